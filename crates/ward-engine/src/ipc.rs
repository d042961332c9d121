//! IPC protocol between the supervisor and `ward-host` processes.
//!
//! Length-delimited JSON frames: a 4-byte big-endian length prefix followed by
//! the JSON payload. Each direction has its own message enum.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::model::StreamKind;
use crate::process::{RunJob, RunReport};

/// Messages from the supervisor to a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SupervisorMessage {
    /// Run one script. A host runs at most one job at a time.
    Run {
        /// The job.
        job: Box<RunJob>,
    },
    /// Cancel the job in progress. Ignored when idle.
    Cancel,
    /// Liveness probe; answered with [`HostMessage::Pong`] when idle.
    Ping,
}

/// Messages from a host to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    /// Sent once at startup.
    Ready,
    /// Answer to [`SupervisorMessage::Ping`].
    Pong,
    /// The interpreter for the current job started.
    Started {
        /// Interpreter process id.
        pid: u32,
    },
    /// One output line from the current job.
    Output {
        /// Originating stream.
        stream: StreamKind,
        /// Line text.
        text: String,
    },
    /// A progress directive from the current job.
    Progress {
        /// Percent complete, when given.
        percent: Option<u8>,
        /// Activity text.
        activity: String,
    },
    /// The current job is over. The host is idle again.
    Finished {
        /// How it ended.
        report: RunReport,
    },
}

/// Default maximum IPC frame: 16 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Write one frame and flush.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC payload too large: {} bytes", payload.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame using [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
///
/// Returns `None` at EOF.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read one frame, rejecting frames larger than `max_size`.
///
/// Returns `None` at EOF.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}
