//! Supervisor-side handle on one `ward-host` process.
//!
//! The host is started with a scrubbed environment and spoken to over
//! length-delimited JSON on its stdin/stdout. A background task moves frames
//! from the host's stdout into an inbox channel so receiving is cancel-safe
//! and can sit in a `select!`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RunnerError;
use crate::ipc::{read_message_with_limit, write_message, HostMessage, SupervisorMessage};
use crate::process::PASSTHROUGH_ENV;

/// File name of the host binary.
pub const HOST_BINARY_NAME: &str = "ward-host";

/// Overrides host binary discovery. Must be an absolute path.
pub const HOST_BIN_ENV: &str = "SCRIPTWARD_HOST_BIN";

/// Host stderr forwarded to the supervisor's log before the rest is dropped.
const MAX_STDERR_LOG_BYTES: usize = 4 * 1024;

const INBOX_CAPACITY: usize = 256;

/// Largest frame accepted from a host.
const MAX_HOST_FRAME: usize = crate::ipc::DEFAULT_MAX_IPC_MESSAGE_SIZE;

/// A running host process.
pub struct HostProcess {
    child: Child,
    stdin: ChildStdin,
    inbox: mpsc::Receiver<HostMessage>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for HostProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProcess")
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

impl HostProcess {
    /// Start `binary` and wait up to `ready_timeout` for its `Ready` frame.
    pub async fn spawn(binary: &Path, ready_timeout: Duration) -> Result<Self, RunnerError> {
        let mut cmd = Command::new(binary);
        cmd.env_clear();
        for key in PASSTHROUGH_ENV {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: binary.display().to_string(),
                source,
            })?;

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture_bounded_stderr(stderr, pid));
        }
        let stdin = child.stdin.take().ok_or_else(|| {
            RunnerError::Ipc(std::io::Error::other("no stdin on host process"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            RunnerError::Ipc(std::io::Error::other("no stdout on host process"))
        })?;

        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout);
            loop {
                match read_message_with_limit::<HostMessage, _>(&mut stdout, MAX_HOST_FRAME).await {
                    Ok(Some(msg)) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(pid, error = %e, "dropping host connection after bad frame");
                        break;
                    }
                }
            }
        });

        let mut host = Self {
            child,
            stdin,
            inbox,
            reader,
        };
        match tokio::time::timeout(ready_timeout, host.recv()).await {
            Ok(Some(HostMessage::Ready)) => {
                tracing::debug!(pid, "host ready");
                Ok(host)
            }
            Ok(Some(other)) => Err(RunnerError::HealthCheck(format!(
                "expected Ready from new host, got {other:?}"
            ))),
            Ok(None) => Err(RunnerError::HealthCheck(
                "host exited before becoming ready".into(),
            )),
            Err(_) => Err(RunnerError::HealthCheck(format!(
                "host not ready within {}ms",
                ready_timeout.as_millis()
            ))),
        }
    }

    /// Host process id.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send one frame.
    pub async fn send(&mut self, msg: &SupervisorMessage) -> Result<(), RunnerError> {
        write_message(&mut self.stdin, msg).await?;
        Ok(())
    }

    /// Next frame from the host; `None` once the host has gone away.
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.inbox.recv().await
    }

    /// Round-trip a `Ping`.
    pub async fn ping(&mut self, timeout: Duration) -> Result<(), RunnerError> {
        self.send(&SupervisorMessage::Ping).await?;
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(HostMessage::Pong)) => Ok(()),
            Ok(Some(other)) => Err(RunnerError::HealthCheck(format!(
                "expected Pong, got {other:?}"
            ))),
            Ok(None) => Err(RunnerError::HealthCheck("host has exited".into())),
            Err(_) => Err(RunnerError::HealthCheck(format!(
                "no Pong within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// Kill the host and reap it.
    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(error = %e, "host kill failed");
        }
    }
}

impl Drop for HostProcess {
    fn drop(&mut self) {
        self.reader.abort();
        let _ = self.child.start_kill();
    }
}

/// Locate the `ward-host` binary.
///
/// Search order:
/// 1. `SCRIPTWARD_HOST_BIN` (must be absolute)
/// 2. `configured`, when given
/// 3. next to the current executable, or one directory up (test binaries live in `deps/`)
///
/// On Unix, world-writable binaries are rejected.
pub fn find_host_binary(configured: Option<&Path>) -> Result<PathBuf, RunnerError> {
    if let Ok(path) = std::env::var(HOST_BIN_ENV) {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(RunnerError::InsecureBinary {
                path: p,
                reason: format!("{HOST_BIN_ENV} must be an absolute path"),
            });
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Some(path) = configured {
        if !path.exists() {
            return Err(RunnerError::HostNotFound(format!(
                "configured host binary {} does not exist",
                path.display()
            )));
        }
        validate_binary_permissions(path)?;
        return Ok(path.to_path_buf());
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let host = candidate.join(HOST_BINARY_NAME);
                if host.exists() {
                    validate_binary_permissions(&host)?;
                    return Ok(host);
                }
            }
        }
    }

    Err(RunnerError::HostNotFound(format!(
        "set {HOST_BIN_ENV} or install {HOST_BINARY_NAME} alongside the engine"
    )))
}

fn validate_binary_permissions(path: &Path) -> Result<(), RunnerError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)
            .map_err(|e| RunnerError::InsecureBinary {
                path: path.to_path_buf(),
                reason: format!("cannot read metadata: {e}"),
            })?
            .permissions()
            .mode();
        if mode & 0o002 != 0 {
            return Err(RunnerError::InsecureBinary {
                path: path.to_path_buf(),
                reason: format!("mode {mode:o} is world-writable"),
            });
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Forward host stderr into the log, up to a fixed budget, then just drain it.
async fn capture_bounded_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    let mut logged = 0usize;
    let mut announced = false;
    while let Ok(Some(line)) = lines.next_line().await {
        if logged < MAX_STDERR_LOG_BYTES {
            logged += line.len();
            tracing::warn!(target: "scriptward::host", pid, "{line}");
        } else if !announced {
            announced = true;
            tracing::warn!(target: "scriptward::host", pid, "further host stderr suppressed");
        }
    }
}
