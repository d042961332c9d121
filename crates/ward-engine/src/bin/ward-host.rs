//! scriptward interpreter host.
//!
//! Spawned by the hosted runner with a scrubbed environment. Receives jobs as
//! length-delimited JSON frames on stdin, runs them one at a time, and streams
//! output, progress and the final report back on stdout. Exits when stdin
//! closes.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{self, BufReader, Stdout};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use ward_engine::ipc::{read_message, write_message, HostMessage, SupervisorMessage};
use ward_engine::process::{run_interpreter, RunJob, RunReport, RunnerEvent};

enum Step {
    Event(RunnerEvent),
    Inbox(Option<SupervisorMessage>),
    Done(Result<RunReport, JoinError>),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stderr is captured by the supervisor
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let (inbox_tx, mut inbox) = mpsc::channel::<SupervisorMessage>(16);
    tokio::spawn(async move {
        let mut stdin = BufReader::new(io::stdin());
        loop {
            match read_message::<SupervisorMessage, _>(&mut stdin).await {
                Ok(Some(msg)) => {
                    if inbox_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable frame from supervisor");
                    break;
                }
            }
        }
    });

    let mut stdout = io::stdout();
    write_message(&mut stdout, &HostMessage::Ready)
        .await
        .context("failed to announce readiness")?;

    while let Some(msg) = inbox.recv().await {
        match msg {
            SupervisorMessage::Ping => write_message(&mut stdout, &HostMessage::Pong).await?,
            SupervisorMessage::Cancel => {}
            SupervisorMessage::Run { job } => {
                let report = run_job(*job, &mut inbox, &mut stdout).await?;
                write_message(&mut stdout, &HostMessage::Finished { report })
                    .await
                    .context("failed to report job result")?;
            }
        }
    }
    Ok(())
}

async fn run_job(
    job: RunJob,
    inbox: &mut mpsc::Receiver<SupervisorMessage>,
    stdout: &mut Stdout,
) -> Result<RunReport> {
    let (events_tx, mut events) = mpsc::channel(256);
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let mut task = tokio::spawn(async move { run_interpreter(&job, events_tx, token).await });
    let mut inbox_open = true;

    loop {
        let step = tokio::select! {
            biased;
            Some(event) = events.recv() => Step::Event(event),
            msg = inbox.recv(), if inbox_open => Step::Inbox(msg),
            joined = &mut task => Step::Done(joined),
        };

        match step {
            Step::Event(event) => write_message(stdout, &host_message(event)).await?,
            Step::Inbox(Some(SupervisorMessage::Cancel)) => cancel.cancel(),
            Step::Inbox(Some(SupervisorMessage::Ping)) => {
                write_message(stdout, &HostMessage::Pong).await?
            }
            Step::Inbox(Some(SupervisorMessage::Run { .. })) => {
                tracing::warn!("ignoring Run while a job is in progress");
            }
            Step::Inbox(None) => {
                // supervisor is gone; stop the interpreter and wind down
                inbox_open = false;
                cancel.cancel();
            }
            Step::Done(joined) => {
                while let Some(event) = events.recv().await {
                    write_message(stdout, &host_message(event)).await?;
                }
                return Ok(joined.unwrap_or_else(|e| {
                    RunReport::crash(format!("interpreter task failed: {e}"), Duration::ZERO)
                }));
            }
        }
    }
}

fn host_message(event: RunnerEvent) -> HostMessage {
    match event {
        RunnerEvent::Started { pid } => HostMessage::Started { pid },
        RunnerEvent::Output { stream, text } => HostMessage::Output { stream, text },
        RunnerEvent::Progress { percent, activity } => HostMessage::Progress { percent, activity },
    }
}
