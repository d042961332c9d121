//! Runner modes: interpreters started directly by the engine, or inside
//! pooled `ward-host` processes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ipc::{HostMessage, SupervisorMessage};
use crate::pool::{HostPool, ReleaseOutcome};
use crate::process::{run_interpreter, RunJob, RunReport, RunnerEvent};
use crate::ScriptRunner;

/// Extra time a host gets beyond the job's own deadline and grace period
/// before it is presumed hung.
const HOST_WATCHDOG_SLACK: Duration = Duration::from_secs(5);

const REAP_INTERVAL: Duration = Duration::from_secs(10);

/// Which runner the engine uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
    /// Interpreter is a direct child of the engine process.
    #[default]
    Direct,
    /// Interpreter runs under a pooled `ward-host` process.
    Hosted,
}

impl RunnerMode {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Hosted => "hosted",
        }
    }
}

impl fmt::Display for RunnerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunnerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "hosted" => Ok(Self::Hosted),
            other => Err(format!("unknown runner mode '{other}' (expected direct or hosted)")),
        }
    }
}

/// Starts the interpreter as a direct child of the engine process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectRunner;

#[async_trait::async_trait]
impl ScriptRunner for DirectRunner {
    async fn run(
        &self,
        job: RunJob,
        events: mpsc::Sender<RunnerEvent>,
        cancel: CancellationToken,
    ) -> RunReport {
        run_interpreter(&job, events, cancel).await
    }
}

/// Runs each job inside a `ward-host` process from a [`HostPool`].
///
/// A host that dies mid-job takes only that job down: the run is reported as
/// an engine crash and [`recover`](ScriptRunner::recover) refills the pool.
pub struct HostedRunner {
    pool: Arc<HostPool>,
    reap_task: JoinHandle<()>,
}

enum Step {
    Message(Option<HostMessage>),
    Cancel,
    Unresponsive,
}

impl HostedRunner {
    /// Wrap a pool, start its idle reaper and pre-warm it in the background.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(pool: Arc<HostPool>) -> Self {
        let reap_task = pool.start_reap_task(REAP_INTERVAL);
        let warm = Arc::clone(&pool);
        tokio::spawn(async move {
            let started = warm.replenish().await;
            tracing::debug!(started, "host pool pre-warmed");
        });
        Self { pool, reap_task }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Arc<HostPool> {
        &self.pool
    }
}

impl Drop for HostedRunner {
    fn drop(&mut self) {
        self.reap_task.abort();
    }
}

#[async_trait::async_trait]
impl ScriptRunner for HostedRunner {
    async fn run(
        &self,
        job: RunJob,
        events: mpsc::Sender<RunnerEvent>,
        cancel: CancellationToken,
    ) -> RunReport {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return RunReport::cancelled_before_start();
        }

        let mut host = match self.pool.acquire().await {
            Ok(host) => host,
            Err(e) => {
                tracing::error!(execution_id = %job.execution_id, error = %e, "no interpreter host available");
                return RunReport::crash(
                    format!("no interpreter host available: {e}"),
                    started.elapsed(),
                );
            }
        };

        let execution_id = job.execution_id;
        let limits = job.limits;
        if let Err(e) = host.send(&SupervisorMessage::Run { job: Box::new(job) }).await {
            tracing::error!(%execution_id, error = %e, "failed to hand job to host");
            self.pool.release(host, ReleaseOutcome::Fatal).await;
            return RunReport::crash(format!("failed to hand job to host: {e}"), started.elapsed());
        }

        let watchdog =
            tokio::time::sleep(limits.timeout() + limits.cancel_grace() + HOST_WATCHDOG_SLACK);
        tokio::pin!(watchdog);
        let mut cancel_sent = false;
        let mut interpreter_pid = None;

        loop {
            let step = tokio::select! {
                msg = host.recv() => Step::Message(msg),
                _ = cancel.cancelled(), if !cancel_sent => Step::Cancel,
                _ = &mut watchdog => Step::Unresponsive,
            };

            let event = match step {
                Step::Message(Some(HostMessage::Finished { report })) => {
                    self.pool.release(host, ReleaseOutcome::Ok).await;
                    return report;
                }
                Step::Message(Some(HostMessage::Started { pid })) => {
                    interpreter_pid = Some(pid);
                    RunnerEvent::Started { pid }
                }
                Step::Message(Some(HostMessage::Output { stream, text })) => {
                    RunnerEvent::Output { stream, text }
                }
                Step::Message(Some(HostMessage::Progress { percent, activity })) => {
                    RunnerEvent::Progress { percent, activity }
                }
                Step::Message(Some(other)) => {
                    tracing::debug!(%execution_id, message = ?other, "ignoring host message during run");
                    continue;
                }
                Step::Message(None) => {
                    tracing::error!(%execution_id, pid = ?host.pid(), "interpreter host exited mid-run");
                    kill_orphaned_interpreter(interpreter_pid);
                    self.pool.release(host, ReleaseOutcome::Fatal).await;
                    return RunReport::crash(
                        "interpreter host exited unexpectedly",
                        started.elapsed(),
                    );
                }
                Step::Cancel => {
                    cancel_sent = true;
                    if let Err(e) = host.send(&SupervisorMessage::Cancel).await {
                        tracing::warn!(%execution_id, error = %e, "failed to forward cancellation to host");
                    }
                    continue;
                }
                Step::Unresponsive => {
                    tracing::error!(%execution_id, pid = ?host.pid(), "interpreter host stopped responding");
                    kill_orphaned_interpreter(interpreter_pid);
                    self.pool.release(host, ReleaseOutcome::Fatal).await;
                    return RunReport::crash(
                        "interpreter host stopped responding",
                        started.elapsed(),
                    );
                }
            };
            let _ = events.send(event).await;
        }
    }

    async fn recover(&self) {
        let started = self.pool.replenish().await;
        tracing::info!(started, alive = self.pool.alive(), "host pool replenished after crash");
    }

    async fn shutdown(&self) {
        self.reap_task.abort();
        self.pool.shutdown().await;
    }
}

/// The interpreter leads its own process group, so it survives its host.
fn kill_orphaned_interpreter(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    tracing::warn!(pid, "killing interpreter process group left behind by host");
    #[cfg(unix)]
    crate::process::signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_mode_parses_case_insensitively() {
        assert_eq!("Direct".parse::<RunnerMode>().unwrap(), RunnerMode::Direct);
        assert_eq!("hosted".parse::<RunnerMode>().unwrap(), RunnerMode::Hosted);
        assert!("pooled".parse::<RunnerMode>().is_err());
        assert_eq!(RunnerMode::default(), RunnerMode::Direct);
        assert_eq!(RunnerMode::Hosted.to_string(), "hosted");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn direct_runner_runs_job() {
        use crate::model::ExecutionId;
        use crate::process::{InterpreterConfig, RunLimits, RunOutcome};

        let job = RunJob {
            execution_id: ExecutionId::new(),
            content: "echo direct\n".into(),
            parameters: vec![],
            interpreter: InterpreterConfig::posix_shell("/bin/sh"),
            limits: RunLimits::default(),
        };
        let (tx, mut rx) = mpsc::channel(16);
        let report = DirectRunner.run(job, tx, CancellationToken::new()).await;
        assert_eq!(report.outcome, RunOutcome::Completed);

        let mut saw_output = false;
        while let Some(event) = rx.recv().await {
            if let RunnerEvent::Output { text, .. } = event {
                assert_eq!(text, "direct");
                saw_output = true;
            }
        }
        assert!(saw_output);
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn hosted_runner_reports_crash_without_host_binary() {
        use crate::model::ExecutionId;
        use crate::pool::PoolConfig;
        use crate::process::{InterpreterConfig, RunLimits, RunOutcome};

        let pool = Arc::new(HostPool::new(PoolConfig {
            min_hosts: 0,
            host_binary: Some("/nonexistent/ward-host".into()),
            ..PoolConfig::default()
        }));
        let runner = HostedRunner::new(pool);
        let job = RunJob {
            execution_id: ExecutionId::new(),
            content: "echo unreachable\n".into(),
            parameters: vec![],
            interpreter: InterpreterConfig::default(),
            limits: RunLimits::default(),
        };
        let (tx, _rx) = mpsc::channel(16);
        let report = runner.run(job, tx, CancellationToken::new()).await;
        assert!(
            matches!(report.outcome, RunOutcome::EngineCrash { .. }),
            "got {:?}",
            report.outcome
        );
        runner.shutdown().await;
    }
}
