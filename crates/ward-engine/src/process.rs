//! Interpreter process driver.
//!
//! [`run_interpreter`] is the one place an interpreter is actually started.
//! Both runner modes use it: the direct runner calls it in the engine process,
//! the `ward-host` binary calls it inside a pooled host process.
//!
//! The script is staged to a private temporary file and the interpreter is
//! started with a scrubbed environment, a null stdin and its own process
//! group. Output is forwarded line by line as it is produced. The wall-clock
//! deadline, the memory ceiling and cancellation are enforced concurrently;
//! whichever fires first terminates the whole process group, politely first
//! and forcibly after the grace period.

use std::io::Write as _;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::model::{ExecutionId, Parameters, StreamKind};

/// Environment variable carrying the execution id into the interpreter.
pub const EXECUTION_ID_ENV: &str = "SCRIPTWARD_EXECUTION_ID";

/// Variables copied from the engine's environment; everything else is dropped.
pub(crate) const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "TMPDIR", "TEMP", "TMP", "SystemRoot", "LANG"];

/// Stderr kept for failure messages.
pub const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Stdout lines starting with this are progress reports, not output.
pub const PROGRESS_PREFIX: &str = "##progress ";

/// How long to wait for the output pipes to drain after the interpreter exits.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How parameters reach the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterBinding {
    /// `-Name value` pairs after the script path.
    Named,
    /// `PREFIXName=value` environment variables.
    Environment {
        /// Prepended to every parameter name.
        prefix: String,
    },
}

/// How to launch the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Executable.
    pub program: String,
    /// Arguments placed before the script path.
    pub args: Vec<String>,
    /// Extension of the staged script file, without the dot.
    pub script_extension: String,
    /// Parameter binding.
    pub parameter_binding: ParameterBinding,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: "pwsh".into(),
            args: vec![
                "-NoProfile".into(),
                "-NonInteractive".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-File".into(),
            ],
            script_extension: "ps1".into(),
            parameter_binding: ParameterBinding::Named,
        }
    }
}

impl InterpreterConfig {
    /// A POSIX shell reading parameters from `WARD_<name>` variables.
    pub fn posix_shell(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            script_extension: "sh".into(),
            parameter_binding: ParameterBinding::Environment {
                prefix: "WARD_".into(),
            },
        }
    }
}

/// Per-run limits. Durations are carried as milliseconds so the job can cross
/// the host IPC boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    /// Wall-clock limit.
    pub timeout_ms: u64,
    /// Resident memory ceiling.
    pub max_memory_bytes: u64,
    /// Memory sampling period.
    pub memory_sample_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL.
    pub cancel_grace_ms: u64,
    /// Longest output line before it is split.
    pub max_line_bytes: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            max_memory_bytes: 512 * 1024 * 1024,
            memory_sample_interval_ms: 250,
            cancel_grace_ms: 2_000,
            max_line_bytes: 64 * 1024,
        }
    }
}

impl RunLimits {
    /// Wall-clock limit.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Memory sampling period, never zero.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval_ms.max(1))
    }

    /// Grace period before a forced kill.
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Everything needed to run one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunJob {
    /// Execution being run.
    pub execution_id: ExecutionId,
    /// Script body.
    pub content: String,
    /// Parameters in binding order.
    pub parameters: Parameters,
    /// Interpreter launch settings.
    pub interpreter: InterpreterConfig,
    /// Limits.
    pub limits: RunLimits,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Exit code zero.
    Completed,
    /// Non-zero exit.
    Failed {
        /// Exit code and stderr tail.
        detail: String,
    },
    /// Wall-clock limit hit.
    TimedOut,
    /// Memory ceiling hit.
    MemoryExceeded {
        /// Highest sample.
        peak_bytes: u64,
    },
    /// Cancelled on request.
    Cancelled,
    /// The interpreter or its host died abnormally, or never started.
    EngineCrash {
        /// What happened.
        detail: String,
    },
}

/// Final result of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// How it ended.
    pub outcome: RunOutcome,
    /// Exit code, when the interpreter exited normally.
    pub exit_code: Option<i32>,
    /// Highest resident set size sampled.
    pub peak_memory_bytes: Option<u64>,
    /// Wall-clock time.
    pub elapsed_ms: u64,
}

impl RunReport {
    /// A crash report with no exit information.
    pub fn crash(detail: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            outcome: RunOutcome::EngineCrash {
                detail: detail.into(),
            },
            exit_code: None,
            peak_memory_bytes: None,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// A cancellation report for a job whose interpreter never started.
    pub fn cancelled_before_start() -> Self {
        Self {
            outcome: RunOutcome::Cancelled,
            exit_code: None,
            peak_memory_bytes: None,
            elapsed_ms: 0,
        }
    }
}

/// Incremental notifications emitted while a run is in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// The interpreter process is up.
    Started {
        /// Interpreter process id.
        pid: u32,
    },
    /// One line of output.
    Output {
        /// Originating stream.
        stream: StreamKind,
        /// Line text without the newline.
        text: String,
    },
    /// A `##progress` directive.
    Progress {
        /// Percent complete, when given.
        percent: Option<u8>,
        /// Free-form activity text.
        activity: String,
    },
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Limit(RunOutcome),
}

/// Run one script to completion and report how it ended.
///
/// Never returns an error: failures to stage or start the interpreter are
/// reported as [`RunOutcome::EngineCrash`]. All output events are sent before
/// this function returns.
pub async fn run_interpreter(
    job: &RunJob,
    events: mpsc::Sender<RunnerEvent>,
    cancel: CancellationToken,
) -> RunReport {
    let start = Instant::now();
    if cancel.is_cancelled() {
        return RunReport::cancelled_before_start();
    }

    let script = match stage_script(&job.content, &job.interpreter.script_extension) {
        Ok(path) => path,
        Err(e) => return RunReport::crash(e.to_string(), start.elapsed()),
    };

    let mut child = match build_command(job, &script).spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = RunnerError::Spawn {
                program: job.interpreter.program.clone(),
                source,
            };
            tracing::error!(execution_id = %job.execution_id, error = %err, "interpreter spawn failed");
            return RunReport::crash(err.to_string(), start.elapsed());
        }
    };

    let pid = child.id();
    if let Some(pid) = pid {
        tracing::debug!(execution_id = %job.execution_id, pid, "interpreter started");
        let _ = events.send(RunnerEvent::Started { pid }).await;
    }

    let limits = job.limits;
    let stdout_task = child.stdout.take().map(|out| {
        tokio::spawn(pump_stream(
            out,
            StreamKind::Stdout,
            events.clone(),
            limits.max_line_bytes,
        ))
    });
    let stderr_task = child.stderr.take().map(|err| {
        tokio::spawn(pump_stream(
            err,
            StreamKind::Stderr,
            events.clone(),
            limits.max_line_bytes,
        ))
    });
    drop(events);

    let deadline = tokio::time::sleep(limits.timeout());
    tokio::pin!(deadline);
    let mut sampler = tokio::time::interval(limits.sample_interval());
    sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut peak: Option<u64> = None;

    let stop = loop {
        tokio::select! {
            status = child.wait() => break Stop::Exited(status),
            _ = &mut deadline => break Stop::Limit(RunOutcome::TimedOut),
            _ = cancel.cancelled() => break Stop::Limit(RunOutcome::Cancelled),
            _ = sampler.tick() => {
                if let Some(rss) = pid.and_then(sample_rss) {
                    let high = peak.map_or(rss, |p| p.max(rss));
                    peak = Some(high);
                    if rss > limits.max_memory_bytes {
                        break Stop::Limit(RunOutcome::MemoryExceeded { peak_bytes: high });
                    }
                }
            }
        }
    };

    let (forced, status) = match stop {
        Stop::Exited(status) => (None, status),
        Stop::Limit(outcome) => {
            tracing::info!(
                execution_id = %job.execution_id,
                reason = ?outcome,
                "terminating interpreter"
            );
            let status = terminate(&mut child, pid, limits.cancel_grace()).await;
            (Some(outcome), status)
        }
    };

    // stragglers left in the group would keep the output pipes open
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }

    let _ = join_reader(stdout_task).await;
    let stderr_tail = join_reader(stderr_task).await;
    let elapsed = start.elapsed();
    drop(script);

    let exit_code = status.as_ref().ok().and_then(|s| s.code());
    let outcome = match forced {
        Some(outcome) => outcome,
        None => classify(status, &stderr_tail),
    };

    RunReport {
        outcome,
        exit_code,
        peak_memory_bytes: peak,
        elapsed_ms: elapsed.as_millis() as u64,
    }
}

fn stage_script(content: &str, extension: &str) -> Result<tempfile::TempPath, RunnerError> {
    let suffix = if extension.is_empty() {
        String::new()
    } else {
        format!(".{extension}")
    };
    let mut file = tempfile::Builder::new()
        .prefix("scriptward-")
        .suffix(&suffix)
        .tempfile()
        .map_err(RunnerError::Staging)?;
    file.write_all(content.as_bytes())
        .and_then(|()| file.flush())
        .map_err(RunnerError::Staging)?;
    Ok(file.into_temp_path())
}

fn build_command(job: &RunJob, script: &Path) -> Command {
    let interpreter = &job.interpreter;
    let mut cmd = Command::new(&interpreter.program);
    cmd.args(&interpreter.args).arg(script);

    cmd.env_clear();
    for key in PASSTHROUGH_ENV {
        if let Some(value) = std::env::var_os(key) {
            cmd.env(key, value);
        }
    }
    cmd.env(EXECUTION_ID_ENV, job.execution_id.to_string());

    match &interpreter.parameter_binding {
        ParameterBinding::Named => {
            for (name, value) in &job.parameters {
                cmd.arg(format!("-{name}")).arg(value);
            }
        }
        ParameterBinding::Environment { prefix } => {
            for (name, value) in &job.parameters {
                cmd.env(format!("{prefix}{name}"), value);
            }
        }
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);
    cmd
}

/// Read a stream line by line, forwarding each line. Returns the stream's
/// tail for stderr, an empty string for stdout.
async fn pump_stream<R: AsyncRead + Unpin>(
    reader: R,
    stream: StreamKind,
    events: mpsc::Sender<RunnerEvent>,
    max_line_bytes: usize,
) -> String {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(1024);
    let mut tail = String::new();
    let limit = max_line_bytes.max(1) as u64;

    loop {
        buf.clear();
        match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, ?stream, "interpreter stream read failed");
                break;
            }
        }

        let text = String::from_utf8_lossy(trim_line_ending(&buf)).into_owned();
        if stream == StreamKind::Stderr {
            push_tail(&mut tail, &text);
        }
        let event = match parse_progress(&text) {
            Some(progress) if stream == StreamKind::Stdout => progress,
            _ => RunnerEvent::Output { stream, text },
        };
        // keep draining even without a listener so the child never blocks on a full pipe
        let _ = events.send(event).await;
    }
    tail
}

async fn join_reader(task: Option<JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            tracing::debug!("output pipe still open after exit, abandoning reader");
            task.abort();
            String::new()
        }
    }
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

fn push_tail(tail: &mut String, line: &str) {
    if !tail.is_empty() {
        tail.push('\n');
    }
    tail.push_str(line);
    if tail.len() > STDERR_TAIL_BYTES {
        let mut cut = tail.len() - STDERR_TAIL_BYTES;
        while !tail.is_char_boundary(cut) {
            cut += 1;
        }
        tail.drain(..cut);
    }
}

/// Parse `##progress <percent|-> [activity]`.
fn parse_progress(line: &str) -> Option<RunnerEvent> {
    let rest = line.strip_prefix(PROGRESS_PREFIX)?.trim();
    let (first, activity) = match rest.split_once(char::is_whitespace) {
        Some((first, activity)) => (first, activity.trim()),
        None => (rest, ""),
    };
    let percent = if first == "-" {
        None
    } else {
        let value: u8 = first.trim_end_matches('%').parse().ok()?;
        if value > 100 {
            return None;
        }
        Some(value)
    };
    Some(RunnerEvent::Progress {
        percent,
        activity: activity.to_string(),
    })
}

fn classify(status: std::io::Result<ExitStatus>, stderr_tail: &str) -> RunOutcome {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            return RunOutcome::EngineCrash {
                detail: format!("lost track of interpreter: {e}"),
            }
        }
    };
    if status.success() {
        return RunOutcome::Completed;
    }
    if let Some(code) = status.code() {
        let detail = if stderr_tail.trim().is_empty() {
            format!("exited with code {code}")
        } else {
            format!("exited with code {code}: {}", stderr_tail.trim_end())
        };
        return RunOutcome::Failed { detail };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return RunOutcome::EngineCrash {
                detail: format!("interpreter terminated by signal {signal}"),
            };
        }
    }
    RunOutcome::EngineCrash {
        detail: "interpreter terminated abnormally".into(),
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL. Always reaps.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::Signal;
        signal_group(pid, Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        tracing::warn!(pid, "interpreter ignored SIGTERM, killing process group");
        signal_group(pid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = (pid, grace);

    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "kill after grace period failed");
    }
    child.wait().await
}

#[cfg(unix)]
pub(crate) fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match nix::sys::signal::killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::debug!(pgid, ?signal, error = %e, "failed to signal process group"),
    }
}

/// Resident set size in bytes of every process in the group led by `pgid`.
///
/// Children that moved to another group or session are not counted.
#[cfg(target_os = "linux")]
pub fn sample_rss(pgid: u32) -> Option<u64> {
    let leader = process_rss(pgid);
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return leader;
    };

    let mut total: Option<u64> = None;
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if parse_pgrp(&stat) != Some(pgid) {
            continue;
        }
        if let Some(rss) = process_rss(pid) {
            total = Some(total.unwrap_or(0).saturating_add(rss));
        }
    }
    total.or(leader)
}

#[cfg(target_os = "linux")]
fn process_rss(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

/// Process group id from `/proc/<pid>/stat`. The command name may itself
/// contain spaces and parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_pgrp(stat: &str) -> Option<u32> {
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(2)?.parse().ok()
}

/// Memory sampling needs procfs; elsewhere the ceiling is not enforced.
#[cfg(not(target_os = "linux"))]
pub fn sample_rss(_pgid: u32) -> Option<u64> {
    static NOTICE: std::sync::Once = std::sync::Once::new();
    NOTICE.call_once(|| {
        tracing::debug!("memory sampling unavailable on this platform, ceiling not enforced")
    });
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib.saturating_mul(1024))
}
