//! Execution data model shared by every engine component.
//!
//! Everything here is plain data: requests and analyses are immutable once
//! built, and an [`Execution`] is only ever mutated by the supervisor that
//! owns it. Readers always work on cloned snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use ward_error::ErrorKind;

/// Ordered severity scale used for both script risk and caller permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing dangerous found.
    Low,
    /// Touches the network or other processes.
    Medium,
    /// Can execute arbitrary code or destroy data.
    High,
    /// Destructive to the host as a whole.
    Critical,
}

/// A caller's clearance, on the same scale as [`RiskLevel`].
pub type PermissionLevel = RiskLevel;

impl RiskLevel {
    /// Lowercase name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!(
                "unknown level '{other}', expected one of: low, medium, high, critical"
            )),
        }
    }
}

/// 1-based position of a finding in the script text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Line number.
    pub line: usize,
    /// Column, counted in characters.
    pub column: usize,
}

/// One denylist match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Severity of the matched rule.
    pub severity: RiskLevel,
    /// Identifier of the matched rule.
    pub rule: String,
    /// Human readable explanation.
    pub description: String,
    /// Where the match starts.
    pub location: Location,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} line {}: {}",
            self.severity, self.location.line, self.description
        )
    }
}

/// Result of static analysis. Computed once, before admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAnalysis {
    /// Highest severity among the findings, `Low` when there are none.
    pub risk_score: RiskLevel,
    /// Every match, ordered by line then column.
    pub findings: Vec<Finding>,
}

impl SecurityAnalysis {
    /// Analysis of a script with no findings.
    pub fn clean() -> Self {
        Self {
            risk_score: RiskLevel::Low,
            findings: Vec::new(),
        }
    }

    /// True when nothing matched.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Findings at or above `level`.
    pub fn findings_at_least(&self, level: RiskLevel) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity >= level)
    }
}

/// Identifier of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ExecutionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where the script text comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptSource {
    /// A script looked up in the catalog.
    Catalog {
        /// Catalog identifier.
        script_id: String,
    },
    /// Raw script text supplied by the caller.
    Inline {
        /// The script body.
        content: String,
    },
}

impl ScriptSource {
    /// Reference a catalog script.
    pub fn catalog(script_id: impl Into<String>) -> Self {
        Self::Catalog {
            script_id: script_id.into(),
        }
    }

    /// Wrap inline content.
    pub fn inline(content: impl Into<String>) -> Self {
        Self::Inline {
            content: content.into(),
        }
    }
}

/// What was actually run, recorded without the script body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptReference {
    /// A catalog script at a specific content revision.
    Catalog {
        /// Catalog identifier.
        script_id: String,
        /// SHA-256 of the content that ran.
        content_hash: String,
    },
    /// Inline content.
    Inline {
        /// SHA-256 of the content that ran.
        content_hash: String,
    },
}

impl ScriptReference {
    /// The content hash, whatever the source.
    pub fn content_hash(&self) -> &str {
        match self {
            Self::Catalog { content_hash, .. } | Self::Inline { content_hash } => content_hash,
        }
    }
}

/// Ordered parameter list, bound in insertion order.
pub type Parameters = Vec<(String, String)>;

/// The identity an execution runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Opaque caller identifier.
    pub id: String,
    /// Clearance granted upstream.
    pub permission_level: PermissionLevel,
    /// Whether a step-up verification was completed recently.
    #[serde(default)]
    pub has_recent_step_up: bool,
}

impl Caller {
    /// A caller without a recent step-up.
    pub fn new(id: impl Into<String>, permission_level: PermissionLevel) -> Self {
        Self {
            id: id.into(),
            permission_level,
            has_recent_step_up: false,
        }
    }

    /// Mark the caller as recently step-up verified.
    pub fn with_step_up(mut self) -> Self {
        self.has_recent_step_up = true;
        self
    }
}

/// An immutable request to run a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Caller-chosen id; the engine generates one when absent.
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    /// The script to run.
    pub source: ScriptSource,
    /// Parameters in binding order.
    #[serde(default)]
    pub parameters: Parameters,
    /// Who asked.
    pub requested_by: Caller,
}

impl ExecutionRequest {
    /// Build a request with an engine-generated id.
    pub fn new(source: ScriptSource, parameters: Parameters, requested_by: Caller) -> Self {
        Self {
            execution_id: None,
            source,
            parameters,
            requested_by,
        }
    }

    /// Use a caller-supplied id.
    pub fn with_id(mut self, id: ExecutionId) -> Self {
        self.execution_id = Some(id);
        self
    }
}

/// Lifecycle state of an execution.
///
/// ```text
/// Pending -> Admitted -> Running -> {Completed, Failed, TimedOut,
///                                    ResourceLimitExceeded, Cancelled}
/// Pending -> {SecurityBlocked, RejectedConcurrencyLimit, Cancelled}
/// Admitted -> {Failed, Cancelled}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted, not yet admitted.
    Pending,
    /// Holding a concurrency slot, interpreter starting.
    Admitted,
    /// Interpreter running.
    Running,
    /// Exited successfully.
    Completed,
    /// Script error or interpreter crash.
    Failed,
    /// Wall-clock limit hit.
    TimedOut,
    /// Memory ceiling hit.
    ResourceLimitExceeded,
    /// Cancelled by the caller or by shutdown.
    Cancelled,
    /// Denied by the authorization gate.
    SecurityBlocked,
    /// No concurrency slot was free.
    RejectedConcurrencyLimit,
}

impl ExecutionStatus {
    /// Terminal states are final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Admitted | Self::Running)
    }

    /// Whether a cancellation request can still take effect.
    pub fn is_cancellable(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match self {
            Pending => matches!(
                next,
                Admitted | SecurityBlocked | RejectedConcurrencyLimit | Cancelled
            ),
            Admitted => matches!(next, Running | Failed | Cancelled),
            Running => matches!(
                next,
                Completed | Failed | TimedOut | ResourceLimitExceeded | Cancelled
            ),
            _ => false,
        }
    }

    /// Lowercase name, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Admitted => "admitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::ResourceLimitExceeded => "resource_limit_exceeded",
            Self::Cancelled => "cancelled",
            Self::SecurityBlocked => "security_blocked",
            Self::RejectedConcurrencyLimit => "rejected_concurrency_limit",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which interpreter stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line (or line fragment) of interpreter output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    /// Originating stream.
    pub stream: StreamKind,
    /// Per-execution sequence number, across both streams.
    pub seq: u64,
    /// The text, without the trailing newline.
    pub text: String,
    /// When the supervisor received it.
    pub timestamp: DateTime<Utc>,
}

/// Coarse exit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitSignal {
    /// The interpreter exited successfully.
    Success,
    /// The interpreter failed or was stopped by a limit.
    Error,
    /// The interpreter never ran or was cancelled.
    None,
}

/// Resources consumed by the interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Highest resident set size sampled, when sampling is available.
    pub peak_memory_bytes: Option<u64>,
    /// Wall-clock time the interpreter ran.
    pub elapsed_ms: u64,
}

/// The supervisor-owned record of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Identifier.
    pub id: ExecutionId,
    /// What ran.
    pub script_reference: ScriptReference,
    /// Bound parameters.
    pub parameters: Parameters,
    /// Caller identifier.
    pub requested_by: String,
    /// Current state.
    pub status: ExecutionStatus,
    /// Why the execution did not simply succeed.
    pub error_kind: Option<ErrorKind>,
    /// Detail for `error_kind`.
    pub error_message: Option<String>,
    /// Interpreter exit code, when it exited normally.
    pub exit_code: Option<i32>,
    /// Coarse exit classification.
    pub exit_signal: ExitSignal,
    /// When the request was accepted.
    pub created_at: DateTime<Utc>,
    /// When the interpreter started.
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal state was reached.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retained output, in production order.
    pub output: Vec<OutputChunk>,
    /// Whether output beyond the retention limit was dropped.
    pub output_truncated: bool,
    /// Whether cancellation was requested.
    pub cancellation_requested: bool,
    /// Resources consumed.
    pub resource_usage: ResourceUsage,
    /// Static analysis computed before admission.
    pub security: Option<SecurityAnalysis>,
}

impl Execution {
    /// A new `Pending` execution.
    pub fn pending(
        id: ExecutionId,
        script_reference: ScriptReference,
        parameters: Parameters,
        requested_by: impl Into<String>,
        security: SecurityAnalysis,
    ) -> Self {
        Self {
            id,
            script_reference,
            parameters,
            requested_by: requested_by.into(),
            status: ExecutionStatus::Pending,
            error_kind: None,
            error_message: None,
            exit_code: None,
            exit_signal: ExitSignal::None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: Vec::new(),
            output_truncated: false,
            cancellation_requested: false,
            resource_usage: ResourceUsage::default(),
            security: Some(security),
        }
    }

    /// Time between start and completion, once both are known.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        Some((completed - started).num_milliseconds().max(0) as u64)
    }

    /// All stdout chunks joined with newlines.
    pub fn stdout_text(&self) -> String {
        self.stream_text(StreamKind::Stdout)
    }

    /// All stderr chunks joined with newlines.
    pub fn stderr_text(&self) -> String {
        self.stream_text(StreamKind::Stderr)
    }

    fn stream_text(&self, stream: StreamKind) -> String {
        self.output
            .iter()
            .filter(|c| c.stream == stream)
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A lifecycle transition.
    StatusChanged,
    /// A progress report from the script.
    Progress,
    /// A chunk of output.
    Output,
}

/// Event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// New lifecycle state.
    Status {
        /// The state entered.
        status: ExecutionStatus,
        /// Error kind, for terminal failures.
        error_kind: Option<ErrorKind>,
    },
    /// Script-reported progress.
    Progress {
        /// Percent complete, when reported.
        percent: Option<u8>,
        /// What the script is doing.
        activity: String,
    },
    /// Output chunk.
    Output {
        /// The chunk.
        chunk: OutputChunk,
    },
}

/// A transient notification fanned out by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Execution this event belongs to.
    pub execution_id: ExecutionId,
    /// Event category.
    pub kind: EventKind,
    /// Event body.
    pub payload: EventPayload,
    /// When it was published.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// A status-change event.
    pub fn status(
        execution_id: ExecutionId,
        status: ExecutionStatus,
        error_kind: Option<ErrorKind>,
    ) -> Self {
        Self {
            execution_id,
            kind: EventKind::StatusChanged,
            payload: EventPayload::Status { status, error_kind },
            timestamp: Utc::now(),
        }
    }

    /// A progress event.
    pub fn progress(execution_id: ExecutionId, percent: Option<u8>, activity: String) -> Self {
        Self {
            execution_id,
            kind: EventKind::Progress,
            payload: EventPayload::Progress { percent, activity },
            timestamp: Utc::now(),
        }
    }

    /// An output event.
    pub fn output(execution_id: ExecutionId, chunk: OutputChunk) -> Self {
        Self {
            execution_id,
            kind: EventKind::Output,
            timestamp: chunk.timestamp,
            payload: EventPayload::Output { chunk },
        }
    }

    /// True for a status event carrying a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            &self.payload,
            EventPayload::Status { status, .. } if status.is_terminal()
        )
    }
}

/// Timing and volume figures for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Execution described.
    pub execution_id: ExecutionId,
    /// State at the time of the query.
    pub status: ExecutionStatus,
    /// Start to completion, once terminal.
    pub duration_ms: Option<u64>,
    /// Peak sampled memory.
    pub peak_memory_bytes: Option<u64>,
    /// Stdout chunks retained.
    pub stdout_chunks: usize,
    /// Stderr chunks retained.
    pub stderr_chunks: usize,
    /// Stdout bytes retained.
    pub stdout_bytes: usize,
    /// Stderr bytes retained.
    pub stderr_bytes: usize,
    /// Whether output was truncated.
    pub output_truncated: bool,
}

impl From<&Execution> for ExecutionMetrics {
    fn from(exec: &Execution) -> Self {
        let mut metrics = Self {
            execution_id: exec.id,
            status: exec.status,
            duration_ms: exec.duration_ms(),
            peak_memory_bytes: exec.resource_usage.peak_memory_bytes,
            stdout_chunks: 0,
            stderr_chunks: 0,
            stdout_bytes: 0,
            stderr_bytes: 0,
            output_truncated: exec.output_truncated,
        };
        for chunk in &exec.output {
            match chunk.stream {
                StreamKind::Stdout => {
                    metrics.stdout_chunks += 1;
                    metrics.stdout_bytes += chunk.text.len();
                }
                StreamKind::Stderr => {
                    metrics.stderr_chunks += 1;
                    metrics.stderr_bytes += chunk.text.len();
                }
            }
        }
        metrics
    }
}

/// Outcome of validating a request without running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when `errors` is empty.
    pub is_valid: bool,
    /// Problems that prevent execution.
    pub errors: Vec<String>,
    /// Problems worth surfacing that do not prevent execution.
    pub warnings: Vec<String>,
    /// Static analysis, when the content could be resolved.
    pub analysis: Option<SecurityAnalysis>,
}
