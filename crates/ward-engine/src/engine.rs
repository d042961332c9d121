//! The execution supervisor.
//!
//! [`ExecutionEngine`] owns the registry of executions and drives each one
//! through its lifecycle:
//!
//! ```text
//! resolve -> validate -> authorize -> register (Pending) -> admit -> run -> terminal
//! ```
//!
//! Validation and step-up failures are returned synchronously and create no
//! state. Everything after registration is recorded on the execution itself.
//! Each execution's state lives in a `watch` channel written only by its own
//! lifecycle; every reader works on a cloned snapshot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use ward_error::{EngineError, ErrorKind};

use crate::admission::{AdmissionController, AdmissionRejected, ConcurrencySlot};
use crate::authz::{AuthorizationDecision, PolicyGate};
#[cfg(feature = "metrics")]
use crate::metrics::EngineMetrics;
use crate::model::{
    Caller, Execution, ExecutionId, ExecutionMetrics, ExecutionRequest, ExecutionStatus,
    ExitSignal, OutputChunk, Parameters, ProgressEvent, ResourceUsage, ScriptReference,
    ScriptSource, SecurityAnalysis, ValidationReport,
};
use crate::pool::{HostPool, PoolConfig};
use crate::process::{InterpreterConfig, RunJob, RunLimits, RunOutcome, RunReport, RunnerEvent};
use crate::recorder::{sha256_hex, ResultRecorder, RetryingRecorder, TracingRecorder};
use crate::relay::{Relay, Subscription, DEFAULT_RELAY_CAPACITY};
use crate::risk::RiskAnalyzer;
use crate::runner::{DirectRunner, HostedRunner, RunnerMode};
use crate::validate::{unknown_script, validate_script, DEFAULT_MAX_SCRIPT_BYTES};
use crate::{AuthorizationSource, ScriptCatalog, ScriptRunner};

const RUNNER_EVENT_BUFFER: usize = 256;
const RECORDER_BACKOFF: Duration = Duration::from_millis(200);

/// Engine settings. Every field has a working default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Hard cap on executions holding a slot at once.
    pub max_concurrent: usize,
    /// Per-run limits handed to the runner.
    pub limits: RunLimits,
    /// Output retained on each execution; later output is still relayed.
    pub max_output_bytes: usize,
    /// Largest accepted script.
    pub max_script_bytes: usize,
    /// Which runner to build when none is supplied.
    pub runner_mode: RunnerMode,
    /// Interpreter command line and parameter binding.
    pub interpreter: InterpreterConfig,
    /// Host pool settings for [`RunnerMode::Hosted`].
    pub pool: PoolConfig,
    /// How long terminal executions stay queryable.
    pub retain_completed: Duration,
    /// Upper bound on retained executions.
    pub max_retained: usize,
    /// Per-subscriber event buffer.
    pub relay_capacity: usize,
    /// Attempts per recorder call.
    pub recorder_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            limits: RunLimits::default(),
            max_output_bytes: 10 * 1024 * 1024,
            max_script_bytes: DEFAULT_MAX_SCRIPT_BYTES,
            runner_mode: RunnerMode::default(),
            interpreter: InterpreterConfig::default(),
            pool: PoolConfig::default(),
            retain_completed: Duration::from_secs(3600),
            max_retained: 1000,
            relay_capacity: DEFAULT_RELAY_CAPACITY,
            recorder_attempts: 3,
        }
    }
}

/// Assembles an [`ExecutionEngine`] from its collaborators.
pub struct EngineBuilder {
    config: EngineConfig,
    runner: Option<Arc<dyn ScriptRunner>>,
    recorder: Arc<dyn ResultRecorder>,
    catalog: Option<Arc<dyn ScriptCatalog>>,
    authorizer: Arc<dyn AuthorizationSource>,
    analyzer: RiskAnalyzer,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<EngineMetrics>>,
}

impl EngineBuilder {
    /// Start from `config` with default collaborators: runner per
    /// `config.runner_mode`, [`TracingRecorder`], [`PolicyGate`], the default
    /// denylist and no catalog.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            runner: None,
            recorder: Arc::new(TracingRecorder),
            catalog: None,
            authorizer: Arc::new(PolicyGate),
            analyzer: RiskAnalyzer::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Use a specific runner instead of the one `runner_mode` selects.
    pub fn runner(mut self, runner: Arc<dyn ScriptRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Where terminal executions are recorded.
    pub fn recorder(mut self, recorder: Arc<dyn ResultRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Where catalog script ids are resolved.
    pub fn catalog(mut self, catalog: Arc<dyn ScriptCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Where caller clearance comes from.
    pub fn authorizer(mut self, authorizer: Arc<dyn AuthorizationSource>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Risk rules to analyze scripts with.
    pub fn analyzer(mut self, analyzer: RiskAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Report into these Prometheus metrics.
    #[cfg(feature = "metrics")]
    pub fn metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the engine.
    ///
    /// In hosted mode this starts the host pool's background tasks, so it
    /// must be called within a Tokio runtime.
    pub fn build(self) -> ExecutionEngine {
        let config = self.config;
        let mut pool = None;
        let runner = match self.runner {
            Some(runner) => runner,
            None => match config.runner_mode {
                RunnerMode::Direct => Arc::new(DirectRunner) as Arc<dyn ScriptRunner>,
                RunnerMode::Hosted => {
                    let mut pool_config = config.pool.clone();
                    if pool_config.max_hosts < config.max_concurrent {
                        tracing::warn!(
                            max_hosts = pool_config.max_hosts,
                            max_concurrent = config.max_concurrent,
                            "host pool smaller than admission limit, raising max_hosts"
                        );
                        pool_config.max_hosts = config.max_concurrent;
                    }
                    let hosts = Arc::new(HostPool::new(pool_config));
                    pool = Some(Arc::clone(&hosts));
                    Arc::new(HostedRunner::new(hosts))
                }
            },
        };
        let recorder: Arc<dyn ResultRecorder> = if config.recorder_attempts > 1 {
            Arc::new(RetryingRecorder::new(
                self.recorder,
                config.recorder_attempts,
                RECORDER_BACKOFF,
            ))
        } else {
            self.recorder
        };

        tracing::info!(
            max_concurrent = config.max_concurrent,
            runner_mode = %config.runner_mode,
            interpreter = %config.interpreter.program,
            timeout_ms = config.limits.timeout_ms,
            max_memory_bytes = config.limits.max_memory_bytes,
            "execution engine ready"
        );

        ExecutionEngine {
            inner: Arc::new(EngineInner {
                admission: AdmissionController::new(config.max_concurrent),
                relay: Relay::new(config.relay_capacity),
                runner,
                recorder,
                catalog: self.catalog,
                authorizer: self.authorizer,
                analyzer: self.analyzer,
                pool,
                registry: RwLock::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutting_down: AtomicBool::new(false),
                #[cfg(feature = "metrics")]
                metrics: self.metrics,
                config,
            }),
        }
    }
}

/// One execution's state and its cancellation switch.
struct ExecutionCell {
    state: watch::Sender<Execution>,
    cancel: CancellationToken,
}

impl ExecutionCell {
    fn snapshot(&self) -> Execution {
        let mut exec = self.state.borrow().clone();
        exec.cancellation_requested |= self.cancel.is_cancelled();
        exec
    }

    fn status(&self) -> ExecutionStatus {
        self.state.borrow().status
    }
}

struct ResolvedScript {
    reference: ScriptReference,
    content: String,
    required: Vec<String>,
}

enum Resolution {
    Found(ResolvedScript),
    UnknownScript(String),
}

/// How an execution ends.
struct Terminal {
    status: ExecutionStatus,
    error_kind: Option<ErrorKind>,
    message: Option<String>,
    exit_code: Option<i32>,
    exit_signal: ExitSignal,
    peak_memory_bytes: Option<u64>,
    elapsed_ms: u64,
}

impl Terminal {
    /// Ended before an interpreter was involved.
    fn early(status: ExecutionStatus, error_kind: ErrorKind, message: String) -> Self {
        Self {
            status,
            error_kind: Some(error_kind),
            message: Some(message),
            exit_code: None,
            exit_signal: ExitSignal::None,
            peak_memory_bytes: None,
            elapsed_ms: 0,
        }
    }

    fn from_report(report: RunReport, limits: &RunLimits) -> Self {
        let (status, error_kind, message, exit_signal) = match report.outcome {
            RunOutcome::Completed => (ExecutionStatus::Completed, None, None, ExitSignal::Success),
            RunOutcome::Failed { detail } => (
                ExecutionStatus::Failed,
                Some(ErrorKind::Failed),
                Some(detail),
                ExitSignal::Error,
            ),
            RunOutcome::TimedOut => (
                ExecutionStatus::TimedOut,
                Some(ErrorKind::TimedOut),
                Some(format!(
                    "execution exceeded the time limit of {} ms",
                    limits.timeout_ms
                )),
                ExitSignal::Error,
            ),
            RunOutcome::MemoryExceeded { peak_bytes } => (
                ExecutionStatus::ResourceLimitExceeded,
                Some(ErrorKind::ResourceLimitExceeded),
                Some(format!(
                    "memory use of {peak_bytes} bytes exceeded the limit of {} bytes",
                    limits.max_memory_bytes
                )),
                ExitSignal::Error,
            ),
            RunOutcome::Cancelled => (
                ExecutionStatus::Cancelled,
                Some(ErrorKind::Cancelled),
                Some("execution was cancelled".to_string()),
                ExitSignal::None,
            ),
            RunOutcome::EngineCrash { detail } => (
                ExecutionStatus::Failed,
                Some(ErrorKind::EngineCrash),
                Some(detail),
                ExitSignal::Error,
            ),
        };
        Self {
            status,
            error_kind,
            message,
            exit_code: report.exit_code,
            exit_signal,
            peak_memory_bytes: report.peak_memory_bytes,
            elapsed_ms: report.elapsed_ms,
        }
    }
}

/// Output sequencing and retention for one execution.
///
/// Retained output is always a prefix of what was produced: once the byte
/// budget is exhausted nothing further is kept, though it is still relayed.
#[derive(Debug)]
struct OutputLedger {
    next_seq: u64,
    retained_bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

enum Retention {
    Keep,
    Drop,
    /// The first chunk that did not fit.
    StartTruncating,
}

impl OutputLedger {
    fn new(max_bytes: usize) -> Self {
        Self {
            next_seq: 0,
            retained_bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn admit(&mut self, len: usize) -> Retention {
        if self.truncated {
            return Retention::Drop;
        }
        if self.retained_bytes + len > self.max_bytes {
            self.truncated = true;
            return Retention::StartTruncating;
        }
        self.retained_bytes += len;
        Retention::Keep
    }
}

struct EngineInner {
    config: EngineConfig,
    runner: Arc<dyn ScriptRunner>,
    recorder: Arc<dyn ResultRecorder>,
    catalog: Option<Arc<dyn ScriptCatalog>>,
    authorizer: Arc<dyn AuthorizationSource>,
    analyzer: RiskAnalyzer,
    admission: Arc<AdmissionController>,
    relay: Relay,
    pool: Option<Arc<HostPool>>,
    registry: RwLock<HashMap<ExecutionId, Arc<ExecutionCell>>>,
    tasks: TaskTracker,
    shutting_down: AtomicBool,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<EngineMetrics>>,
}

/// Public facade of the engine. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Start building an engine.
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// An engine with default collaborators. See [`EngineBuilder::build`].
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::new(config).build()
    }

    /// The configuration in effect.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The interpreter host pool, when the engine built one.
    pub fn host_pool(&self) -> Option<&Arc<HostPool>> {
        self.inner.pool.as_ref()
    }

    /// Concurrency slots currently free.
    pub fn available_slots(&self) -> usize {
        self.inner.admission.available()
    }

    /// Prometheus metrics, when configured.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<EngineMetrics>> {
        self.inner.metrics.as_ref()
    }

    /// Analyze script text with the engine's rules.
    pub fn analyze(&self, content: &str) -> SecurityAnalysis {
        self.inner.analyzer.analyze(content)
    }

    /// Check a request without running it. No state is created.
    ///
    /// Fails only when the catalog itself cannot be read.
    pub async fn validate_execution(
        &self,
        source: &ScriptSource,
        parameters: &Parameters,
    ) -> Result<ValidationReport, EngineError> {
        let inner = &self.inner;
        Ok(match inner.resolve(source).await? {
            Resolution::Found(script) => validate_script(
                &script.content,
                parameters,
                &script.required,
                &inner.analyzer,
                inner.config.max_script_bytes,
            ),
            Resolution::UnknownScript(script_id) => unknown_script(&script_id, parameters),
        })
    }

    /// Run a catalog script. See [`execute_request`](Self::execute_request).
    pub async fn execute_script(
        &self,
        script_id: &str,
        parameters: Parameters,
        requested_by: Caller,
    ) -> Result<Execution, EngineError> {
        self.execute_request(ExecutionRequest::new(
            ScriptSource::catalog(script_id),
            parameters,
            requested_by,
        ))
        .await
    }

    /// Run ad hoc script text. See [`execute_request`](Self::execute_request).
    pub async fn execute_script_content(
        &self,
        content: &str,
        parameters: Parameters,
        requested_by: Caller,
    ) -> Result<Execution, EngineError> {
        self.execute_request(ExecutionRequest::new(
            ScriptSource::inline(content),
            parameters,
            requested_by,
        ))
        .await
    }

    /// Submit a request.
    ///
    /// Returns once the execution is running or has already ended, with a
    /// snapshot of it. Invalid input, unknown scripts, missing step-up
    /// verification, duplicate ids and shutdown are errors and leave no
    /// trace. Denial, rejection for capacity and every runtime outcome are
    /// reported as the execution's status.
    #[tracing::instrument(skip_all, fields(caller = %request.requested_by.id))]
    pub async fn execute_request(&self, request: ExecutionRequest) -> Result<Execution, EngineError> {
        let inner = &self.inner;
        if inner.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }

        let script = match inner.resolve(&request.source).await? {
            Resolution::Found(script) => script,
            Resolution::UnknownScript(script_id) => {
                return Err(EngineError::script_not_found(script_id))
            }
        };
        let report = validate_script(
            &script.content,
            &request.parameters,
            &script.required,
            &inner.analyzer,
            inner.config.max_script_bytes,
        );
        if !report.is_valid {
            return Err(EngineError::Validation {
                errors: report.errors,
            });
        }
        let analysis = report
            .analysis
            .unwrap_or_else(|| inner.analyzer.analyze(&script.content));

        let decision = inner
            .authorizer
            .check_permission(&request.requested_by, &analysis)
            .await;
        if decision == AuthorizationDecision::RequiresStepUpVerification {
            tracing::info!(risk = %analysis.risk_score, "step-up verification required");
            return Err(EngineError::StepUpRequired {
                risk: analysis.risk_score.to_string(),
            });
        }

        let id = request.execution_id.unwrap_or_default();
        let blocked = match &decision {
            AuthorizationDecision::Denied { reason } => Some(blocked_message(reason, &analysis)),
            _ => None,
        };
        let execution = Execution::pending(
            id,
            script.reference,
            request.parameters.clone(),
            request.requested_by.id.as_str(),
            analysis,
        );
        let cell = inner.register(execution)?;
        inner.relay.open(id);
        inner
            .relay
            .publish(ProgressEvent::status(id, ExecutionStatus::Pending, None));
        tracing::info!(execution_id = %id, "execution accepted");

        if let Some(message) = blocked {
            tracing::warn!(execution_id = %id, %message, "execution blocked by authorization");
            inner.finish(
                &cell,
                Terminal::early(
                    ExecutionStatus::SecurityBlocked,
                    ErrorKind::SecurityBlocked,
                    message,
                ),
            );
            return Ok(cell.snapshot());
        }
        if cell.cancel.is_cancelled() {
            inner.finish(&cell, cancelled_before_admission());
            return Ok(cell.snapshot());
        }

        let slot = match inner.admission.try_admit(id) {
            Ok(slot) => slot,
            Err(AdmissionRejected::Full { capacity }) => {
                tracing::warn!(execution_id = %id, capacity, "execution rejected at concurrency limit");
                inner.finish(
                    &cell,
                    Terminal::early(
                        ExecutionStatus::RejectedConcurrencyLimit,
                        ErrorKind::RejectedConcurrencyLimit,
                        format!("concurrency limit of {capacity} executions reached"),
                    ),
                );
                return Ok(cell.snapshot());
            }
            Err(AdmissionRejected::Closed) => {
                inner.finish(
                    &cell,
                    Terminal::early(
                        ExecutionStatus::Cancelled,
                        ErrorKind::Cancelled,
                        "engine is shutting down".to_string(),
                    ),
                );
                return Ok(cell.snapshot());
            }
        };
        inner.transition(&cell, ExecutionStatus::Admitted, |_| {});
        inner.observe_running(1);

        let job = RunJob {
            execution_id: id,
            content: script.content,
            parameters: request.parameters,
            interpreter: inner.config.interpreter.clone(),
            limits: inner.config.limits,
        };
        let mut started = cell.state.subscribe();
        inner.tasks.spawn(drive(
            Arc::clone(inner),
            Arc::clone(&cell),
            slot,
            job,
        ));
        let _ = started
            .wait_for(|exec| {
                !matches!(
                    exec.status,
                    ExecutionStatus::Pending | ExecutionStatus::Admitted
                )
            })
            .await;
        Ok(cell.snapshot())
    }

    /// Request cancellation.
    ///
    /// `true` when the execution was still cancellable; `false` when it is
    /// unknown or already terminal.
    pub fn cancel_execution(&self, id: ExecutionId) -> bool {
        let Some(cell) = self.inner.cell(id) else {
            return false;
        };
        if cell.status().is_terminal() {
            return false;
        }
        tracing::info!(execution_id = %id, "cancellation requested");
        cell.cancel.cancel();
        true
    }

    /// Snapshot of one execution.
    pub fn get_execution(&self, id: ExecutionId) -> Result<Execution, EngineError> {
        self.inner
            .cell(id)
            .map(|cell| cell.snapshot())
            .ok_or_else(|| EngineError::execution_not_found(id.to_string()))
    }

    /// Snapshots of every execution that has not finished, oldest first.
    pub fn get_running_executions(&self) -> Vec<Execution> {
        let mut running: Vec<Execution> = self
            .inner
            .registry()
            .values()
            .filter(|cell| !cell.status().is_terminal())
            .map(|cell| cell.snapshot())
            .collect();
        running.sort_by_key(|exec| exec.created_at);
        running
    }

    /// Snapshots of every retained execution, oldest first.
    pub fn list_executions(&self) -> Vec<Execution> {
        let mut all: Vec<Execution> = self
            .inner
            .registry()
            .values()
            .map(|cell| cell.snapshot())
            .collect();
        all.sort_by_key(|exec| exec.created_at);
        all
    }

    /// Timing and volume figures for one execution.
    pub fn get_execution_metrics(&self, id: ExecutionId) -> Result<ExecutionMetrics, EngineError> {
        self.get_execution(id).map(|exec| ExecutionMetrics::from(&exec))
    }

    /// Live events for one execution, from now on.
    ///
    /// For an execution that has already finished the stream is empty.
    pub fn subscribe(&self, id: ExecutionId) -> Result<Subscription, EngineError> {
        if self.inner.cell(id).is_none() {
            return Err(EngineError::execution_not_found(id.to_string()));
        }
        Ok(self
            .inner
            .relay
            .subscribe(id)
            .unwrap_or_else(Subscription::finished))
    }

    /// Live events for every execution.
    pub fn subscribe_all(&self) -> Subscription {
        self.inner.relay.subscribe_all()
    }

    /// Wait up to `timeout` for the execution to finish and return its
    /// snapshot. The snapshot is not terminal if the wait timed out.
    pub async fn wait_for_completion(
        &self,
        id: ExecutionId,
        timeout: Duration,
    ) -> Result<Execution, EngineError> {
        let cell = self
            .inner
            .cell(id)
            .ok_or_else(|| EngineError::execution_not_found(id.to_string()))?;
        let mut rx = cell.state.subscribe();
        let _ = tokio::time::timeout(timeout, async {
            let _ = rx.wait_for(|exec| exec.status.is_terminal()).await;
        })
        .await;
        Ok(cell.snapshot())
    }

    /// Stop admitting, cancel everything in flight and wait up to `grace`
    /// for it to wind down, then release runner resources.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.admission.close();

        let in_flight: Vec<Arc<ExecutionCell>> = inner
            .registry()
            .values()
            .filter(|cell| !cell.status().is_terminal())
            .cloned()
            .collect();
        tracing::info!(in_flight = in_flight.len(), "engine shutting down");
        for cell in &in_flight {
            cell.cancel.cancel();
        }

        inner.tasks.close();
        let drained = tokio::time::timeout(grace, async {
            for cell in &in_flight {
                let mut rx = cell.state.subscribe();
                let _ = rx.wait_for(|exec| exec.status.is_terminal()).await;
            }
            inner.tasks.wait().await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "shutdown grace period elapsed with work outstanding"
            );
        }
        inner.runner.shutdown().await;
        tracing::info!("engine stopped");
    }
}

impl EngineInner {
    fn registry(&self) -> RwLockReadGuard<'_, HashMap<ExecutionId, Arc<ExecutionCell>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, HashMap<ExecutionId, Arc<ExecutionCell>>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn cell(&self, id: ExecutionId) -> Option<Arc<ExecutionCell>> {
        self.registry().get(&id).cloned()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn resolve(&self, source: &ScriptSource) -> Result<Resolution, EngineError> {
        match source {
            ScriptSource::Inline { content } => Ok(Resolution::Found(ResolvedScript {
                reference: ScriptReference::Inline {
                    content_hash: sha256_hex(content),
                },
                content: content.clone(),
                required: Vec::new(),
            })),
            ScriptSource::Catalog { script_id } => {
                let Some(catalog) = &self.catalog else {
                    return Ok(Resolution::UnknownScript(script_id.clone()));
                };
                let found = catalog.get_script(script_id).await.map_err(|e| {
                    EngineError::Internal(e.context(format!("catalog lookup for '{script_id}' failed")))
                })?;
                Ok(match found {
                    Some(def) => Resolution::Found(ResolvedScript {
                        reference: ScriptReference::Catalog {
                            script_id: def.id,
                            content_hash: sha256_hex(&def.content),
                        },
                        content: def.content,
                        required: def.required_parameters,
                    }),
                    None => Resolution::UnknownScript(script_id.clone()),
                })
            }
        }
    }

    /// Insert a new execution, pruning old terminal ones to stay within the
    /// retention limits.
    fn register(&self, execution: Execution) -> Result<Arc<ExecutionCell>, EngineError> {
        let id = execution.id;
        let mut registry = self.registry_mut();
        if registry.contains_key(&id) {
            return Err(EngineError::DuplicateExecution(id.to_string()));
        }
        self.prune(&mut registry);
        let (state, _) = watch::channel(execution);
        let cell = Arc::new(ExecutionCell {
            state,
            cancel: CancellationToken::new(),
        });
        registry.insert(id, Arc::clone(&cell));
        Ok(cell)
    }

    fn prune(&self, registry: &mut HashMap<ExecutionId, Arc<ExecutionCell>>) {
        let cutoff = chrono::Duration::from_std(self.config.retain_completed)
            .ok()
            .and_then(|retain| Utc::now().checked_sub_signed(retain));
        let mut finished: Vec<(ExecutionId, chrono::DateTime<Utc>)> = registry
            .iter()
            .filter_map(|(id, cell)| {
                let exec = cell.state.borrow();
                match exec.completed_at {
                    Some(at) if exec.status.is_terminal() => Some((*id, at)),
                    _ => None,
                }
            })
            .collect();
        finished.sort_by_key(|(_, at)| *at);

        // room for the execution about to be inserted
        let mut excess = (registry.len() + 1).saturating_sub(self.config.max_retained.max(1));
        let mut removed = 0usize;
        for (id, completed_at) in finished {
            let expired = cutoff.is_some_and(|cutoff| completed_at < cutoff);
            if !expired && excess == 0 {
                break;
            }
            registry.remove(&id);
            excess = excess.saturating_sub(1);
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!(removed, retained = registry.len(), "pruned finished executions");
        }
    }

    /// Apply a status change if the lifecycle graph allows it, then publish it.
    fn transition(
        &self,
        cell: &ExecutionCell,
        next: ExecutionStatus,
        update: impl FnOnce(&mut Execution),
    ) -> bool {
        let mut from = None;
        let applied = cell.state.send_if_modified(|exec| {
            from = Some(exec.status);
            if !exec.status.can_transition_to(next) {
                return false;
            }
            exec.status = next;
            update(exec);
            true
        });

        let (id, error_kind) = {
            let exec = cell.state.borrow();
            (exec.id, exec.error_kind)
        };
        let from = from.unwrap_or(next);
        if !applied {
            tracing::error!(execution_id = %id, %from, to = %next, "illegal status transition ignored");
            return false;
        }
        tracing::info!(execution_id = %id, %from, to = %next, "execution status changed");
        self.relay.publish(ProgressEvent::status(
            id,
            next,
            if next.is_terminal() { error_kind } else { None },
        ));
        applied
    }

    /// Move to a terminal state, close the event stream and hand the result
    /// to the recorder.
    fn finish(&self, cell: &Arc<ExecutionCell>, terminal: Terminal) {
        let cancel_requested = cell.cancel.is_cancelled();
        let status = terminal.status;
        let applied = self.transition(cell, status, move |exec| {
            exec.error_kind = terminal.error_kind;
            exec.error_message = terminal.message;
            exec.exit_code = terminal.exit_code;
            exec.exit_signal = terminal.exit_signal;
            exec.completed_at = Some(Utc::now());
            exec.resource_usage = ResourceUsage {
                peak_memory_bytes: terminal.peak_memory_bytes,
                elapsed_ms: terminal.elapsed_ms,
            };
            exec.cancellation_requested |= cancel_requested;
        });
        let snapshot = cell.snapshot();
        self.relay.close(snapshot.id);
        if !applied {
            return;
        }

        self.observe_terminal(&snapshot);
        let recorder = Arc::clone(&self.recorder);
        self.tasks.spawn(record_result(recorder, snapshot));
    }

    #[cfg(feature = "metrics")]
    fn observe_running(&self, delta: i64) {
        if let Some(metrics) = &self.metrics {
            metrics.running_executions.inc_by(delta);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn observe_running(&self, _delta: i64) {}

    #[cfg(feature = "metrics")]
    fn observe_terminal(&self, exec: &Execution) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.record_terminal(
            exec.status,
            exec.error_kind,
            exec.duration_ms().map(|ms| ms as f64 / 1000.0),
        );
        if let Some(pool) = &self.pool {
            metrics.pool_hosts_alive.set(pool.alive() as i64);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn observe_terminal(&self, _exec: &Execution) {}
}

fn blocked_message(reason: &str, analysis: &SecurityAnalysis) -> String {
    let findings: Vec<String> = analysis
        .findings_at_least(analysis.risk_score)
        .map(ToString::to_string)
        .collect();
    if findings.is_empty() {
        reason.to_string()
    } else {
        format!("{reason}; findings: {}", findings.join("; "))
    }
}

fn cancelled_before_admission() -> Terminal {
    Terminal::early(
        ExecutionStatus::Cancelled,
        ErrorKind::Cancelled,
        "execution was cancelled before it started".to_string(),
    )
}

/// Run an admitted execution to its terminal state.
async fn drive(
    inner: Arc<EngineInner>,
    cell: Arc<ExecutionCell>,
    slot: ConcurrencySlot,
    job: RunJob,
) {
    let id = job.execution_id;
    let limits = job.limits;
    let started = Instant::now();
    let (events_tx, mut events) = mpsc::channel(RUNNER_EVENT_BUFFER);
    let runner = Arc::clone(&inner.runner);
    let cancel = cell.cancel.clone();
    let run = tokio::spawn(async move { runner.run(job, events_tx, cancel).await });

    let mut ledger = OutputLedger::new(inner.config.max_output_bytes);
    while let Some(event) = events.recv().await {
        apply_event(&inner, &cell, &mut ledger, event);
    }
    let report = run.await.unwrap_or_else(|e| {
        RunReport::crash(format!("runner task failed: {e}"), started.elapsed())
    });

    if let RunOutcome::EngineCrash { detail } = &report.outcome {
        tracing::error!(execution_id = %id, %detail, "interpreter crashed; execution marked failed");
        let runner = Arc::clone(&inner.runner);
        inner.tasks.spawn(async move { runner.recover().await });
    }

    let terminal = Terminal::from_report(report, &limits);
    let needs_running = matches!(
        terminal.status,
        ExecutionStatus::Completed
            | ExecutionStatus::TimedOut
            | ExecutionStatus::ResourceLimitExceeded
    );
    if needs_running && cell.status() == ExecutionStatus::Admitted {
        // the runner never reported a start; keep the lifecycle graph intact
        inner.transition(&cell, ExecutionStatus::Running, |exec| {
            exec.started_at = Some(Utc::now());
        });
    }

    if slot.release() {
        inner.observe_running(-1);
    }
    inner.finish(&cell, terminal);
}

fn apply_event(
    inner: &EngineInner,
    cell: &ExecutionCell,
    ledger: &mut OutputLedger,
    event: RunnerEvent,
) {
    let id = cell.state.borrow().id;
    match event {
        RunnerEvent::Started { pid } => {
            tracing::debug!(execution_id = %id, pid, "interpreter started");
            inner.transition(cell, ExecutionStatus::Running, |exec| {
                exec.started_at = Some(Utc::now());
            });
        }
        RunnerEvent::Output { stream, text } => {
            let chunk = OutputChunk {
                stream,
                seq: ledger.next_seq(),
                text,
                timestamp: Utc::now(),
            };
            tracing::trace!(execution_id = %id, seq = chunk.seq, stream = ?stream, "output");
            match ledger.admit(chunk.text.len()) {
                Retention::Keep => {
                    let kept = chunk.clone();
                    cell.state.send_modify(|exec| exec.output.push(kept));
                }
                Retention::StartTruncating => {
                    tracing::warn!(
                        execution_id = %id,
                        max_output_bytes = inner.config.max_output_bytes,
                        "output limit reached; further output is relayed but not retained"
                    );
                    cell.state.send_modify(|exec| exec.output_truncated = true);
                }
                Retention::Drop => {}
            }
            inner.relay.publish(ProgressEvent::output(id, chunk));
        }
        RunnerEvent::Progress { percent, activity } => {
            tracing::debug!(execution_id = %id, ?percent, %activity, "progress");
            inner
                .relay
                .publish(ProgressEvent::progress(id, percent, activity));
        }
    }
}

/// Hand a terminal execution and its metrics to the recorder. Failures are
/// logged and otherwise ignored.
async fn record_result(recorder: Arc<dyn ResultRecorder>, exec: Execution) {
    if let Err(e) = recorder.record_execution_result(&exec).await {
        tracing::warn!(execution_id = %exec.id, error = %format!("{e:#}"), "failed to record execution result");
    }

    let tags = [
        ("status", exec.status.as_str()),
        ("error_kind", exec.error_kind.map_or("none", |k| k.as_str())),
    ];
    let mut samples = Vec::with_capacity(3);
    if let Some(ms) = exec.duration_ms() {
        samples.push(("execution.duration_ms", ms as f64));
    }
    if let Some(peak) = exec.resource_usage.peak_memory_bytes {
        samples.push(("execution.peak_memory_bytes", peak as f64));
    }
    let output_bytes: usize = exec.output.iter().map(|c| c.text.len()).sum();
    samples.push(("execution.output_bytes", output_bytes as f64));

    for (name, value) in samples {
        if let Err(e) = recorder.record_metric(name, value, &tags).await {
            tracing::warn!(execution_id = %exec.id, metric = name, error = %format!("{e:#}"), "failed to record metric");
        }
    }
}
