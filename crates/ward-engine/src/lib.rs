#![warn(missing_docs)]

//! # ward-engine
//!
//! Sandboxed PowerShell script execution for scriptward.
//!
//! Every request passes through the same pipeline before an interpreter is
//! started:
//!
//! - **Validation**: content, size and parameter checks
//! - **Risk analysis**: static pattern rules score the script
//! - **Authorization**: caller clearance against script risk, with step-up
//!   verification for high-risk scripts
//! - **Admission**: a hard cap on concurrent executions, no queueing
//!
//! Admitted scripts run in a separate interpreter process with a wall-clock
//! deadline, a memory ceiling and cooperative-then-forced cancellation.
//! Output and lifecycle changes are fanned out to subscribers as they happen,
//! and every terminal execution is handed to a [`ResultRecorder`].

pub mod admission;
pub mod authz;
pub mod catalog;
mod comments;
pub mod engine;
pub mod error;
pub mod host;
pub mod ipc;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod model;
pub mod pool;
pub mod process;
pub mod recorder;
pub mod relay;
pub mod risk;
pub mod runner;
pub mod validate;

pub use catalog::ScriptDefinition;
pub use engine::{EngineBuilder, EngineConfig, ExecutionEngine};
pub use model::*;
pub use process::{RunJob, RunReport, RunnerEvent};
pub use recorder::ResultRecorder;
pub use ward_error::{EngineError, ErrorKind};

use authz::AuthorizationDecision;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Source of caller clearance.
///
/// Implementations decide what permission level a caller actually holds and
/// whether their step-up verification is recent; the comparison against the
/// script's risk is shared ([`authz::authorize`]).
#[async_trait::async_trait]
pub trait AuthorizationSource: Send + Sync {
    /// Decide whether `caller` may run a script with this analysis.
    async fn check_permission(
        &self,
        caller: &Caller,
        analysis: &SecurityAnalysis,
    ) -> AuthorizationDecision;
}

/// Lookup of stored scripts by identifier.
#[async_trait::async_trait]
pub trait ScriptCatalog: Send + Sync {
    /// The script stored under `script_id`, or `None` if there is none.
    async fn get_script(&self, script_id: &str) -> anyhow::Result<Option<ScriptDefinition>>;

    /// Every known script id, for suggestions. Empty when the catalog
    /// cannot enumerate itself.
    async fn list_scripts(&self) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Something that can run a job in an isolated interpreter.
///
/// `run` must not return until every event for the job has been sent on
/// `events`, and must stop the interpreter promptly once `cancel` fires.
#[async_trait::async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run one job to completion.
    async fn run(
        &self,
        job: RunJob,
        events: mpsc::Sender<RunnerEvent>,
        cancel: CancellationToken,
    ) -> RunReport;

    /// Called after a run ended in an engine crash, so the runner can restore
    /// its capacity for later executions.
    async fn recover(&self) {}

    /// Release runner resources. Called once during engine shutdown.
    async fn shutdown(&self) {}
}
