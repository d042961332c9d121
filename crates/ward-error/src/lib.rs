//! Typed errors for the scriptward execution engine.
//!
//! Provides [`ErrorKind`], the closed taxonomy of execution outcomes that
//! are not plain success, and [`EngineError`], the canonical error type
//! returned synchronously by the engine's public operations.
//!
//! Runtime failures (timeouts, crashes, script errors) are never returned as
//! [`EngineError`]; they are recorded on the execution as an [`ErrorKind`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed classification of why an execution did not simply succeed.
///
/// Serialized in `snake_case` so persisted records and log lines use stable
/// identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request or unknown script.
    ValidationError,
    /// The authorization gate denied the execution.
    SecurityBlocked,
    /// The caller must complete a step-up verification and retry.
    RequiresStepUpVerification,
    /// No concurrency slot was available.
    RejectedConcurrencyLimit,
    /// The wall-clock limit was exceeded.
    TimedOut,
    /// The memory ceiling was exceeded.
    ResourceLimitExceeded,
    /// The script itself failed.
    Failed,
    /// The interpreter host crashed; contained to one execution.
    EngineCrash,
    /// The caller cancelled the execution.
    Cancelled,
}

impl ErrorKind {
    /// Stable identifier, identical to the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::SecurityBlocked => "security_blocked",
            Self::RequiresStepUpVerification => "requires_step_up_verification",
            Self::RejectedConcurrencyLimit => "rejected_concurrency_limit",
            Self::TimedOut => "timed_out",
            Self::ResourceLimitExceeded => "resource_limit_exceeded",
            Self::Failed => "failed",
            Self::EngineCrash => "engine_crash",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether resubmitting the same request may produce a different outcome.
    pub fn retryable(&self) -> bool {
        match self {
            Self::RequiresStepUpVerification => true,
            Self::RejectedConcurrencyLimit => true,
            Self::EngineCrash => true,
            Self::TimedOut => false,
            Self::ResourceLimitExceeded => false,
            Self::ValidationError => false,
            Self::SecurityBlocked => false,
            Self::Failed => false,
            Self::Cancelled => false,
        }
    }

    /// Whether this kind is an error at all. Cancellation is caller-initiated.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned synchronously by engine operations.
///
/// These are resolved before any concurrency slot is acquired and before any
/// execution reaches `running`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The request is malformed; nothing was created.
    #[error("invalid execution request: {}", .errors.join("; "))]
    Validation {
        /// Every problem found, in discovery order.
        errors: Vec<String>,
    },

    /// A referenced script or execution does not exist.
    #[error("{what} not found: {id}")]
    NotFound {
        /// What was looked up ("script", "execution").
        what: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// The script's risk requires a recent step-up verification.
    #[error("step-up verification required for {risk} risk script")]
    StepUpRequired {
        /// The script's aggregate risk level.
        risk: String,
    },

    /// An execution with this id already exists.
    #[error("execution id already in use: {0}")]
    DuplicateExecution(String),

    /// The engine is shutting down and admits nothing new.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Shorthand for a missing script.
    pub fn script_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "script",
            id: id.into(),
        }
    }

    /// Shorthand for a missing execution.
    pub fn execution_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "execution",
            id: id.into(),
        }
    }

    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::StepUpRequired { .. } => "STEP_UP_REQUIRED",
            Self::DuplicateExecution(_) => "DUPLICATE_EXECUTION",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::StepUpRequired { .. } => true,
            Self::ShuttingDown => false,
            Self::Validation { .. } => false,
            Self::NotFound { .. } => false,
            Self::DuplicateExecution(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// The taxonomy entry this error corresponds to, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Validation { .. } | Self::NotFound { .. } | Self::DuplicateExecution(_) => {
                Some(ErrorKind::ValidationError)
            }
            Self::StepUpRequired { .. } => Some(ErrorKind::RequiresStepUpVerification),
            Self::ShuttingDown | Self::Internal(_) => None,
        }
    }

    /// Convert to a structured JSON error object for API callers.
    ///
    /// Returns a JSON object with `error`, `code`, `message`, `retryable`, and
    /// optionally `suggested_fix`. When `known_scripts` is provided, a missing
    /// script id is fuzzy-matched against it.
    pub fn to_structured_error(&self, known_scripts: Option<&[&str]>) -> serde_json::Value {
        let suggested_fix = match self {
            Self::NotFound { what: "script", id } => {
                known_scripts.and_then(|known| find_similar_script(id, known))
            }
            Self::StepUpRequired { .. } => {
                Some("Complete step-up verification and resubmit".to_string())
            }
            Self::DuplicateExecution(_) => {
                Some("Omit the execution id to have one generated".to_string())
            }
            _ => None,
        };

        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });

        if let Self::Validation { errors } = self {
            obj["errors"] = serde_json::json!(errors);
        }

        if let Some(fix) = suggested_fix {
            obj["suggested_fix"] = serde_json::Value::String(fix);
        }

        obj
    }
}

/// Find the closest script id using Levenshtein distance.
///
/// Returns a suggestion string if an id within edit distance 3 is found.
fn find_similar_script(id: &str, known: &[&str]) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for &candidate in known {
        let dist = strsim::levenshtein(id, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, s)| format!("Did you mean script '{s}'?"))
}

// Compile-time assertion: EngineError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<EngineError>();
};
