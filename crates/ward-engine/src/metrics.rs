//! Prometheus metrics for the execution engine.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;

use crate::model::ExecutionStatus;
use ward_error::ErrorKind;

/// Label set keyed by terminal status.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabels {
    /// Terminal status, e.g. "completed" or "timed_out".
    pub status: String,
}

/// Label set keyed by error kind.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// The error kind, e.g. "engine_crash".
    pub error_kind: String,
}

/// Engine metrics, registered on a caller-owned [`Registry`].
pub struct EngineMetrics {
    /// Executions that reached a terminal state.
    pub executions_total: Family<StatusLabels, Counter>,
    /// Start-to-finish time of executions that ran.
    pub execution_duration_seconds: Family<StatusLabels, Histogram>,
    /// Terminal executions by error kind.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Executions currently holding a concurrency slot.
    pub running_executions: Gauge<i64, AtomicI64>,
    /// Interpreter hosts alive in the pool (hosted mode only).
    pub pool_hosts_alive: Gauge<i64, AtomicI64>,
}

impl EngineMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let executions_total = Family::default();
        registry.register(
            "scriptward_executions",
            "Executions that reached a terminal state",
            executions_total.clone(),
        );

        let execution_duration_seconds =
            Family::<StatusLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(
                    [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0].into_iter(),
                )
            });
        registry.register(
            "scriptward_execution_duration_seconds",
            "Interpreter run time",
            execution_duration_seconds.clone(),
        );

        let errors_total = Family::default();
        registry.register(
            "scriptward_errors",
            "Terminal executions by error kind",
            errors_total.clone(),
        );

        let running_executions = Gauge::default();
        registry.register(
            "scriptward_running_executions",
            "Executions currently holding a concurrency slot",
            running_executions.clone(),
        );

        let pool_hosts_alive = Gauge::default();
        registry.register(
            "scriptward_pool_hosts_alive",
            "Interpreter hosts alive in the pool",
            pool_hosts_alive.clone(),
        );

        Self {
            executions_total,
            execution_duration_seconds,
            errors_total,
            running_executions,
            pool_hosts_alive,
        }
    }

    /// Record a terminal execution.
    pub fn record_terminal(
        &self,
        status: ExecutionStatus,
        error_kind: Option<ErrorKind>,
        duration_secs: Option<f64>,
    ) {
        let labels = StatusLabels {
            status: status.as_str().to_string(),
        };
        self.executions_total.get_or_create(&labels).inc();
        if let Some(secs) = duration_secs {
            self.execution_duration_seconds
                .get_or_create(&labels)
                .observe(secs);
        }
        if let Some(kind) = error_kind {
            self.errors_total
                .get_or_create(&ErrorLabels {
                    error_kind: kind.as_str().to_string(),
                })
                .inc();
        }
    }
}
