//! Result recording for terminal executions.
//!
//! The engine hands every execution that reaches a terminal state to a
//! [`ResultRecorder`], along with a few per-execution metrics. Recording runs
//! off the lifecycle path: a failing backend is logged and never changes the
//! execution's outcome.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::model::Execution;

/// Pluggable sink for execution results and metrics.
#[async_trait::async_trait]
pub trait ResultRecorder: Send + Sync {
    /// Persist a terminal execution snapshot.
    async fn record_execution_result(&self, execution: &Execution) -> anyhow::Result<()>;

    /// Record one metric sample.
    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> anyhow::Result<()>;
}

/// SHA-256 of a string as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait::async_trait]
impl ResultRecorder for NoopRecorder {
    async fn record_execution_result(&self, _execution: &Execution) -> anyhow::Result<()> {
        Ok(())
    }

    async fn record_metric(
        &self,
        _name: &str,
        _value: f64,
        _tags: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits results as structured `tracing` events at `INFO` with `audit = true`.
///
/// Output text is summarised as counts; script content never appears, only
/// its hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingRecorder;

#[async_trait::async_trait]
impl ResultRecorder for TracingRecorder {
    async fn record_execution_result(&self, execution: &Execution) -> anyhow::Result<()> {
        tracing::info!(
            audit = true,
            execution_id = %execution.id,
            status = execution.status.as_str(),
            error_kind = execution.error_kind.map(|k| k.as_str()),
            exit_code = execution.exit_code,
            duration_ms = execution.duration_ms(),
            peak_memory_bytes = execution.resource_usage.peak_memory_bytes,
            content_hash = %execution.script_reference.content_hash(),
            requested_by = %execution.requested_by,
            output_chunks = execution.output.len(),
            output_truncated = execution.output_truncated,
            "execution recorded"
        );
        Ok(())
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        tracing::info!(audit = true, metric = name, value, tags = ?tags, "metric recorded");
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RecordLine<'a> {
    Execution(&'a Execution),
    Metric {
        name: &'a str,
        value: f64,
        tags: BTreeMap<&'a str, &'a str>,
        timestamp: DateTime<Utc>,
    },
}

/// Writes one JSON object per line to an `AsyncWrite` sink.
///
/// Lines carry a `type` of `execution` or `metric`.
pub struct JsonLinesRecorder<W: AsyncWrite + Unpin + Send> {
    writer: tokio::sync::Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesRecorder<W> {
    /// Record into `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// Give the sink back.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    async fn write_line(&self, line: &RecordLine<'_>) -> anyhow::Result<()> {
        let mut buf = serde_json::to_vec(line).context("failed to serialize record")?;
        buf.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&buf)
            .await
            .context("failed to write record")?;
        writer.flush().await.context("failed to flush record")?;
        Ok(())
    }
}

impl JsonLinesRecorder<tokio::fs::File> {
    /// Append to the file at `path`, creating it if needed.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open result log {}", path.display()))?;
        Ok(Self::new(file))
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> ResultRecorder for JsonLinesRecorder<W> {
    async fn record_execution_result(&self, execution: &Execution) -> anyhow::Result<()> {
        self.write_line(&RecordLine::Execution(execution)).await
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        self.write_line(&RecordLine::Metric {
            name,
            value,
            tags: tags.iter().copied().collect(),
            timestamp: Utc::now(),
        })
        .await
    }
}

/// A metric sample captured by [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    /// Metric name.
    pub name: String,
    /// Sample value.
    pub value: f64,
    /// Tags in the order given.
    pub tags: Vec<(String, String)>,
}

impl RecordedMetric {
    /// Value of the tag `key`, if present.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Keeps everything in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    executions: Mutex<Vec<Execution>>,
    metrics: Mutex<Vec<RecordedMetric>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryRecorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Executions recorded so far.
    pub fn executions(&self) -> Vec<Execution> {
        lock(&self.executions).clone()
    }

    /// Metric samples recorded so far.
    pub fn metrics(&self) -> Vec<RecordedMetric> {
        lock(&self.metrics).clone()
    }

    /// Samples of one metric.
    pub fn metric(&self, name: &str) -> Vec<RecordedMetric> {
        lock(&self.metrics)
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl ResultRecorder for MemoryRecorder {
    async fn record_execution_result(&self, execution: &Execution) -> anyhow::Result<()> {
        lock(&self.executions).push(execution.clone());
        Ok(())
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        lock(&self.metrics).push(RecordedMetric {
            name: name.to_string(),
            value,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        Ok(())
    }
}

/// Records into several backends. Every backend is tried; the call fails if
/// any of them did.
#[derive(Clone, Default)]
pub struct FanoutRecorder {
    backends: Vec<Arc<dyn ResultRecorder>>,
}

impl FanoutRecorder {
    /// No backends yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend.
    pub fn with(mut self, backend: Arc<dyn ResultRecorder>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Number of backends.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// True when there are no backends.
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

fn combine(failures: Vec<anyhow::Error>, total: usize) -> anyhow::Result<()> {
    match failures.len() {
        0 => Ok(()),
        n => {
            let first = failures.into_iter().next().map(|e| format!("{e:#}"));
            Err(anyhow::anyhow!(
                "{n} of {total} recorder backends failed: {}",
                first.unwrap_or_default()
            ))
        }
    }
}

#[async_trait::async_trait]
impl ResultRecorder for FanoutRecorder {
    async fn record_execution_result(&self, execution: &Execution) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for backend in &self.backends {
            if let Err(e) = backend.record_execution_result(execution).await {
                failures.push(e);
            }
        }
        combine(failures, self.backends.len())
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for backend in &self.backends {
            if let Err(e) = backend.record_metric(name, value, tags).await {
                failures.push(e);
            }
        }
        combine(failures, self.backends.len())
    }
}

/// Retries a backend with linear backoff: attempt `n` waits `n * backoff`
/// before trying again.
pub struct RetryingRecorder {
    inner: Arc<dyn ResultRecorder>,
    attempts: u32,
    backoff: Duration,
}

impl RetryingRecorder {
    /// Try `inner` up to `attempts` times (at least once).
    pub fn new(inner: Arc<dyn ResultRecorder>, attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }
}

#[async_trait::async_trait]
impl ResultRecorder for RetryingRecorder {
    async fn record_execution_result(&self, execution: &Execution) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.record_execution_result(execution).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.attempts => {
                    return Err(e.context(format!("gave up after {attempt} attempts")))
                }
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "recording failed, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn record_metric(
        &self,
        name: &str,
        value: f64,
        tags: &[(&str, &str)],
    ) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.inner.record_metric(name, value, tags).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.attempts => {
                    return Err(e.context(format!("gave up after {attempt} attempts")))
                }
                Err(e) => {
                    tracing::debug!(attempt, metric = name, error = %e, "recording failed, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}
