//! Pool of warm `ward-host` processes for the hosted runner.
//!
//! A host runs one job at a time. Idle hosts are health-checked with a
//! `Ping` before reuse; hosts that crashed, hit their use limit or sat idle
//! too long are killed. The alive count covers idle and checked-out hosts and
//! is bounded by `max_hosts`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::RunnerError;
use crate::host::{find_host_binary, HostProcess};
use crate::ipc::{HostMessage, SupervisorMessage};

/// Pool sizing and recycling policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hosts kept warm.
    pub min_hosts: usize,
    /// Upper bound on live hosts.
    pub max_hosts: usize,
    /// Idle hosts older than this are reaped, down to `min_hosts`.
    pub max_idle_time: Duration,
    /// Recycle a host after this many jobs. `None` never recycles.
    pub max_uses: Option<u32>,
    /// Ping round-trip allowance.
    pub health_check_timeout: Duration,
    /// How long a new host may take to report `Ready`.
    pub spawn_timeout: Duration,
    /// Explicit host binary; otherwise discovered.
    pub host_binary: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_hosts: 1,
            max_hosts: 8,
            max_idle_time: Duration::from_secs(300),
            max_uses: Some(100),
            health_check_timeout: Duration::from_millis(500),
            spawn_timeout: Duration::from_secs(5),
            host_binary: None,
        }
    }
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Hosts started.
    pub spawned: AtomicU64,
    /// Idle hosts handed out again.
    pub reused: AtomicU64,
    /// Hosts recycled at `max_uses`.
    pub killed_max_uses: AtomicU64,
    /// Hosts reaped for idleness.
    pub killed_idle: AtomicU64,
    /// Hosts killed after a crash or failed health check.
    pub killed_error: AtomicU64,
}

/// Decrements the alive count when the host it travels with is dropped.
#[derive(Debug)]
struct AliveSlot {
    alive: Arc<AtomicUsize>,
}

impl Drop for AliveSlot {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
struct PooledHost {
    process: HostProcess,
    _slot: AliveSlot,
    uses: u32,
    idle_since: Instant,
}

/// How a job on a host ended, for [`HostPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The host finished the job and can be reused.
    Ok,
    /// The host crashed or misbehaved and must be killed.
    Fatal,
}

/// A host checked out of the pool. Dropping it kills the host.
#[derive(Debug)]
pub struct AcquiredHost {
    host: PooledHost,
}

impl AcquiredHost {
    /// Host process id.
    pub fn pid(&self) -> Option<u32> {
        self.host.process.pid()
    }

    /// Send one frame to the host.
    pub async fn send(&mut self, msg: &SupervisorMessage) -> Result<(), RunnerError> {
        self.host.process.send(msg).await
    }

    /// Next frame from the host; `None` once it has gone away. Cancel-safe.
    pub async fn recv(&mut self) -> Option<HostMessage> {
        self.host.process.recv().await
    }
}

/// Warm host processes.
pub struct HostPool {
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledHost>>,
    alive: Arc<AtomicUsize>,
    metrics: Arc<PoolMetrics>,
    shutting_down: AtomicBool,
}

impl HostPool {
    /// An empty pool. Nothing is spawned until [`acquire`](Self::acquire) or
    /// [`replenish`](Self::replenish).
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(VecDeque::new()),
            alive: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(PoolMetrics::default()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool counters.
    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    /// Live hosts, idle and checked out.
    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::Acquire)
    }

    /// Idle hosts.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Check out a healthy host, reusing an idle one or starting a new one.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self) -> Result<AcquiredHost, RunnerError> {
        if self.is_shutting_down() {
            return Err(RunnerError::PoolShuttingDown);
        }

        loop {
            let next = self.idle.lock().await.pop_front();
            let Some(mut host) = next else {
                break;
            };
            match host.process.ping(self.config.health_check_timeout).await {
                Ok(()) => {
                    self.metrics.reused.fetch_add(1, Ordering::Relaxed);
                    return Ok(AcquiredHost { host });
                }
                Err(e) => {
                    tracing::warn!(pid = ?host.process.pid(), error = %e, "idle host failed health check");
                    self.metrics.killed_error.fetch_add(1, Ordering::Relaxed);
                    host.process.kill().await;
                }
            }
        }

        let slot = self.reserve().ok_or(RunnerError::PoolExhausted {
            max: self.config.max_hosts,
        })?;
        let host = self.spawn_host(slot).await?;
        Ok(AcquiredHost { host })
    }

    /// Return a host after a job.
    #[tracing::instrument(skip(self, handle), fields(pid = ?handle.pid()))]
    pub async fn release(&self, handle: AcquiredHost, outcome: ReleaseOutcome) {
        let mut host = handle.host;
        host.uses += 1;

        if outcome == ReleaseOutcome::Fatal {
            self.metrics.killed_error.fetch_add(1, Ordering::Relaxed);
            host.process.kill().await;
            return;
        }
        if self.config.max_uses.is_some_and(|max| host.uses >= max) {
            tracing::debug!(uses = host.uses, "recycling host");
            self.metrics.killed_max_uses.fetch_add(1, Ordering::Relaxed);
            host.process.kill().await;
            return;
        }
        if self.is_shutting_down() {
            host.process.kill().await;
            return;
        }

        host.idle_since = Instant::now();
        self.idle.lock().await.push_back(host);
    }

    /// Start hosts until `min_hosts` are alive. Returns how many were started.
    pub async fn replenish(&self) -> usize {
        if self.is_shutting_down() {
            return 0;
        }
        let wanted = self.config.min_hosts.saturating_sub(self.alive());
        let mut started = 0;
        for _ in 0..wanted {
            let Some(slot) = self.reserve() else {
                break;
            };
            match self.spawn_host(slot).await {
                Ok(mut host) => {
                    host.idle_since = Instant::now();
                    self.idle.lock().await.push_back(host);
                    started += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to pre-warm host");
                    break;
                }
            }
        }
        started
    }

    /// Kill idle hosts past `max_idle_time`, keeping at least `min_hosts` alive.
    pub async fn reap_idle(&self) {
        let mut idle = self.idle.lock().await;
        let now = Instant::now();
        let alive = self.alive();
        let mut to_kill = Vec::new();
        let mut kept = VecDeque::with_capacity(idle.len());

        while let Some(host) = idle.pop_front() {
            let expired = now.duration_since(host.idle_since) > self.config.max_idle_time;
            let would_remain = alive.saturating_sub(to_kill.len() + 1);
            if expired && would_remain >= self.config.min_hosts {
                to_kill.push(host);
            } else {
                kept.push_back(host);
            }
        }
        *idle = kept;
        drop(idle);

        for host in to_kill {
            self.metrics.killed_idle.fetch_add(1, Ordering::Relaxed);
            host.process.kill().await;
        }
    }

    /// Periodically reap idle hosts until shutdown.
    pub fn start_reap_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if pool.is_shutting_down() {
                    break;
                }
                pool.reap_idle().await;
            }
        })
    }

    /// Stop handing out hosts and kill the idle ones. Checked-out hosts are
    /// killed when released.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let hosts: Vec<PooledHost> = self.idle.lock().await.drain(..).collect();
        for host in hosts {
            host.process.kill().await;
        }
    }

    fn reserve(&self) -> Option<AliveSlot> {
        let max = self.config.max_hosts;
        self.alive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| AliveSlot {
                alive: Arc::clone(&self.alive),
            })
    }

    async fn spawn_host(&self, slot: AliveSlot) -> Result<PooledHost, RunnerError> {
        let binary = find_host_binary(self.config.host_binary.as_deref())?;
        let process = HostProcess::spawn(&binary, self.config.spawn_timeout).await?;
        self.metrics.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(pid = ?process.pid(), binary = %binary.display(), "host spawned");
        Ok(PooledHost {
            process,
            _slot: slot,
            uses: 0,
            idle_since: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn config() -> PoolConfig {
        PoolConfig {
            min_hosts: 0,
            max_hosts: 2,
            host_binary: Some(PathBuf::from("/nonexistent/ward-host")),
            ..PoolConfig::default()
        }
    }

    #[test]
    fn reserve_is_bounded_and_slots_give_back() {
        let pool = HostPool::new(config());
        let a = pool.reserve().unwrap();
        let b = pool.reserve().unwrap();
        assert!(pool.reserve().is_none());
        assert_eq!(pool.alive(), 2);
        drop(a);
        assert_eq!(pool.alive(), 1);
        drop(b);
        assert_eq!(pool.alive(), 0);
    }

    #[tokio::test]
    #[serial]
    async fn failed_spawn_returns_reservation() {
        let pool = HostPool::new(config());
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, RunnerError::HostNotFound(_)), "got {err:?}");
        assert_eq!(pool.alive(), 0);
        assert_eq!(pool.metrics().spawned.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_acquire() {
        let pool = HostPool::new(config());
        pool.shutdown().await;
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            RunnerError::PoolShuttingDown
        ));
        assert_eq!(pool.replenish().await, 0);
    }

    #[tokio::test]
    async fn reap_on_empty_pool_is_noop() {
        let pool = HostPool::new(PoolConfig {
            max_idle_time: Duration::ZERO,
            ..config()
        });
        pool.reap_idle().await;
        assert_eq!(pool.idle_count().await, 0);
    }

    #[tokio::test]
    #[serial]
    async fn replenish_stops_on_spawn_failure() {
        let pool = HostPool::new(PoolConfig {
            min_hosts: 2,
            ..config()
        });
        assert_eq!(pool.replenish().await, 0);
        assert_eq!(pool.alive(), 0);
    }

    #[tokio::test]
    async fn reap_task_exits_after_shutdown() {
        let pool = Arc::new(HostPool::new(config()));
        let handle = pool.start_reap_task(Duration::from_millis(10));
        pool.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
