//! In-memory stand-in for a database under failover.
//!
//! Writes draw from a bounded, FIFO-fair connection pool. Outages can be scheduled relative to
//! [`Backend::prepare`] or toggled by hand, and a number of acknowledged writes can be dropped when
//! the first outage is observed to simulate asynchronous replication lag.
use failover_core::{Backend, BackendError, SyntheticRecord};
use rand_distr::{Distribution, SkewNormal};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// How long a refused connection takes to fail.
const CONNECT_FAILURE_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
struct Outage {
    start: Duration,
    duration: Duration,
}

#[derive(Debug)]
pub struct MockDb {
    rows: AtomicU64,
    inserts: AtomicU64,
    down: AtomicBool,
    auth_failing: AtomicBool,
    unreachable: bool,
    pool: Semaphore,
    pool_size: usize,
    max_in_use: AtomicUsize,
    acquire_timeout: Duration,
    write_latency: Duration,
    write_jitter: Duration,
    probe_latency: Duration,
    outages: Vec<Outage>,
    epoch: Mutex<Instant>,
    lost_writes: u64,
    lost_applied: AtomicBool,
}

impl Default for MockDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDb {
    pub fn new() -> Self {
        Self {
            rows: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            down: AtomicBool::new(false),
            auth_failing: AtomicBool::new(false),
            unreachable: false,
            pool: Semaphore::new(10),
            pool_size: 10,
            max_in_use: AtomicUsize::new(0),
            acquire_timeout: Duration::from_secs(1),
            write_latency: Duration::from_millis(1),
            write_jitter: Duration::ZERO,
            probe_latency: Duration::from_millis(1),
            outages: vec![],
            epoch: Mutex::new(Instant::now()),
            lost_writes: 0,
            lost_applied: AtomicBool::new(false),
        }
    }

    /// Rows already present before the run.
    pub fn with_rows(self, rows: u64) -> Self {
        self.rows.store(rows, Ordering::Relaxed);
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        let size = size.max(1);
        self.pool = Semaphore::new(size);
        self.pool_size = size;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Write latency, skewed to the right when `jitter` is non-zero.
    pub fn write_latency(mut self, mean: Duration, jitter: Duration) -> Self {
        self.write_latency = mean;
        self.write_jitter = jitter;
        self
    }

    pub fn probe_latency(mut self, latency: Duration) -> Self {
        self.probe_latency = latency;
        self
    }

    /// Schedules an outage `start` after [`Backend::prepare`] lasting `duration`.
    pub fn outage(mut self, start: Duration, duration: Duration) -> Self {
        self.outages.push(Outage { start, duration });
        self
    }

    /// Drops `count` acknowledged rows the first time an outage is observed.
    pub fn lose_writes(mut self, count: u64) -> Self {
        self.lost_writes = count;
        self
    }

    /// Every operation fails, including [`Backend::prepare`].
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn set_down(&self, down: bool) {
        info!("Mock database {}", if down { "going down" } else { "coming back up" });
        self.down.store(down, Ordering::Relaxed);
    }

    /// Rejects writes with an authentication error, as after a credential rotation. Probes and
    /// counts are unaffected.
    pub fn set_auth_failing(&self, failing: bool) {
        self.auth_failing.store(failing, Ordering::Relaxed);
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Acknowledged inserts, regardless of later losses.
    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// Highest number of pooled connections checked out at once.
    pub fn max_in_use(&self) -> usize {
        self.max_in_use.load(Ordering::Relaxed)
    }

    fn is_down(&self) -> bool {
        if self.unreachable || self.down.load(Ordering::Relaxed) {
            return true;
        }
        let epoch = *self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = Instant::now().saturating_duration_since(epoch);
        self.outages
            .iter()
            .any(|o| o.start <= offset && offset < o.start + o.duration)
    }

    async fn refuse(&self) -> BackendError {
        if !self.lost_applied.swap(true, Ordering::Relaxed) && self.lost_writes > 0 {
            let lost = self.lost_writes;
            let _ = self
                .rows
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |rows| {
                    Some(rows.saturating_sub(lost))
                });
            debug!("Mock database dropped {lost} acknowledged rows");
        }
        sleep(CONNECT_FAILURE_DELAY).await;
        BackendError::Connection("connection refused".into())
    }

    fn sample_write_latency(&self) -> Duration {
        if self.write_jitter.is_zero() {
            return self.write_latency;
        }
        match SkewNormal::new(
            self.write_latency.as_secs_f64(),
            self.write_jitter.as_secs_f64(),
            20.,
        ) {
            Ok(dist) => {
                let v: f64 = dist.sample(&mut rand::thread_rng()).max(0.);
                Duration::from_secs_f64(v)
            }
            Err(_) => self.write_latency,
        }
    }
}

impl Backend for MockDb {
    async fn prepare(&self) -> Result<(), BackendError> {
        if self.unreachable {
            sleep(CONNECT_FAILURE_DELAY).await;
            return Err(BackendError::Connection(
                "could not connect to server: Connection refused".into(),
            ));
        }
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        Ok(())
    }

    async fn count_records(&self) -> Result<u64, BackendError> {
        if self.is_down() {
            return Err(self.refuse().await);
        }
        Ok(self.rows())
    }

    async fn insert_record(&self, record: &SyntheticRecord) -> Result<(), BackendError> {
        let _permit = match timeout(self.acquire_timeout, self.pool.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BackendError::Connection("pool closed".into())),
            Err(_) => {
                return Err(BackendError::Timeout(format!(
                    "pool acquire timed out after {:?}",
                    self.acquire_timeout
                )))
            }
        };
        let in_use = self.pool_size - self.pool.available_permits();
        self.max_in_use.fetch_max(in_use, Ordering::Relaxed);

        if self.is_down() {
            return Err(self.refuse().await);
        }
        if self.auth_failing.load(Ordering::Relaxed) {
            return Err(BackendError::Auth(
                "password authentication failed for user \"postgres\"".into(),
            ));
        }

        sleep(self.sample_write_latency()).await;

        if self.is_down() {
            return Err(BackendError::Connection(
                "server closed the connection unexpectedly".into(),
            ));
        }

        self.rows.fetch_add(1, Ordering::Relaxed);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Inserted record {}/{} for run {}",
            record.worker_id, record.sequence, record.run_id
        );
        Ok(())
    }

    async fn probe(&self) -> Result<(), BackendError> {
        if self.is_down() {
            return Err(self.refuse().await);
        }
        sleep(self.probe_latency).await;
        if self.is_down() {
            return Err(BackendError::Connection("connection reset by peer".into()));
        }
        Ok(())
    }
}
