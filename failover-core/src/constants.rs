use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

pub const DEFAULT_TPS: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(50) };
pub const DEFAULT_WORKERS: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(10) };

pub const DEFAULT_DURATION: Duration = Duration::from_secs(300);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(800);
pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_POOL_MIN: u32 = 2;
pub const DEFAULT_POOL_MAX: u32 = 20;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failed probes required before the database is declared down.
///
/// A single failure is enough by default so that short outages are never missed. One-off network
/// blips will therefore open a failover window; raise this to debounce noisy links.
pub const DEFAULT_FAILURE_THRESHOLD: usize = 1;

/// Recovery time objective used for the pass/fail verdict in reports.
pub const DEFAULT_RTO_SLA: Duration = Duration::from_secs(120);

pub const DEFAULT_TPS_WINDOW: Duration = Duration::from_secs(5);
pub const DEFAULT_RESERVOIR_SIZE: usize = 10_000;

/// Width of the buckets backing the sliding TPS window.
pub const TPS_BUCKET_WIDTH: Duration = Duration::from_millis(100);

pub const DIRECT_PORT: u16 = 5432;
pub const POOLED_PORT: u16 = 6432;
pub const DEFAULT_TABLE: &str = "failover_test_records";
