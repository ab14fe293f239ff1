use crate::constants::*;
use crate::error::ConfigError;
#[cfg(feature = "rt")]
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
#[cfg(feature = "rt")]
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::fmt;
use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

/// Immutable input for a single failover test run.
///
/// Built once (usually via the builder-style setters) and then handed to the orchestrator, which
/// validates it before anything touches the database.
///
/// # Example
/// ```
/// use failover_core::TestConfig;
/// use std::num::{NonZeroU32, NonZeroUsize};
/// use std::time::Duration;
///
/// let config = TestConfig::default()
///     .tps(NonZeroU32::new(200).unwrap())
///     .workers(NonZeroUsize::new(20).unwrap())
///     .duration(Duration::from_secs(60));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct TestConfig {
    pub target_tps: NonZeroU32,
    pub workers: NonZeroUsize,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationSeconds<u64>"))]
    pub duration: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSeconds<u64>"))]
    pub probe_interval: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSeconds<u64>"))]
    pub probe_timeout: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSeconds<u64>"))]
    pub status_interval: Duration,
    pub pool_min: u32,
    pub pool_max: u32,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSeconds<u64>"))]
    pub acquire_timeout: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSeconds<u64>"))]
    pub statement_timeout: Duration,
    pub failure_threshold: usize,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationSeconds<u64>"))]
    pub rto_sla: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSeconds<u64>"))]
    pub tps_window: Duration,
    pub reservoir_size: usize,
    pub database: DatabaseConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            target_tps: DEFAULT_TPS,
            workers: DEFAULT_WORKERS,
            duration: DEFAULT_DURATION,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            status_interval: DEFAULT_STATUS_INTERVAL,
            pool_min: DEFAULT_POOL_MIN,
            pool_max: DEFAULT_POOL_MAX,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            rto_sla: DEFAULT_RTO_SLA,
            tps_window: DEFAULT_TPS_WINDOW,
            reservoir_size: DEFAULT_RESERVOIR_SIZE,
            database: DatabaseConfig::default(),
        }
    }
}

impl TestConfig {
    pub fn new(database: DatabaseConfig) -> Self {
        Self {
            database,
            ..Self::default()
        }
    }

    /// Aggregate transactions per second the worker pool aims for.
    pub fn tps(mut self, tps: NonZeroU32) -> Self {
        self.target_tps = tps;
        self
    }

    pub fn workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = workers;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Probe cadence and the timeout of each individual probe.
    ///
    /// NOTE: The timeout must be strictly shorter than the interval, otherwise a hung probe would
    /// overlap the next tick.
    pub fn probe(mut self, interval: Duration, timeout: Duration) -> Self {
        self.probe_interval = interval;
        self.probe_timeout = timeout;
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    pub fn pool(mut self, min: u32, max: u32) -> Self {
        self.pool_min = min;
        self.pool_max = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Number of consecutive failed probes required to declare an outage.
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn rto_sla(mut self, sla: Duration) -> Self {
        self.rto_sla = sla;
        self
    }

    pub fn tps_window(mut self, window: Duration) -> Self {
        self.tps_window = window;
        self
    }

    pub fn reservoir_size(mut self, size: usize) -> Self {
        self.reservoir_size = size;
        self
    }

    pub fn database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }

    /// Per-worker delay that keeps the aggregate rate near the target without a shared limiter.
    pub fn pacing_delay(&self) -> Duration {
        Duration::from_secs_f64(self.workers.get() as f64 / self.target_tps.get() as f64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.duration.is_zero() {
            return Err(ConfigError::Invalid("duration must be greater than zero".into()));
        }
        if self.probe_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "probe interval must be greater than zero".into(),
            ));
        }
        if self.probe_timeout.is_zero() || self.probe_timeout >= self.probe_interval {
            return Err(ConfigError::Invalid(format!(
                "probe timeout ({}) must be non-zero and shorter than the probe interval ({})",
                humantime::format_duration(self.probe_timeout),
                humantime::format_duration(self.probe_interval),
            )));
        }
        if self.status_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "status interval must be greater than zero".into(),
            ));
        }
        if self.pool_max == 0 {
            return Err(ConfigError::Invalid("pool max must be at least 1".into()));
        }
        if self.pool_min > self.pool_max {
            return Err(ConfigError::Invalid(format!(
                "pool min ({}) exceeds pool max ({})",
                self.pool_min, self.pool_max
            )));
        }
        if self.acquire_timeout.is_zero() || self.statement_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "acquire and statement timeouts must be greater than zero".into(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failure threshold must be at least 1".into(),
            ));
        }
        if self.tps_window.is_zero() || self.reservoir_size == 0 {
            return Err(ConfigError::Invalid(
                "tps window and latency reservoir must be non-empty".into(),
            ));
        }

        self.database.validate()
    }
}

impl fmt::Display for TestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "workers={}, target_tps={}, duration={}, probe_interval={}, pool={}..={}, failure_threshold={}, database={}",
            self.workers,
            self.target_tps,
            humantime::format_duration(self.duration),
            humantime::format_duration(self.probe_interval),
            self.pool_min,
            self.pool_max,
            self.failure_threshold,
            self.database,
        )
    }
}

/// Whether to connect to the server directly or through its pooled proxy (PgBouncer) port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "rt", serde(rename_all = "snake_case"))]
pub enum PoolMode {
    #[default]
    Direct,
    Pooled,
}

impl PoolMode {
    pub fn default_port(self) -> u16 {
        match self {
            PoolMode::Direct => DIRECT_PORT,
            PoolMode::Pooled => POOLED_PORT,
        }
    }
}

#[derive(Clone, PartialEq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct DatabaseConfig {
    pub host: String,
    /// Explicit port; falls back to the port implied by `pool_mode`.
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
    #[cfg_attr(feature = "rt", serde(skip_serializing, default))]
    pub password: String,
    pub ssl_mode: Option<String>,
    pub pool_mode: PoolMode,
    /// Table receiving the synthetic test records.
    pub table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            database: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            ssl_mode: None,
            pool_mode: PoolMode::Direct,
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

impl DatabaseConfig {
    /// Reads `POSTGRES_HOST`, `POSTGRES_PORT`, `POSTGRES_DATABASE`, `POSTGRES_USERNAME`,
    /// `POSTGRES_PASSWORD`, `POSTGRES_SSL` and `POSTGRES_POOL_MODE` from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingVar(key))
        };

        let port = match lookup("POSTGRES_PORT") {
            Some(port) if !port.is_empty() => Some(port.parse::<u16>().map_err(|_| {
                ConfigError::Invalid(format!("POSTGRES_PORT is not a valid port: {port}"))
            })?),
            _ => None,
        };

        let pool_mode = match lookup("POSTGRES_POOL_MODE").as_deref() {
            None | Some("") | Some("direct") => PoolMode::Direct,
            Some("pooled") | Some("pgbouncer") => PoolMode::Pooled,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "POSTGRES_POOL_MODE must be `direct` or `pooled`, found `{other}`"
                )))
            }
        };

        Ok(Self {
            host: required("POSTGRES_HOST")?,
            port,
            database: required("POSTGRES_DATABASE")?,
            user: required("POSTGRES_USERNAME")?,
            password: required("POSTGRES_PASSWORD")?,
            ssl_mode: lookup("POSTGRES_SSL").filter(|v| !v.is_empty()),
            pool_mode,
            table: DEFAULT_TABLE.to_string(),
        })
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.pool_mode.default_port())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("database host is empty".into()));
        }
        if !is_identifier(&self.table) {
            return Err(ConfigError::Invalid(format!(
                "`{}` is not a valid table name",
                self.table
            )));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// NOTE: Debug is written by hand so the password never ends up in logs.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl_mode", &self.ssl_mode)
            .field("pool_mode", &self.pool_mode)
            .field("table", &self.table)
            .finish()
    }
}

impl fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{} ({:?})",
            self.user,
            self.host,
            self.port(),
            self.database,
            self.pool_mode
        )
    }
}
