#[cfg(feature = "rt")]
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
#[cfg(feature = "rt")]
use serde_with::{serde_as, DurationMilliSecondsWithFrac};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "rt", serde(rename_all = "snake_case"))]
pub enum Outcome {
    Success,
    ConnectionError,
    Timeout,
    QueryError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::ConnectionError => "connection_error",
            Outcome::Timeout => "timeout",
            Outcome::QueryError => "query_error",
        }
    }
}

/// One completed transaction attempt. Summarized by the aggregator and then dropped.
#[derive(Clone, Copy, Debug)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub outcome: Outcome,
    pub latency: Duration,
    pub at: Instant,
}

/// The synthetic "create test record" write issued by a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyntheticRecord {
    pub run_id: Uuid,
    pub worker_id: usize,
    pub sequence: u64,
}

/// Result of one probe tick.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct ProbeResult {
    pub seq: u64,
    pub success: bool,
    #[cfg_attr(feature = "rt", serde(with = "time::serde::rfc3339"))]
    pub at: OffsetDateTime,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSecondsWithFrac<f64>"))]
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn success(seq: u64, at: OffsetDateTime, latency: Duration) -> Self {
        Self {
            seq,
            success: true,
            at,
            latency,
            error: None,
        }
    }

    pub fn failure(seq: u64, at: OffsetDateTime, latency: Duration, error: String) -> Self {
        Self {
            seq,
            success: false,
            at,
            latency,
            error: Some(error),
        }
    }
}

/// Outage observed during a run: first detected failure and first detected recovery after it.
///
/// Invariant: when closed, `first_recovery_at > first_failure_at`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct FailoverWindow {
    #[cfg_attr(feature = "rt", serde(with = "time::serde::rfc3339"))]
    pub first_failure_at: OffsetDateTime,
    #[cfg_attr(feature = "rt", serde(with = "time::serde::rfc3339::option"))]
    pub first_recovery_at: Option<OffsetDateTime>,
}

impl FailoverWindow {
    pub fn open(first_failure_at: OffsetDateTime) -> Self {
        Self {
            first_failure_at,
            first_recovery_at: None,
        }
    }

    /// Closes the window. Returns `false` (and leaves the window untouched) if it is already
    /// closed or if `at` is not strictly after the first failure.
    pub fn close(&mut self, at: OffsetDateTime) -> bool {
        if self.first_recovery_at.is_some() || at <= self.first_failure_at {
            return false;
        }
        self.first_recovery_at = Some(at);
        true
    }

    pub fn is_open(&self) -> bool {
        self.first_recovery_at.is_none()
    }

    /// Downtime; `None` while the window is still open.
    pub fn rto(&self) -> Option<Duration> {
        self.first_recovery_at
            .and_then(|recovered| Duration::try_from(recovered - self.first_failure_at).ok())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct TransactionCountSnapshot {
    pub count: u64,
    #[cfg_attr(feature = "rt", serde(with = "time::serde::rfc3339"))]
    pub captured_at: OffsetDateTime,
}

impl TransactionCountSnapshot {
    pub fn new(count: u64) -> Self {
        Self {
            count,
            captured_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn window_rto_is_none_until_closed() {
        let mut window = FailoverWindow::open(datetime!(2024-03-01 12:00:00 UTC));
        assert!(window.is_open());
        assert_eq!(window.rto(), None);

        assert!(window.close(datetime!(2024-03-01 12:00:08.4 UTC)));
        assert_eq!(window.rto(), Some(Duration::from_millis(8_400)));
    }

    #[test]
    fn window_rejects_recovery_not_after_failure() {
        let at = datetime!(2024-03-01 12:00:00 UTC);
        let mut window = FailoverWindow::open(at);
        assert!(!window.close(at));
        assert!(!window.close(datetime!(2024-03-01 11:59:59 UTC)));
        assert!(window.is_open());
    }

    #[test]
    fn window_closes_only_once() {
        let mut window = FailoverWindow::open(datetime!(2024-03-01 12:00:00 UTC));
        assert!(window.close(datetime!(2024-03-01 12:00:05 UTC)));
        assert!(!window.close(datetime!(2024-03-01 12:00:09 UTC)));
        assert_eq!(window.rto(), Some(Duration::from_secs(5)));
    }
}
