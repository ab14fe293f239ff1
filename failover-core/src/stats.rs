use crate::data::{FailoverWindow, ProbeResult, TransactionCountSnapshot};
#[cfg(feature = "rt")]
use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
#[cfg(feature = "rt")]
use serde_with::{serde_as, DurationMilliSecondsWithFrac, DurationSeconds, DurationSecondsWithFrac};
use std::fmt;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Latency percentiles over the aggregator's reservoir of recent samples.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct LatencySummary {
    pub samples: usize,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSecondsWithFrac<f64>"))]
    pub min: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSecondsWithFrac<f64>"))]
    pub mean: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSecondsWithFrac<f64>"))]
    pub p50: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSecondsWithFrac<f64>"))]
    pub p95: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSecondsWithFrac<f64>"))]
    pub p99: Duration,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationMilliSecondsWithFrac<f64>"))]
    pub max: Duration,
}

/// Published view of the aggregator's state.
///
/// `total_attempts` always equals `successes + connection_errors + timeouts + query_errors`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct AggregateMetrics {
    #[cfg_attr(feature = "rt", serde_as(as = "DurationSecondsWithFrac<f64>"))]
    pub elapsed: Duration,
    pub total_attempts: u64,
    pub successes: u64,
    pub connection_errors: u64,
    pub timeouts: u64,
    pub query_errors: u64,
    /// Successes per second over the sliding window.
    pub current_tps: f64,
    pub peak_tps: f64,
    /// Successes per second since the start of the run.
    pub mean_tps: f64,
    /// Success ratio of the attempts inside the sliding window, if any were made.
    pub recent_success_rate: Option<f64>,
    pub latency: LatencySummary,
    /// Worker outcomes not delivered to the detector because its channel was full. When non-zero,
    /// the detector's worker counters and write-path outage window are incomplete.
    #[cfg_attr(feature = "rt", serde(default))]
    pub dropped_detector_events: u64,
}

impl AggregateMetrics {
    pub fn failures(&self) -> u64 {
        self.connection_errors + self.timeouts + self.query_errors
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.
        } else {
            self.successes as f64 / self.total_attempts as f64
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "rt", serde(rename_all = "snake_case"))]
pub enum DetectorState {
    #[default]
    Stable,
    Down,
    Recovered,
}

impl fmt::Display for DetectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectorState::Stable => "stable",
            DetectorState::Down => "down",
            DetectorState::Recovered => "recovered",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct DetectorSnapshot {
    pub state: DetectorState,
    pub window: Option<FailoverWindow>,
    /// Outage as seen by worker writes rather than by the probe.
    pub write_outage: Option<FailoverWindow>,
    pub probes: u64,
    pub probe_failures: u64,
    pub worker_failures: u64,
    pub worker_successes: u64,
    pub failures_after_recovery: u64,
    pub last_probe: Option<ProbeResult>,
}

/// Periodic status emitted by the orchestrator while a test runs.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct LiveStatus {
    pub run_id: Option<Uuid>,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationSecondsWithFrac<f64>"))]
    pub elapsed: Duration,
    pub metrics: AggregateMetrics,
    pub detector: DetectorSnapshot,
}

impl fmt::Display for LiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.metrics;
        write!(
            f,
            "[{:>6.1}s] total={} success={} failed={} tps={:.1} peak={:.1} p50={:?} p99={:?} probe={}",
            self.elapsed.as_secs_f64(),
            m.total_attempts,
            m.successes,
            m.failures(),
            m.current_tps,
            m.peak_tps,
            m.latency.p50,
            m.latency.p99,
            self.detector.state,
        )?;
        if let Some(rate) = m.recent_success_rate {
            write!(f, " recent_success={:.1}%", rate * 100.)?;
        }
        Ok(())
    }
}

/// Recovery time as measured by the probe.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "rt", serde(tag = "status", rename_all = "snake_case"))]
pub enum RtoMeasurement {
    /// No probe ever failed. Deliberately distinct from a zero RTO.
    NotObserved,
    /// The database went down and had not recovered when the run ended.
    Open {
        #[cfg_attr(feature = "rt", serde(with = "time::serde::rfc3339"))]
        since: OffsetDateTime,
    },
    Measured {
        window: FailoverWindow,
        #[cfg_attr(feature = "rt", serde_as(as = "DurationSecondsWithFrac<f64>"))]
        rto: Duration,
    },
}

impl RtoMeasurement {
    pub fn from_window(window: Option<FailoverWindow>) -> Self {
        match window {
            None => RtoMeasurement::NotObserved,
            Some(window) => match window.rto() {
                Some(rto) => RtoMeasurement::Measured { window, rto },
                None => RtoMeasurement::Open {
                    since: window.first_failure_at,
                },
            },
        }
    }

    pub fn rto(&self) -> Option<Duration> {
        match self {
            RtoMeasurement::Measured { rto, .. } => Some(*rto),
            _ => None,
        }
    }
}

impl fmt::Display for RtoMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtoMeasurement::NotObserved => f.write_str("not observed"),
            RtoMeasurement::Open { since } => write!(f, "not recovered (down since {})", rfc3339(*since)),
            RtoMeasurement::Measured { rto, .. } => write!(f, "{:.2}s", rto.as_secs_f64()),
        }
    }
}

/// Committed-data loss, comparing the rows the database retained with the writes workers
/// believe they committed.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "rt", serde(tag = "status", rename_all = "snake_case"))]
pub enum RpoMeasurement {
    Measured {
        baseline: TransactionCountSnapshot,
        final_snapshot: TransactionCountSnapshot,
        reported_successes: u64,
        /// Acknowledged writes missing from the database.
        lost: u64,
        /// Rows present beyond the acknowledged writes (ambiguous failures that did commit).
        surplus: u64,
    },
    Unknown {
        reason: String,
    },
}

impl RpoMeasurement {
    pub fn compute(
        baseline: TransactionCountSnapshot,
        final_snapshot: TransactionCountSnapshot,
        reported_successes: u64,
    ) -> Self {
        let retained = i128::from(final_snapshot.count) - i128::from(baseline.count);
        let reported = i128::from(reported_successes);
        let lost = (reported - retained).max(0) as u64;
        let surplus = (retained - reported).max(0) as u64;

        RpoMeasurement::Measured {
            baseline,
            final_snapshot,
            reported_successes,
            lost,
            surplus,
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        RpoMeasurement::Unknown {
            reason: reason.into(),
        }
    }

    pub fn lost_writes(&self) -> Option<u64> {
        match self {
            RpoMeasurement::Measured { lost, .. } => Some(*lost),
            RpoMeasurement::Unknown { .. } => None,
        }
    }

    pub fn data_lost(&self) -> Option<bool> {
        self.lost_writes().map(|lost| lost > 0)
    }
}

impl fmt::Display for RpoMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpoMeasurement::Measured {
                baseline,
                final_snapshot,
                reported_successes,
                lost,
                surplus,
            } => write!(
                f,
                "{lost} lost writes (baseline={}, final={}, acknowledged={reported_successes}, surplus={surplus})",
                baseline.count, final_snapshot.count
            ),
            RpoMeasurement::Unknown { reason } => write!(f, "unknown ({reason})"),
        }
    }
}

/// Final result of a failover test run.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "rt", cfg_eval::cfg_eval, serde_as)]
#[cfg_attr(feature = "rt", derive(Serialize, Deserialize))]
pub struct TestReport {
    pub run_id: Uuid,
    #[cfg_attr(feature = "rt", serde(with = "time::serde::rfc3339"))]
    pub started_at: OffsetDateTime,
    #[cfg_attr(feature = "rt", serde(with = "time::serde::rfc3339"))]
    pub finished_at: OffsetDateTime,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationSecondsWithFrac<f64>"))]
    pub elapsed: Duration,
    pub cancelled: bool,
    pub workers: usize,
    pub target_tps: u32,
    pub metrics: AggregateMetrics,
    /// Successful transactions per second over the whole run.
    pub achieved_tps: f64,
    pub probes: u64,
    pub probe_failures: u64,
    pub failures_after_recovery: u64,
    pub rto: RtoMeasurement,
    #[cfg_attr(feature = "rt", serde_as(as = "DurationSeconds<u64>"))]
    pub rto_sla: Duration,
    /// `None` when no failover was observed.
    pub sla_met: Option<bool>,
    pub write_outage: Option<FailoverWindow>,
    pub rpo: RpoMeasurement,
}

impl TestReport {
    pub fn failover_detected(&self) -> bool {
        !matches!(self.rto, RtoMeasurement::NotObserved)
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.metrics;
        writeln!(f, "FAILOVER TEST RESULTS (run {})", self.run_id)?;
        writeln!(
            f,
            "  Duration:                 {}{}",
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64)),
            if self.cancelled { " (cancelled)" } else { "" }
        )?;
        writeln!(f, "  Workers / target TPS:     {} / {}", self.workers, self.target_tps)?;
        writeln!(f, "  Total write attempts:     {}", m.total_attempts)?;
        writeln!(f, "  Successful writes:        {}", m.successes)?;
        writeln!(
            f,
            "  Failed writes:            {} (connection={}, timeout={}, query={})",
            m.failures(),
            m.connection_errors,
            m.timeouts,
            m.query_errors
        )?;
        writeln!(f, "  Success rate:             {:.2}%", m.success_rate() * 100.)?;
        writeln!(
            f,
            "  Achieved / peak TPS:      {:.2} / {:.2}",
            self.achieved_tps, m.peak_tps
        )?;
        writeln!(
            f,
            "  Latency p50/p95/p99:      {:?} / {:?} / {:?}",
            m.latency.p50, m.latency.p95, m.latency.p99
        )?;
        writeln!(
            f,
            "  Probes (failed):          {} ({})",
            self.probes, self.probe_failures
        )?;

        match &self.rto {
            RtoMeasurement::Measured { window, rto } => {
                writeln!(f, "  First failure detected:   {}", rfc3339(window.first_failure_at))?;
                if let Some(recovered) = window.first_recovery_at {
                    writeln!(f, "  First recovery detected:  {}", rfc3339(recovered))?;
                }
                writeln!(f, "  RTO:                      {:.2}s", rto.as_secs_f64())?;
                let verdict = if self.sla_met == Some(true) {
                    "PASSED"
                } else {
                    "EXCEEDED"
                };
                writeln!(
                    f,
                    "  RTO target:               < {} ({verdict})",
                    humantime::format_duration(self.rto_sla)
                )?;
            }
            RtoMeasurement::Open { since } => {
                writeln!(
                    f,
                    "  RTO:                      not recovered (down since {})",
                    rfc3339(*since)
                )?;
            }
            RtoMeasurement::NotObserved => {
                writeln!(f, "  RTO:                      not observed")?;
                writeln!(
                    f,
                    "  No failover detected. Either none occurred or the test was too short."
                )?;
            }
        }

        if let Some(rto) = self.write_outage.and_then(|w| w.rto()) {
            writeln!(f, "  Write-path outage:        {:.2}s", rto.as_secs_f64())?;
        }

        write!(f, "  RPO:                      {}", self.rpo)
    }
}

pub(crate) fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}
