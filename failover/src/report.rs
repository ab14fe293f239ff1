//! CSV export of a [`TestReport`].
use failover_core::{RpoMeasurement, RtoMeasurement, TestReport};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Timestamp formatting error: {0}")]
    Format(#[from] time::error::Format),
}

/// One flat CSV row per run.
#[derive(Debug, Serialize)]
struct ReportRecord {
    run_id: String,
    started_at: String,
    finished_at: String,
    duration_s: f64,
    cancelled: bool,
    workers: usize,
    target_tps: u32,
    total_attempts: u64,
    successes: u64,
    connection_errors: u64,
    timeouts: u64,
    query_errors: u64,
    success_rate: f64,
    achieved_tps: f64,
    peak_tps: f64,
    latency_p50_ms: f64,
    latency_p95_ms: f64,
    latency_p99_ms: f64,
    probes: u64,
    probe_failures: u64,
    first_failure_at: Option<String>,
    first_recovery_at: Option<String>,
    rto_s: Option<f64>,
    rto_sla_s: u64,
    sla_met: Option<bool>,
    write_outage_s: Option<f64>,
    baseline_count: Option<u64>,
    final_count: Option<u64>,
    lost_writes: Option<u64>,
    rpo_unknown_reason: Option<String>,
}

impl ReportRecord {
    fn from_report(report: &TestReport) -> Result<Self, ReportError> {
        let m = &report.metrics;
        let millis = |d: std::time::Duration| d.as_secs_f64() * 1_000.;

        let (first_failure_at, first_recovery_at) = match report.rto {
            RtoMeasurement::NotObserved => (None, None),
            RtoMeasurement::Open { since } => (Some(since.format(&Rfc3339)?), None),
            RtoMeasurement::Measured { window, .. } => (
                Some(window.first_failure_at.format(&Rfc3339)?),
                window
                    .first_recovery_at
                    .map(|at| at.format(&Rfc3339))
                    .transpose()?,
            ),
        };

        let (baseline_count, final_count, lost_writes, rpo_unknown_reason) = match &report.rpo {
            RpoMeasurement::Measured {
                baseline,
                final_snapshot,
                lost,
                ..
            } => (Some(baseline.count), Some(final_snapshot.count), Some(*lost), None),
            RpoMeasurement::Unknown { reason } => (None, None, None, Some(reason.clone())),
        };

        Ok(Self {
            run_id: report.run_id.to_string(),
            started_at: report.started_at.format(&Rfc3339)?,
            finished_at: report.finished_at.format(&Rfc3339)?,
            duration_s: report.elapsed.as_secs_f64(),
            cancelled: report.cancelled,
            workers: report.workers,
            target_tps: report.target_tps,
            total_attempts: m.total_attempts,
            successes: m.successes,
            connection_errors: m.connection_errors,
            timeouts: m.timeouts,
            query_errors: m.query_errors,
            success_rate: m.success_rate(),
            achieved_tps: report.achieved_tps,
            peak_tps: m.peak_tps,
            latency_p50_ms: millis(m.latency.p50),
            latency_p95_ms: millis(m.latency.p95),
            latency_p99_ms: millis(m.latency.p99),
            probes: report.probes,
            probe_failures: report.probe_failures,
            first_failure_at,
            first_recovery_at,
            rto_s: report.rto.rto().map(|rto| rto.as_secs_f64()),
            rto_sla_s: report.rto_sla.as_secs(),
            sla_met: report.sla_met,
            write_outage_s: report
                .write_outage
                .and_then(|w| w.rto())
                .map(|d| d.as_secs_f64()),
            baseline_count,
            final_count,
            lost_writes,
            rpo_unknown_reason,
        })
    }
}

/// Writes the header and a single row for `report`.
pub fn to_csv_writer<W: io::Write>(report: &TestReport, writer: W) -> Result<(), ReportError> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.serialize(ReportRecord::from_report(report)?)?;
    writer.flush()?;
    Ok(())
}

pub fn write_csv(report: &TestReport, path: impl AsRef<Path>) -> Result<(), ReportError> {
    let file = std::fs::File::create(path)?;
    to_csv_writer(report, file)
}

/// `failover_test_results_YYYYMMDD_HHMMSS.csv`
pub fn default_report_path(now: OffsetDateTime) -> Result<PathBuf, ReportError> {
    let stamp = now.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    Ok(PathBuf::from(format!("failover_test_results_{stamp}.csv")))
}
