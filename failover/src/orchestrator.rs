//! Test orchestration: runs workers, probe and detector for the configured duration and
//! assembles the [`TestReport`].
use crate::aggregator::Aggregator;
use crate::detector::{run_detector, FailureDetector};
use crate::probe::spawn_probe;
use crate::workers::{WorkerContext, WorkerPool};
use arc_swap::ArcSwap;
use failover_core::{
    capture_count, Backend, BackendError, ConfigError, DetectorSnapshot, LiveStatus,
    RpoMeasurement, RtoMeasurement, TestConfig, TestReport,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 4_096;

/// Errors that abort a run before any load is generated. No report is produced.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database unreachable at startup: {0}")]
    Startup(#[source] BackendError),
}

/// One failover test run.
///
/// Awaiting a `FailoverTest` runs it to completion.
///
/// # Example
/// ```no_run
/// use failover::prelude::*;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn run<B: Backend>(backend: B) -> Result<(), FatalError> {
/// let config = TestConfig::new(DatabaseConfig::from_env()?).duration(Duration::from_secs(300));
/// let report = FailoverTest::new(Arc::new(backend), config).await?;
/// println!("{report}");
/// # Ok(())
/// # }
/// ```
#[pin_project::pin_project]
pub struct FailoverTest<B> {
    backend: Arc<B>,
    config: TestConfig,
    run_id: Uuid,
    cancel: CancellationToken,
    status: Option<watch::Sender<LiveStatus>>,
    runner_fut: Option<Pin<Box<dyn Future<Output = Result<TestReport, FatalError>> + Send>>>,
}

impl<B: Backend> FailoverTest<B> {
    pub fn new(backend: Arc<B>, config: TestConfig) -> Self {
        Self {
            backend,
            config,
            run_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            status: None,
            runner_fut: None,
        }
    }

    /// Stop the run early when `cancel` fires. A report is still produced.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish a [`LiveStatus`] every `status_interval`.
    pub fn with_status(mut self, status: watch::Sender<LiveStatus>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

impl<B: Backend> Future for FailoverTest<B> {
    type Output = Result<TestReport, FatalError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let runner = this.runner_fut.get_or_insert_with(|| {
            Box::pin(run_failover_test(
                this.backend.clone(),
                this.config.clone(),
                *this.run_id,
                this.cancel.clone(),
                this.status.take(),
            ))
        });
        runner.as_mut().poll(cx)
    }
}

#[instrument(name = "failover_test", skip_all, fields(run_id = %run_id))]
async fn run_failover_test<B: Backend>(
    backend: Arc<B>,
    config: TestConfig,
    run_id: Uuid,
    cancel: CancellationToken,
    status: Option<watch::Sender<LiveStatus>>,
) -> Result<TestReport, FatalError> {
    config.validate()?;
    info!("Running failover test with config {config}");

    backend.prepare().await.map_err(FatalError::Startup)?;
    let baseline = capture_count(backend.as_ref())
        .await
        .map_err(FatalError::Startup)?;
    info!("Baseline transaction count: {}", baseline.count);

    let started_at = OffsetDateTime::now_utc();
    let start = Instant::now();
    let deadline = start + config.duration;

    let aggregator = Arc::new(Aggregator::starting_at(
        start,
        config.reservoir_size,
        config.tps_window,
    ));
    let published = Arc::new(ArcSwap::from_pointee(DetectorSnapshot::default()));
    let (events, events_rx) = async_channel::bounded(EVENT_CHANNEL_CAPACITY);

    let detector = tokio::spawn(run_detector(
        FailureDetector::new(config.failure_threshold),
        events_rx,
        published.clone(),
    ));

    let stop = cancel.child_token();
    let probe = spawn_probe(
        backend.clone(),
        config.probe_interval,
        config.probe_timeout,
        events.clone(),
        stop.child_token(),
    );
    let workers = WorkerPool::start(
        backend.clone(),
        &config,
        WorkerContext {
            run_id,
            aggregator: aggregator.clone(),
            events,
            cancel: stop.child_token(),
            deadline,
        },
    );

    let mut ticker = interval_at(start + config.status_interval, config.status_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let cancelled = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Test cancelled");
                break true;
            }
            _ = sleep_until(deadline) => break false,
            _ = ticker.tick() => {
                let live = live_status(run_id, &aggregator, &published);
                info!("{live}");
                if let Some(status) = &status {
                    status.send_replace(live);
                }
            }
        }
    };

    // Workers finish their in-flight write; the detector drains once every sender is gone.
    stop.cancel();
    let attempts = workers.join().await;
    let probes = probe.await.unwrap_or_else(|err| {
        error!("Probe task failed: {err}");
        0
    });
    let detector = match detector.await {
        Ok(detector) => detector.snapshot(),
        Err(err) => {
            error!("Detector task failed: {err}");
            DetectorSnapshot::clone(&published.load())
        }
    };
    debug!("Stopped after {attempts} write attempts and {probes} probes");

    let metrics = aggregator.snapshot();
    if metrics.dropped_detector_events > 0 {
        warn!(
            "{} worker outcomes never reached the detector, write-path outage may be incomplete",
            metrics.dropped_detector_events
        );
    }
    let rpo = match capture_count(backend.as_ref()).await {
        Ok(final_snapshot) => RpoMeasurement::compute(baseline, final_snapshot, metrics.successes),
        Err(err) => {
            warn!("Final transaction count failed, RPO unknown: {err}");
            RpoMeasurement::unknown(err.to_string())
        }
    };

    let finished_at = OffsetDateTime::now_utc();
    let rto = RtoMeasurement::from_window(detector.window);
    let sla_met = sla_verdict(&rto, config.rto_sla, finished_at);

    let report = TestReport {
        run_id,
        started_at,
        finished_at,
        elapsed: metrics.elapsed,
        cancelled,
        workers: config.workers.get(),
        target_tps: config.target_tps.get(),
        metrics,
        achieved_tps: metrics.mean_tps,
        probes: detector.probes,
        probe_failures: detector.probe_failures,
        failures_after_recovery: detector.failures_after_recovery,
        rto,
        rto_sla: config.rto_sla,
        sla_met,
        write_outage: detector.write_outage,
        rpo,
    };

    if let Some(status) = &status {
        status.send_replace(LiveStatus {
            run_id: Some(run_id),
            elapsed: metrics.elapsed,
            metrics,
            detector,
        });
    }
    info!("\n{report}");

    Ok(report)
}

fn live_status(
    run_id: Uuid,
    aggregator: &Aggregator,
    detector: &ArcSwap<DetectorSnapshot>,
) -> LiveStatus {
    let metrics = aggregator.snapshot();
    LiveStatus {
        run_id: Some(run_id),
        elapsed: metrics.elapsed,
        metrics,
        detector: DetectorSnapshot::clone(&detector.load()),
    }
}

/// `None` when no outage was seen, or when an unrecovered outage has not yet exceeded the SLA.
fn sla_verdict(rto: &RtoMeasurement, sla: Duration, finished_at: OffsetDateTime) -> Option<bool> {
    match rto {
        RtoMeasurement::NotObserved => None,
        RtoMeasurement::Measured { rto, .. } => Some(*rto < sla),
        RtoMeasurement::Open { since } => {
            let down_for = Duration::try_from(finished_at - *since).unwrap_or_default();
            (down_for >= sla).then_some(false)
        }
    }
}
