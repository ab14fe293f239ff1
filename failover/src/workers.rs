//! Pool of independent write workers.
use crate::aggregator::Aggregator;
use crate::detector::DetectorEvent;
use failover_core::{Backend, BackendError, Outcome, SyntheticRecord, TestConfig, WorkerResult};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// Shared state handed to every worker of a run.
#[derive(Clone)]
pub struct WorkerContext {
    pub run_id: Uuid,
    pub aggregator: Arc<Aggregator>,
    pub events: async_channel::Sender<DetectorEvent>,
    pub cancel: CancellationToken,
    pub deadline: Instant,
}

pub struct WorkerPool {
    tasks: Vec<JoinHandle<u64>>,
}

impl WorkerPool {
    /// Spawns `config.workers` tasks, each pacing itself to `workers / target_tps` seconds
    /// between writes with its own rate limiter.
    pub fn start<B: Backend>(backend: Arc<B>, config: &TestConfig, ctx: WorkerContext) -> Self {
        let pacing = config.pacing_delay();
        // An attempt may wait for a pooled connection and then run its statement.
        let write_timeout = config.acquire_timeout + config.statement_timeout;
        debug!(
            "Starting {} workers, {} between writes per worker",
            config.workers,
            humantime::format_duration(pacing)
        );

        let tasks = (0..config.workers.get())
            .map(|worker_id| {
                let limiter = pacing_limiter(pacing, config.target_tps);
                tokio::spawn(worker(
                    worker_id,
                    backend.clone(),
                    limiter,
                    write_timeout,
                    ctx.clone(),
                ))
            })
            .collect();

        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Waits for every worker to finish its in-flight write. Returns the total attempts made.
    pub async fn join(self) -> u64 {
        let mut attempts = 0;
        for task in self.tasks {
            match task.await {
                Ok(count) => attempts += count,
                Err(err) => error!("Worker task failed: {err}"),
            }
        }
        attempts
    }
}

fn pacing_limiter(pacing: Duration, target_tps: NonZeroU32) -> DefaultDirectRateLimiter {
    let quota = Quota::with_period(pacing).unwrap_or_else(|| Quota::per_second(target_tps));
    RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN))
}

#[instrument(name = "worker", skip(backend, limiter, write_timeout, ctx), fields(run_id = %ctx.run_id))]
async fn worker<B: Backend>(
    worker_id: usize,
    backend: Arc<B>,
    limiter: DefaultDirectRateLimiter,
    write_timeout: Duration,
    ctx: WorkerContext,
) -> u64 {
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = sleep_until(ctx.deadline) => break,
            _ = limiter.until_ready() => {}
        }
        // Only checked between writes; an in-flight write always runs to completion.
        if ctx.cancel.is_cancelled() || Instant::now() >= ctx.deadline {
            break;
        }

        let record = SyntheticRecord {
            run_id: ctx.run_id,
            worker_id,
            sequence,
        };
        sequence += 1;

        let start = Instant::now();
        let outcome = match timeout(write_timeout, backend.insert_record(&record)).await {
            Ok(Ok(())) => Outcome::Success,
            Ok(Err(err)) => {
                if let BackendError::Auth(_) = err {
                    warn!("Authentication failure mid-test: {err}");
                } else {
                    trace!("Write {sequence} failed: {err}");
                }
                err.outcome()
            }
            Err(_) => {
                trace!("Write {sequence} exceeded {write_timeout:?}");
                Outcome::Timeout
            }
        };
        let at = Instant::now();

        ctx.aggregator.record(&WorkerResult {
            worker_id,
            outcome,
            latency: at.duration_since(start),
            at,
        });

        // Never block a worker on the detector.
        let event = DetectorEvent::Worker {
            success: outcome.is_success(),
            at: OffsetDateTime::now_utc(),
        };
        if let Err(err) = ctx.events.try_send(event) {
            trace!("Detector event not delivered: {err}");
            ctx.aggregator.record_dropped_event();
            #[cfg(feature = "metrics")]
            metrics::counter!("failover_dropped_detector_events").increment(1);
        }
    }

    trace!("Worker stopping after {sequence} writes");
    sequence
}
