//! Thread-safe counters, latency reservoir and sliding TPS window.
mod reservoir;
mod window;

use arc_swap::ArcSwap;
use failover_core::{AggregateMetrics, Outcome, WorkerResult};
use reservoir::Reservoir;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use window::TpsWindow;

/// Collects [`WorkerResult`]s from every worker and publishes [`AggregateMetrics`].
///
/// Counters are lock-free. The reservoir and TPS window share one mutex which is only held for a
/// push in [`Aggregator::record`] and a copy in [`Aggregator::snapshot`], so workers never stall on
/// reporting.
pub struct Aggregator {
    started: Instant,
    success: AtomicU64,
    connection_errors: AtomicU64,
    timeouts: AtomicU64,
    query_errors: AtomicU64,
    dropped_detector_events: AtomicU64,
    /// `f64` bits. Non-negative floats order the same as their bit patterns.
    peak_tps: AtomicU64,
    samples: Mutex<Samples>,
    published: ArcSwap<AggregateMetrics>,
}

struct Samples {
    latencies: Reservoir,
    window: TpsWindow,
}

impl Aggregator {
    pub fn new(reservoir_size: usize, tps_window: Duration) -> Self {
        Self::starting_at(Instant::now(), reservoir_size, tps_window)
    }

    pub fn starting_at(started: Instant, reservoir_size: usize, tps_window: Duration) -> Self {
        Self {
            started,
            success: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            dropped_detector_events: AtomicU64::new(0),
            peak_tps: AtomicU64::new(0f64.to_bits()),
            samples: Mutex::new(Samples {
                latencies: Reservoir::new(reservoir_size),
                window: TpsWindow::new(started, tps_window),
            }),
            published: ArcSwap::from_pointee(AggregateMetrics::default()),
        }
    }

    pub fn record(&self, result: &WorkerResult) {
        let counter = match result.outcome {
            Outcome::Success => &self.success,
            Outcome::ConnectionError => &self.connection_errors,
            Outcome::Timeout => &self.timeouts,
            Outcome::QueryError => &self.query_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        {
            let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            samples.latencies.push(result.latency);
            samples.window.add(result.at, result.outcome.is_success());
        }

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("failover_attempts", "outcome" => result.outcome.label()).increment(1);
            metrics::histogram!("failover_latency_seconds").record(result.latency.as_secs_f64());
        }
    }

    /// Worker outcome that could not be handed to the detector.
    pub fn record_dropped_event(&self) {
        self.dropped_detector_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot as of now.
    ///
    /// `elapsed` and the rates derived from it move with the clock, so repeated calls only agree
    /// on the counters. Use [`Aggregator::snapshot_at`] for a reproducible view, or
    /// [`Aggregator::latest`] to re-read the last published one.
    pub fn snapshot(&self) -> AggregateMetrics {
        self.snapshot_at(Instant::now())
    }

    /// Snapshot as of `now`. Two calls with the same `now` and no intervening
    /// [`Aggregator::record`] return identical values.
    pub fn snapshot_at(&self, now: Instant) -> AggregateMetrics {
        let successes = self.success.load(Ordering::Relaxed);
        let connection_errors = self.connection_errors.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let query_errors = self.query_errors.load(Ordering::Relaxed);
        let dropped_detector_events = self.dropped_detector_events.load(Ordering::Relaxed);

        let (latencies, rate) = {
            let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
            (samples.latencies.samples().to_vec(), samples.window.rate(now))
        };

        let peak_bits = self.peak_tps.fetch_max(rate.tps.to_bits(), Ordering::Relaxed);
        let peak_tps = f64::from_bits(peak_bits).max(rate.tps);

        let elapsed = now.saturating_duration_since(self.started);
        let mean_tps = if elapsed.is_zero() {
            0.
        } else {
            successes as f64 / elapsed.as_secs_f64()
        };

        let snapshot = AggregateMetrics {
            elapsed,
            total_attempts: successes + connection_errors + timeouts + query_errors,
            successes,
            connection_errors,
            timeouts,
            query_errors,
            current_tps: rate.tps,
            peak_tps,
            mean_tps,
            recent_success_rate: rate.success_rate,
            latency: reservoir::summarize(latencies),
            dropped_detector_events,
        };

        #[cfg(feature = "metrics")]
        metrics::gauge!("failover_tps").set(snapshot.current_tps);

        self.published.store(Arc::new(snapshot));
        snapshot
    }

    /// Most recently published snapshot, without computing a new one.
    pub fn latest(&self) -> Arc<AggregateMetrics> {
        self.published.load_full()
    }

    pub fn started(&self) -> Instant {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn result(outcome: Outcome, latency_ms: u64, at: Instant) -> WorkerResult {
        WorkerResult {
            worker_id: 0,
            outcome,
            latency: Duration::from_millis(latency_ms),
            at,
        }
    }

    #[test]
    fn totals_match_categories() {
        let start = Instant::now();
        let aggregator = Aggregator::starting_at(start, 100, Duration::from_secs(5));
        let outcomes = [
            Outcome::Success,
            Outcome::Success,
            Outcome::ConnectionError,
            Outcome::Timeout,
            Outcome::QueryError,
            Outcome::Success,
        ];
        for (i, outcome) in outcomes.into_iter().enumerate() {
            aggregator.record(&result(outcome, 5, start + Duration::from_millis(i as u64 * 10)));
        }

        let snapshot = aggregator.snapshot_at(start + Duration::from_secs(1));
        assert_eq!(snapshot.total_attempts, 6);
        assert_eq!(snapshot.successes, 3);
        assert_eq!(snapshot.connection_errors, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.query_errors, 1);
        assert_eq!(snapshot.total_attempts, snapshot.successes + snapshot.failures());
    }

    #[test]
    fn snapshot_is_idempotent() {
        let start = Instant::now();
        let aggregator = Aggregator::starting_at(start, 100, Duration::from_secs(5));
        for i in 0..50u64 {
            aggregator.record(&result(Outcome::Success, i, start + Duration::from_millis(i * 20)));
        }

        let now = start + Duration::from_secs(2);
        let first = aggregator.snapshot_at(now);
        let second = aggregator.snapshot_at(now);
        assert_eq!(first, second);
        assert_eq!(*aggregator.latest(), second);
    }

    #[test]
    fn wall_clock_snapshots_agree_on_counters() {
        let aggregator = Aggregator::new(100, Duration::from_secs(5));
        aggregator.record(&result(Outcome::Success, 3, Instant::now()));

        let first = aggregator.snapshot();
        assert_eq!(*aggregator.latest(), first);
        thread::sleep(Duration::from_millis(20));
        let second = aggregator.snapshot();

        assert!(second.elapsed > first.elapsed);
        assert_eq!(first.total_attempts, second.total_attempts);
        assert_eq!(first.successes, second.successes);
        assert_eq!(first.latency, second.latency);
        assert_eq!(*aggregator.latest(), second);
    }

    #[test]
    fn dropped_events_are_counted() {
        let aggregator = Aggregator::new(100, Duration::from_secs(5));
        aggregator.record_dropped_event();
        aggregator.record_dropped_event();
        assert_eq!(aggregator.snapshot().dropped_detector_events, 2);
    }

    #[test]
    fn percentiles_are_ordered() {
        let start = Instant::now();
        let aggregator = Aggregator::starting_at(start, 1_000, Duration::from_secs(5));
        for i in 0..500u64 {
            let latency = if i % 50 == 0 { 900 } else { (i * 7) % 40 };
            aggregator.record(&result(Outcome::Success, latency, start));
        }

        let latency = aggregator.snapshot_at(start + Duration::from_secs(1)).latency;
        assert_eq!(latency.samples, 500);
        assert!(latency.p50 <= latency.p95);
        assert!(latency.p95 <= latency.p99);
    }

    #[test]
    fn peak_survives_an_outage() {
        let start = Instant::now();
        let aggregator = Aggregator::starting_at(start, 100, Duration::from_secs(1));
        for i in 0..100u64 {
            aggregator.record(&result(Outcome::Success, 1, start + Duration::from_millis(i * 10)));
        }
        let busy = aggregator.snapshot_at(start + Duration::from_millis(999));
        assert!((busy.current_tps - 100.).abs() < 1e-9);

        for i in 0..20u64 {
            aggregator.record(&result(
                Outcome::ConnectionError,
                1,
                start + Duration::from_secs(3) + Duration::from_millis(i * 10),
            ));
        }
        let outage = aggregator.snapshot_at(start + Duration::from_millis(3_500));
        assert_eq!(outage.current_tps, 0.);
        assert_eq!(outage.recent_success_rate, Some(0.));
        assert_eq!(outage.peak_tps, busy.current_tps);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let aggregator = Arc::new(Aggregator::new(64, Duration::from_secs(5)));
        let handles: Vec<_> = (0..8)
            .map(|worker_id| {
                let aggregator = aggregator.clone();
                thread::spawn(move || {
                    for i in 0..1_000u64 {
                        let outcome = if i % 10 == 0 {
                            Outcome::Timeout
                        } else {
                            Outcome::Success
                        };
                        aggregator.record(&WorkerResult {
                            worker_id,
                            outcome,
                            latency: Duration::from_micros(i),
                            at: Instant::now(),
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.total_attempts, 8_000);
        assert_eq!(snapshot.timeouts, 800);
        assert_eq!(snapshot.successes, 7_200);
        assert_eq!(snapshot.latency.samples, 64);
    }
}
