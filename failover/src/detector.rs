//! Failure detection from probe results and worker write outcomes.
use arc_swap::ArcSwap;
use failover_core::{DetectorSnapshot, DetectorState, FailoverWindow, ProbeResult};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Clone, Debug, PartialEq)]
pub enum DetectorEvent {
    Probe(ProbeResult),
    /// Outcome of a worker write. Feeds the write-path outage window only.
    Worker { success: bool, at: OffsetDateTime },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Down { at: OffsetDateTime },
    Recovered { window: FailoverWindow, rto: Duration },
}

/// Probe-driven state machine: `Stable -> Down -> Recovered`.
///
/// `Down` is entered once the last `threshold` probes have all failed, and the outage is dated
/// from the earliest failure of that run. `Recovered` is terminal, so at most one
/// [`FailoverWindow`] exists per run.
#[derive(Clone, Debug)]
pub struct FailureDetector {
    threshold: usize,
    state: DetectorState,
    recent: VecDeque<(bool, OffsetDateTime)>,
    window: Option<FailoverWindow>,
    write_outage: Option<FailoverWindow>,
    last_seq: Option<u64>,
    last_at: Option<OffsetDateTime>,
    last_probe: Option<ProbeResult>,
    probes: u64,
    probe_failures: u64,
    worker_failures: u64,
    worker_successes: u64,
    failures_after_recovery: u64,
}

impl FailureDetector {
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            threshold,
            state: DetectorState::Stable,
            recent: VecDeque::with_capacity(threshold),
            window: None,
            write_outage: None,
            last_seq: None,
            last_at: None,
            last_probe: None,
            probes: 0,
            probe_failures: 0,
            worker_failures: 0,
            worker_successes: 0,
            failures_after_recovery: 0,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn window(&self) -> Option<FailoverWindow> {
        self.window
    }

    pub fn write_outage(&self) -> Option<FailoverWindow> {
        self.write_outage
    }

    pub fn observe(&mut self, event: DetectorEvent) -> Option<Transition> {
        match event {
            DetectorEvent::Probe(result) => self.observe_probe(result),
            DetectorEvent::Worker { success, at } => {
                self.observe_write(success, at);
                None
            }
        }
    }

    fn observe_probe(&mut self, result: ProbeResult) -> Option<Transition> {
        let stale_seq = self.last_seq.is_some_and(|seq| result.seq <= seq);
        let stale_at = self.last_at.is_some_and(|at| result.at < at);
        if stale_seq || stale_at {
            warn!(
                "Dropping out-of-order probe result seq={} (last seq={:?})",
                result.seq, self.last_seq
            );
            return None;
        }
        self.last_seq = Some(result.seq);
        self.last_at = Some(result.at);

        self.probes += 1;
        if !result.success {
            self.probe_failures += 1;
        }

        if self.recent.len() == self.threshold {
            self.recent.pop_front();
        }
        self.recent.push_back((result.success, result.at));

        let success = result.success;
        let at = result.at;
        self.last_probe = Some(result);

        match self.state {
            DetectorState::Stable => {
                let all_failed = self.recent.len() == self.threshold
                    && self.recent.iter().all(|(ok, _)| !ok);
                if !all_failed {
                    return None;
                }
                let (_, first_failure_at) = self.recent.front().copied()?;
                self.window = Some(FailoverWindow::open(first_failure_at));
                self.state = DetectorState::Down;
                Some(Transition::Down { at: first_failure_at })
            }
            DetectorState::Down if success => {
                let window = self.window.as_mut()?;
                if !window.close(at) {
                    return None;
                }
                let window = *window;
                self.state = DetectorState::Recovered;
                window
                    .rto()
                    .map(|rto| Transition::Recovered { window, rto })
            }
            DetectorState::Down => None,
            DetectorState::Recovered => {
                if !success {
                    self.failures_after_recovery += 1;
                }
                None
            }
        }
    }

    fn observe_write(&mut self, success: bool, at: OffsetDateTime) {
        if success {
            self.worker_successes += 1;
            if let Some(window) = self.write_outage.as_mut() {
                window.close(at);
            }
        } else {
            self.worker_failures += 1;
            if self.write_outage.is_none() {
                self.write_outage = Some(FailoverWindow::open(at));
            }
        }
    }

    pub fn snapshot(&self) -> DetectorSnapshot {
        DetectorSnapshot {
            state: self.state,
            window: self.window,
            write_outage: self.write_outage,
            probes: self.probes,
            probe_failures: self.probe_failures,
            worker_failures: self.worker_failures,
            worker_successes: self.worker_successes,
            failures_after_recovery: self.failures_after_recovery,
            last_probe: self.last_probe.clone(),
        }
    }
}

/// Drives a [`FailureDetector`] until every event sender has been dropped, publishing a snapshot
/// after each event. Returns the detector so the final state can be read without racing the
/// published copy.
#[instrument(name = "detector", skip_all, fields(threshold = detector.threshold()))]
pub async fn run_detector(
    mut detector: FailureDetector,
    events: async_channel::Receiver<DetectorEvent>,
    published: Arc<ArcSwap<DetectorSnapshot>>,
) -> FailureDetector {
    while let Ok(event) = events.recv().await {
        match detector.observe(event) {
            Some(Transition::Down { at }) => {
                warn!("Database unavailable, first failure detected at {at}");
                #[cfg(feature = "metrics")]
                metrics::counter!("failover_outages").increment(1);
            }
            Some(Transition::Recovered { rto, .. }) => {
                info!("Database recovered after {:.2}s", rto.as_secs_f64());
                #[cfg(feature = "metrics")]
                metrics::histogram!("failover_rto_seconds").record(rto.as_secs_f64());
            }
            None => {}
        }
        published.store(Arc::new(detector.snapshot()));
    }

    debug!("Detector channel closed after {} probes", detector.probes);
    detector
}
