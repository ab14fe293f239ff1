//! Independent connectivity probe.
use crate::detector::DetectorEvent;
use failover_core::{Backend, ProbeResult};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
#[allow(unused_imports)]
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

/// Spawns the probe loop. Exactly one [`ProbeResult`] is emitted per tick, each bounded by
/// `probe_timeout`, until `cancel` fires. Resolves to the number of probes issued.
pub fn spawn_probe<B: Backend>(
    backend: Arc<B>,
    probe_interval: Duration,
    probe_timeout: Duration,
    events: async_channel::Sender<DetectorEvent>,
    cancel: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(
        probe_loop(backend, probe_interval, probe_timeout, events, cancel)
            .instrument(tracing::info_span!("probe")),
    )
}

async fn probe_loop<B: Backend>(
    backend: Arc<B>,
    probe_interval: Duration,
    probe_timeout: Duration,
    events: async_channel::Sender<DetectorEvent>,
    cancel: CancellationToken,
) -> u64 {
    let mut ticker = interval(probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seq = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = probe_once(backend.as_ref(), seq, probe_timeout).await;
        if !result.success {
            debug!("Probe {seq} failed: {:?}", result.error);
        }
        #[cfg(feature = "metrics")]
        metrics::counter!("failover_probes", "success" => result.success.to_string()).increment(1);

        seq += 1;
        if events.send(DetectorEvent::Probe(result)).await.is_err() {
            warn!("Detector channel closed, stopping probe");
            break;
        }
    }

    seq
}

async fn probe_once<B: Backend>(backend: &B, seq: u64, probe_timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    let outcome = timeout(probe_timeout, backend.probe()).await;
    let latency = start.elapsed();
    let at = OffsetDateTime::now_utc();

    match outcome {
        Ok(Ok(())) => ProbeResult::success(seq, at, latency),
        Ok(Err(err)) => ProbeResult::failure(seq, at, latency, err.to_string()),
        Err(_) => ProbeResult::failure(
            seq,
            at,
            latency,
            format!("probe timed out after {probe_timeout:?}"),
        ),
    }
}
