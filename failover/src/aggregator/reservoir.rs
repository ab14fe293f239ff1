use failover_core::LatencySummary;
use std::time::Duration;

/// Fixed-capacity circular buffer of the most recent latencies.
#[derive(Debug, Clone)]
pub(crate) struct Reservoir {
    samples: Vec<Duration>,
    next: usize,
    capacity: usize,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity),
            next: 0,
            capacity,
        }
    }

    pub fn push(&mut self, latency: Duration) {
        if self.samples.len() < self.capacity {
            self.samples.push(latency);
        } else {
            self.samples[self.next] = latency;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }
}

/// Summarize a copy of the reservoir. Sorting happens outside of any lock.
pub(crate) fn summarize(mut samples: Vec<Duration>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }
    samples.sort_unstable();

    let total: Duration = samples.iter().sum();
    LatencySummary {
        samples: samples.len(),
        min: samples[0],
        mean: total / samples.len() as u32,
        p50: percentile(&samples, 0.50),
        p95: percentile(&samples, 0.95),
        p99: percentile(&samples, 0.99),
        max: samples[samples.len() - 1],
    }
}

/// Nearest-rank percentile over sorted samples. Monotonic in `quantile`, so
/// `p50 <= p95 <= p99` holds for any non-empty input.
fn percentile(sorted: &[Duration], quantile: f64) -> Duration {
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
