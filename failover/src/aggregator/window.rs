use failover_core::TPS_BUCKET_WIDTH;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

// NOTE: Rates are never computed over less than a second, otherwise the first few successes of a
// run would register as an enormous peak.
const MIN_RATE_WIDTH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bucket {
    index: u64,
    successes: u64,
    attempts: u64,
}

/// Sliding window of attempt/success counts in fixed-width buckets.
///
/// Memory is bounded by `window / TPS_BUCKET_WIDTH` buckets regardless of throughput.
#[derive(Debug, Clone)]
pub(crate) struct TpsWindow {
    origin: Instant,
    window: Duration,
    buckets: VecDeque<Bucket>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowRate {
    pub tps: f64,
    pub success_rate: Option<f64>,
}

impl TpsWindow {
    pub fn new(origin: Instant, window: Duration) -> Self {
        Self {
            origin,
            window: window.max(TPS_BUCKET_WIDTH),
            buckets: VecDeque::new(),
        }
    }

    fn index_of(&self, at: Instant) -> u64 {
        (at.saturating_duration_since(self.origin).as_nanos() / TPS_BUCKET_WIDTH.as_nanos()) as u64
    }

    fn bucket_span(&self) -> u64 {
        (self.window.as_nanos() / TPS_BUCKET_WIDTH.as_nanos()).max(1) as u64
    }

    pub fn add(&mut self, at: Instant, success: bool) {
        let index = self.index_of(at);
        let successes = u64::from(success);

        let target = match self.buckets.back().map(|b| b.index) {
            Some(newest) if newest > index => {
                // Workers record concurrently, so an attempt can land slightly behind the newest
                // bucket. It goes to the first retained bucket at or after its own slot.
                self.buckets.iter_mut().find(|b| b.index >= index)
            }
            Some(newest) if newest == index => self.buckets.back_mut(),
            _ => None,
        };

        match target {
            Some(bucket) => {
                bucket.successes += successes;
                bucket.attempts += 1;
            }
            None => self.buckets.push_back(Bucket {
                index,
                successes,
                attempts: 1,
            }),
        }

        let newest = self.buckets.back().map_or(index, |b| b.index);
        let span = self.bucket_span();
        while let Some(front) = self.buckets.front() {
            if front.index + span <= newest {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// Rate over the window ending at `now`. A pure function of `now` and the recorded attempts.
    pub fn rate(&self, now: Instant) -> WindowRate {
        let elapsed = now.saturating_duration_since(self.origin);
        let now_index = self.index_of(now);
        let span = self.bucket_span();
        let oldest = (now_index + 1).saturating_sub(span);

        let (successes, attempts) = self
            .buckets
            .iter()
            .filter(|b| b.index >= oldest && b.index <= now_index)
            .fold((0u64, 0u64), |(s, a), b| (s + b.successes, a + b.attempts));

        let width = elapsed.min(self.window).max(MIN_RATE_WIDTH.min(self.window));
        let tps = if width.is_zero() {
            0.
        } else {
            successes as f64 / width.as_secs_f64()
        };

        let success_rate = if attempts == 0 {
            None
        } else {
            Some(successes as f64 / attempts as f64)
        };

        WindowRate { tps, success_rate }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_rate_over_full_window() {
        let origin = Instant::now();
        let mut window = TpsWindow::new(origin, Duration::from_secs(5));

        // 100 successes per second for 10 seconds.
        for i in 0..1_000u64 {
            window.add(origin + Duration::from_millis(i * 10), true);
        }

        let rate = window.rate(origin + Duration::from_secs(10));
        assert!((rate.tps - 100.).abs() < 3., "tps was {}", rate.tps);
        assert_eq!(rate.success_rate, Some(1.));
    }

    #[test]
    fn rate_drops_to_zero_during_silence() {
        let origin = Instant::now();
        let mut window = TpsWindow::new(origin, Duration::from_secs(2));
        for i in 0..100u64 {
            window.add(origin + Duration::from_millis(i * 10), true);
        }

        let rate = window.rate(origin + Duration::from_secs(10));
        assert_eq!(rate.tps, 0.);
        assert_eq!(rate.success_rate, None);
    }

    #[test]
    fn failures_lower_success_rate_but_not_tps() {
        let origin = Instant::now();
        let mut window = TpsWindow::new(origin, Duration::from_secs(1));
        for i in 0..10u64 {
            window.add(origin + Duration::from_millis(i * 50), i % 2 == 0);
        }

        let rate = window.rate(origin + Duration::from_millis(999));
        assert_eq!(rate.success_rate, Some(0.5));
        assert!((rate.tps - 5.).abs() < 1e-9);
    }

    #[test]
    fn memory_is_bounded_by_window() {
        let origin = Instant::now();
        let mut window = TpsWindow::new(origin, Duration::from_secs(1));
        for i in 0..100_000u64 {
            window.add(origin + Duration::from_millis(i), true);
        }
        assert!(window.len() <= 10);
    }

    #[test]
    fn late_attempts_are_counted() {
        let origin = Instant::now();
        let mut window = TpsWindow::new(origin, Duration::from_secs(5));
        window.add(origin + Duration::from_millis(450), true);
        window.add(origin + Duration::from_millis(250), true);
        window.add(origin + Duration::from_millis(460), true);

        let rate = window.rate(origin + Duration::from_secs(1));
        assert!((rate.tps - 3.).abs() < 1e-9);
    }
}
