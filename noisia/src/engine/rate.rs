//! Rate and backoff controllers
//!
//! Two flavors:
//! - `IntervalThrottle` spaces iteration starts by a fixed or jittered interval
//! - `AdaptiveBackoff` grows its interval on failure and shrinks it on success

use std::time::Duration;

use rand::{Rng, SeedableRng};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use super::WorkloadRng;

/// Draw a duration uniformly from `[min, max]`, both ends included
///
/// The upper bound is bumped by one nanosecond before drawing since the
/// range draw excludes its end.
pub fn draw_between<R: Rng + ?Sized>(rng: &mut R, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let lo = as_nanos(min);
    let hi = as_nanos(max).saturating_add(1);
    Duration::from_nanos(rng.random_range(lo..hi))
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Interval between iterations for a per-second rate
pub fn interval_for_rate(rate: f64) -> Duration {
    if rate.is_finite() && rate > 0.0 {
        Duration::from_secs_f64(1.0 / rate)
    } else {
        Duration::ZERO
    }
}

/// Sleep unless cancelled first. Returns `true` if the full duration elapsed.
pub async fn nap(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Throttle spacing consecutive iteration starts
///
/// The first `wait` returns immediately. Each following start is scheduled one
/// drawn interval after the previous scheduled start, so the spacing does not
/// depend on how long an iteration took. A loop that fell behind restarts its
/// schedule from now instead of bursting.
pub struct IntervalThrottle {
    min: Duration,
    max: Duration,
    rng: WorkloadRng,
    next: Option<Instant>,
}

impl IntervalThrottle {
    /// Constant interval
    pub fn fixed(interval: Duration) -> Self {
        Self::between(interval, interval, WorkloadRng::seed_from_u64(0))
    }

    /// Interval drawn from `[min, max]` before every iteration
    pub fn between(min: Duration, max: Duration, rng: WorkloadRng) -> Self {
        Self {
            min,
            max: max.max(min),
            rng,
            next: None,
        }
    }

    /// Rate drawn from `[min_rate, max_rate]` iterations per second
    pub fn for_rates(min_rate: f64, max_rate: f64, rng: WorkloadRng) -> Self {
        Self::between(interval_for_rate(max_rate), interval_for_rate(min_rate), rng)
    }

    /// Next interval to apply
    fn next_delay(&mut self) -> Duration {
        draw_between(&mut self.rng, self.min, self.max)
    }

    /// Wait for the next iteration slot. Returns `false` once cancelled.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> bool {
        let now = Instant::now();
        let start = match self.next {
            Some(at) if at > now => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    _ = sleep_until(at) => at,
                }
            }
            _ => now,
        };
        if cancel.is_cancelled() {
            return false;
        }
        let delay = self.next_delay();
        self.next = Some(start + delay);
        true
    }
}

/// Adaptive interval for probing a resource that fails by design
///
/// Starts at the floor, doubles on every failure (capped at the ceiling) and
/// halves on every success, never dropping below the floor.
#[derive(Debug, Clone)]
pub struct AdaptiveBackoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl AdaptiveBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
            current: floor,
        }
    }

    pub fn interval(&self) -> Duration {
        self.current
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn on_failure(&mut self) {
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
            .max(self.floor);
    }

    pub fn on_success(&mut self) {
        self.current = (self.current / 2).max(self.floor);
    }
}
