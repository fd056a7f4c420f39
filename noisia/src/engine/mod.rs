//! Workload execution engine
//!
//! This module provides:
//! - `WorkerPool`: bounded-concurrency admission of units of work
//! - `IntervalThrottle` and `AdaptiveBackoff`: pacing controllers
//! - `select_targets`: picks the busiest user tables
//! - `produce_deadlock`: cross-ordered transaction pair
//! - `Fixture`: lifecycle of the tables noisia creates for itself
//! - `Backend`: server-side cancellation of a session's running statement

pub mod deadlock;
pub mod fixture;
pub mod interrupt;
pub mod pool;
pub mod rate;
pub mod targeting;

pub use deadlock::{DEADLOCK_PAUSE, DeadlockOutcome, DeadlockPair, produce_deadlock};
pub use fixture::Fixture;
pub use interrupt::Backend;
pub use pool::{PoolReport, WorkerPool};
pub use rate::{AdaptiveBackoff, IntervalThrottle, draw_between, interval_for_rate, nap};
pub use targeting::{MAX_TARGETS, TargetTable, select_targets};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Random source owned by a single control loop
pub type WorkloadRng = ChaCha8Rng;

/// Build the RNG for one driver
///
/// With a seed every driver gets its own stream of the same key, so runs are
/// reproducible per driver regardless of which other drivers are enabled.
pub fn workload_rng(seed: Option<u64>, stream: u64) -> WorkloadRng {
    match seed {
        Some(seed) => {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(stream);
            rng
        }
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}
