//! Deadlocks
//!
//! Every unit is one deadlock attempt on the fixture table. An attempt uses
//! two sessions, so at most `jobs / 2` attempts run at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DeadlocksConfig;
use crate::db::Database;
use crate::engine::{DeadlockPair, Fixture, WorkerPool, produce_deadlock, workload_rng};

use super::{Lifecycle, Phase, Workload, WorkloadError};

const RNG_STREAM: u64 = 3;

pub struct Deadlocks {
    config: DeadlocksConfig,
    db: Arc<dyn Database>,
    seed: Option<u64>,
}

impl Deadlocks {
    pub fn new(config: DeadlocksConfig, db: Arc<dyn Database>, seed: Option<u64>) -> Self {
        Self { config, db, seed }
    }
}

#[async_trait]
impl Workload for Deadlocks {
    fn name(&self) -> &'static str {
        "deadlocks"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);

        let fixture = Fixture::deadlocks();
        if let Err(e) = fixture.prepare(self.db.as_ref()).await {
            fixture.cleanup(self.db.as_ref()).await;
            return Err(WorkloadError::Prepare(e));
        }

        let pool = WorkerPool::new(self.name(), self.config.jobs / 2);
        let mut rng = workload_rng(self.seed, RNG_STREAM);
        let deadlocks = Arc::new(AtomicU64::new(0));

        let report = lifecycle
            .drive(
                &cancel,
                pool.run(&cancel, |_| {
                    let pair = DeadlockPair::generate(&mut rng);
                    let db = self.db.clone();
                    let deadlocks = deadlocks.clone();
                    async move {
                        let outcome = produce_deadlock(db.as_ref(), pair).await?;
                        if !outcome.is_deadlock() {
                            debug!("deadlocks: attempt did not deadlock: {:?}", outcome);
                        }
                        deadlocks.fetch_add(u64::from(outcome.deadlocked), Ordering::Relaxed);
                        Ok::<(), WorkloadError>(())
                    }
                }),
            )
            .await;

        fixture.cleanup(self.db.as_ref()).await;
        lifecycle.enter(Phase::CleanedUp);
        info!(
            "deadlocks finished: {} attempts, {} deadlocks, {} failed",
            report.admitted,
            deadlocks.load(Ordering::Relaxed),
            report.failed
        );
        Ok(())
    }
}
