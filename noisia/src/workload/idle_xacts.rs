//! Idle transactions
//!
//! Each unit opens a transaction, optionally copies one row of a busy table
//! into a throwaway temp table so the transaction pins a snapshot, idles for
//! a random naptime and rolls back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::IdleXactsConfig;
use crate::db::{Connection, Database, close_quietly, rollback_quietly};
use crate::engine::{Backend, TargetTable, WorkerPool, draw_between, nap, workload_rng};

use super::{Lifecycle, Phase, Workload, WorkloadError, discover_targets, pick_target};

const RNG_STREAM: u64 = 1;

pub struct IdleXacts {
    config: IdleXactsConfig,
    db: Arc<dyn Database>,
    seed: Option<u64>,
}

impl IdleXacts {
    pub fn new(config: IdleXactsConfig, db: Arc<dyn Database>, seed: Option<u64>) -> Self {
        Self { config, db, seed }
    }
}

#[async_trait]
impl Workload for IdleXacts {
    fn name(&self) -> &'static str {
        "idle_xacts"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);
        let targets = discover_targets(self.db.as_ref()).await?;
        if targets.is_empty() {
            info!("idle xacts: no tables with write activity, transactions stay empty");
        }

        let pool = WorkerPool::new(self.name(), self.config.jobs);
        let mut rng = workload_rng(self.seed, RNG_STREAM);
        let (min, max) = (self.config.naptime_min, self.config.naptime_max);

        let report = lifecycle
            .drive(
                &cancel,
                pool.run(&cancel, |_| {
                    let target = pick_target(&mut rng, &targets);
                    let naptime = draw_between(&mut rng, min, max);
                    idle_transaction(self.db.clone(), target, naptime, cancel.clone())
                }),
            )
            .await;

        lifecycle.enter(Phase::CleanedUp);
        info!(
            "idle xacts finished: {} transactions, {} failed",
            report.admitted, report.failed
        );
        Ok(())
    }
}

async fn idle_transaction(
    db: Arc<dyn Database>,
    target: Option<TargetTable>,
    naptime: Duration,
    cancel: CancellationToken,
) -> Result<(), WorkloadError> {
    let mut conn = db.connect().await?;
    let result = hold_snapshot(db.as_ref(), conn.as_mut(), target.as_ref(), naptime, &cancel).await;
    close_quietly(conn).await;
    result
}

async fn hold_snapshot(
    db: &dyn Database,
    conn: &mut dyn Connection,
    target: Option<&TargetTable>,
    naptime: Duration,
    cancel: &CancellationToken,
) -> Result<(), WorkloadError> {
    // Reading the target may queue behind a lock held elsewhere
    let backend = match target {
        Some(_) => Some(Backend::of(conn).await?),
        None => None,
    };
    let mut tx = conn.begin().await?;

    if let (Some(target), Some(backend)) = (target, backend) {
        let sql = format!(
            "CREATE TEMP TABLE _noisia_idle_xacts ON COMMIT DROP AS SELECT * FROM {} LIMIT 1",
            target
        );
        match backend.interruptible(db, cancel, tx.execute(&sql, &[])).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                rollback_quietly(tx).await;
                return Ok(());
            }
            Err(e) => {
                rollback_quietly(tx).await;
                return Err(e.into());
            }
        }
    }

    debug!("idle xacts: idling for {:?}", naptime);
    nap(cancel, naptime).await;
    tx.rollback().await?;
    Ok(())
}
