//! Waiting transactions
//!
//! Units take an `ACCESS EXCLUSIVE` lock on one of the busiest tables and
//! keep it for a random lock time, so concurrent sessions queue behind it.
//! Without usable tables the fixture table is locked instead, and each unit
//! pairs its locker with a prober that reads the table once the lock is held.
//!
//! A lock request or read still queued when the run is cancelled is
//! cancelled on the server, so it neither outlives the run nor keeps its
//! place in the lock queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WaitXactsConfig;
use crate::db::{Connection, Database, close_quietly, rollback_quietly};
use crate::engine::{Backend, Fixture, TargetTable, WorkerPool, draw_between, nap, workload_rng};

use super::{Lifecycle, Phase, Workload, WorkloadError, discover_targets};

const RNG_STREAM: u64 = 2;

pub struct WaitXacts {
    config: WaitXactsConfig,
    db: Arc<dyn Database>,
    seed: Option<u64>,
}

impl WaitXacts {
    pub fn new(config: WaitXactsConfig, db: Arc<dyn Database>, seed: Option<u64>) -> Self {
        Self { config, db, seed }
    }

    async fn targets(&self, fixture: &Fixture) -> Result<Vec<TargetTable>, WorkloadError> {
        if !self.config.fixture {
            let targets = discover_targets(self.db.as_ref()).await?;
            if !targets.is_empty() {
                return Ok(targets);
            }
            info!("wait xacts: no tables with write activity, using fixture");
        }
        let table = fixture
            .prepare(self.db.as_ref())
            .await
            .map_err(WorkloadError::Prepare)?;
        Ok(vec![table])
    }
}

#[async_trait]
impl Workload for WaitXacts {
    fn name(&self) -> &'static str {
        "wait_xacts"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);

        let fixture = Fixture::wait_xacts();
        let targets = match self.targets(&fixture).await {
            Ok(targets) => targets,
            Err(e) => {
                if self.config.fixture || matches!(e, WorkloadError::Prepare(_)) {
                    fixture.cleanup(self.db.as_ref()).await;
                }
                return Err(e);
            }
        };
        let uses_fixture = targets.iter().any(|t| t.is_fixture());

        let pool = WorkerPool::new(self.name(), self.config.jobs);
        let mut rng = workload_rng(self.seed, RNG_STREAM);
        let (min, max) = (self.config.locktime_min, self.config.locktime_max);

        let report = lifecycle
            .drive(
                &cancel,
                pool.run(&cancel, |_| {
                    let target = targets[rng.random_range(0..targets.len())].clone();
                    let locktime = draw_between(&mut rng, min, max);
                    lock_unit(self.db.clone(), target, locktime, cancel.clone())
                }),
            )
            .await;

        if uses_fixture {
            fixture.cleanup(self.db.as_ref()).await;
        }
        lifecycle.enter(Phase::CleanedUp);
        info!(
            "wait xacts finished: {} locks taken, {} failed",
            report.admitted, report.failed
        );
        Ok(())
    }
}

async fn lock_unit(
    db: Arc<dyn Database>,
    target: TargetTable,
    locktime: Duration,
    cancel: CancellationToken,
) -> Result<(), WorkloadError> {
    if !target.is_fixture() {
        return hold_lock(db.as_ref(), &target, locktime, &cancel, None).await;
    }

    let (held_tx, held_rx) = oneshot::channel();
    let (locked, probed) = tokio::join!(
        hold_lock(db.as_ref(), &target, locktime, &cancel, Some(held_tx)),
        probe(db.as_ref(), &target, held_rx, &cancel),
    );
    locked.and(probed)
}

async fn hold_lock(
    db: &dyn Database,
    target: &TargetTable,
    locktime: Duration,
    cancel: &CancellationToken,
    held: Option<oneshot::Sender<()>>,
) -> Result<(), WorkloadError> {
    let mut conn = db.connect().await?;
    let result = lock_for(db, conn.as_mut(), target, locktime, cancel, held).await;
    close_quietly(conn).await;
    result
}

async fn lock_for(
    db: &dyn Database,
    conn: &mut dyn Connection,
    target: &TargetTable,
    locktime: Duration,
    cancel: &CancellationToken,
    held: Option<oneshot::Sender<()>>,
) -> Result<(), WorkloadError> {
    let backend = Backend::of(conn).await?;
    let mut tx = conn.begin().await?;
    let sql = format!("LOCK TABLE {} IN ACCESS EXCLUSIVE MODE", target);
    match backend.interruptible(db, cancel, tx.execute(&sql, &[])).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            debug!("wait xacts: lock request on {} cancelled", target);
            rollback_quietly(tx).await;
            return Ok(());
        }
        Err(e) => {
            rollback_quietly(tx).await;
            return Err(e.into());
        }
    }

    if let Some(held) = held {
        held.send(()).ok();
    }
    debug!("wait xacts: holding lock on {} for {:?}", target, locktime);
    nap(cancel, locktime).await;

    tx.rollback().await?;
    Ok(())
}

/// Read the locked table once the lock is confirmed; the read queues behind it
async fn probe(
    db: &dyn Database,
    target: &TargetTable,
    held: oneshot::Receiver<()>,
    cancel: &CancellationToken,
) -> Result<(), WorkloadError> {
    let mut conn = db.connect().await?;
    let result = read_behind_lock(db, conn.as_mut(), target, held, cancel).await;
    close_quietly(conn).await;
    result
}

async fn read_behind_lock(
    db: &dyn Database,
    conn: &mut dyn Connection,
    target: &TargetTable,
    held: oneshot::Receiver<()>,
    cancel: &CancellationToken,
) -> Result<(), WorkloadError> {
    let backend = Backend::of(conn).await?;
    // Locker gave up before holding the lock
    if held.await.is_err() {
        return Ok(());
    }
    let sql = format!("SELECT payload FROM {}", target);
    backend.interruptible(db, cancel, conn.query(&sql, &[])).await?;
    Ok(())
}
