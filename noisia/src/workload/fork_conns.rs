//! Forced reconnection
//!
//! Every unit opens a fresh connection, runs one trivial query and
//! disconnects, so the server keeps forking and tearing down backends.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ForkConnsConfig;
use crate::db::{Database, close_quietly};
use crate::engine::{IntervalThrottle, WorkerPool, interval_for_rate};

use super::{Lifecycle, Phase, Workload, WorkloadError};

const PING: &str = "SELECT count(*) FROM pg_class LIMIT 1";

pub struct ForkConns {
    config: ForkConnsConfig,
    db: Arc<dyn Database>,
}

impl ForkConns {
    pub fn new(config: ForkConnsConfig, db: Arc<dyn Database>) -> Self {
        Self { config, db }
    }
}

#[async_trait]
impl Workload for ForkConns {
    fn name(&self) -> &'static str {
        "fork_conns"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);

        let pool = WorkerPool::new(self.name(), self.config.jobs);
        let mut throttle = IntervalThrottle::fixed(interval_for_rate(self.config.rate));

        let report = lifecycle
            .drive(
                &cancel,
                pool.run_paced(&cancel, &mut throttle, |_| reconnect(self.db.clone())),
            )
            .await;

        lifecycle.enter(Phase::CleanedUp);
        info!(
            "forkconns finished: {} connections, {} failed",
            report.admitted, report.failed
        );
        Ok(())
    }
}

async fn reconnect(db: Arc<dyn Database>) -> Result<(), WorkloadError> {
    let mut conn = db.connect().await?;
    let result = conn.execute(PING, &[]).await;
    close_quietly(conn).await;
    result?;
    Ok(())
}
