//! Workload drivers
//!
//! Each driver composes the engine primitives with one SQL recipe:
//! - `IdleXacts`: transactions idling with a live snapshot
//! - `WaitXacts`: exclusive table locks held for a while
//! - `Deadlocks`: cross-ordered transaction pairs
//! - `Rollbacks`: statements that always fail
//! - `TempFiles`: queries spilling to disk
//! - `Terminate`: signalling other backends
//! - `FailConns`: connection slot exhaustion
//! - `ForkConns`: connect/disconnect churn

mod deadlocks;
mod fail_conns;
mod fork_conns;
mod idle_xacts;
mod rollbacks;
mod temp_files;
mod terminate;
mod wait_xacts;

pub use deadlocks::Deadlocks;
pub use fail_conns::FailConns;
pub use fork_conns::ForkConns;
pub use idle_xacts::IdleXacts;
pub use rollbacks::{ErrStatement, Rollbacks};
pub use temp_files::TempFiles;
pub use terminate::{Terminate, build_signal_query};
pub use wait_xacts::WaitXacts;

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::{Database, DbError, close_quietly};
use crate::engine::{MAX_TARGETS, TargetTable, WorkloadRng, select_targets};

/// Errors returned by a driver or one of its units
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("connect failed: {0}")]
    Connect(#[source] DbError),

    #[error("prepare failed: {0}")]
    Prepare(#[source] DbError),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl WorkloadError {
    /// Raised before the driver started admitting units
    pub fn is_setup(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Prepare(_))
    }
}

/// A harmful workload run until cancelled
#[async_trait]
pub trait Workload: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare, run until `cancel` fires, drain and clean up
    ///
    /// Only setup failures are returned; unit failures are logged and absorbed.
    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError>;
}

/// Driver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Running,
    Draining,
    CleanedUp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Running => "running",
            Phase::Draining => "draining",
            Phase::CleanedUp => "cleaned up",
        };
        f.write_str(name)
    }
}

/// Phase tracker of one driver run
pub(crate) struct Lifecycle {
    workload: &'static str,
    phase: Phase,
}

impl Lifecycle {
    pub(crate) fn new(workload: &'static str) -> Self {
        Self {
            workload,
            phase: Phase::Idle,
        }
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn enter(&mut self, next: Phase) {
        debug!("{}: {} -> {}", self.workload, self.phase, next);
        self.phase = next;
    }

    /// Run `body` in the running phase, switching to draining once `cancel` fires
    pub(crate) async fn drive<F: Future>(&mut self, cancel: &CancellationToken, body: F) -> F::Output {
        self.enter(Phase::Running);
        tokio::pin!(body);
        tokio::select! {
            output = &mut body => return output,
            _ = cancel.cancelled() => {}
        }
        self.enter(Phase::Draining);
        body.await
    }
}

/// Look up the busiest tables once at startup
pub(crate) async fn discover_targets(db: &dyn Database) -> Result<Vec<TargetTable>, WorkloadError> {
    let mut conn = db.connect().await.map_err(WorkloadError::Connect)?;
    let targets = select_targets(conn.as_mut(), MAX_TARGETS)
        .await
        .map_err(WorkloadError::Prepare);
    close_quietly(conn).await;
    targets
}

/// Random target for one unit, `None` when there is nothing to aim at
pub(crate) fn pick_target(rng: &mut WorkloadRng, targets: &[TargetTable]) -> Option<TargetTable> {
    targets.choose(rng).cloned()
}
