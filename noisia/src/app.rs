//! Run coordinator
//!
//! Builds the enabled workloads, runs them side by side until the run
//! duration elapses or shutdown is requested, and reports which of them
//! failed to start.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::{Id, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::db::Database;
use crate::engine::Fixture;
use crate::workload::{
    Deadlocks, FailConns, ForkConns, IdleXacts, Rollbacks, TempFiles, Terminate, WaitXacts,
    Workload,
};

/// Errors that end a run
#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("no workload enabled")]
    NothingToRun,

    #[error("workloads failed: {}", .0.join(", "))]
    SetupFailed(Vec<&'static str>),
}

/// One driver per enabled workload, in a fixed order
pub fn build_workloads(config: &Config, db: Arc<dyn Database>) -> Vec<Box<dyn Workload>> {
    let mut workloads: Vec<Box<dyn Workload>> = Vec::new();
    let seed = config.seed;

    if let Some(c) = &config.idle_xacts {
        workloads.push(Box::new(IdleXacts::new(c.clone(), db.clone(), seed)));
    }
    if let Some(c) = &config.wait_xacts {
        workloads.push(Box::new(WaitXacts::new(c.clone(), db.clone(), seed)));
    }
    if let Some(c) = &config.deadlocks {
        workloads.push(Box::new(Deadlocks::new(c.clone(), db.clone(), seed)));
    }
    if let Some(c) = &config.rollbacks {
        workloads.push(Box::new(Rollbacks::new(c.clone(), db.clone(), seed)));
    }
    if let Some(c) = &config.temp_files {
        workloads.push(Box::new(TempFiles::new(c.clone(), db.clone())));
    }
    if let Some(c) = &config.terminate {
        workloads.push(Box::new(Terminate::new(c.clone(), db.clone())));
    }
    if let Some(c) = &config.fail_conns {
        workloads.push(Box::new(FailConns::new(c.clone(), db.clone())));
    }
    if let Some(c) = &config.fork_conns {
        workloads.push(Box::new(ForkConns::new(c.clone(), db)));
    }

    workloads
}

/// Run every enabled workload until the duration elapses or `shutdown` fires
///
/// A workload that fails to start does not stop the others; its name is
/// reported once all of them have finished.
pub async fn run(config: &Config, db: Arc<dyn Database>, shutdown: CancellationToken) -> Result<(), AppError> {
    config.validate()?;
    if !config.any_workload() {
        return Err(AppError::NothingToRun);
    }
    let workloads = build_workloads(config, db);

    let cancel = shutdown.child_token();
    let deadline = cancel.clone();
    let duration = config.duration;
    let timer = tokio::spawn(async move {
        tokio::select! {
            _ = sleep(duration) => {
                info!("run duration of {:?} elapsed, stopping", duration);
                deadline.cancel();
            }
            _ = deadline.cancelled() => {}
        }
    });

    let mut drivers = JoinSet::new();
    let mut names = HashMap::new();
    for workload in workloads {
        let name = workload.name();
        let cancel = cancel.clone();
        info!("starting {}", name);
        let handle = drivers.spawn(async move { workload.run(cancel).await });
        names.insert(handle.id(), name);
    }

    let name_of = |id: Id| names.get(&id).copied().unwrap_or("unknown");
    let mut failed = Vec::new();
    while let Some(joined) = drivers.join_next_with_id().await {
        match joined {
            Ok((id, Ok(()))) => info!("{} finished", name_of(id)),
            Ok((id, Err(e))) => {
                if e.is_setup() {
                    error!("{} failed to start: {}", name_of(id), e);
                } else {
                    error!("{} failed: {}", name_of(id), e);
                }
                failed.push(name_of(id));
            }
            Err(e) => {
                error!("{} panicked: {}", name_of(e.id()), e);
                failed.push(name_of(e.id()));
            }
        }
    }

    cancel.cancel();
    timer.await.ok();

    if failed.is_empty() {
        Ok(())
    } else {
        failed.sort_unstable();
        Err(AppError::SetupFailed(failed))
    }
}

/// Drop every fixture table a previous run may have left behind
pub async fn cleanup(db: &dyn Database) {
    for fixture in Fixture::all() {
        fixture.cleanup(db).await;
    }
    info!("fixture tables dropped");
}
