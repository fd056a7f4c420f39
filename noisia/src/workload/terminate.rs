//! Terminate backends
//!
//! Signals one random backend `rate` times per `interval`: terminates it, or
//! in soft mode only cancels its running query. The driver's own backend is
//! never picked. Optional regular expressions narrow the candidates.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TerminateConfig;
use crate::db::{Database, SqlArg, close_quietly};
use crate::engine::{IntervalThrottle, WorkerPool};

use super::{Lifecycle, Phase, Workload, WorkloadError};

/// Build the signalling query and its bound filter arguments
pub fn build_signal_query(config: &TerminateConfig) -> (String, Vec<SqlArg>) {
    let signal = if config.soft_mode {
        "pg_cancel_backend(pid)"
    } else {
        "pg_terminate_backend(pid)"
    };

    let mut sql = format!(
        "SELECT {}::text FROM pg_stat_activity WHERE pid <> pg_backend_pid() ",
        signal
    );
    if config.ignore_system {
        sql.push_str("AND backend_type = 'client backend' ");
    }

    let mut args = Vec::new();
    let filters = [
        ("client_addr::text", &config.client_addr),
        ("usename", &config.user),
        ("datname", &config.database),
        ("application_name", &config.application_name),
    ];
    for (column, pattern) in filters {
        if let Some(pattern) = pattern {
            args.push(SqlArg::from(pattern.as_str()));
            sql.push_str(&format!("AND {} ~ ${} ", column, args.len()));
        }
    }

    sql.push_str("ORDER BY random() LIMIT 1");
    (sql, args)
}

pub struct Terminate {
    config: TerminateConfig,
    db: Arc<dyn Database>,
    signalled: Arc<AtomicU64>,
}

impl Terminate {
    pub fn new(config: TerminateConfig, db: Arc<dyn Database>) -> Self {
        Self {
            config,
            db,
            signalled: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Backends the server reported as signalled
    pub fn signalled(&self) -> u64 {
        self.signalled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Workload for Terminate {
    fn name(&self) -> &'static str {
        "terminate"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);
        let conn = self.db.connect().await.map_err(WorkloadError::Connect)?;
        close_quietly(conn).await;

        let (sql, args) = build_signal_query(&self.config);
        let statement = Arc::new((sql, args));
        debug!("terminate: {}", statement.0);

        let pool = WorkerPool::new(self.name(), 1);
        let mut throttle = IntervalThrottle::fixed(self.config.naptime());

        let report = lifecycle
            .drive(
                &cancel,
                pool.run_paced(&cancel, &mut throttle, |_| {
                    signal_one(self.db.clone(), statement.clone(), self.signalled.clone())
                }),
            )
            .await;

        lifecycle.enter(Phase::CleanedUp);
        info!(
            "terminate finished: {} backends signalled, {} attempts failed",
            self.signalled(),
            report.failed
        );
        Ok(())
    }
}

async fn signal_one(
    db: Arc<dyn Database>,
    statement: Arc<(String, Vec<SqlArg>)>,
    signalled: Arc<AtomicU64>,
) -> Result<(), WorkloadError> {
    let (sql, args) = statement.as_ref();
    let mut conn = db.connect().await?;
    let rows = conn.query(sql, args).await;
    close_quietly(conn).await;

    match rows {
        Ok(rows) => {
            let hits = rows.iter().filter(|row| row.get(0) == Some("true")).count() as u64;
            if hits == 0 {
                debug!("terminate: no backend matched");
            }
            signalled.fetch_add(hits, Ordering::Relaxed);
            counter!("noisia_backends_signalled_total").increment(hits);
            Ok(())
        }
        // Another terminate run may pick this very session
        Err(e) if e.kind().is_session_signal() => {
            debug!("terminate: own session signalled: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
