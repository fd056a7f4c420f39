//! Temporary files
//!
//! Units shrink `work_mem` to its minimum and run a query whose sort spills
//! to disk. Queries are admitted at a fixed rate and may overlap up to the
//! job limit, since a spilling sort easily outlives the admission interval.
//! A sort still running when the run is cancelled is cancelled on the server
//! before its session is closed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TempFilesConfig;
use crate::db::{Connection, Database, DbError, close_quietly};
use crate::engine::fixture::TEMP_FILES_TABLE;
use crate::engine::{Backend, Fixture, IntervalThrottle, WorkerPool, interval_for_rate};

use super::{Lifecycle, Phase, Workload, WorkloadError};

const SHRINK_WORK_MEM: &str = "SET work_mem TO '64kB'";

/// Spills even on an empty cluster
const CATALOG_SORT: &str = "SELECT * FROM pg_class a, pg_class b ORDER BY random()";

const TEMP_BYTES: &str = "SELECT pg_stat_get_db_temp_bytes(oid)::text FROM pg_database \
                          WHERE datname = current_database()";

/// Sort of the fixture table, grouped and ordered on every column
fn fixture_sort() -> String {
    let columns: Vec<String> = ('a'..='z').map(String::from).collect();
    let reversed: Vec<String> = columns.iter().rev().cloned().collect();
    format!(
        "SELECT {cols} FROM {t} GROUP BY {rev} ORDER BY {cols} DESC",
        cols = columns.join(","),
        rev = reversed.join(","),
        t = TEMP_FILES_TABLE
    )
}

/// Temp bytes written so far in the current database
async fn read_temp_bytes(db: &dyn Database) -> Result<Option<i64>, WorkloadError> {
    let mut conn = db.connect().await.map_err(WorkloadError::Connect)?;
    let rows = conn.query(TEMP_BYTES, &[]).await;
    close_quietly(conn).await;

    match rows {
        Ok(rows) => Ok(rows
            .first()
            .and_then(|row| row.get(0))
            .and_then(|v| v.parse().ok())),
        Err(e) => {
            warn!("temp files: reading temp bytes failed: {}", e);
            Ok(None)
        }
    }
}

pub struct TempFiles {
    config: TempFilesConfig,
    db: Arc<dyn Database>,
}

impl TempFiles {
    pub fn new(config: TempFilesConfig, db: Arc<dyn Database>) -> Self {
        Self { config, db }
    }
}

#[async_trait]
impl Workload for TempFiles {
    fn name(&self) -> &'static str {
        "temp_files"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);

        let before = read_temp_bytes(self.db.as_ref()).await?;
        let fixture = (self.config.scale_factor > 0).then(|| Fixture::temp_files(self.config.scale_factor));
        if let Some(fixture) = &fixture
            && let Err(e) = fixture.prepare(self.db.as_ref()).await
        {
            fixture.cleanup(self.db.as_ref()).await;
            return Err(WorkloadError::Prepare(e));
        }
        let query: Arc<str> = match &fixture {
            Some(_) => fixture_sort().into(),
            None => CATALOG_SORT.into(),
        };

        let pool = WorkerPool::new(self.name(), self.config.jobs);
        let mut throttle = IntervalThrottle::fixed(interval_for_rate(self.config.rate));

        let report = lifecycle
            .drive(
                &cancel,
                pool.run_paced(&cancel, &mut throttle, |_| {
                    spill(self.db.clone(), query.clone(), cancel.clone())
                }),
            )
            .await;

        if let Some(fixture) = &fixture {
            fixture.cleanup(self.db.as_ref()).await;
        }
        lifecycle.enter(Phase::CleanedUp);

        info!(
            "temp files finished: {} queries, {} failed",
            report.admitted, report.failed
        );
        let after = read_temp_bytes(self.db.as_ref()).await.ok().flatten();
        if let (Some(before), Some(after)) = (before, after) {
            info!(
                "temp files: {} temp bytes written (includes concurrent activity)",
                after.saturating_sub(before)
            );
        }
        Ok(())
    }
}

async fn spill(db: Arc<dyn Database>, query: Arc<str>, cancel: CancellationToken) -> Result<(), WorkloadError> {
    let mut conn = db.connect().await?;
    let result = sort_with_small_work_mem(db.as_ref(), conn.as_mut(), &query, &cancel).await;
    close_quietly(conn).await;
    result.map_err(Into::into)
}

async fn sort_with_small_work_mem(
    db: &dyn Database,
    conn: &mut dyn Connection,
    query: &str,
    cancel: &CancellationToken,
) -> Result<(), DbError> {
    let backend = Backend::of(conn).await?;
    conn.execute(SHRINK_WORK_MEM, &[]).await?;
    if backend
        .interruptible(db, cancel, conn.execute(query, &[]))
        .await?
        .is_none()
    {
        debug!("temp files: sort cancelled on backend {}", backend.pid());
    }
    Ok(())
}
