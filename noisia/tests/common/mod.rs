//! Common Test Utilities for Integration Tests
//!
//! Integration tests run against a live PostgreSQL named by
//! `NOISIA_TEST_CONNINFO`. They are `#[ignore]`d by default; run them with
//! `cargo test -- --ignored` once the variable points at a disposable database.

use std::sync::Arc;
use std::time::Duration;

use noisia::db::{Database, PostgresDatabase, close_quietly};
use noisia::{Workload, WorkloadError};
use tokio_util::sync::CancellationToken;

pub const CONNINFO_VAR: &str = "NOISIA_TEST_CONNINFO";

/// Client for the test database
///
/// Panics with a hint when the variable is missing, so a forgotten setup
/// does not pass silently.
pub fn live_database() -> Arc<PostgresDatabase> {
    let conninfo = std::env::var(CONNINFO_VAR)
        .unwrap_or_else(|_| panic!("{} must point at a test database", CONNINFO_VAR));
    Arc::new(PostgresDatabase::new(&conninfo).expect("valid connection URL"))
}

/// Run a workload for `duration`, then cancel it and wait for it to drain
pub async fn run_for(workload: &dyn Workload, duration: Duration) -> Result<(), WorkloadError> {
    let cancel = CancellationToken::new();
    let deadline = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        deadline.cancel();
    });
    workload.run(cancel).await
}

/// Whether a table named `name` exists in any schema
pub async fn table_exists(db: &dyn Database, name: &str) -> bool {
    let mut conn = db.connect().await.expect("connect");
    let rows = conn
        .query(
            "SELECT count(*)::text FROM pg_class WHERE relname = $1 AND relkind = 'r'",
            &[name.into()],
        )
        .await
        .expect("catalog query");
    close_quietly(conn).await;
    rows.first().and_then(|r| r.get(0)) == Some("1")
}

/// Run a statement on a fresh connection
pub async fn execute(db: &dyn Database, sql: &str) {
    let mut conn = db.connect().await.expect("connect");
    conn.execute(sql, &[]).await.expect(sql);
    close_quietly(conn).await;
}
