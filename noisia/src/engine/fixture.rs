//! Fixture tables
//!
//! Some workloads need a table of their own. Creation is idempotent and safe
//! to race; removal is best effort and never fails the caller.

use tracing::{debug, warn};

use crate::db::{Connection, Database, DbError, DbErrorKind, SqlArg, close_quietly, rollback_quietly};

use super::targeting::TargetTable;

pub const DEADLOCKS_TABLE: &str = "_noisia_deadlocks_workload";
pub const WAIT_XACTS_TABLE: &str = "_noisia_waitxacts_workload";
pub const TEMP_FILES_TABLE: &str = "_noisia_tempfiles_workload";

const TEMP_FILES_COLUMNS: [&str; 26] = [
    "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m", "n", "o", "p", "q", "r", "s",
    "t", "u", "v", "w", "x", "y", "z",
];

/// Rows per unit of the temp files scale factor
pub const TEMP_FILES_ROWS_PER_SCALE: i64 = 1000;

/// A table owned by one workload
#[derive(Debug, Clone)]
pub struct Fixture {
    table: &'static str,
    create: String,
    seed: Option<(String, Vec<SqlArg>)>,
}

impl Fixture {
    /// Rows updated in crossed order by the deadlocks workload
    pub fn deadlocks() -> Self {
        Self {
            table: DEADLOCKS_TABLE,
            create: format!(
                "CREATE TABLE IF NOT EXISTS {} (id bigint, payload text)",
                DEADLOCKS_TABLE
            ),
            seed: None,
        }
    }

    /// Single-row table locked and probed by the waiting transactions workload
    pub fn wait_xacts() -> Self {
        Self {
            table: WAIT_XACTS_TABLE,
            create: format!(
                "CREATE TABLE IF NOT EXISTS {} (payload bigint)",
                WAIT_XACTS_TABLE
            ),
            seed: Some((
                format!(
                    "INSERT INTO {t} (payload) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM {t})",
                    t = WAIT_XACTS_TABLE
                ),
                Vec::new(),
            )),
        }
    }

    /// Wide table of random text sorted by the temp files workload
    pub fn temp_files(scale_factor: u32) -> Self {
        let columns = TEMP_FILES_COLUMNS.join(", ");
        let definitions = TEMP_FILES_COLUMNS
            .iter()
            .map(|c| format!("{} text", c))
            .collect::<Vec<_>>()
            .join(", ");
        let values = vec!["random()::text"; TEMP_FILES_COLUMNS.len()].join(", ");
        let rows = TEMP_FILES_ROWS_PER_SCALE * i64::from(scale_factor);

        Self {
            table: TEMP_FILES_TABLE,
            create: format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                TEMP_FILES_TABLE, definitions
            ),
            seed: Some((
                format!(
                    "INSERT INTO {t} ({columns}) SELECT {values} FROM generate_series(1, $1) \
                     WHERE NOT EXISTS (SELECT 1 FROM {t})",
                    t = TEMP_FILES_TABLE
                ),
                vec![SqlArg::Int(rows)],
            )),
        }
    }

    /// Every fixture noisia may leave behind
    pub fn all() -> Vec<Self> {
        vec![Self::deadlocks(), Self::wait_xacts(), Self::temp_files(0)]
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Create and seed the table inside one transaction
    ///
    /// Losing a creation race to a concurrent prepare counts as success.
    pub async fn prepare(&self, db: &dyn Database) -> Result<TargetTable, DbError> {
        let mut conn = db.connect().await?;
        let result = self.create_and_seed(conn.as_mut()).await;
        close_quietly(conn).await;

        match result {
            Ok(()) => {
                debug!("fixture {} ready", self.table);
                Ok(TargetTable::fixture(self.table))
            }
            Err(e) if e.kind() == DbErrorKind::DuplicateObject => {
                debug!("fixture {} created concurrently: {}", self.table, e);
                Ok(TargetTable::fixture(self.table))
            }
            Err(e) => Err(e),
        }
    }

    async fn create_and_seed(&self, conn: &mut dyn Connection) -> Result<(), DbError> {
        let mut tx = conn.begin().await?;
        let mut result = tx.execute(&self.create, &[]).await.map(|_| ());
        if result.is_ok()
            && let Some((sql, args)) = &self.seed
        {
            result = tx.execute(sql, args).await.map(|_| ());
        }
        match result {
            Ok(()) => tx.commit().await,
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    /// Drop the table; failures are logged, never returned
    pub async fn cleanup(&self, db: &dyn Database) {
        let sql = format!("DROP TABLE IF EXISTS {}", self.table);
        let mut conn = match db.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("cleanup of {} failed to connect: {}", self.table, e);
                return;
            }
        };
        match conn.execute(&sql, &[]).await {
            Ok(_) => debug!("fixture {} dropped", self.table),
            Err(e) => warn!("cleanup of {} failed: {}", self.table, e),
        }
        close_quietly(conn).await;
    }
}
