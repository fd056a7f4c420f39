//! Target table selection
//!
//! Workloads that lock or read user tables aim at the tables with the most
//! write activity, so the disturbance lands where it hurts.

use std::fmt;

use tracing::debug;

use crate::db::{Connection, DbError, SqlArg};

/// Upper bound on the number of tables a driver aims at
pub const MAX_TARGETS: usize = 3;

const SELECT_TARGETS: &str = "SELECT quote_ident(schemaname) || '.' || quote_ident(relname), \
     (n_tup_upd + n_tup_del)::text \
     FROM pg_stat_user_tables \
     WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
     AND schemaname !~ '^pg_toast' \
     AND n_tup_upd + n_tup_del > 0 \
     ORDER BY n_tup_upd + n_tup_del DESC \
     LIMIT $1";

/// Table a workload operates on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    name: String,
    fixture: bool,
}

impl TargetTable {
    /// An existing user table, already quoted and schema-qualified
    pub fn live(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixture: false,
        }
    }

    /// A table created and owned by noisia
    pub fn fixture(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fixture: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_fixture(&self) -> bool {
        self.fixture
    }
}

impl fmt::Display for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Pick up to `n` tables ordered by `n_tup_upd + n_tup_del`, busiest first
///
/// No qualifying table yields an empty list, which callers treat as fixture
/// mode.
pub async fn select_targets(conn: &mut dyn Connection, n: usize) -> Result<Vec<TargetTable>, DbError> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let limit = i64::try_from(n).unwrap_or(i64::MAX);
    let rows = conn.query(SELECT_TARGETS, &[SqlArg::Int(limit)]).await?;

    let mut scored: Vec<(i64, TargetTable)> = rows
        .iter()
        .filter_map(|row| {
            let name = row.get(0)?;
            let score = row.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            Some((score, TargetTable::live(name)))
        })
        .collect();

    // Stable: ties keep the server's order
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(n);

    debug!(
        "selected targets: {:?}",
        scored.iter().map(|(_, t)| t.name()).collect::<Vec<_>>()
    );

    Ok(scored.into_iter().map(|(_, t)| t).collect())
}
