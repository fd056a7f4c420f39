//! Rollbacks
//!
//! Units issue statements that parse but always fail, so every one of them
//! ends in a rollback. Statements run against a temporary table private to
//! each session; sessions are kept between units and reused.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::future::join_all;
use metrics::counter;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RollbacksConfig;
use crate::db::{Connection, Database, DbError, DbErrorKind, SqlArg, close_quietly};
use crate::engine::{IntervalThrottle, WorkerPool, WorkloadRng, workload_rng};

use super::{Lifecycle, Phase, Workload, WorkloadError};

const RNG_STREAM: u64 = 4;

/// Session-private table the statements run against
const ROLLBACKS_TABLE: &str = "_noisia_rollbacks";

/// Why a statement fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blunder {
    TooManyValues,
    BadInteger,
    BadDate,
    CopyMissingFile,
    SyntaxError,
    UnknownColumn,
    UnknownRelation,
    UnknownFunction,
    UngroupedColumn,
    AggregateInGroupBy,
    OrderByOutOfRange,
    SubqueryManyRows,
    MissingFromEntry,
    NumericScale,
    CoalesceMismatch,
}

const BLUNDERS: [Blunder; 15] = [
    Blunder::TooManyValues,
    Blunder::BadInteger,
    Blunder::BadDate,
    Blunder::CopyMissingFile,
    Blunder::SyntaxError,
    Blunder::UnknownColumn,
    Blunder::UnknownRelation,
    Blunder::UnknownFunction,
    Blunder::UngroupedColumn,
    Blunder::AggregateInGroupBy,
    Blunder::OrderByOutOfRange,
    Blunder::SubqueryManyRows,
    Blunder::MissingFromEntry,
    Blunder::NumericScale,
    Blunder::CoalesceMismatch,
];

/// A statement that is syntactically plausible but always fails
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrStatement {
    blunder: Blunder,
    num1: i64,
    num2: i64,
    str1: String,
    str2: String,
}

fn aux_label<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!(
        "AUX-{}-{}-{}",
        rng.random_range(0..1000),
        rng.random_range(0..1000),
        rng.random_range(0..1000)
    )
}

impl ErrStatement {
    /// Number of distinct failing statements
    pub const CATALOG_SIZE: usize = BLUNDERS.len();

    pub fn draw<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self::nth(rng.random_range(0..Self::CATALOG_SIZE), rng)
    }

    /// Statement `index` of the catalog with random values
    pub fn nth<R: Rng + ?Sized>(index: usize, rng: &mut R) -> Self {
        Self {
            blunder: BLUNDERS[index % Self::CATALOG_SIZE],
            num1: rng.random_range(0..1000),
            num2: rng.random_range(0..10000),
            str1: aux_label(rng),
            str2: aux_label(rng),
        }
    }

    /// SQL text and arguments, aimed at `table`
    pub fn render(&self, table: &str) -> (String, Vec<SqlArg>) {
        let (num1, num2) = (SqlArg::Int(self.num1), SqlArg::Int(self.num2));
        let (str1, str2) = (SqlArg::from(self.str1.as_str()), SqlArg::from(self.str2.as_str()));
        let since = SqlArg::Int(self.num1 * 999_999);

        match self.blunder {
            Blunder::TooManyValues => (
                format!("INSERT INTO {} (entity_id, name, size_b) VALUES ($1, $2, $3, $4)", table),
                vec![num1, str1, num2, SqlArg::from("now")],
            ),
            Blunder::BadInteger => (
                format!("INSERT INTO {} (entity_id, name, size_b) VALUES ($1, $2, $3)", table),
                vec![num1, str1, str2],
            ),
            Blunder::BadDate => (
                format!(
                    "INSERT INTO {} (entity_id, name, size_b, created_at) VALUES ($1, $2, $3, $4)",
                    table
                ),
                vec![num1, str1, num2, SqlArg::from("30/02/2021")],
            ),
            Blunder::CopyMissingFile => (
                format!("COPY {} FROM '/mnt/vol9/raw/data/{}/noisia.in.csv'", table, self.num1),
                vec![],
            ),
            Blunder::SyntaxError => (
                format!(
                    "INSERT SELECT entity_id, name, size_b, created_at FROM {} WHERE entity_id = $1",
                    table
                ),
                vec![num1],
            ),
            Blunder::UnknownColumn => (
                format!("SELECT id, name, size_b, created_at FROM {} WHERE id = $1", table),
                vec![num1],
            ),
            Blunder::UnknownRelation => (
                format!(
                    "SELECT entity_id, name, size_b, created_at FROM {}_1 WHERE entity_id = $1",
                    table
                ),
                vec![num1],
            ),
            Blunder::UnknownFunction => (
                format!(
                    "SELECT string_agg(name, 10) FROM {} WHERE entity_id >= $1 AND entity_id < $2",
                    table
                ),
                vec![num1, num2],
            ),
            Blunder::UngroupedColumn => (
                format!(
                    "SELECT name, created_at::date, count(size_b) FROM {} \
                     WHERE created_at > to_timestamp($1) GROUP BY name ORDER BY 3 DESC",
                    table
                ),
                vec![since],
            ),
            Blunder::AggregateInGroupBy => (
                format!(
                    "SELECT name, created_at::date, count(size_b) FROM {} \
                     WHERE created_at > to_timestamp($1) GROUP BY 1, 2, 3 ORDER BY 3 DESC",
                    table
                ),
                vec![since],
            ),
            Blunder::OrderByOutOfRange => (
                format!(
                    "SELECT name, created_at::date, count(size_b) FROM {} \
                     WHERE created_at > to_timestamp($1) GROUP BY 1, 2 ORDER BY 4 DESC",
                    table
                ),
                vec![since],
            ),
            Blunder::SubqueryManyRows => (
                "SELECT relname, reltuples FROM pg_class WHERE relname = \
                 (SELECT relname FROM pg_stat_sys_indexes WHERE relname = 'pg_constraint')"
                    .to_string(),
                vec![],
            ),
            Blunder::MissingFromEntry => (
                format!(
                    "SELECT st.entity_id, s.name, s.size_b, s.created_at FROM {} s WHERE entity_id = $1",
                    table
                ),
                vec![num1],
            ),
            Blunder::NumericScale => (
                format!(
                    "SELECT entity_id, name, (size_b / 8192)::numeric(1, 2) AS size_t, created_at \
                     FROM {} WHERE entity_id = $1",
                    table
                ),
                vec![num1],
            ),
            Blunder::CoalesceMismatch => (
                format!(
                    "SELECT entity_id, name, size_b, coalesce(created_at, 0) FROM {} WHERE entity_id = $1",
                    table
                ),
                vec![num1],
            ),
        }
    }
}

/// Idle sessions waiting for the next statement
#[derive(Default)]
struct SessionStash {
    idle: Mutex<Vec<Box<dyn Connection>>>,
}

impl SessionStash {
    fn take(&self) -> Option<Box<dyn Connection>> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn give_back(&self, conn: Box<dyn Connection>) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }

    fn drain(&self) -> Vec<Box<dyn Connection>> {
        std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Session with its private table created
async fn open_session(db: &dyn Database) -> Result<Box<dyn Connection>, WorkloadError> {
    let mut conn = db.connect().await.map_err(WorkloadError::Connect)?;
    let sql = format!(
        "CREATE TEMP TABLE IF NOT EXISTS {} (entity_id INT, name TEXT, size_b BIGINT, created_at TIMESTAMPTZ)",
        ROLLBACKS_TABLE
    );
    if let Err(e) = conn.execute(&sql, &[]).await {
        close_quietly(conn).await;
        return Err(WorkloadError::Prepare(e));
    }
    Ok(conn)
}

#[derive(Default)]
struct Tally {
    rollbacks: AtomicU64,
    commits: AtomicU64,
}

pub struct Rollbacks {
    config: RollbacksConfig,
    db: Arc<dyn Database>,
    seed: Option<u64>,
    tally: Arc<Tally>,
}

impl Rollbacks {
    pub fn new(config: RollbacksConfig, db: Arc<dyn Database>, seed: Option<u64>) -> Self {
        Self {
            config,
            db,
            seed,
            tally: Arc::new(Tally::default()),
        }
    }

    /// Statements that failed, as designed
    pub fn rollbacks(&self) -> u64 {
        self.tally.rollbacks.load(Ordering::Relaxed)
    }

    /// Statements that unexpectedly succeeded
    pub fn commits(&self) -> u64 {
        self.tally.commits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Workload for Rollbacks {
    fn name(&self) -> &'static str {
        "rollbacks"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);

        let stash = Arc::new(SessionStash::default());
        stash.give_back(open_session(self.db.as_ref()).await?);

        let pool = WorkerPool::new(self.name(), self.config.jobs);
        let mut rng = workload_rng(self.seed, RNG_STREAM);
        let mut throttle = IntervalThrottle::for_rates(
            self.config.min_rate,
            self.config.max_rate,
            WorkloadRng::from_rng(&mut rng),
        );

        let report = lifecycle
            .drive(
                &cancel,
                pool.run_paced(&cancel, &mut throttle, |_| {
                    let statement = ErrStatement::draw(&mut rng);
                    issue(self.db.clone(), stash.clone(), self.tally.clone(), statement)
                }),
            )
            .await;

        join_all(stash.drain().into_iter().map(close_quietly)).await;
        lifecycle.enter(Phase::CleanedUp);
        info!(
            "rollbacks finished: {} rollbacks, {} commits, {} units failed",
            self.rollbacks(),
            self.commits(),
            report.failed
        );
        Ok(())
    }
}

async fn issue(
    db: Arc<dyn Database>,
    stash: Arc<SessionStash>,
    tally: Arc<Tally>,
    statement: ErrStatement,
) -> Result<(), WorkloadError> {
    let mut conn = match stash.take() {
        Some(conn) => conn,
        None => open_session(db.as_ref()).await?,
    };

    let (sql, args) = statement.render(ROLLBACKS_TABLE);
    match conn.execute(&sql, &args).await {
        Ok(_) => {
            tally.commits.fetch_add(1, Ordering::Relaxed);
            debug!("rollbacks: statement unexpectedly succeeded: {}", sql);
        }
        Err(e) if session_lost(&e) => {
            tally.rollbacks.fetch_add(1, Ordering::Relaxed);
            counter!("noisia_rollbacks_total").increment(1);
            debug!("rollbacks: session lost: {}", e);
            close_quietly(conn).await;
            return Ok(());
        }
        Err(e) => {
            tally.rollbacks.fetch_add(1, Ordering::Relaxed);
            counter!("noisia_rollbacks_total").increment(1);
            debug!("rollbacks: {}", e);
        }
    }

    stash.give_back(conn);
    Ok(())
}

fn session_lost(e: &DbError) -> bool {
    e.kind() == DbErrorKind::Connection || e.kind() == DbErrorKind::AdminShutdown
}
