//! Deadlock orchestration
//!
//! Two sessions insert a pair of rows, then update them in opposite order
//! inside concurrent transactions. The pause after the first update makes
//! sure both sides hold their first lock before requesting the second, so the
//! server's deadlock detector has to pick a victim.

use std::time::Duration;

use metrics::{counter, histogram};
use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::db::{
    Connection, Database, DbError, SqlArg, Transaction, close_quietly, rollback_quietly,
};

use super::fixture::DEADLOCKS_TABLE;

/// Pause between the first and the second update of each transaction
pub const DEADLOCK_PAUSE: Duration = Duration::from_millis(10);

/// Row ids used by one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlockPair {
    first: i64,
    second: i64,
}

impl DeadlockPair {
    /// `None` when both ids are equal
    pub fn new(first: i64, second: i64) -> Option<Self> {
        (first != second).then_some(Self { first, second })
    }

    /// Draw two distinct positive ids
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let first = rng.random_range(1..i64::MAX);
        loop {
            let second = rng.random_range(1..i64::MAX);
            if second != first {
                return Self { first, second };
            }
        }
    }

    pub fn first(&self) -> i64 {
        self.first
    }

    pub fn second(&self) -> i64 {
        self.second
    }
}

/// Results of the two transactions of one attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadlockOutcome {
    pub committed: u32,
    pub deadlocked: u32,
    pub unexpected: u32,
}

impl DeadlockOutcome {
    /// One side committed, the other was chosen as deadlock victim
    pub fn is_deadlock(&self) -> bool {
        self.committed == 1 && self.deadlocked == 1
    }
}

/// Run one deadlock attempt on two dedicated connections
///
/// Either side may be the victim. Both connections are closed before
/// returning, whatever happened.
pub async fn produce_deadlock(db: &dyn Database, pair: DeadlockPair) -> Result<DeadlockOutcome, DbError> {
    let started = Instant::now();

    let mut left = db.connect().await?;
    let mut right = match db.connect().await {
        Ok(conn) => conn,
        Err(e) => {
            close_quietly(left).await;
            return Err(e);
        }
    };

    let result = run_attempt(left.as_mut(), right.as_mut(), pair).await;

    close_quietly(left).await;
    close_quietly(right).await;

    histogram!("noisia_deadlock_attempt_duration_seconds").record(started.elapsed());
    if let Ok(outcome) = &result {
        counter!("noisia_deadlocks_total").increment(u64::from(outcome.deadlocked));
    }
    result
}

async fn run_attempt(
    left: &mut dyn Connection,
    right: &mut dyn Connection,
    pair: DeadlockPair,
) -> Result<DeadlockOutcome, DbError> {
    let insert = format!(
        "INSERT INTO {} (id, payload) VALUES ($1, md5(random()::text)), ($2, md5(random()::text))",
        DEADLOCKS_TABLE
    );
    left.execute(&insert, &[SqlArg::Int(pair.first), SqlArg::Int(pair.second)])
        .await?;

    let (left_result, right_result) = tokio::join!(
        cross_update(left, pair.first, pair.second),
        cross_update(right, pair.second, pair.first),
    );

    let mut outcome = DeadlockOutcome::default();
    for result in [left_result, right_result] {
        match result {
            Ok(()) => outcome.committed += 1,
            Err(e) if e.kind().is_lock_conflict() => {
                debug!("deadlock victim: {}", e);
                outcome.deadlocked += 1;
            }
            Err(e) => {
                warn!("deadlock transaction failed unexpectedly: {}", e);
                outcome.unexpected += 1;
            }
        }
    }
    Ok(outcome)
}

async fn cross_update(conn: &mut dyn Connection, first: i64, second: i64) -> Result<(), DbError> {
    let mut tx = conn.begin().await?;
    match update_in_order(tx.as_mut(), first, second).await {
        Ok(()) => tx.commit().await,
        Err(e) => {
            rollback_quietly(tx).await;
            Err(e)
        }
    }
}

async fn update_in_order(tx: &mut dyn Transaction, first: i64, second: i64) -> Result<(), DbError> {
    let update = format!(
        "UPDATE {} SET payload = md5(random()::text) WHERE id = $1",
        DEADLOCKS_TABLE
    );
    tx.execute(&update, &[SqlArg::Int(first)]).await?;
    sleep(DEADLOCK_PAUSE).await;
    tx.execute(&update, &[SqlArg::Int(second)]).await?;
    Ok(())
}
