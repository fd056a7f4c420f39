//! Test Utilities Module
//!
//! Provides an in-memory database standing in for PostgreSQL in unit tests.
//! This module is only compiled when running tests.

#![cfg(test)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::db::{Connection, Database, DbError, DbErrorKind, Row, SqlArg, Transaction};
use crate::engine::interrupt::{BACKEND_PID, CANCEL_BACKEND};

// ============================================================================
// Mock Database
// ============================================================================

/// In-memory `Database` with a statement log, failure injection, canned
/// query results, a connection limit and a small lock manager
///
/// Lock semantics:
/// - `UPDATE ... WHERE id = $1` inside a transaction locks row `$1`
/// - `LOCK TABLE <name>` inside a transaction locks table `<name>`
/// - a `SELECT` (or `CREATE ... AS SELECT`) naming a table locked by another
///   session waits for it
/// - a lock request closing a waits-for cycle fails with SQLSTATE 40P01
/// - `pg_cancel_backend($1)` interrupts a running statement of session `$1`
///   with SQLSTATE 57014
///
/// Locks are released when the owning transaction ends or is dropped. Temp
/// tables belong to their session; `ON COMMIT DROP` ones end with the
/// transaction.
#[derive(Clone, Default)]
pub struct MockDatabase {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    inner: Mutex<Inner>,
    locks_changed: Notify,
    cancels: Notify,
    next_session: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    lock_waits: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    log: Vec<String>,
    failures: Vec<(String, String)>,
    responses: Vec<(String, Vec<Row>)>,
    delays: Vec<(String, Duration)>,
    connect_failure: Option<String>,
    connect_limit: Option<usize>,
    tables: BTreeSet<String>,
    locks: HashMap<LockKey, u64>,
    waiting: HashMap<u64, LockKey>,
    temp_tables: HashMap<u64, Vec<TempTable>>,
    running: HashSet<u64>,
    cancelled: HashSet<u64>,
}

struct TempTable {
    name: String,
    on_commit_drop: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockKey {
    Row(i64),
    Table(String),
}

impl Inner {
    /// Whether `session` waiting on a lock owned by `owner` closes a cycle
    fn closes_cycle(&self, session: u64, mut owner: u64) -> bool {
        for _ in 0..=self.waiting.len() {
            if owner == session {
                return true;
            }
            match self.waiting.get(&owner).and_then(|key| self.locks.get(key)) {
                Some(&next) => owner = next,
                None => return false,
            }
        }
        false
    }

    fn release(&mut self, session: u64) -> bool {
        let before = self.locks.len();
        self.locks.retain(|_, owner| *owner != session);
        self.waiting.remove(&session);
        before != self.locks.len()
    }

    /// Mark `pid` cancelled if it is running a statement
    fn cancel_backend(&mut self, pid: u64) -> bool {
        let running = self.running.contains(&pid);
        if running {
            self.cancelled.insert(pid);
        }
        running
    }

    fn blocking_table(&self, session: u64, sql: &str) -> Option<LockKey> {
        self.locks.iter().find_map(|(key, owner)| match key {
            LockKey::Table(name) if *owner != session && sql.contains(name.as_str()) => {
                Some(key.clone())
            }
            _ => None,
        })
    }
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.state.inner.lock().unwrap()
    }

    /// Statements containing `pattern` fail with `sqlstate`
    pub fn fail_when(&self, pattern: &str, sqlstate: &str) -> &Self {
        self.inner()
            .failures
            .push((pattern.to_string(), sqlstate.to_string()));
        self
    }

    /// Queries containing `pattern` return `rows`
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) -> &Self {
        self.inner().responses.push((pattern.to_string(), rows));
        self
    }

    /// Statements containing `pattern` take `delay` to run
    pub fn delay_when(&self, pattern: &str, delay: Duration) -> &Self {
        self.inner().delays.push((pattern.to_string(), delay));
        self
    }

    /// Every connection attempt fails with `sqlstate`
    pub fn refuse_connections(&self, sqlstate: &str) -> &Self {
        self.inner().connect_failure = Some(sqlstate.to_string());
        self
    }

    /// Connection attempts beyond `limit` open sessions fail with 53300
    pub fn connection_limit(&self, limit: usize) -> &Self {
        self.inner().connect_limit = Some(limit);
        self
    }

    pub fn create_table(&self, name: &str) -> &Self {
        self.inner().tables.insert(name.to_string());
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.inner().log.clone()
    }

    /// Number of logged statements containing `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.inner()
            .log
            .iter()
            .filter(|s| s.contains(pattern))
            .count()
    }

    pub fn tables(&self) -> BTreeSet<String> {
        self.inner().tables.clone()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.inner().tables.contains(name)
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Sessions ended through `close` rather than dropped
    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    pub fn peak_connections(&self) -> usize {
        self.state.peak_open.load(Ordering::SeqCst)
    }

    /// Number of times a session had to wait for a lock held by another
    pub fn lock_waits(&self) -> usize {
        self.state.lock_waits.load(Ordering::SeqCst)
    }

    pub fn held_locks(&self) -> usize {
        self.inner().locks.len()
    }

    fn release(&self, session: u64) {
        if self.inner().release(session) {
            self.state.locks_changed.notify_waiters();
        }
    }

    fn end_transaction(&self, session: u64) {
        if let Some(tables) = self.inner().temp_tables.get_mut(&session) {
            tables.retain(|t| !t.on_commit_drop);
        }
        self.release(session);
    }

    async fn cancel_requested(&self, session: u64) {
        loop {
            let notified = self.state.cancels.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner().cancelled.contains(&session) {
                return;
            }
            notified.await;
        }
    }

    async fn acquire(&self, session: u64, key: LockKey) -> Result<(), DbError> {
        let mut counted = false;
        loop {
            let notified = self.state.locks_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner();
                match inner.locks.get(&key).copied() {
                    None => {
                        inner.locks.insert(key, session);
                        inner.waiting.remove(&session);
                        return Ok(());
                    }
                    Some(owner) if owner == session => {
                        inner.waiting.remove(&session);
                        return Ok(());
                    }
                    Some(owner) => {
                        inner.waiting.insert(session, key.clone());
                        if inner.closes_cycle(session, owner) {
                            inner.waiting.remove(&session);
                            return Err(DbError::with_code("40P01", "deadlock detected"));
                        }
                    }
                }
            }
            if !counted {
                self.state.lock_waits.fetch_add(1, Ordering::SeqCst);
                counted = true;
            }
            notified.await;
        }
    }

    async fn wait_readable(&self, session: u64, sql: &str) {
        let mut counted = false;
        loop {
            let notified = self.state.locks_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner().blocking_table(session, sql).is_none() {
                return;
            }
            if !counted {
                self.state.lock_waits.fetch_add(1, Ordering::SeqCst);
                counted = true;
            }
            notified.await;
        }
    }

    async fn run(
        &self,
        session: u64,
        in_tx: bool,
        sql: &str,
        args: &[SqlArg],
    ) -> Result<Vec<Row>, DbError> {
        {
            let mut inner = self.inner();
            inner.log.push(sql.to_string());
            inner.running.insert(session);
        }
        let _running = Running { db: self, session };
        tokio::select! {
            biased;
            result = self.evaluate(session, in_tx, sql, args) => result,
            _ = self.cancel_requested(session) => Err(DbError::with_code(
                "57014",
                "canceling statement due to user request",
            )),
        }
    }

    async fn evaluate(
        &self,
        session: u64,
        in_tx: bool,
        sql: &str,
        args: &[SqlArg],
    ) -> Result<Vec<Row>, DbError> {
        let (failure, delay, rows) = {
            let inner = self.inner();
            let failure = inner
                .failures
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, code)| code.clone());
            let delay = inner
                .delays
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, delay)| *delay);
            let rows = inner
                .responses
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default();
            (failure, delay, rows)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = failure {
            return Err(DbError::with_code(code, format!("injected failure: {}", sql)));
        }

        if sql.starts_with(BACKEND_PID) {
            return Ok(vec![Row::from_values([session.to_string()])]);
        }
        if sql.starts_with(CANCEL_BACKEND) {
            let delivered = match args.first() {
                Some(SqlArg::Int(pid)) => self.inner().cancel_backend(*pid as u64),
                _ => false,
            };
            if delivered {
                self.state.cancels.notify_waiters();
            }
            return Ok(vec![Row::from_values([delivered.to_string()])]);
        }

        let upper = sql.trim_start().to_ascii_uppercase();
        if upper.starts_with("CREATE") {
            if upper.contains(" AS SELECT ") {
                self.wait_readable(session, sql).await;
            }
            self.apply_create(session, sql)?;
        } else if upper.starts_with("DROP TABLE") {
            if let Some(name) = sql.split_whitespace().last() {
                self.inner().tables.remove(name);
            }
        } else if upper.starts_with("LOCK TABLE") {
            if let (true, Some(name)) = (in_tx, sql.split_whitespace().nth(2)) {
                self.acquire(session, LockKey::Table(name.to_string()))
                    .await?;
            }
        } else if upper.starts_with("UPDATE") {
            if let (true, Some(SqlArg::Int(id))) = (in_tx, args.first()) {
                self.acquire(session, LockKey::Row(*id)).await?;
            }
        } else if upper.starts_with("SELECT") {
            self.wait_readable(session, sql).await;
        }

        Ok(rows)
    }

    fn apply_create(&self, session: u64, sql: &str) -> Result<(), DbError> {
        let words: Vec<&str> = sql.split_whitespace().collect();
        let Some(table_at) = words.iter().position(|w| w.eq_ignore_ascii_case("TABLE")) else {
            return Ok(());
        };
        let if_not_exists = words
            .get(table_at + 1)
            .is_some_and(|w| w.eq_ignore_ascii_case("IF"));
        let name_at = if if_not_exists { table_at + 4 } else { table_at + 1 };
        let Some(name) = words.get(name_at) else {
            return Ok(());
        };
        let name = name.trim_end_matches('(');
        let temp = words[..table_at]
            .iter()
            .any(|w| w.eq_ignore_ascii_case("TEMP") || w.eq_ignore_ascii_case("TEMPORARY"));
        let mut inner = self.inner();
        let created = if temp {
            let tables = inner.temp_tables.entry(session).or_default();
            let exists = tables.iter().any(|t| t.name == name);
            if !exists {
                tables.push(TempTable {
                    name: name.to_string(),
                    on_commit_drop: sql.to_ascii_uppercase().contains("ON COMMIT DROP"),
                });
            }
            !exists
        } else {
            inner.tables.insert(name.to_string())
        };
        if !created && !if_not_exists {
            return Err(DbError::with_code(
                "42P07",
                format!("relation \"{}\" already exists", name),
            ));
        }
        Ok(())
    }
}

/// Clears the running marker of a statement, even when it is abandoned
struct Running<'a> {
    db: &'a MockDatabase,
    session: u64,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut inner = self.db.inner();
        inner.running.remove(&self.session);
        inner.cancelled.remove(&self.session);
        inner.waiting.remove(&self.session);
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn connect(&self) -> Result<Box<dyn Connection>, DbError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let (refusal, limit) = {
            let inner = self.inner();
            (inner.connect_failure.clone(), inner.connect_limit)
        };
        if let Some(code) = refusal {
            return Err(DbError::with_code(code, "connection refused"));
        }
        let open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = limit
            && open > limit
        {
            self.state.open.fetch_sub(1, Ordering::SeqCst);
            return Err(DbError::with_code(
                "53300",
                "sorry, too many clients already",
            ));
        }
        self.state.peak_open.fetch_max(open, Ordering::SeqCst);
        let session = self.state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            db: self.clone(),
            session,
            closed: false,
        }))
    }
}

/// Session of a `MockDatabase`
pub struct MockConnection {
    db: MockDatabase,
    session: u64,
    closed: bool,
}

impl MockConnection {
    fn shut(&mut self) {
        if !self.closed {
            self.closed = true;
            self.db.inner().temp_tables.remove(&self.session);
            self.db.release(self.session);
            self.db.state.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.shut();
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64, DbError> {
        self.db.run(self.session, false, sql, args).await.map(|_| 1)
    }

    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<Row>, DbError> {
        self.db.run(self.session, false, sql, args).await
    }

    async fn begin<'a>(&'a mut self) -> Result<Box<dyn Transaction + 'a>, DbError> {
        self.db.run(self.session, false, "BEGIN", &[]).await?;
        Ok(Box::new(MockTransaction {
            conn: self,
            done: false,
        }))
    }

    async fn close(self: Box<Self>) -> Result<(), DbError> {
        let mut conn = self;
        conn.db.state.closes.fetch_add(1, Ordering::SeqCst);
        conn.shut();
        Ok(())
    }
}

/// Transaction of a `MockConnection`; releases its locks when it ends
pub struct MockTransaction<'a> {
    conn: &'a mut MockConnection,
    done: bool,
}

impl MockTransaction<'_> {
    async fn finish(&mut self, statement: &str) -> Result<(), DbError> {
        self.done = true;
        let result = self
            .conn
            .db
            .run(self.conn.session, false, statement, &[])
            .await
            .map(|_| ());
        self.conn.db.end_transaction(self.conn.session);
        result
    }
}

impl Drop for MockTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.conn.db.end_transaction(self.conn.session);
        }
    }
}

#[async_trait]
impl Transaction for MockTransaction<'_> {
    async fn execute(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64, DbError> {
        self.conn
            .db
            .run(self.conn.session, true, sql, args)
            .await
            .map(|_| 1)
    }

    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<Row>, DbError> {
        self.conn.db.run(self.conn.session, true, sql, args).await
    }

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        let mut tx = self;
        tx.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        let mut tx = self;
        tx.finish("ROLLBACK").await
    }
}

/// Error kind of a failed result, for assertions
pub fn kind_of<T>(result: &Result<T, DbError>) -> Option<DbErrorKind> {
    result.as_ref().err().map(|e| e.kind())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_injection_and_log() {
        let db = MockDatabase::new();
        db.fail_when("boom", "42703");

        let mut conn = db.connect().await.unwrap();
        assert!(conn.execute("SELECT 1", &[]).await.is_ok());
        let result = conn.execute("SELECT boom", &[]).await;
        assert_eq!(kind_of(&result), Some(DbErrorKind::Query));
        assert_eq!(db.statements(), vec!["SELECT 1", "SELECT boom"]);
    }

    #[tokio::test]
    async fn test_connection_limit_and_open_count() {
        let db = MockDatabase::new();
        db.connection_limit(2);

        let a = db.connect().await.unwrap();
        let b = db.connect().await.unwrap();
        let refused = db.connect().await.map(|_| ());
        assert_eq!(kind_of(&refused), Some(DbErrorKind::TooManyConnections));
        assert_eq!(db.open_connections(), 2);

        a.close().await.unwrap();
        drop(b);
        assert_eq!(db.open_connections(), 0);
        assert_eq!(db.peak_connections(), 2);
    }

    #[tokio::test]
    async fn test_cross_ordered_updates_deadlock() {
        let db = MockDatabase::new();
        let mut a = db.connect().await.unwrap();
        let mut b = db.connect().await.unwrap();
        let mut ta = a.begin().await.unwrap();
        let mut tb = b.begin().await.unwrap();

        let update = "UPDATE t SET payload = 'x' WHERE id = $1";
        ta.execute(update, &[SqlArg::Int(1)]).await.unwrap();
        tb.execute(update, &[SqlArg::Int(2)]).await.unwrap();

        let (ra, rb) = tokio::join!(
            ta.execute(update, &[SqlArg::Int(2)]),
            async {
                tokio::task::yield_now().await;
                let r = tb.execute(update, &[SqlArg::Int(1)]).await;
                if r.is_err() {
                    // Victim aborts, releasing row 2
                    db.release(2);
                }
                r
            }
        );
        assert!(ra.is_ok());
        assert_eq!(kind_of(&rb), Some(DbErrorKind::Deadlock));
    }

    #[tokio::test]
    async fn test_temp_tables_are_per_session() {
        let db = MockDatabase::new();
        let create = "CREATE TEMP TABLE _noisia_idle_xacts ON COMMIT DROP AS SELECT 1";
        let mut a = db.connect().await.unwrap();
        let mut b = db.connect().await.unwrap();

        let mut ta = a.begin().await.unwrap();
        let mut tb = b.begin().await.unwrap();
        ta.execute(create, &[]).await.unwrap();
        tb.execute(create, &[]).await.unwrap();
        assert_eq!(
            kind_of(&ta.execute(create, &[]).await),
            Some(DbErrorKind::DuplicateObject)
        );
        ta.rollback().await.unwrap();
        tb.rollback().await.unwrap();

        // Dropped with the transaction, so the next one can create it again
        let mut ta = a.begin().await.unwrap();
        ta.execute(create, &[]).await.unwrap();
        ta.rollback().await.unwrap();
        assert!(db.tables().is_empty());
    }

    #[tokio::test]
    async fn test_session_temp_table_outlives_transaction() {
        let db = MockDatabase::new();
        let create = "CREATE TEMP TABLE _noisia_rollbacks (id INT)";
        let mut a = db.connect().await.unwrap();

        a.execute(create, &[]).await.unwrap();
        let tx = a.begin().await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(
            kind_of(&a.execute(create, &[]).await),
            Some(DbErrorKind::DuplicateObject)
        );
    }

    #[tokio::test]
    async fn test_cancel_backend_interrupts_lock_wait() {
        let db = MockDatabase::new();
        let lock = "LOCK TABLE public.orders IN ACCESS EXCLUSIVE MODE";
        let mut holder = db.connect().await.unwrap();
        let mut waiter = db.connect().await.unwrap();
        let mut side = db.connect().await.unwrap();
        let mut th = holder.begin().await.unwrap();
        th.execute(lock, &[]).await.unwrap();

        let mut tw = waiter.begin().await.unwrap();
        let (waited, delivered) = tokio::join!(tw.execute(lock, &[]), async {
            tokio::task::yield_now().await;
            side.query(CANCEL_BACKEND, &[SqlArg::Int(2)])
                .await
                .unwrap()
        });

        assert_eq!(kind_of(&waited), Some(DbErrorKind::QueryCanceled));
        assert_eq!(delivered, vec![Row::from_values(["true"])]);
        assert_eq!(db.held_locks(), 1);

        // An idle session ignores the request
        let idle = side.query(CANCEL_BACKEND, &[SqlArg::Int(1)]).await.unwrap();
        assert_eq!(idle, vec![Row::from_values(["false"])]);
        th.rollback().await.unwrap();
    }
}
