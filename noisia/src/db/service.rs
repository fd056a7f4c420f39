//! Database client traits
//!
//! Workloads only talk to the server through these traits. Every unit of work
//! opens its own dedicated connection so that a stalled or signalled session
//! never affects another unit.

use async_trait::async_trait;
use tracing::debug;

use super::types::{DbError, Row, SqlArg};

/// Connection factory (PostgreSQL in production, in-memory in tests)
#[async_trait]
pub trait Database: Send + Sync {
    /// Open a new dedicated connection
    async fn connect(&self) -> Result<Box<dyn Connection>, DbError>;
}

/// A single server session
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement, returning the number of affected rows
    async fn execute(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64, DbError>;

    /// Run a query and collect its rows
    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<Row>, DbError>;

    /// Start a transaction borrowing this connection
    async fn begin<'a>(&'a mut self) -> Result<Box<dyn Transaction + 'a>, DbError>;

    /// Close the session
    async fn close(self: Box<Self>) -> Result<(), DbError>;
}

/// An open transaction
///
/// Dropping a transaction without commit or rollback aborts it.
#[async_trait]
pub trait Transaction: Send {
    async fn execute(&mut self, sql: &str, args: &[SqlArg]) -> Result<u64, DbError>;

    async fn query(&mut self, sql: &str, args: &[SqlArg]) -> Result<Vec<Row>, DbError>;

    async fn commit(self: Box<Self>) -> Result<(), DbError>;

    async fn rollback(self: Box<Self>) -> Result<(), DbError>;
}

/// Close a connection on an exit path where the close outcome cannot change
/// the result
pub async fn close_quietly(conn: Box<dyn Connection>) {
    if let Err(e) = conn.close().await {
        debug!("closing connection failed: {}", e);
    }
}

/// Roll back a transaction whose outcome is already decided
pub async fn rollback_quietly(tx: Box<dyn Transaction + '_>) {
    if let Err(e) = tx.rollback().await {
        debug!("rollback failed: {}", e);
    }
}
