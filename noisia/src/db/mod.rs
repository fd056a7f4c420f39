//! Database client boundary
//!
//! This module provides:
//! - `Database`, `Connection` and `Transaction` traits used by every workload
//! - `PostgresDatabase`, the `sqlx`-backed implementation
//! - `DbError` with SQLSTATE-based classification

mod postgres;
mod service;
mod types;

pub use postgres::{APPLICATION_NAME, PostgresDatabase};
pub use service::{Connection, Database, Transaction, close_quietly, rollback_quietly};
pub use types::{DbError, DbErrorKind, Row, SqlArg};
