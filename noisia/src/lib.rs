//! noisia
//!
//! Harmful workload generator for PostgreSQL. The library exposes the run
//! coordinator, the workload drivers and the engine primitives they share,
//! for use by the binary and integration tests.

pub mod app;
pub mod config;
pub mod db;
pub mod engine;
pub mod workload;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use app::AppError;
pub use config::{Cli, Config};
pub use db::{Database, PostgresDatabase};
pub use workload::{Workload, WorkloadError};
