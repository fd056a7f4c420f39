//! Connection exhaustion
//!
//! Opens connections and never gives them back until shutdown, starving
//! other clients of connection slots. Once the server refuses, attempts back
//! off and speed up again when a slot frees.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::FailConnsConfig;
use crate::db::{Connection, Database, DbErrorKind, close_quietly};
use crate::engine::{AdaptiveBackoff, nap};

use super::{Lifecycle, Phase, Workload, WorkloadError};

/// Connection attempt totals of one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HoldReport {
    held: usize,
    refused: u64,
}

pub struct FailConns {
    config: FailConnsConfig,
    db: Arc<dyn Database>,
}

impl FailConns {
    pub fn new(config: FailConnsConfig, db: Arc<dyn Database>) -> Self {
        Self { config, db }
    }

    /// Grab connections at the backoff cadence until cancelled
    async fn hoard(&self, cancel: &CancellationToken) -> (Vec<Box<dyn Connection>>, HoldReport) {
        let mut backoff = AdaptiveBackoff::new(self.config.floor, self.config.ceiling);
        let mut held = Vec::new();
        let mut report = HoldReport::default();

        while nap(cancel, backoff.interval()).await {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                attempt = self.db.connect() => attempt,
            };

            match attempt {
                Ok(conn) => {
                    held.push(conn);
                    gauge!("noisia_connections_held").set(held.len() as f64);
                    backoff.on_success();
                }
                Err(e) => {
                    report.refused += 1;
                    counter!("noisia_connections_refused_total").increment(1);
                    match e.kind() {
                        DbErrorKind::TooManyConnections => debug!("failconns: refused: {}", e),
                        _ => info!("failconns: connect failed: {}", e),
                    }
                    backoff.on_failure();
                }
            }
        }

        report.held = held.len();
        (held, report)
    }
}

#[async_trait]
impl Workload for FailConns {
    fn name(&self) -> &'static str {
        "fail_conns"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), WorkloadError> {
        let mut lifecycle = Lifecycle::new(self.name());
        lifecycle.enter(Phase::Preparing);

        let (held, report) = lifecycle.drive(&cancel, self.hoard(&cancel)).await;

        join_all(held.into_iter().map(close_quietly)).await;
        gauge!("noisia_connections_held").set(0.0);
        lifecycle.enter(Phase::CleanedUp);
        info!(
            "failconns finished: {} connections held, {} attempts refused",
            report.held, report.refused
        );
        Ok(())
    }
}
