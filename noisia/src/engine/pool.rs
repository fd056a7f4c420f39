//! Bounded worker pool
//!
//! Admission is controlled by a counting semaphore: a unit is spawned only
//! after it acquired a permit, and the permit moves into the spawned task so
//! the slot is released when the unit ends, whatever the outcome. A unit
//! that fails faster than `FAILED_UNIT_FLOOR` keeps its slot until the floor
//! has passed, so a persistent failure cannot turn admission into a busy loop.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::rate::{IntervalThrottle, nap};

/// Shortest time a failed unit holds its slot
pub const FAILED_UNIT_FLOOR: Duration = Duration::from_millis(10);

/// Outcome counters of one pool run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub admitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
}

impl PoolReport {
    /// Units that ended, successfully or not
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.panicked
    }
}

/// Pool admitting at most `limit` concurrent units
pub struct WorkerPool {
    name: &'static str,
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    /// A limit of zero is raised to one
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            slots: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Admit units as fast as slots free up until `cancel` fires
    ///
    /// `make_unit` is called by the admission loop with the unit's sequence
    /// number; any random draws belong there, not in the spawned future.
    pub async fn run<F, Fut, E>(&self, cancel: &CancellationToken, make_unit: F) -> PoolReport
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.admit(cancel, None, make_unit).await
    }

    /// Admit units no faster than `throttle` allows, overlapping up to the limit
    pub async fn run_paced<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        throttle: &mut IntervalThrottle,
        make_unit: F,
    ) -> PoolReport
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.admit(cancel, Some(throttle), make_unit).await
    }

    async fn admit<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        mut throttle: Option<&mut IntervalThrottle>,
        mut make_unit: F,
    ) -> PoolReport
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut report = PoolReport::default();
        let mut units = JoinSet::new();

        loop {
            if let Some(throttle) = throttle.as_deref_mut()
                && !throttle.wait(cancel).await
            {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let unit = make_unit(report.admitted);
            report.admitted += 1;
            counter!("noisia_units_admitted_total", "workload" => self.name).increment(1);

            let floor = cancel.clone();
            units.spawn(async move {
                let _slot = permit;
                let started = Instant::now();
                let result = unit.await;
                if result.is_err() {
                    let rest = FAILED_UNIT_FLOOR.saturating_sub(started.elapsed());
                    if !rest.is_zero() {
                        nap(&floor, rest).await;
                    }
                }
                result
            });

            while let Some(result) = units.try_join_next() {
                self.record(&mut report, result);
            }
        }

        if !units.is_empty() {
            debug!("{}: draining {} in-flight units", self.name, units.len());
        }
        while let Some(result) = units.join_next().await {
            self.record(&mut report, result);
        }
        debug!("{}: {} of {} units finished", self.name, report.finished(), report.admitted);

        report
    }

    fn record<E: Display>(&self, report: &mut PoolReport, result: Result<Result<(), E>, JoinError>) {
        match result {
            Ok(Ok(())) => report.succeeded += 1,
            Ok(Err(e)) => {
                report.failed += 1;
                counter!("noisia_units_failed_total", "workload" => self.name).increment(1);
                warn!("{}: unit failed: {}", self.name, e);
            }
            Err(e) if e.is_panic() => {
                report.panicked += 1;
                counter!("noisia_units_panicked_total", "workload" => self.name).increment(1);
                error!("{}: unit panicked: {}", self.name, e);
            }
            Err(e) => {
                report.failed += 1;
                counter!("noisia_units_failed_total", "workload" => self.name).increment(1);
                warn!("{}: unit did not complete: {}", self.name, e);
            }
        }
    }
}
