//! Server-side cancellation of running statements
//!
//! A statement blocked on the server (a queued `LOCK TABLE`, a long sort)
//! does not notice when the run is cancelled. `Backend` remembers which
//! server process serves a session so the statement can be cancelled from a
//! side session with `pg_cancel_backend`, leaving the connection usable for
//! rollback and close.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{Connection, Database, DbError, DbErrorKind, SqlArg, close_quietly};

pub const BACKEND_PID: &str = "SELECT pg_backend_pid()::text";

pub const CANCEL_BACKEND: &str = "SELECT pg_cancel_backend($1::int)::text";

/// How long a cancelled statement may take to return before it is abandoned
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Server process serving one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backend {
    pid: i64,
}

impl Backend {
    /// Ask the server which process serves `conn`
    pub async fn of(conn: &mut dyn Connection) -> Result<Self, DbError> {
        let rows = conn.query(BACKEND_PID, &[]).await?;
        rows.first()
            .and_then(|row| row.get(0))
            .and_then(|v| v.parse().ok())
            .map(|pid| Self { pid })
            .ok_or_else(|| DbError::new(DbErrorKind::Other, "pg_backend_pid() returned no pid"))
    }

    pub fn pid(&self) -> i64 {
        self.pid
    }

    /// Cancel whatever the backend is running, from a separate session
    ///
    /// Returns whether the server delivered the signal.
    pub async fn cancel(&self, db: &dyn Database) -> Result<bool, DbError> {
        let mut side = db.connect().await?;
        let rows = side.query(CANCEL_BACKEND, &[SqlArg::Int(self.pid)]).await;
        close_quietly(side).await;
        Ok(rows?.first().and_then(|row| row.get(0)) == Some("true"))
    }

    /// Run `work` on this backend's session until it ends or `cancel` fires
    ///
    /// On cancellation the running statement is cancelled server-side and
    /// `work` is awaited for at most `CANCEL_GRACE` so it can observe the
    /// error. `Ok(None)` means the statement was interrupted; nothing is
    /// started once `cancel` has fired.
    pub async fn interruptible<T, F>(
        &self,
        db: &dyn Database,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<Option<T>, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        tokio::pin!(work);

        tokio::select! {
            biased;
            result = &mut work => return result.map(Some),
            _ = cancel.cancelled() => {}
        }

        match self.cancel(db).await {
            Ok(signalled) => debug!("backend {}: cancel sent (delivered: {})", self.pid, signalled),
            Err(e) => warn!("backend {}: cancel request failed: {}", self.pid, e),
        }
        match timeout(CANCEL_GRACE, &mut work).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(e)) if e.kind() == DbErrorKind::QueryCanceled => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!("backend {}: statement still running after cancel, abandoning it", self.pid);
                Ok(None)
            }
        }
    }
}
