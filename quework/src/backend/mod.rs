#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Job, JobId, JobMessage, QueueResult};

/// Store adapter: job table access plus session-scoped advisory locks.
///
/// Locks belong to a leased connection (`Self::Conn`). Closing a connection
/// must release every lock taken on it; that is the only crash recovery the
/// engine relies on. Returning a connection to its pool does not necessarily
/// unlock anything, so callers unlock explicitly before [`release`].
///
/// [`release`]: QueueBackend::release
#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    /// A leased connection, exclusively owned while held
    type Conn: Send + 'static;

    /// Lease a connection, waiting if the pool is exhausted
    async fn acquire(&self) -> QueueResult<Self::Conn>;

    /// Return a connection to the pool. Locks must already be released.
    async fn release(&self, conn: Self::Conn);

    /// Close a connection without returning it, dropping any locks it holds.
    ///
    /// Synchronous so it can run from `Drop`.
    fn discard(&self, conn: Self::Conn);

    /// Insert a new job row and return its assigned id
    async fn insert(&self, message: JobMessage) -> QueueResult<JobId>;

    /// Lock and return the first eligible job in `queue`.
    ///
    /// Candidates are visited in `(priority, run_at, id)` order; a candidate
    /// whose lock is held elsewhere is skipped, never waited on.
    async fn claim_next(&self, conn: &mut Self::Conn, queue: &str) -> QueueResult<Option<Job>>;

    /// Release the advisory lock on `id`. Unlocking an unheld lock is not an error.
    async fn release_lock(&self, conn: &mut Self::Conn, id: JobId) -> QueueResult<()>;

    async fn delete(&self, conn: &mut Self::Conn, id: JobId) -> QueueResult<()>;

    async fn update_for_retry(
        &self,
        conn: &mut Self::Conn,
        id: JobId,
        error_count: i32,
        last_error: &str,
        run_at: DateTime<Utc>,
    ) -> QueueResult<()>;

    async fn update_for_reschedule(
        &self,
        conn: &mut Self::Conn,
        id: JobId,
        args: &[u8],
        run_at: DateTime<Utc>,
    ) -> QueueResult<()>;
}
