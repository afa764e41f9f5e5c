//! Claiming jobs under connection-scoped advisory locks.
//!
//! A claimed job travels with the connection its lock was taken on, inside a
//! [`LockedJob`]. The lock is released exactly once: by [`LockedJob::release`]
//! on the normal path, or by closing the connection when the guard is dropped
//! without being released (handler panic, cancelled task, early return).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{backend::QueueBackend, Job, JobState, QueueResult, Resolution};

/// Hands out jobs locked on their own leased connection
pub struct Locker<B: QueueBackend> {
    backend: Arc<B>,
    release_attempts: u32,
    release_retry_delay: Duration,
}

impl<B: QueueBackend> Locker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            release_attempts: 3,
            release_retry_delay: Duration::from_millis(100),
        }
    }

    /// How hard `release` tries to unlock before closing the connection instead
    pub fn with_release_policy(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.release_attempts = attempts.max(1);
        self.release_retry_delay = retry_delay;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Lock the next eligible job in `queue`, or `None` when there is nothing to do.
    #[instrument(skip(self), level = "debug")]
    pub async fn claim(&self, queue: &str) -> QueueResult<Option<LockedJob<B>>> {
        let conn = self.backend.acquire().await?;
        self.claim_on(conn, queue).await
    }

    /// Like [`claim`](Self::claim), but gives up with `None` if `shutdown`
    /// fires while waiting for a connection.
    ///
    /// Only the lease is raced against the token. Once the lock query has
    /// started it runs to completion, so a connection is never pooled with a
    /// lock of unknown state.
    #[instrument(skip(self, shutdown), level = "debug")]
    pub async fn claim_unless_cancelled(
        &self,
        queue: &str,
        shutdown: &CancellationToken,
    ) -> QueueResult<Option<LockedJob<B>>> {
        let conn = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(None),
            conn = self.backend.acquire() => conn?,
        };

        if shutdown.is_cancelled() {
            self.backend.release(conn).await;
            return Ok(None);
        }

        self.claim_on(conn, queue).await
    }

    async fn claim_on(&self, mut conn: B::Conn, queue: &str) -> QueueResult<Option<LockedJob<B>>> {
        match self.backend.claim_next(&mut conn, queue).await {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, job_type = %job.job_type, "claimed job");
                Ok(Some(LockedJob {
                    backend: self.backend.clone(),
                    conn: Some(conn),
                    job,
                    release_attempts: self.release_attempts,
                    release_retry_delay: self.release_retry_delay,
                }))
            }
            Ok(None) => {
                self.backend.release(conn).await;
                Ok(None)
            }
            Err(err) => {
                // Lock state on this connection is unknown; closing it settles that.
                self.backend.discard(conn);
                Err(err)
            }
        }
    }
}

impl<B: QueueBackend> Clone for Locker<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            release_attempts: self.release_attempts,
            release_retry_delay: self.release_retry_delay,
        }
    }
}

/// A job whose advisory lock is held on `conn`
pub struct LockedJob<B: QueueBackend> {
    backend: Arc<B>,
    conn: Option<B::Conn>,
    job: Job,
    release_attempts: u32,
    release_retry_delay: Duration,
}

impl<B: QueueBackend> LockedJob<B> {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Delete the job after successful work
    pub async fn delete(&mut self) -> QueueResult<()> {
        self.apply(&Resolution::Delete).await
    }

    /// Record a failure and back the job off to `run_at`
    pub async fn retry(&mut self, error_count: i32, last_error: &str, run_at: DateTime<Utc>) -> QueueResult<()> {
        self.apply(&Resolution::Retry {
            error_count,
            last_error: last_error.to_string(),
            run_at,
        })
        .await
    }

    /// Replace args and move the job to `run_at`, leaving its error state alone
    pub async fn reschedule(&mut self, args: &[u8], run_at: DateTime<Utc>) -> QueueResult<()> {
        self.apply(&Resolution::Reschedule {
            args: args.to_vec(),
            run_at,
        })
        .await
    }

    /// Write a resolution through the locked connection
    pub async fn apply(&mut self, resolution: &Resolution) -> QueueResult<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(crate::QueueError::LockNotHeld(self.job.id));
        };
        let id = self.job.id;
        let next = resolution.next_state();
        debug_assert!(
            JobState::Claimed.can_transition_to(next),
            "claimed job cannot move to {}",
            next.name()
        );

        match resolution {
            Resolution::Delete => self.backend.delete(conn, id).await?,
            Resolution::Retry { error_count, last_error, run_at } => {
                self.backend
                    .update_for_retry(conn, id, *error_count, last_error, *run_at)
                    .await?;
                self.job.error_count = *error_count;
                self.job.last_error = Some(last_error.clone());
                self.job.run_at = *run_at;
            }
            Resolution::Reschedule { args, run_at } => {
                self.backend.update_for_reschedule(conn, id, args, *run_at).await?;
                self.job.args = args.clone();
                self.job.run_at = *run_at;
            }
        }

        debug!(job_id = %id, resolution = resolution.name(), state = next.name(), "resolved job");
        Ok(())
    }

    /// Unlock the job and hand the connection back.
    ///
    /// Unlocking is retried a bounded number of times. If it still fails the
    /// connection is closed instead of pooled, which drops the lock with it,
    /// and the last error is returned for logging.
    pub async fn release(mut self) -> QueueResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let id = self.job.id;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.release_lock(&mut conn, id).await {
                Ok(()) => {
                    self.backend.release(conn).await;
                    return Ok(());
                }
                Err(err) if attempt >= self.release_attempts => {
                    warn!(job_id = %id, attempts = attempt, error = %err, "giving up on unlock, closing connection");
                    self.backend.discard(conn);
                    return Err(err);
                }
                Err(err) => {
                    debug!(job_id = %id, attempt, error = %err, "unlock failed, retrying");
                    tokio::time::sleep(self.release_retry_delay).await;
                }
            }
        }
    }
}

impl<B: QueueBackend> Drop for LockedJob<B> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(job_id = %self.job.id, "locked job dropped without release, closing its connection");
            self.backend.discard(conn);
        }
    }
}
