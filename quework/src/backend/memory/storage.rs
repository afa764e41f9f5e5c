use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::{backend::QueueBackend, Job, JobId, JobMessage, QueueError, QueueResult};

type SessionId = u64;

#[derive(Default)]
struct MemoryState {
    jobs: BTreeMap<JobId, Job>,

    /// Advisory locks: job id -> owning session
    locks: HashMap<JobId, SessionId>,

    next_id: i64,
    next_session: SessionId,
}

impl MemoryState {
    fn held_by(&self, id: JobId, session: SessionId) -> QueueResult<()> {
        if !self.jobs.contains_key(&id) {
            return Err(QueueError::JobNotFound(id));
        }
        match self.locks.get(&id) {
            Some(owner) if *owner == session => Ok(()),
            _ => Err(QueueError::LockNotHeld(id)),
        }
    }
}

/// In-process store for tests and development.
///
/// Every leased [`MemoryConnection`] is its own session. Dropping one closes
/// the session and releases every lock it holds, which is how a crashed
/// worker's jobs become claimable again.
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    connections: Arc<Semaphore>,
    acquire_timeout: Option<Duration>,

    /// Store errors still to inject into `claim_next`
    failing_claims: Arc<AtomicUsize>,

    /// Store errors still to inject into `release_lock`
    failing_unlocks: Arc<AtomicUsize>,
}

impl MemoryBackend {
    /// Backend with a ten connection pool and a 30 second acquire timeout
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            connections: Arc::new(Semaphore::new(10)),
            acquire_timeout: Some(Duration::from_secs(30)),
            failing_claims: Arc::new(AtomicUsize::new(0)),
            failing_unlocks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.connections = Arc::new(Semaphore::new(max));
        self
    }

    /// `None` waits for a connection forever
    pub fn with_acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Close the pool. Leased connections stay usable; new leases fail.
    pub fn close(&self) {
        self.connections.close();
    }

    /// Make the next `count` claims fail with a store error
    pub fn fail_next_claims(&self, count: usize) {
        self.failing_claims.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` unlocks fail with a store error, leaving the lock held
    pub fn fail_next_unlocks(&self, count: usize) {
        self.failing_unlocks.store(count, Ordering::SeqCst);
    }

    /// Injected unlock failures not yet consumed
    pub fn pending_unlock_failures(&self) -> usize {
        self.failing_unlocks.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.state.lock().jobs.get(&id).cloned()
    }

    /// All rows in claim order
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(Job::claim_key);
        jobs
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_locked(&self, id: JobId) -> bool {
        self.state.lock().locks.contains_key(&id)
    }

    pub fn available_connections(&self) -> usize {
        self.connections.available_permits()
    }

    fn take_injected_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            connections: self.connections.clone(),
            acquire_timeout: self.acquire_timeout,
            failing_claims: self.failing_claims.clone(),
            failing_unlocks: self.failing_unlocks.clone(),
        }
    }
}

/// A leased session on a [`MemoryBackend`]
pub struct MemoryConnection {
    session: SessionId,
    state: Arc<Mutex<MemoryState>>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    pub fn session(&self) -> u64 {
        self.session
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let session = self.session;
        self.state.lock().locks.retain(|_, owner| *owner != session);
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    type Conn = MemoryConnection;

    async fn acquire(&self) -> QueueResult<MemoryConnection> {
        let lease = self.connections.clone().acquire_owned();
        let permit = match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, lease)
                .await
                .map_err(|_| QueueError::PoolTimedOut)?,
            None => lease.await,
        }
        .map_err(|_| QueueError::PoolClosed)?;

        let mut state = self.state.lock();
        state.next_session += 1;

        Ok(MemoryConnection {
            session: state.next_session,
            state: self.state.clone(),
            _permit: permit,
        })
    }

    async fn release(&self, conn: MemoryConnection) {
        drop(conn);
    }

    fn discard(&self, conn: MemoryConnection) {
        drop(conn);
    }

    async fn insert(&self, message: JobMessage) -> QueueResult<JobId> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = JobId(state.next_id);
        state.jobs.insert(id, Job::from_message(id, message));
        Ok(id)
    }

    async fn claim_next(&self, conn: &mut MemoryConnection, queue: &str) -> QueueResult<Option<Job>> {
        if Self::take_injected_failure(&self.failing_claims) {
            return Err(QueueError::Store("injected claim failure".to_string()));
        }

        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let candidate = state
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.is_eligible(now))
            .filter(|job| !state.locks.contains_key(&job.id))
            .min_by_key(|job| job.claim_key())
            .cloned();

        if let Some(job) = &candidate {
            trace!(job_id = %job.id, session = conn.session, "locked job");
            state.locks.insert(job.id, conn.session);
        }

        Ok(candidate)
    }

    async fn release_lock(&self, conn: &mut MemoryConnection, id: JobId) -> QueueResult<()> {
        if Self::take_injected_failure(&self.failing_unlocks) {
            return Err(QueueError::Store("injected unlock failure".to_string()));
        }

        let mut state = self.state.lock();
        if state.locks.get(&id) == Some(&conn.session) {
            state.locks.remove(&id);
        }
        Ok(())
    }

    async fn delete(&self, conn: &mut MemoryConnection, id: JobId) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.held_by(id, conn.session)?;
        state.jobs.remove(&id);
        Ok(())
    }

    async fn update_for_retry(
        &self,
        conn: &mut MemoryConnection,
        id: JobId,
        error_count: i32,
        last_error: &str,
        run_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.held_by(id, conn.session)?;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.error_count = error_count;
            job.last_error = Some(last_error.to_string());
            job.run_at = run_at;
        }
        Ok(())
    }

    async fn update_for_reschedule(
        &self,
        conn: &mut MemoryConnection,
        id: JobId,
        args: &[u8],
        run_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut state = self.state.lock();
        state.held_by(id, conn.session)?;
        if let Some(job) = state.jobs.get_mut(&id) {
            job.args = args.to_vec();
            job.run_at = run_at;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobPriority, NewJob};

    fn message(job_type: &str, priority: i16) -> JobMessage {
        NewJob::new(job_type)
            .with_priority(priority)
            .into_message(Utc::now())
            .unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let backend = MemoryBackend::new();
        let first = backend.insert(message("A", 0)).await.unwrap();
        let second = backend.insert(message("A", 0)).await.unwrap();

        assert!(second > first);
        assert_eq!(backend.len(), 2);
        assert_eq!(backend.get(first).unwrap().priority, JobPriority(0));
    }

    #[tokio::test]
    async fn dropping_connection_releases_its_locks() {
        let backend = MemoryBackend::new();
        let id = backend.insert(message("A", 0)).await.unwrap();

        let mut conn = backend.acquire().await.unwrap();
        backend.claim_next(&mut conn, "").await.unwrap().unwrap();
        assert!(backend.is_locked(id));

        drop(conn);
        assert!(!backend.is_locked(id));
    }

    #[tokio::test]
    async fn mutations_require_the_lock() {
        let backend = MemoryBackend::new();
        let id = backend.insert(message("A", 0)).await.unwrap();
        let mut conn = backend.acquire().await.unwrap();

        let result = backend.delete(&mut conn, id).await;
        assert!(matches!(result, Err(QueueError::LockNotHeld(_))));

        let result = backend.delete(&mut conn, JobId(999)).await;
        assert!(matches!(result, Err(QueueError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let backend = MemoryBackend::new()
            .with_max_connections(1)
            .with_acquire_timeout(Some(Duration::from_millis(20)));

        let _held = backend.acquire().await.unwrap();
        let result = backend.acquire().await;
        assert!(matches!(result, Err(QueueError::PoolTimedOut)));
    }

    #[tokio::test]
    async fn acquire_fails_once_closed() {
        let backend = MemoryBackend::new();
        backend.close();
        assert!(matches!(backend.acquire().await, Err(QueueError::PoolClosed)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next_claims(1);
        let mut conn = backend.acquire().await.unwrap();

        assert!(backend.claim_next(&mut conn, "").await.is_err());
        assert!(backend.claim_next(&mut conn, "").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn injected_unlock_failure_keeps_the_lock() {
        let backend = MemoryBackend::new();
        let id = backend.insert(message("A", 0)).await.unwrap();
        backend.fail_next_unlocks(1);
        let mut conn = backend.acquire().await.unwrap();
        backend.claim_next(&mut conn, "").await.unwrap().unwrap();

        assert!(backend.release_lock(&mut conn, id).await.is_err());
        assert!(backend.is_locked(id));
        assert_eq!(backend.pending_unlock_failures(), 0);

        backend.release_lock(&mut conn, id).await.unwrap();
        assert!(!backend.is_locked(id));
    }
}
