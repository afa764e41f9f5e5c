//! Worker pool lifecycle.
//!
//! Shutdown is cooperative: it stops workers from claiming new jobs and then
//! waits for in-flight handlers to return. Nothing is aborted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    backend::QueueBackend,
    client::Client,
    config::WorkerConfig,
    job::WorkMap,
    observability::{MetricsSnapshot, WorkerMetrics},
    worker::Worker,
    QueueError, QueueResult,
};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the pool whose worker task is running the current future
    static CURRENT_POOL: u64;
}

/// N workers sharing one work map and one backend
pub struct WorkerPool<B: QueueBackend> {
    id: u64,
    backend: Arc<B>,
    work_map: Arc<WorkMap>,
    config: Arc<WorkerConfig>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    failure: Arc<Mutex<Option<QueueError>>>,
    metrics: Arc<WorkerMetrics>,
}

impl<B: QueueBackend> WorkerPool<B> {
    /// Pool working jobs from the client's backend
    pub fn new(client: &Client<B>, work_map: WorkMap, config: WorkerConfig) -> Self {
        Self::from_backend(client.backend().clone(), work_map, config)
    }

    pub fn from_backend(backend: Arc<B>, work_map: WorkMap, config: WorkerConfig) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            work_map: Arc::new(work_map),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
            failure: Arc::new(Mutex::new(None)),
            metrics: Arc::new(WorkerMetrics::new()),
        }
    }

    /// Spawn every worker and return immediately.
    ///
    /// Must be called from within a Tokio runtime. A pool starts at most once.
    pub fn start(&self) -> QueueResult<()> {
        self.config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| QueueError::Config("worker pool must be started inside a Tokio runtime".to_string()))?;

        if self.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyStarted);
        }

        info!(
            workers = self.config.workers,
            queue = %self.config.queue,
            job_types = ?self.work_map.job_types(),
            "starting worker pool"
        );

        for worker_id in 0..self.config.workers {
            let worker = Worker::new(worker_id, self.backend.clone(), self.work_map.clone(), self.config.clone())
                .with_shutdown(self.shutdown.clone())
                .with_metrics(self.metrics.clone());
            let failure = self.failure.clone();
            let shutdown = self.shutdown.clone();
            let tracker = self.tracker.clone();

            self.tracker.spawn_on(
                CURRENT_POOL.scope(self.id, async move {
                    if let Err(err) = worker.run().await {
                        failure.lock().get_or_insert(err);
                        // One fatal worker stops the whole pool so `wait` can report it
                        shutdown.cancel();
                        tracker.close();
                    }
                }),
                &runtime,
            );
        }

        Ok(())
    }

    /// Block until every worker has exited.
    ///
    /// Returns the first fatal worker error, if any. Without a shutdown or a
    /// fatal error this waits indefinitely.
    pub async fn wait(&self) -> QueueResult<()> {
        self.tracker.wait().await;
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Start and block until the pool stops
    pub async fn run(&self) -> QueueResult<()> {
        self.start()?;
        self.wait().await
    }

    /// Stop claiming new jobs and wait for in-flight handlers to finish.
    ///
    /// Safe to call repeatedly, before `start`, and from inside one of this
    /// pool's handlers. In the last case the stop is signalled but not waited
    /// on, since the caller is itself one of the in-flight handlers.
    pub async fn shutdown(&self) {
        self.signal_shutdown();

        if self.in_own_worker() {
            debug!("shutdown requested from inside a handler, not waiting for drain");
            return;
        }

        self.tracker.wait().await;
        info!("worker pool stopped");
    }

    /// Like [`shutdown`](Self::shutdown) but gives up waiting after `limit`.
    ///
    /// Handlers still running at the deadline keep running; only the wait is abandoned.
    pub async fn shutdown_timeout(&self, limit: Duration) -> QueueResult<()> {
        match tokio::time::timeout(limit, self.shutdown()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(limit = ?limit, in_flight = self.tracker.len(), "worker pool did not drain in time");
                Err(QueueError::ShutdownTimeout(limit))
            }
        }
    }

    fn signal_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("shutting down worker pool");
        }
        self.shutdown.cancel();
        self.tracker.close();
    }

    fn in_own_worker(&self) -> bool {
        CURRENT_POOL.try_with(|id| *id == self.id).unwrap_or(false)
    }

    /// Started and not yet fully stopped
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !(self.tracker.is_closed() && self.tracker.is_empty())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn work_map(&self) -> &WorkMap {
        &self.work_map
    }
}

impl<B: QueueBackend> Drop for WorkerPool<B> {
    fn drop(&mut self) {
        // Detached workers would otherwise poll forever
        self.shutdown.cancel();
        self.tracker.close();
    }
}
