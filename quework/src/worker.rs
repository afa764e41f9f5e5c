use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    backend::QueueBackend,
    config::WorkerConfig,
    job::{Outcome, WorkMap},
    locker::Locker,
    observability::WorkerMetrics,
    Job, JobError, QueueResult, Resolution,
};

/// A single claim-execute-resolve loop.
///
/// Workers normally live inside a [`WorkerPool`](crate::WorkerPool), but one
/// can be driven by hand with [`Worker::work_one`].
pub struct Worker<B: QueueBackend> {
    id: usize,
    locker: Locker<B>,
    work_map: Arc<WorkMap>,
    config: Arc<WorkerConfig>,
    shutdown: CancellationToken,
    metrics: Arc<WorkerMetrics>,
}

impl<B: QueueBackend> Worker<B> {
    pub fn new(id: usize, backend: Arc<B>, work_map: Arc<WorkMap>, config: Arc<WorkerConfig>) -> Self {
        let locker = Locker::new(backend)
            .with_release_policy(config.release_attempts, config.release_retry_delay);

        Self {
            id,
            locker,
            work_map,
            config,
            shutdown: CancellationToken::new(),
            metrics: Arc::new(WorkerMetrics::new()),
        }
    }

    /// Stop signal checked before every claim
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Run until the shutdown token fires or a fatal error occurs.
    ///
    /// The token is only consulted between jobs; a running handler is never
    /// interrupted.
    pub async fn run(self) -> QueueResult<()> {
        info!(worker = self.id, queue = %self.config.queue, "worker started");

        let mut idle = self.config.poll_interval;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.work_one().await {
                Ok(true) => idle = self.config.poll_interval,
                Ok(false) => {
                    if self.pause(idle).await {
                        break;
                    }
                    idle = idle.saturating_mul(2).min(self.config.max_poll_interval);
                }
                Err(err) if err.is_fatal() => {
                    error!(worker = self.id, error = %err, "worker stopping on fatal error");
                    return Err(err);
                }
                Err(err) => {
                    self.metrics.record_store_error();
                    warn!(worker = self.id, error = %err, "store error, pausing before next claim");
                    if self.pause(self.config.store_error_pause).await {
                        break;
                    }
                }
            }
        }

        info!(worker = self.id, "worker stopped");
        Ok(())
    }

    /// Claim and resolve at most one job. Returns `false` if the queue had nothing
    /// eligible or shutdown fired before a connection was leased.
    pub async fn work_one(&self) -> QueueResult<bool> {
        let Some(mut locked) = self
            .locker
            .claim_unless_cancelled(&self.config.queue, &self.shutdown)
            .await?
        else {
            return Ok(false);
        };
        self.metrics.record_claimed();

        let job = locked.job().clone();
        let span = info_span!("job", job_id = %job.id, job_type = %job.job_type, worker = self.id);

        let outcome = self.perform(&job).instrument(span).await;
        let resolution = job.resolve(outcome, Utc::now(), &self.config.backoff);

        match &resolution {
            Resolution::Delete => debug!(job_id = %job.id, "job done"),
            Resolution::Retry { error_count, last_error, run_at } => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                error_count,
                retry_at = %run_at,
                error = %last_error,
                "job failed, backing off"
            ),
            Resolution::Reschedule { run_at, .. } => debug!(job_id = %job.id, run_at = %run_at, "job rescheduled"),
        }

        let applied = locked.apply(&resolution).await;
        let released = locked.release().await;

        applied?;
        self.metrics.record_resolution(&resolution);

        if let Err(err) = released {
            self.metrics.record_store_error();
            warn!(job_id = %job.id, error = %err, "unlock failed, connection was closed instead");
        }

        Ok(true)
    }

    async fn perform(&self, job: &Job) -> Result<Outcome, JobError> {
        let Some(handler) = self.work_map.get(&job.job_type) else {
            return Err(JobError::new(format!("unknown job type: {}", job.job_type)));
        };

        match AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(JobError::new(format!("job panicked: {}", panic_message(panic.as_ref())))),
        }
    }

    /// Sleep unless shut down first. Returns `true` on shutdown.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
