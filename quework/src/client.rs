use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::{
    backend::QueueBackend,
    locker::{LockedJob, Locker},
    JobId, NewJob, QueueResult,
};

#[cfg(feature = "json")]
use crate::job::TypedJob;

/// Enqueues jobs. Holds nothing but its store handle.
pub struct Client<B: QueueBackend> {
    backend: Arc<B>,
    locker: Locker<B>,
}

impl<B: QueueBackend> Client<B> {
    pub fn new(backend: B) -> Self {
        Self::from_arc(Arc::new(backend))
    }

    pub fn from_arc(backend: Arc<B>) -> Self {
        Self {
            locker: Locker::new(backend.clone()),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Insert a job, filling in the default queue, priority and run time.
    ///
    /// A blank job type is rejected before anything reaches the store.
    #[instrument(skip(self, job), fields(job_type = %job.job_type))]
    pub async fn enqueue(&self, job: NewJob) -> QueueResult<JobId> {
        let message = job.into_message(Utc::now())?;
        let queue = message.queue.clone();

        let id = self.backend.insert(message).await?;

        debug!(job_id = %id, queue = %queue, "enqueued job");
        Ok(id)
    }

    /// Enqueue a typed job with JSON args, runnable immediately
    #[cfg(feature = "json")]
    pub async fn enqueue_job<J: TypedJob>(&self, job: &J) -> QueueResult<JobId> {
        self.enqueue(typed_request(job)?).await
    }

    /// Enqueue a typed job that becomes eligible at `run_at`
    #[cfg(feature = "json")]
    pub async fn enqueue_job_at<J: TypedJob>(
        &self,
        job: &J,
        run_at: chrono::DateTime<Utc>,
    ) -> QueueResult<JobId> {
        self.enqueue(typed_request(job)?.with_run_at(run_at)).await
    }

    /// Lock the next eligible job in `queue` for manual processing.
    ///
    /// The caller resolves it through the returned guard and must call
    /// [`LockedJob::release`] when done.
    pub async fn lock_job(&self, queue: &str) -> QueueResult<Option<LockedJob<B>>> {
        self.locker.claim(queue).await
    }
}

impl<B: QueueBackend> Clone for Client<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            locker: self.locker.clone(),
        }
    }
}

#[cfg(feature = "json")]
fn typed_request<J: TypedJob>(job: &J) -> QueueResult<NewJob> {
    Ok(NewJob::new(J::JOB_TYPE)
        .with_args(serde_json::to_vec(job)?)
        .with_queue(J::QUEUE)
        .with_priority(J::PRIORITY))
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::{JobPriority, QueueError, DEFAULT_QUEUE};

    #[tokio::test]
    async fn enqueue_fills_defaults() {
        let client = Client::new(MemoryBackend::new());
        let before = Utc::now();

        let id = client.enqueue(NewJob::new("PrintName").with_args(b"[]".to_vec())).await.unwrap();

        let job = client.backend().get(id).unwrap();
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.priority, JobPriority::DEFAULT);
        assert!(job.run_at >= before && job.run_at <= Utc::now());
        assert_eq!(job.error_count, 0);
        assert_eq!(job.last_error, None);
    }

    #[tokio::test]
    async fn missing_type_inserts_nothing() {
        let client = Client::new(MemoryBackend::new());

        let result = client.enqueue(NewJob::new("")).await;

        assert!(matches!(result, Err(QueueError::MissingJobType)));
        assert!(client.backend().is_empty());
    }

    #[tokio::test]
    async fn lock_job_respects_run_at() {
        let client = Client::new(MemoryBackend::new());
        let later = Utc::now() + chrono::Duration::seconds(30);
        client.enqueue(NewJob::new("Later").with_run_at(later)).await.unwrap();

        assert!(client.lock_job(DEFAULT_QUEUE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_job_then_delete() {
        let client = Client::new(MemoryBackend::new());
        let id = client.enqueue(NewJob::new("Now")).await.unwrap();

        let mut locked = client.lock_job(DEFAULT_QUEUE).await.unwrap().unwrap();
        assert_eq!(locked.job().id, id);
        locked.delete().await.unwrap();
        locked.release().await.unwrap();

        assert!(client.backend().get(id).is_none());
        assert!(!client.backend().is_locked(id));
    }

    #[cfg(feature = "json")]
    mod typed {
        use super::*;
        use crate::{Job, JobError, Outcome};
        use async_trait::async_trait;
        use serde::{Deserialize, Serialize};

        #[derive(Serialize, Deserialize)]
        struct SendReport {
            account: u64,
        }

        #[async_trait]
        impl TypedJob for SendReport {
            const JOB_TYPE: &'static str = "SendReport";
            const PRIORITY: JobPriority = JobPriority(10);
            const QUEUE: &'static str = "reports";

            async fn perform(self, _job: &Job) -> Result<Outcome, JobError> {
                Ok(Outcome::Done)
            }
        }

        #[tokio::test]
        async fn enqueue_job_uses_type_constants() {
            let client = Client::new(MemoryBackend::new());

            let id = client.enqueue_job(&SendReport { account: 42 }).await.unwrap();

            let job = client.backend().get(id).unwrap();
            assert_eq!(job.job_type, "SendReport");
            assert_eq!(job.queue, "reports");
            assert_eq!(job.priority, JobPriority(10));
            assert_eq!(job.args, br#"{"account":42}"#.to_vec());
        }
    }
}
