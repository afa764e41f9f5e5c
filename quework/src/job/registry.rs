use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::Outcome;
use crate::{Job, JobError, QueueError, QueueResult};

#[cfg(feature = "json")]
use super::TypedJob;

/// Application code run for one job type
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> Result<Outcome, JobError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, JobError>> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> Result<Outcome, JobError> {
        (self)(job.clone()).await
    }
}

/// Decodes JSON args into `J` before running it
#[cfg(feature = "json")]
struct TypedHandler<J> {
    _phantom: std::marker::PhantomData<fn() -> J>,
}

#[cfg(feature = "json")]
#[async_trait]
impl<J: TypedJob> Handler for TypedHandler<J> {
    async fn handle(&self, job: &Job) -> Result<Outcome, JobError> {
        let args: J = serde_json::from_slice(&job.args)?;
        args.perform(job).await
    }
}

/// Dispatch table from job type to handler.
///
/// Built before the pool starts and shared read-only by every worker.
#[derive(Clone, Default)]
pub struct WorkMap {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl WorkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`
    pub fn register<H: Handler>(&mut self, job_type: impl Into<String>, handler: H) -> QueueResult<()> {
        let job_type = job_type.into();

        if job_type.trim().is_empty() {
            return Err(QueueError::MissingJobType);
        }
        if self.handlers.contains_key(&job_type) {
            return Err(QueueError::Config(format!("Job type '{}' already registered", job_type)));
        }

        self.handlers.insert(job_type, Arc::new(handler));
        Ok(())
    }

    /// Register a JSON-decoded job under `J::JOB_TYPE`
    #[cfg(feature = "json")]
    pub fn register_job<J: TypedJob>(&mut self) -> QueueResult<()> {
        self.register(
            J::JOB_TYPE,
            TypedHandler::<J> {
                _phantom: std::marker::PhantomData,
            },
        )
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for WorkMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkMap")
            .field("job_types", &self.job_types())
            .finish()
    }
}
