pub mod registry;

pub use registry::{Handler, WorkMap};

use chrono::{DateTime, Utc};

#[cfg(feature = "json")]
use async_trait::async_trait;
#[cfg(feature = "json")]
use serde::{de::DeserializeOwned, Serialize};

#[cfg(feature = "json")]
use crate::{Job, JobError, JobPriority, DEFAULT_QUEUE};

/// Successful handler result.
///
/// Failure is the `Err` side of the handler's return value, so success,
/// error and reschedule are mutually exclusive per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Work finished; the job is deleted
    Done,

    /// Run the job again at `run_at`, optionally with new args.
    /// Error count and last error are left untouched.
    Reschedule {
        args: Option<Vec<u8>>,
        run_at: DateTime<Utc>,
    },
}

impl Outcome {
    pub fn reschedule_at(run_at: DateTime<Utc>) -> Self {
        Self::Reschedule { args: None, run_at }
    }

    /// Replace the args carried by a reschedule. No effect on `Done`.
    pub fn with_args(self, new_args: impl Into<Vec<u8>>) -> Self {
        match self {
            Self::Reschedule { run_at, .. } => Self::Reschedule {
                args: Some(new_args.into()),
                run_at,
            },
            done => done,
        }
    }
}

/// Job whose args are a JSON-encoded `Self`.
///
/// Register with [`WorkMap::register_job`] and enqueue with
/// [`Client::enqueue_job`](crate::Client::enqueue_job).
#[cfg(feature = "json")]
#[async_trait]
pub trait TypedJob: Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Work map key
    const JOB_TYPE: &'static str;

    const PRIORITY: JobPriority = JobPriority::DEFAULT;

    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Run with the decoded args. `job` is the row being worked.
    async fn perform(self, job: &Job) -> Result<Outcome, JobError>;
}
