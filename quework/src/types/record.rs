use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobMessage, JobPriority};
use crate::backoff::BackoffPolicy;
use crate::job::Outcome;
use crate::JobError;

/// Where a job sits in its lifecycle.
///
/// `Pending` covers fresh, backed-off and rescheduled rows alike; the only
/// difference between them is `run_at`. Nothing leaves `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Claimed,
    Deleted,
}

impl JobState {
    /// Check whether `next` is reachable from this state in one step
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Claimed)
                | (Self::Claimed, Self::Pending)
                | (Self::Claimed, Self::Deleted)
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Deleted => "deleted",
        }
    }
}

/// A job row as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub priority: JobPriority,
    pub run_at: DateTime<Utc>,
    pub job_type: String,
    pub args: Vec<u8>,
    pub error_count: i32,
    pub last_error: Option<String>,
}

impl Job {
    /// Build the stored row for a freshly inserted message
    pub fn from_message(id: JobId, message: JobMessage) -> Self {
        Self {
            id,
            queue: message.queue,
            priority: message.priority,
            run_at: message.run_at,
            job_type: message.job_type,
            args: message.args,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }

    /// Claim ordering key
    pub fn claim_key(&self) -> (JobPriority, DateTime<Utc>, JobId) {
        (self.priority, self.run_at, self.id)
    }

    /// Turn a handler outcome into the store update that resolves this job.
    ///
    /// `run_at` is never moved backward: a retry or reschedule time earlier
    /// than the current one is clamped to it.
    pub fn resolve(
        &self,
        outcome: Result<Outcome, JobError>,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> Resolution {
        match outcome {
            Ok(Outcome::Done) => Resolution::Delete,
            Ok(Outcome::Reschedule { args, run_at }) => Resolution::Reschedule {
                args: args.unwrap_or_else(|| self.args.clone()),
                run_at: run_at.max(self.run_at),
            },
            Err(err) => {
                let error_count = self.error_count.saturating_add(1);
                Resolution::Retry {
                    error_count,
                    last_error: err.message().to_string(),
                    run_at: backoff.retry_at(now, error_count).max(self.run_at),
                }
            }
        }
    }
}

/// Store update that ends a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Handler succeeded
    Delete,

    /// Handler failed or its type is unknown
    Retry {
        error_count: i32,
        last_error: String,
        run_at: DateTime<Utc>,
    },

    /// Handler asked to run again later; error state untouched
    Reschedule {
        args: Vec<u8>,
        run_at: DateTime<Utc>,
    },
}

impl Resolution {
    /// State the job lands in once this resolution is applied
    pub fn next_state(&self) -> JobState {
        match self {
            Self::Delete => JobState::Deleted,
            Self::Retry { .. } | Self::Reschedule { .. } => JobState::Pending,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Delete => "delete",
            Self::Retry { .. } => "retry",
            Self::Reschedule { .. } => "reschedule",
        }
    }
}
