use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::JobPriority;
use crate::{QueueError, QueueResult};

/// Queue used when an enqueue request does not name one
pub const DEFAULT_QUEUE: &str = "";

/// Enqueue request. Unset fields are filled with defaults by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    /// Handler key in the work map
    pub job_type: String,

    /// Opaque payload handed verbatim to the handler
    pub args: Vec<u8>,

    pub queue: Option<String>,

    pub priority: Option<JobPriority>,

    /// Earliest time the job may be claimed
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: impl Into<Vec<u8>>) -> Self {
        self.args = args.into();
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: impl Into<JobPriority>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Validate and fill defaults, producing the row to insert
    pub fn into_message(self, now: DateTime<Utc>) -> QueueResult<JobMessage> {
        if self.job_type.trim().is_empty() {
            return Err(QueueError::MissingJobType);
        }

        Ok(JobMessage {
            queue: self.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            priority: self.priority.unwrap_or_default(),
            run_at: self.run_at.unwrap_or(now),
            job_type: self.job_type,
            args: self.args,
        })
    }
}

/// Fully populated job row handed to the store on insert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub queue: String,
    pub priority: JobPriority,
    pub run_at: DateTime<Utc>,
    pub job_type: String,
    pub args: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_defaults() {
        let now = Utc::now();
        let message = NewJob::new("PrintName").into_message(now).unwrap();

        assert_eq!(message.queue, DEFAULT_QUEUE);
        assert_eq!(message.priority, JobPriority::DEFAULT);
        assert_eq!(message.run_at, now);
        assert!(message.args.is_empty());
    }

    #[test]
    fn keeps_explicit_fields() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(30);
        let message = NewJob::new("PrintName")
            .with_args(br#"{"name":"bgentry"}"#.to_vec())
            .with_queue("mail")
            .with_priority(1i16)
            .with_run_at(later)
            .into_message(now)
            .unwrap();

        assert_eq!(message.queue, "mail");
        assert_eq!(message.priority, JobPriority(1));
        assert_eq!(message.run_at, later);
        assert_eq!(message.args, br#"{"name":"bgentry"}"#.to_vec());
    }

    #[test]
    fn rejects_blank_job_type() {
        let result = NewJob::new("  ").into_message(Utc::now());
        assert!(matches!(result, Err(QueueError::MissingJobType)));
    }
}
