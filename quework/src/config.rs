use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{backoff::BackoffPolicy, QueueError, QueueResult, DEFAULT_QUEUE};

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers
    pub workers: usize,
    /// Queue the workers claim from
    pub queue: String,
    /// First idle poll delay after finding the queue empty
    pub poll_interval: Duration,
    /// Idle poll delay doubles up to this cap
    pub max_poll_interval: Duration,
    /// Retry spacing for failed jobs
    pub backoff: BackoffPolicy,
    /// Pause after a store or connection error
    pub store_error_pause: Duration,
    /// Unlock attempts before the connection is closed instead
    pub release_attempts: u32,
    pub release_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue: DEFAULT_QUEUE.to_string(),
            poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            store_error_pause: Duration::from_secs(1),
            release_attempts: 3,
            release_retry_delay: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    /// Defaults overlaid with `QUEWORK_*` environment variables
    pub fn from_env() -> QueueResult<Self> {
        let mut config = Self::default();

        if let Some(workers) = env_parse::<usize>("QUEWORK_WORKERS")? {
            config.workers = workers;
        }
        if let Ok(queue) = env::var("QUEWORK_QUEUE") {
            config.queue = queue;
        }
        if let Some(ms) = env_parse::<u64>("QUEWORK_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("QUEWORK_MAX_POLL_INTERVAL_MS")? {
            config.max_poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("QUEWORK_BACKOFF_BASE_MS")? {
            config.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("QUEWORK_BACKOFF_MAX_MS")? {
            config.backoff.max = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Idle polling starts at `min` and doubles up to `max`
    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.poll_interval = min;
        self.max_poll_interval = max;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_store_error_pause(mut self, pause: Duration) -> Self {
        self.store_error_pause = pause;
        self
    }

    /// Unlock attempts per job and the delay between them
    pub fn with_release_policy(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.release_attempts = attempts;
        self.release_retry_delay = retry_delay;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.workers == 0 {
            return Err(QueueError::Config("workers must be at least 1".to_string()));
        }
        if self.release_attempts == 0 {
            return Err(QueueError::Config("release_attempts must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(QueueError::Config("poll_interval must be positive".to_string()));
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(QueueError::Config(
                "max_poll_interval must not be shorter than poll_interval".to_string(),
            ));
        }
        if self.backoff.max < self.backoff.base {
            return Err(QueueError::Config("backoff max must not be shorter than its base".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> QueueResult<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::Config(format!("{} is not valid: {:?}", key, raw))),
        Err(_) => Ok(None),
    }
}
