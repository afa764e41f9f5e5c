//! # quework: Durable Jobs on Advisory Locks
//!
//! **A job queue whose mutual exclusion lives in the database session**
//!
//! Producers insert jobs into a single table. Workers claim them one at a
//! time by taking a session-scoped advisory lock on the job id, run the
//! handler registered for the job's type, and resolve the row before
//! unlocking. Because the lock belongs to the connection, a worker that dies
//! mid-job loses its connection and with it the lock: the job is claimable
//! again with no heartbeat, lease or reaper involved.
//!
//! ## Guarantees
//!
//! - **One worker per job**: a claimed job is invisible to every other claimer,
//!   across processes, for as long as its lock is held
//! - **Skip, don't wait**: claimers walk `(priority, run_at, id)` order and pass
//!   over locked rows, so a busy job never blocks the queue behind it
//! - **Backoff on failure**: handler errors bump `error_count` and push
//!   `run_at` out by a capped exponential delay; nothing is dropped
//! - **Cooperative shutdown**: stopping a pool halts new claims and waits for
//!   running handlers to return
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quework::prelude::*;
//! use quework::backend::memory::MemoryBackend;
//!
//! # async fn demo() -> QueueResult<()> {
//! let client = Client::new(MemoryBackend::new());
//!
//! let mut work_map = WorkMap::new();
//! work_map.register("PrintName", |job: Job| async move {
//!     println!("Hello {}!", String::from_utf8_lossy(&job.args));
//!     Ok::<_, JobError>(Outcome::Done)
//! })?;
//!
//! let pool = WorkerPool::new(&client, work_map, WorkerConfig::default());
//! pool.start()?;
//!
//! client.enqueue(NewJob::new("PrintName").with_args(b"bgentry".to_vec())).await?;
//!
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod job;
pub mod locker;
pub mod observability;
pub mod pool;
pub mod types;
pub mod worker;

pub use backend::QueueBackend;
pub use backoff::BackoffPolicy;
pub use client::Client;
pub use config::WorkerConfig;
pub use error::{JobError, QueueError, QueueResult};
pub use job::{Handler, Outcome, WorkMap};
pub use locker::{LockedJob, Locker};
pub use observability::{MetricsSnapshot, WorkerMetrics};
pub use pool::WorkerPool;
pub use types::{Job, JobId, JobMessage, JobPriority, JobState, NewJob, Resolution, DEFAULT_QUEUE};
pub use worker::Worker;

#[cfg(feature = "json")]
pub use job::TypedJob;

#[cfg(feature = "memory")]
pub use backend::memory::MemoryBackend;

#[cfg(feature = "postgres")]
pub use backend::postgres::PostgresBackend;

/// Everything needed to enqueue jobs and run workers
pub mod prelude {
    pub use crate::{
        Client, Job, JobError, JobId, JobPriority, NewJob, Outcome, QueueBackend, QueueError, QueueResult,
        WorkMap, WorkerConfig, WorkerPool,
    };

    #[cfg(feature = "json")]
    pub use crate::TypedJob;

    pub use async_trait::async_trait;
}
