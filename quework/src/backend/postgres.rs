//! PostgreSQL store using session-level advisory locks.
//!
//! A claim leases one pooled connection and keeps it until the job is
//! resolved and unlocked. Connections whose unlock could not be confirmed are
//! closed rather than pooled, so a stray lock never outlives its job's claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use tracing::{debug, instrument};

use crate::{backend::QueueBackend, Job, JobId, JobMessage, JobPriority, QueueError, QueueResult};

/// Table definition and claim index
pub const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS que_jobs (
        priority    smallint    NOT NULL DEFAULT 100,
        run_at      timestamptz NOT NULL DEFAULT now(),
        job_id      bigserial   NOT NULL PRIMARY KEY,
        job_class   text        NOT NULL,
        args        bytea       NOT NULL DEFAULT ''::bytea,
        error_count integer     NOT NULL DEFAULT 0,
        last_error  text,
        queue       text        NOT NULL DEFAULT ''
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS que_jobs_claim_idx
        ON que_jobs (queue, priority, run_at, job_id)
    "#,
];

// Walks candidates in claim order, trying the advisory lock on each and
// stopping at the first one it gets. Recursion ends once a lock is taken, so
// at most one lock is held per claim. Rows locked by other sessions are
// passed over without waiting.
const LOCK_JOB_SQL: &str = r#"
WITH RECURSIVE jobs AS (
    SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
    FROM (
        SELECT j
        FROM que_jobs AS j
        WHERE queue = $1::text
          AND run_at <= now()
        ORDER BY priority, run_at, job_id
        LIMIT 1
    ) AS t1
    UNION ALL (
        SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
        FROM (
            SELECT (
                SELECT j
                FROM que_jobs AS j
                WHERE queue = $1::text
                  AND run_at <= now()
                  AND (priority, run_at, job_id) > (jobs.priority, jobs.run_at, jobs.job_id)
                ORDER BY priority, run_at, job_id
                LIMIT 1
            ) AS j
            FROM jobs
            WHERE NOT jobs.locked
            LIMIT 1
        ) AS t1
    )
)
SELECT job_id, queue, priority, run_at, job_class, args, error_count, last_error
FROM jobs
WHERE locked
LIMIT 1
"#;

// The scan and the lock are not one snapshot: the row may have been worked
// and deleted or backed off in between. Re-read it under the lock.
const RECHECK_JOB_SQL: &str = r#"
SELECT job_id, queue, priority, run_at, job_class, args, error_count, last_error
FROM que_jobs
WHERE job_id = $1
  AND queue = $2::text
  AND run_at <= now()
"#;

const INSERT_JOB_SQL: &str = r#"
INSERT INTO que_jobs (queue, priority, run_at, job_class, args)
VALUES ($1, $2, $3, $4, $5)
RETURNING job_id
"#;

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: i64,
    queue: String,
    priority: i16,
    run_at: DateTime<Utc>,
    job_class: String,
    args: Vec<u8>,
    error_count: i32,
    last_error: Option<String>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: JobId(row.job_id),
            queue: row.queue,
            priority: JobPriority(row.priority),
            run_at: row.run_at,
            job_type: row.job_class,
            args: row.args,
            error_count: row.error_count,
            last_error: row.last_error,
        }
    }
}

/// Store backed by a `que_jobs` table
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    max_lock_attempts: u32,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_lock_attempts: 2,
        }
    }

    /// Connect a new pool
    pub async fn connect(database_url: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Scan-then-recheck rounds per claim before reporting the queue empty
    pub fn with_max_lock_attempts(mut self, attempts: u32) -> Self {
        self.max_lock_attempts = attempts.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job table and claim index if missing
    pub async fn migrate(&self) -> QueueResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn affected(rows: u64, id: JobId) -> QueueResult<()> {
    if rows == 0 {
        Err(QueueError::JobNotFound(id))
    } else {
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    type Conn = PoolConnection<Postgres>;

    async fn acquire(&self) -> QueueResult<Self::Conn> {
        Ok(self.pool.acquire().await?)
    }

    async fn release(&self, conn: Self::Conn) {
        drop(conn);
    }

    fn discard(&self, mut conn: Self::Conn) {
        conn.close_on_drop();
        drop(conn);
    }

    #[instrument(skip(self, message), fields(job_type = %message.job_type), level = "debug")]
    async fn insert(&self, message: JobMessage) -> QueueResult<JobId> {
        let id: i64 = sqlx::query_scalar(INSERT_JOB_SQL)
            .bind(&message.queue)
            .bind(message.priority.get())
            .bind(message.run_at)
            .bind(&message.job_type)
            .bind(&message.args)
            .fetch_one(&self.pool)
            .await?;
        Ok(JobId(id))
    }

    async fn claim_next(&self, conn: &mut Self::Conn, queue: &str) -> QueueResult<Option<Job>> {
        for attempt in 1..=self.max_lock_attempts {
            let Some(candidate) = sqlx::query_as::<_, JobRow>(LOCK_JOB_SQL)
                .bind(queue)
                .fetch_optional(&mut **conn)
                .await?
            else {
                return Ok(None);
            };

            let id = candidate.job_id;
            let current = sqlx::query_as::<_, JobRow>(RECHECK_JOB_SQL)
                .bind(id)
                .bind(queue)
                .fetch_optional(&mut **conn)
                .await?;

            match current {
                Some(row) => return Ok(Some(row.into())),
                None => {
                    debug!(job_id = id, attempt, "job changed before lock, trying again");
                    self.release_lock(conn, JobId(id)).await?;
                }
            }
        }

        Ok(None)
    }

    async fn release_lock(&self, conn: &mut Self::Conn, id: JobId) -> QueueResult<()> {
        sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(id.get())
            .fetch_one(&mut **conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, conn: &mut Self::Conn, id: JobId) -> QueueResult<()> {
        let result = sqlx::query("DELETE FROM que_jobs WHERE job_id = $1")
            .bind(id.get())
            .execute(&mut **conn)
            .await?;
        affected(result.rows_affected(), id)
    }

    async fn update_for_retry(
        &self,
        conn: &mut Self::Conn,
        id: JobId,
        error_count: i32,
        last_error: &str,
        run_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let result = sqlx::query(
            "UPDATE que_jobs SET error_count = $2, last_error = $3, run_at = $4 WHERE job_id = $1",
        )
        .bind(id.get())
        .bind(error_count)
        .bind(last_error)
        .bind(run_at)
        .execute(&mut **conn)
        .await?;
        affected(result.rows_affected(), id)
    }

    async fn update_for_reschedule(
        &self,
        conn: &mut Self::Conn,
        id: JobId,
        args: &[u8],
        run_at: DateTime<Utc>,
    ) -> QueueResult<()> {
        let result = sqlx::query("UPDATE que_jobs SET args = $2, run_at = $3 WHERE job_id = $1")
            .bind(id.get())
            .bind(args)
            .bind(run_at)
            .execute(&mut **conn)
            .await?;
        affected(result.rows_affected(), id)
    }
}
