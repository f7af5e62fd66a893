//! PostgreSQL implementation of the job queue.
//!
//! Jobs live in a single `ticket_queue_jobs` table keyed by `(queue_name, id)`.
//! Delayed jobs are ordinary rows with a future `ready_at`; the claim query
//! picks the oldest row whose `ready_at` has passed using
//! `FOR UPDATE SKIP LOCKED`, so concurrent workers never receive the same job.
//! Cancellation and the completion transitions are conditional updates on the
//! current status, which is what resolves a cancel racing a claim.

use super::{DatabaseQueue, JobQueue, STALLED_MESSAGE, not_active, select_counts};
use crate::{
    Result, TicketQueueError,
    job::{Job, JobHandle, JobOptions, JobState},
    retry::BackoffPolicy,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Postgres, types::Json};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info};

const JOB_COLUMNS: &str = "queue_name, id, job_type, payload, status, attempts_made, attempts_max, \
     backoff, created_at, ready_at, started_at, finished_at, error_message, claimed_by";

#[derive(FromRow, Clone)]
pub(crate) struct JobRow {
    pub queue_name: String,
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts_made: i32,
    pub attempts_max: i32,
    pub backoff: Option<Json<BackoffPolicy>>,
    pub created_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub claimed_by: Option<String>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            queue_name: self.queue_name,
            job_type: self.job_type,
            payload: self.payload,
            state: self.status.parse()?,
            attempts_made: self.attempts_made.max(0) as u32,
            attempts_max: self.attempts_max.max(1) as u32,
            backoff: self.backoff.map(|Json(policy)| policy),
            created_at: self.created_at,
            ready_at: self.ready_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_message: self.error_message,
            claimed_by: self.claimed_by,
        })
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Attempt budgets are stored as `INTEGER`; larger budgets saturate.
fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

impl JobQueue<Postgres> {
    /// Error for a guarded transition that matched no row.
    async fn transition_error(&self, job_id: &str) -> TicketQueueError {
        match self.get_job(job_id).await {
            Ok(Some(_)) => not_active(job_id, &self.queue_name),
            Ok(None) => TicketQueueError::JobNotFound {
                id: job_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl DatabaseQueue for JobQueue<Postgres> {
    fn name(&self) -> &str {
        &self.queue_name
    }

    fn open_sibling(&self, queue_name: &str) -> Self {
        JobQueue::new(Arc::clone(&self.broker), queue_name)
    }

    async fn create_tables(&self) -> Result<()> {
        let pool = self.pool()?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ticket_queue_jobs (
                queue_name VARCHAR NOT NULL,
                id VARCHAR NOT NULL,
                job_type VARCHAR NOT NULL,
                payload JSONB NOT NULL,
                status VARCHAR NOT NULL,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                attempts_max INTEGER NOT NULL DEFAULT 1,
                backoff JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                ready_at TIMESTAMPTZ NOT NULL,
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                error_message TEXT,
                claimed_by VARCHAR,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_ticket_queue_jobs_claim
            ON ticket_queue_jobs (queue_name, status, ready_at, created_at)
            "#,
        )
        .execute(pool)
        .await?;

        info!("Job table ready");
        Ok(())
    }

    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobHandle> {
        let pool = self.pool()?;
        let now = Utc::now();
        let job = Job::new(&self.queue_name, job_type, payload, options, now);

        // A finished row with the same id is replaced; a live one is left alone
        // and the insert returns nothing.
        let inserted = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO ticket_queue_jobs
            (queue_name, id, job_type, payload, status, attempts_made, attempts_max, backoff, created_at, ready_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9)
            ON CONFLICT (queue_name, id) DO UPDATE SET
                job_type = EXCLUDED.job_type,
                payload = EXCLUDED.payload,
                status = EXCLUDED.status,
                attempts_made = 0,
                attempts_max = EXCLUDED.attempts_max,
                backoff = EXCLUDED.backoff,
                created_at = EXCLUDED.created_at,
                ready_at = EXCLUDED.ready_at,
                started_at = NULL,
                finished_at = NULL,
                error_message = NULL,
                claimed_by = NULL
            WHERE ticket_queue_jobs.status IN ('completed', 'failed', 'removed')
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(&job.queue_name)
        .bind(&job.id)
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(attempts_to_db(job.attempts_max))
        .bind(job.backoff.map(Json))
        .bind(job.created_at)
        .bind(job.ready_at)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = inserted {
            let job = row.into_job()?;
            debug!("Enqueued job {} in {} as {}", job.id, job.queue_name, job.state);
            return Ok(job.handle(now, false));
        }

        match self.get_job(&job.id).await? {
            Some(existing) => {
                debug!(
                    "Job {} already {} in {}; reusing it",
                    existing.id, existing.state, existing.queue_name
                );
                Ok(existing.handle(Utc::now(), true))
            }
            None => Err(TicketQueueError::Queue {
                message: format!(
                    "Job {} conflicted on insert but no longer exists in {}",
                    job.id, self.queue_name
                ),
            }),
        }
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ticket_queue_jobs
            SET status = 'removed', finished_at = $3
            WHERE queue_name = $1 AND id = $2 AND status IN ('waiting', 'delayed')
            "#,
        )
        .bind(&self.queue_name)
        .bind(job_id)
        .bind(Utc::now())
        .execute(self.pool()?)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM ticket_queue_jobs WHERE queue_name = $1 AND id = $2",
            JOB_COLUMNS
        ))
        .bind(&self.queue_name)
        .bind(job_id)
        .fetch_optional(self.pool()?)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE ticket_queue_jobs
            SET status = 'active', started_at = $2, attempts_made = attempts_made + 1, claimed_by = $3
            WHERE (queue_name, id) = (
                SELECT queue_name, id FROM ticket_queue_jobs
                WHERE queue_name = $1
                AND status IN ('waiting', 'delayed')
                AND ready_at <= $2
                ORDER BY ready_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(&self.queue_name)
        .bind(Utc::now())
        .bind(worker_id)
        .fetch_optional(self.pool()?)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn complete_job(&self, job_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ticket_queue_jobs
            SET status = 'completed', finished_at = $3, claimed_by = NULL
            WHERE queue_name = $1 AND id = $2 AND status = 'active'
            "#,
        )
        .bind(&self.queue_name)
        .bind(job_id)
        .bind(Utc::now())
        .execute(self.pool()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id).await);
        }
        Ok(())
    }

    async fn retry_job(&self, job_id: &str, delay: Duration, error_message: &str) -> Result<()> {
        let now = Utc::now();
        let state = if delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        let result = sqlx::query(
            r#"
            UPDATE ticket_queue_jobs
            SET status = $3, ready_at = $4, error_message = $5, started_at = NULL, claimed_by = NULL
            WHERE queue_name = $1 AND id = $2 AND status = 'active'
            "#,
        )
        .bind(&self.queue_name)
        .bind(job_id)
        .bind(state.as_str())
        .bind(now + to_chrono(delay))
        .bind(error_message)
        .execute(self.pool()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id).await);
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ticket_queue_jobs
            SET status = 'failed', error_message = $3, finished_at = $4, claimed_by = NULL
            WHERE queue_name = $1 AND id = $2 AND status = 'active'
            "#,
        )
        .bind(&self.queue_name)
        .bind(job_id)
        .bind(error_message)
        .bind(Utc::now())
        .execute(self.pool()?)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(job_id).await);
        }
        Ok(())
    }

    async fn requeue_stalled(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now();

        // The status guard keeps this from touching a row whose worker
        // recorded its result in the meantime.
        let result = sqlx::query(
            r#"
            UPDATE ticket_queue_jobs
            SET status = CASE WHEN attempts_made < attempts_max THEN 'waiting' ELSE 'failed' END,
                ready_at = CASE WHEN attempts_made < attempts_max THEN $3 ELSE ready_at END,
                started_at = CASE WHEN attempts_made < attempts_max THEN NULL ELSE started_at END,
                finished_at = CASE WHEN attempts_made < attempts_max THEN NULL ELSE $3 END,
                error_message = $4,
                claimed_by = NULL
            WHERE queue_name = $1 AND status = 'active' AND started_at <= $2
            "#,
        )
        .bind(&self.queue_name)
        .bind(now - to_chrono(older_than))
        .bind(now)
        .bind(STALLED_MESSAGE)
        .execute(self.pool()?)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!("Released {} stalled job(s) in {}", released, self.queue_name);
        }
        Ok(released)
    }

    async fn get_counts(&self, states: &[JobState]) -> Result<HashMap<JobState, u64>> {
        // Delayed rows whose timer has run out are reported as waiting.
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT
                CASE WHEN status = 'delayed' AND ready_at <= $2 THEN 'waiting' ELSE status END AS state,
                COUNT(*)
            FROM ticket_queue_jobs
            WHERE queue_name = $1
            GROUP BY 1
            "#,
        )
        .bind(&self.queue_name)
        .bind(Utc::now())
        .fetch_all(self.pool()?)
        .await?;

        let mut observed = HashMap::new();
        for (state, count) in rows {
            observed.insert(state.parse::<JobState>()?, count.max(0) as u64);
        }

        Ok(select_counts(observed, states))
    }

    async fn close(&self) -> Result<()> {
        self.mark_closed();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}
