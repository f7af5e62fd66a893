//! Named, durable job queues.
//!
//! The operations are defined by the [`DatabaseQueue`] trait. [`JobQueue`] is
//! the SQL-backed implementation (PostgreSQL behind the `postgres` feature);
//! the `test` feature adds an in-memory backend with a controllable clock.
//!
//! A queue is a handle bound to one queue name on a shared broker. Several
//! handles can point at the same broker; closing a handle never closes the
//! broker itself.

use crate::{
    Result, TicketQueueError,
    broker::BrokerConnection,
    job::{Job, JobHandle, JobOptions, JobState},
};
use async_trait::async_trait;
use sqlx::{Database, Pool};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::debug;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(any(test, feature = "test"))]
pub mod test;

/// Operations on a single named queue.
///
/// Enqueue, cancel and the count snapshot are what the application calls.
/// Dequeue and the completion transitions are driven by the
/// [`Worker`](crate::worker::Worker).
#[async_trait]
pub trait DatabaseQueue: Send + Sync {
    /// Name of the queue this handle is bound to.
    fn name(&self) -> &str;

    /// A new handle on another named queue of the same broker.
    fn open_sibling(&self, queue_name: &str) -> Self
    where
        Self: Sized;

    /// Create the backing storage if it does not exist yet.
    async fn create_tables(&self) -> Result<()>;

    /// Durably record a job and return its handle.
    ///
    /// If a waiting, delayed or active job with the same id exists, nothing is
    /// written and the existing job's handle is returned with
    /// `deduplicated = true`. A finished record with the same id is replaced.
    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobHandle>;

    /// Remove a job that has not been claimed yet.
    ///
    /// Returns `false` if the job is unknown, already active or finished.
    /// In-flight work is never interrupted.
    async fn cancel(&self, job_id: &str) -> Result<bool>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Atomically claim the oldest eligible job for `worker_id`.
    ///
    /// The claim marks the job active and counts the attempt. At most one
    /// caller receives a given job.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>>;

    async fn complete_job(&self, job_id: &str) -> Result<()>;

    /// Put an active job back for another attempt after `delay`.
    async fn retry_job(&self, job_id: &str, delay: Duration, error_message: &str) -> Result<()>;

    /// Mark an active job as permanently failed.
    async fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()>;

    /// Hand back active jobs claimed at least `older_than` ago.
    ///
    /// Such a job belongs to a worker that crashed or could not record a
    /// result. The claim already consumed an attempt: a job with attempts
    /// left becomes waiting again, the rest are marked failed. Returns the
    /// number of jobs released.
    async fn requeue_stalled(&self, older_than: Duration) -> Result<u64>;

    /// Snapshot of job counts for the requested states. Every requested state
    /// is present in the result, zero if no job is in it.
    async fn get_counts(&self, states: &[JobState]) -> Result<HashMap<JobState, u64>>;

    /// Stop accepting work on this handle. Safe to call more than once.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// SQL-backed queue handle.
///
/// # Examples
///
/// ```rust,no_run
/// use ticket_queue::{JobQueue, broker::BrokerConnection, job::JobOptions, queue::DatabaseQueue};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # #[cfg(feature = "postgres")]
/// # {
/// let pool = sqlx::PgPool::connect("postgresql://localhost/ticket_queue").await?;
/// let broker = Arc::new(BrokerConnection::new(pool));
/// let queue = JobQueue::new(broker, "tickets");
///
/// let handle = queue
///     .enqueue("ticket.notify", json!({"ticket_id": 42}), JobOptions::new("notify-42"))
///     .await?;
/// assert!(!handle.deduplicated);
/// # }
/// # Ok(())
/// # }
/// ```
pub struct JobQueue<DB: Database> {
    pub(crate) broker: Arc<BrokerConnection<DB>>,
    pub(crate) queue_name: String,
    pub(crate) closed: AtomicBool,
}

impl<DB: Database> JobQueue<DB> {
    pub fn new(broker: Arc<BrokerConnection<DB>>, queue_name: impl Into<String>) -> Self {
        Self {
            broker,
            queue_name: queue_name.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn broker(&self) -> &Arc<BrokerConnection<DB>> {
        &self.broker
    }

    /// The broker pool, failing if this handle or the broker has been closed.
    pub(crate) fn pool(&self) -> Result<&Pool<DB>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TicketQueueError::QueueClosed {
                queue_name: self.queue_name.clone(),
            });
        }
        self.broker.pool()
    }

    pub(crate) fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Queue handle {} closed", self.queue_name);
        }
    }
}

/// Fill in zero for every requested state missing from `observed`.
pub(crate) fn select_counts(
    observed: HashMap<JobState, u64>,
    states: &[JobState],
) -> HashMap<JobState, u64> {
    states
        .iter()
        .map(|state| (*state, observed.get(state).copied().unwrap_or(0)))
        .collect()
}

/// Error message stored on a job released by
/// [`requeue_stalled`](DatabaseQueue::requeue_stalled).
pub const STALLED_MESSAGE: &str = "claim expired before a result was recorded";

pub(crate) fn not_active(job_id: &str, queue_name: &str) -> TicketQueueError {
    TicketQueueError::Queue {
        message: format!("Job {} is not active in queue {}", job_id, queue_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_counts_zero_fills() {
        let mut observed = HashMap::new();
        observed.insert(JobState::Waiting, 2);
        observed.insert(JobState::Removed, 5);

        let counts = select_counts(observed, &[JobState::Waiting, JobState::Failed]);

        assert_eq!(counts.len(), 2);
        assert_eq!(counts[&JobState::Waiting], 2);
        assert_eq!(counts[&JobState::Failed], 0);
        assert!(!counts.contains_key(&JobState::Removed));
    }
}
