//! In-memory broker and queue for tests.
//!
//! [`TestBroker`] holds every job of every queue in memory and reads time from
//! a [`MockClock`], so delays and backoff can be stepped through instantly.
//! [`TestQueue`] handles opened from the same broker share that storage, just
//! as [`JobQueue`](super::JobQueue) handles share a database.
//!
//! The state transitions mirror the PostgreSQL backend: the claim happens
//! under one write lock, and cancel only succeeds on a job that has not been
//! claimed yet.
//!
//! # Examples
//!
//! ```rust
//! use ticket_queue::queue::{DatabaseQueue, test::{MockClock, TestQueue}};
//! use ticket_queue::job::JobOptions;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = MockClock::new();
//! let queue = TestQueue::with_clock(clock.clone());
//!
//! let options = JobOptions::new("sla-1").with_delay(Duration::from_secs(900));
//! queue.enqueue("ticket.sla", json!({"ticket_id": 1}), options).await?;
//!
//! assert!(queue.dequeue("worker-1").await?.is_none());
//!
//! clock.advance(chrono::Duration::minutes(15));
//! let job = queue.dequeue("worker-1").await?.unwrap();
//! assert_eq!(job.id, "sla-1");
//! # Ok(())
//! # }
//! ```

use super::{DatabaseQueue, STALLED_MESSAGE, not_active, select_counts};
use crate::{
    DEFAULT_QUEUE_NAME, Result, TicketQueueError,
    broker::{Broker, BrokerHealth},
    job::{Job, JobHandle, JobId, JobOptions, JobState},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::debug;

/// Mock clock for controlling time in tests.
///
/// Clones share the same instant, so a test can keep one clone and advance it
/// while the broker reads from another.
///
/// ```rust
/// use ticket_queue::queue::test::MockClock;
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
/// clock.advance(Duration::seconds(90));
/// assert_eq!((clock.now() - start).num_seconds(), 90);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current time.
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Advance the mock time by the given duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

type StorageKey = (String, JobId);

struct TestBrokerInner {
    jobs: RwLock<HashMap<StorageKey, Job>>,
    clock: MockClock,
    closed: AtomicBool,
    available: AtomicBool,
}

/// In-memory broker. Cheap to clone; clones share storage and state.
#[derive(Clone)]
pub struct TestBroker {
    inner: Arc<TestBrokerInner>,
}

impl TestBroker {
    pub fn new() -> Self {
        Self::with_clock(MockClock::new())
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            inner: Arc::new(TestBrokerInner {
                jobs: RwLock::new(HashMap::new()),
                clock,
                closed: AtomicBool::new(false),
                available: AtomicBool::new(true),
            }),
        }
    }

    pub fn clock(&self) -> &MockClock {
        &self.inner.clock
    }

    /// Open a queue handle on this broker.
    pub fn queue(&self, queue_name: impl Into<String>) -> TestQueue {
        TestQueue {
            queue_name: queue_name.into(),
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the store going away or coming back. While unavailable every
    /// queue operation fails with a retryable
    /// [`BrokerUnavailable`](TicketQueueError::BrokerUnavailable).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored records across all queues, finished ones included.
    pub async fn stored_jobs(&self) -> usize {
        self.inner.jobs.read().await.len()
    }

    fn check(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TicketQueueError::BrokerUnavailable {
                message: "broker connection is closed".to_string(),
            });
        }
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(TicketQueueError::BrokerUnavailable {
                message: "broker is unreachable".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for TestBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for TestBroker {
    async fn health(&self) -> BrokerHealth {
        if self.is_closed() {
            return BrokerHealth::closed();
        }
        match self.check() {
            Ok(()) => BrokerHealth::healthy(Duration::ZERO),
            Err(e) => BrokerHealth::unavailable(e.to_string()),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("Test broker closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// In-memory queue handle bound to one queue name of a [`TestBroker`].
pub struct TestQueue {
    queue_name: String,
    broker: TestBroker,
    closed: AtomicBool,
}

impl TestQueue {
    /// A queue named [`DEFAULT_QUEUE_NAME`] on a fresh broker.
    pub fn new() -> Self {
        TestBroker::new().queue(DEFAULT_QUEUE_NAME)
    }

    pub fn with_clock(clock: MockClock) -> Self {
        TestBroker::with_clock(clock).queue(DEFAULT_QUEUE_NAME)
    }

    pub fn broker(&self) -> &TestBroker {
        &self.broker
    }

    pub fn clock(&self) -> &MockClock {
        self.broker.clock()
    }

    fn now(&self) -> DateTime<Utc> {
        self.broker.clock().now()
    }

    fn key(&self, job_id: &str) -> StorageKey {
        (self.queue_name.clone(), job_id.to_string())
    }

    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TicketQueueError::QueueClosed {
                queue_name: self.queue_name.clone(),
            });
        }
        self.broker.check()
    }

    /// Apply `f` to an active job, failing if it is missing or not active.
    async fn update_active<F>(&self, job_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Job, DateTime<Utc>),
    {
        self.check()?;
        let now = self.now();
        let mut jobs = self.broker.inner.jobs.write().await;
        match jobs.get_mut(&self.key(job_id)) {
            Some(job) if job.state == JobState::Active => {
                f(job, now);
                Ok(())
            }
            Some(_) => Err(not_active(job_id, &self.queue_name)),
            None => Err(TicketQueueError::JobNotFound {
                id: job_id.to_string(),
            }),
        }
    }
}

impl Default for TestQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatabaseQueue for TestQueue {
    fn name(&self) -> &str {
        &self.queue_name
    }

    fn open_sibling(&self, queue_name: &str) -> Self {
        self.broker.queue(queue_name)
    }

    async fn create_tables(&self) -> Result<()> {
        self.check()
    }

    async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobHandle> {
        self.check()?;
        let now = self.now();
        let job = Job::new(&self.queue_name, job_type, payload, options, now);
        let key = self.key(&job.id);

        let mut jobs = self.broker.inner.jobs.write().await;
        if let Some(existing) = jobs.get(&key) {
            if !existing.state.is_terminal() {
                debug!(
                    "Job {} already {} in {}; reusing it",
                    existing.id, existing.state, existing.queue_name
                );
                return Ok(existing.handle(now, true));
            }
        }

        let handle = job.handle(now, false);
        jobs.insert(key, job);
        Ok(handle)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        self.check()?;
        let now = self.now();
        let mut jobs = self.broker.inner.jobs.write().await;
        match jobs.get_mut(&self.key(job_id)) {
            Some(job) if job.state.is_cancellable() => {
                job.state = JobState::Removed;
                job.finished_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.check()?;
        Ok(self.broker.inner.jobs.read().await.get(&self.key(job_id)).cloned())
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>> {
        self.check()?;
        let now = self.now();
        let mut jobs = self.broker.inner.jobs.write().await;

        let next = jobs
            .values_mut()
            .filter(|job| job.queue_name == self.queue_name && job.is_claimable(now))
            .min_by(|a, b| {
                a.ready_at
                    .cmp(&b.ready_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            });

        Ok(next.map(|job| {
            job.state = JobState::Active;
            job.started_at = Some(now);
            job.attempts_made += 1;
            job.claimed_by = Some(worker_id.to_string());
            job.clone()
        }))
    }

    async fn complete_job(&self, job_id: &str) -> Result<()> {
        self.update_active(job_id, |job, now| {
            job.state = JobState::Completed;
            job.finished_at = Some(now);
            job.claimed_by = None;
        })
        .await
    }

    async fn retry_job(&self, job_id: &str, delay: Duration, error_message: &str) -> Result<()> {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.update_active(job_id, |job, now| {
            job.state = if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            };
            job.ready_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            job.error_message = Some(error_message.to_string());
            job.started_at = None;
            job.claimed_by = None;
        })
        .await
    }

    async fn fail_job(&self, job_id: &str, error_message: &str) -> Result<()> {
        self.update_active(job_id, |job, now| {
            job.state = JobState::Failed;
            job.error_message = Some(error_message.to_string());
            job.finished_at = Some(now);
            job.claimed_by = None;
        })
        .await
    }

    async fn requeue_stalled(&self, older_than: Duration) -> Result<u64> {
        self.check()?;
        let now = self.now();
        let lease = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        let cutoff = now
            .checked_sub_signed(lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut jobs = self.broker.inner.jobs.write().await;

        let mut released = 0;
        for job in jobs.values_mut().filter(|job| {
            job.queue_name == self.queue_name
                && job.state == JobState::Active
                && job.started_at.is_some_and(|started| started <= cutoff)
        }) {
            if job.has_attempts_left() {
                job.state = JobState::Waiting;
                job.ready_at = now;
                job.started_at = None;
            } else {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
            }
            job.error_message = Some(STALLED_MESSAGE.to_string());
            job.claimed_by = None;
            released += 1;
        }

        Ok(released)
    }

    async fn get_counts(&self, states: &[JobState]) -> Result<HashMap<JobState, u64>> {
        self.check()?;
        let now = self.now();
        let jobs = self.broker.inner.jobs.read().await;

        let mut observed = HashMap::new();
        for job in jobs.values().filter(|job| job.queue_name == self.queue_name) {
            *observed.entry(job.effective_state(now)).or_insert(0) += 1;
        }

        Ok(select_counts(observed, states))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Queue handle {} closed", self.queue_name);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(ticket_id: i64) -> serde_json::Value {
        json!({ "ticket_id": ticket_id })
    }

    #[tokio::test]
    async fn test_mock_clock_controls_delays() {
        let clock = MockClock::new();
        let queue = TestQueue::with_clock(clock.clone());

        let options = JobOptions::new("sla-1").with_delay(Duration::from_secs(60));
        let handle = queue.enqueue("ticket.sla", payload(1), options).await.unwrap();
        assert_eq!(handle.state, JobState::Delayed);

        assert!(queue.dequeue("w").await.unwrap().is_none());
        clock.advance(chrono::Duration::seconds(59));
        assert!(queue.dequeue("w").await.unwrap().is_none());
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, "sla-1");
    }

    #[tokio::test]
    async fn test_dequeue_orders_by_ready_time() {
        let clock = MockClock::new();
        let queue = TestQueue::with_clock(clock.clone());

        queue
            .enqueue(
                "ticket.notify",
                payload(1),
                JobOptions::new("later").with_delay(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        queue
            .enqueue("ticket.notify", payload(2), JobOptions::new("now"))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, "now");
        assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, "later");
        assert!(queue.dequeue("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sibling_queues_are_isolated() {
        let broker = TestBroker::new();
        let tickets = broker.queue("tickets");
        let other = tickets.open_sibling("other");

        tickets
            .enqueue("ticket.notify", payload(1), JobOptions::new("notify-1"))
            .await
            .unwrap();

        assert!(other.dequeue("w").await.unwrap().is_none());
        assert!(!other.cancel("notify-1").await.unwrap());
        assert_eq!(broker.stored_jobs().await, 1);
    }

    #[tokio::test]
    async fn test_terminal_record_is_replaced() {
        let queue = TestQueue::new();
        queue
            .enqueue("ticket.notify", payload(1), JobOptions::new("notify-1"))
            .await
            .unwrap();
        assert!(queue.cancel("notify-1").await.unwrap());

        let handle = queue
            .enqueue("ticket.notify", payload(1), JobOptions::new("notify-1"))
            .await
            .unwrap();
        assert!(!handle.deduplicated);
        assert_eq!(handle.state, JobState::Waiting);
        assert_eq!(queue.broker().stored_jobs().await, 1);
    }

    #[tokio::test]
    async fn test_transitions_require_active_job() {
        let queue = TestQueue::new();
        queue
            .enqueue("ticket.notify", payload(1), JobOptions::new("notify-1"))
            .await
            .unwrap();

        assert!(matches!(
            queue.complete_job("notify-1").await,
            Err(TicketQueueError::Queue { .. })
        ));
        assert!(matches!(
            queue.fail_job("missing", "x").await,
            Err(TicketQueueError::JobNotFound { ref id }) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn test_dedup_handle_reports_elapsed_delay_as_waiting() {
        let clock = MockClock::new();
        let queue = TestQueue::with_clock(clock.clone());
        let options = JobOptions::new("notify-1").with_delay(Duration::from_secs(3));

        let first = queue
            .enqueue("ticket.notify", payload(1), options.clone())
            .await
            .unwrap();
        assert_eq!(first.state, JobState::Delayed);

        clock.advance(chrono::Duration::seconds(3));
        let again = queue
            .enqueue("ticket.notify", payload(1), options)
            .await
            .unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.state, JobState::Waiting);
        assert_eq!(again.ready_at, first.ready_at);
    }

    #[tokio::test]
    async fn test_requeue_stalled_releases_expired_claims() {
        let clock = MockClock::new();
        let queue = TestQueue::with_clock(clock.clone());
        queue
            .enqueue(
                "ticket.notify",
                payload(1),
                JobOptions::new("notify-1").with_attempts(2),
            )
            .await
            .unwrap();
        queue
            .enqueue("ticket.sla", payload(1), JobOptions::new("sla-1"))
            .await
            .unwrap();
        queue.dequeue("w").await.unwrap().unwrap();
        queue.dequeue("w").await.unwrap().unwrap();

        let lease = Duration::from_secs(60);
        clock.advance(chrono::Duration::seconds(59));
        assert_eq!(queue.requeue_stalled(lease).await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(queue.requeue_stalled(lease).await.unwrap(), 2);

        let notify = queue.get_job("notify-1").await.unwrap().unwrap();
        assert_eq!(notify.state, JobState::Waiting);
        assert_eq!(notify.attempts_made, 1);
        assert!(notify.claimed_by.is_none());
        assert_eq!(notify.error_message.as_deref(), Some(STALLED_MESSAGE));

        // Single-attempt jobs have nothing left to retry.
        let sla = queue.get_job("sla-1").await.unwrap().unwrap();
        assert_eq!(sla.state, JobState::Failed);
        assert!(sla.finished_at.is_some());

        let reclaimed = queue.dequeue("w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, "notify-1");
        assert_eq!(reclaimed.attempts_made, 2);
        assert_eq!(queue.requeue_stalled(lease).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker_is_retryable() {
        let queue = TestQueue::new();
        queue.broker().set_available(false);

        let err = queue.dequeue("w").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!queue.broker().health().await.is_healthy());

        queue.broker().set_available(true);
        assert!(queue.dequeue("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_operations() {
        let queue = TestQueue::new();
        queue.close().await.unwrap();
        queue.close().await.unwrap();

        assert!(matches!(
            queue.cancel("x").await,
            Err(TicketQueueError::QueueClosed { .. })
        ));
        assert!(!queue.broker().is_closed());
    }
}
