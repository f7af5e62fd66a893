//! The worker loop that drains one queue.
//!
//! A [`Worker`] claims ready jobs, decodes them into a [`TicketJob`] and runs
//! the matching handler. Success completes the job. Failure, a panic or a
//! timeout consumes one attempt: the job is put back with its backoff delay
//! while attempts remain, and marked failed once they are spent.
//!
//! Recording a result is retried with backoff while the broker is
//! unreachable. A job whose result could still not be recorded, or whose
//! worker died, stays active until a running worker's periodic sweep finds
//! its claim older than the lease and hands it back to the queue.
//!
//! Shutdown stops claiming first, then waits for in-flight handlers for the
//! grace period. Handlers still running after that are aborted, and each of
//! their jobs is recorded as a failed attempt so it is retried or failed
//! instead of being left active.

use crate::{
    Result, TicketQueueError,
    config::WorkerConfig,
    handlers::TicketHandlers,
    job::{Job, JobId},
    queue::DatabaseQueue,
    retry::BackoffPolicy,
    ticket::TicketJob,
};
use futures_util::FutureExt;
use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::{self, JoinError, JoinHandle, JoinSet},
    time::{Instant, sleep},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tries made to record a job's result before giving up on an outage.
const RECORD_ATTEMPTS: u32 = 5;

/// What happened to a job the worker processed.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { job_id: JobId },
    /// The attempt failed and the job will be eligible again after `delay`.
    Retried { job_id: JobId, delay: Duration },
    /// The attempt failed and no attempts remain.
    Failed { job_id: JobId, error: String },
    /// The job could not be decoded and was completed without running.
    Dropped { job_id: JobId, reason: String },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            JobOutcome::Completed { job_id }
            | JobOutcome::Retried { job_id, .. }
            | JobOutcome::Failed { job_id, .. }
            | JobOutcome::Dropped { job_id, .. } => job_id,
        }
    }
}

pub struct Worker<Q: DatabaseQueue + 'static> {
    queue: Arc<Q>,
    handlers: TicketHandlers,
    worker_id: String,
    poll_interval: Duration,
    concurrency: usize,
    job_timeout: Option<Duration>,
    shutdown_grace_period: Duration,
    stalled_after: Duration,
    stall_check_interval: Duration,
}

impl<Q: DatabaseQueue + 'static> Clone for Worker<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            handlers: self.handlers.clone(),
            worker_id: self.worker_id.clone(),
            poll_interval: self.poll_interval,
            concurrency: self.concurrency,
            job_timeout: self.job_timeout,
            shutdown_grace_period: self.shutdown_grace_period,
            stalled_after: self.stalled_after,
            stall_check_interval: self.stall_check_interval,
        }
    }
}

impl<Q: DatabaseQueue + 'static> Worker<Q> {
    pub fn new(queue: Arc<Q>, handlers: TicketHandlers) -> Self {
        Self::from_config(queue, handlers, &WorkerConfig::default())
    }

    /// Build a worker with the timing settings of `config`.
    ///
    /// `config.queue_name` is not used here; the worker drains whatever queue
    /// `queue` is bound to.
    pub fn from_config(queue: Arc<Q>, handlers: TicketHandlers, config: &WorkerConfig) -> Self {
        Self {
            queue,
            handlers,
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: config.poll_interval,
            concurrency: config.concurrency.max(1),
            job_timeout: config.job_timeout,
            shutdown_grace_period: config.shutdown_grace_period,
            stalled_after: config.stalled_after,
            stall_check_interval: config.stall_check_interval,
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    /// Claim lease after which an active job is handed back to the queue.
    /// Keep it longer than any handler can legitimately run.
    pub fn with_stalled_after(mut self, lease: Duration) -> Self {
        self.stalled_after = lease;
        self
    }

    pub fn with_stall_check_interval(mut self, interval: Duration) -> Self {
        self.stall_check_interval = interval;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Claim and process a single job, if one is ready.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>> {
        match self.queue.dequeue(&self.worker_id).await? {
            Some(job) => self.process_job(job).await.map(Some),
            None => Ok(None),
        }
    }

    /// Run until a shutdown signal arrives (or its sender is dropped).
    ///
    /// A claim that is already under way is allowed to finish before the
    /// signal is acted on, so a job is never claimed and then forgotten.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(
            "Worker {} started for queue: {} (concurrency {})",
            self.worker_id,
            self.queue.name(),
            self.concurrency
        );

        let mut tasks: JoinSet<Result<JobOutcome>> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, Job> = HashMap::new();
        let mut next_sweep = Instant::now();

        loop {
            while let Some(joined) = tasks.try_join_next_with_id() {
                self.reap(joined, &mut in_flight);
            }

            if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
                break;
            }

            if Instant::now() >= next_sweep {
                self.release_stalled().await;
                next_sweep = Instant::now() + self.stall_check_interval;
            }

            if tasks.len() >= self.concurrency {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    Some(joined) = tasks.join_next_with_id() => self.reap(joined, &mut in_flight),
                }
                continue;
            }

            match self.queue.dequeue(&self.worker_id).await {
                Ok(Some(job)) => {
                    debug!("Worker {} claimed job {}", self.worker_id, job.id);
                    let worker = self.clone();
                    let claimed = job.clone();
                    let handle = tasks.spawn(async move { worker.process_job(claimed).await });
                    in_flight.insert(handle.id(), job);
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("Error dequeuing job from {}: {}", self.queue.name(), e),
            }

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = sleep(self.poll_interval) => {}
                Some(joined) = tasks.join_next_with_id() => self.reap(joined, &mut in_flight),
            }
        }

        info!(
            "Worker {} shutting down for queue: {} ({} job(s) in flight)",
            self.worker_id,
            self.queue.name(),
            tasks.len()
        );
        self.drain(tasks, in_flight).await
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker_id = self.worker_id.clone();
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        WorkerHandle {
            worker_id,
            shutdown_tx,
            join,
        }
    }

    async fn drain(
        &self,
        mut tasks: JoinSet<Result<JobOutcome>>,
        mut in_flight: HashMap<task::Id, Job>,
    ) -> Result<()> {
        let deadline = sleep(self.shutdown_grace_period);
        tokio::pin!(deadline);

        while !tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => break,
                Some(joined) = tasks.join_next_with_id() => self.reap(joined, &mut in_flight),
            }
        }

        if tasks.is_empty() {
            info!("Worker {} stopped", self.worker_id);
            return Ok(());
        }

        warn!(
            "Grace period of {:?} expired; aborting {} in-flight job(s) on {}",
            self.shutdown_grace_period,
            tasks.len(),
            self.queue.name()
        );
        tasks.abort_all();

        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let aborted = match joined {
                Err(e) if e.is_cancelled() => in_flight.remove(&e.id()),
                other => {
                    self.reap(other, &mut in_flight);
                    None
                }
            };

            if let Some(job) = aborted {
                warn!("Job {} aborted during shutdown", job.id);
                if let Err(e) = self
                    .record_failure(&job, "aborted during worker shutdown".to_string())
                    .await
                {
                    error!("Failed to record aborted job {}: {}", job.id, e);
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            info!("Worker {} stopped", self.worker_id);
            Ok(())
        } else {
            Err(TicketQueueError::Shutdown { errors })
        }
    }

    async fn release_stalled(&self) {
        match self.queue.requeue_stalled(self.stalled_after).await {
            Ok(0) => {}
            Ok(released) => warn!(
                "Worker {} released {} stalled job(s) in {}",
                self.worker_id,
                released,
                self.queue.name()
            ),
            Err(e) => error!("Error releasing stalled jobs in {}: {}", self.queue.name(), e),
        }
    }

    /// Run a result-recording call, retrying with backoff while the error is
    /// transient.
    async fn record<F, Fut>(&self, job_id: &str, mut call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let backoff =
            BackoffPolicy::exponential_capped(Duration::from_millis(100), Duration::from_secs(5));
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_retryable() && attempt < RECORD_ATTEMPTS => {
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        "Recording result of job {} failed: {}; retrying in {:?}",
                        job_id, e, delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn reap(
        &self,
        joined: std::result::Result<(task::Id, Result<JobOutcome>), JoinError>,
        in_flight: &mut HashMap<task::Id, Job>,
    ) {
        match joined {
            Ok((id, Ok(outcome))) => {
                in_flight.remove(&id);
                debug!("Job {} finished: {:?}", outcome.job_id(), outcome);
            }
            Ok((id, Err(e))) => {
                let job_id = in_flight.remove(&id).map(|job| job.id).unwrap_or_default();
                error!("Failed to record result of job {}: {}", job_id, e);
            }
            Err(e) => {
                let job_id = in_flight.remove(&e.id()).map(|job| job.id).unwrap_or_default();
                error!("Task for job {} failed: {}", job_id, e);
            }
        }
    }

    async fn process_job(&self, job: Job) -> Result<JobOutcome> {
        let result = match TicketJob::decode(&job) {
            TicketJob::Notify { ticket_id } => {
                self.execute(&job, self.handlers.notify(ticket_id)).await
            }
            TicketJob::SlaEscalate { ticket_id } => {
                self.execute(&job, self.handlers.escalate(ticket_id)).await
            }
            TicketJob::Unknown { job_type, reason } => {
                warn!(
                    "Dropping job {} of type {} from {}: {}",
                    job.id, job_type, job.queue_name, reason
                );
                self.record(&job.id, || self.queue.complete_job(&job.id))
                    .await?;
                return Ok(JobOutcome::Dropped {
                    job_id: job.id,
                    reason,
                });
            }
        };

        match result {
            Ok(()) => {
                self.record(&job.id, || self.queue.complete_job(&job.id))
                    .await?;
                debug!(
                    "Job {} completed on attempt {}/{}",
                    job.id, job.attempts_made, job.attempts_max
                );
                Ok(JobOutcome::Completed { job_id: job.id })
            }
            Err(message) => self.record_failure(&job, message).await,
        }
    }

    /// Run a handler future, turning errors, panics and timeouts into a message.
    async fn execute<F>(&self, job: &Job, handler: F) -> std::result::Result<(), String>
    where
        F: Future<Output = Result<()>> + Send,
    {
        let guarded = AssertUnwindSafe(handler).catch_unwind();

        let result = match self.job_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Job {} timed out after {:?}", job.id, timeout);
                    return Err(format!("Job timed out after {:?}", timeout));
                }
            },
            None => guarded.await,
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                error!("Handler for job {} panicked", job.id);
                Err(format!("handler panicked: {}", panic_message(panic.as_ref())))
            }
        }
    }

    async fn record_failure(&self, job: &Job, message: String) -> Result<JobOutcome> {
        match job.retry_delay() {
            Some(delay) => {
                warn!(
                    "Job {} failed (attempt {}/{}): {}; retrying in {:?}",
                    job.id, job.attempts_made, job.attempts_max, message, delay
                );
                self.record(&job.id, || self.queue.retry_job(&job.id, delay, &message))
                    .await?;
                Ok(JobOutcome::Retried {
                    job_id: job.id.clone(),
                    delay,
                })
            }
            None => {
                error!(
                    "Job {} failed after {} attempt(s): {}",
                    job.id, job.attempts_made, message
                );
                self.record(&job.id, || self.queue.fail_job(&job.id, &message))
                    .await?;
                Ok(JobOutcome::Failed {
                    job_id: job.id.clone(),
                    error: message,
                })
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a worker started with [`Worker::spawn`].
pub struct WorkerHandle {
    worker_id: String,
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the worker and wait for it to stop, including the grace period.
    pub async fn shutdown(self) -> Result<()> {
        if self.shutdown_tx.send(()).await.is_err() {
            debug!("Worker {} already stopped", self.worker_id);
        }

        self.join.await.map_err(|e| TicketQueueError::Worker {
            message: format!("Worker task failed: {}", e),
        })?
    }
}
