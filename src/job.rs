use crate::retry::BackoffPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};

/// Queue-unique job identifier. Deterministic for ticket jobs (`notify-42`).
pub type JobId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    Removed,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
        JobState::Removed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Removed => "removed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Removed
        )
    }

    /// Only jobs that have not been claimed yet can be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Delayed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = crate::TicketQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::TicketQueueError::Queue {
                message: format!("Unknown job state: {}", s),
            })
    }
}

/// Options accepted by [`DatabaseQueue::enqueue`](crate::queue::DatabaseQueue::enqueue).
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub id: JobId,
    pub delay: Duration,
    pub attempts_max: u32,
    pub backoff: Option<BackoffPolicy>,
}

impl JobOptions {
    /// One attempt, no delay, no backoff.
    pub fn new(id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            delay: Duration::ZERO,
            attempts_max: 1,
            backoff: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// A budget of zero is treated as a single attempt.
    pub fn with_attempts(mut self, attempts_max: u32) -> Self {
        self.attempts_max = attempts_max.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub attempts_made: u32,
    pub attempts_max: u32,
    pub backoff: Option<BackoffPolicy>,
    pub created_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub claimed_by: Option<String>,
}

impl Job {
    pub fn new(
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = chrono::Duration::from_std(options.delay).unwrap_or(chrono::Duration::MAX);
        let state = if options.delay.is_zero() {
            JobState::Waiting
        } else {
            JobState::Delayed
        };

        Self {
            id: options.id,
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload,
            state,
            attempts_made: 0,
            attempts_max: options.attempts_max.max(1),
            backoff: options.backoff,
            created_at: now,
            ready_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
            started_at: None,
            finished_at: None,
            error_message: None,
            claimed_by: None,
        }
    }

    /// The state as observed at `now`: a delayed job whose timer has elapsed is waiting.
    pub fn effective_state(&self, now: DateTime<Utc>) -> JobState {
        match self.state {
            JobState::Delayed if self.ready_at <= now => JobState::Waiting,
            state => state,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state.is_cancellable() && self.ready_at <= now
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.attempts_max
    }

    /// Delay before the next attempt, or `None` once the budget is spent.
    ///
    /// Without a backoff policy the job is immediately eligible again.
    pub fn retry_delay(&self) -> Option<Duration> {
        if !self.has_attempts_left() {
            return None;
        }
        Some(
            self.backoff
                .map(|policy| policy.delay_for(self.attempts_made))
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Handle describing this job as observed at `now`.
    pub fn handle(&self, now: DateTime<Utc>, deduplicated: bool) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            queue_name: self.queue_name.clone(),
            job_type: self.job_type.clone(),
            state: self.effective_state(now),
            ready_at: self.ready_at,
            deduplicated,
        }
    }
}

/// Returned by enqueue. `deduplicated` is set when an existing live job with
/// the same id was reused instead of writing a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobHandle {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub state: JobState,
    pub ready_at: DateTime<Utc>,
    pub deduplicated: bool,
}
