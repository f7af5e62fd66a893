//! Read-only job counts for the admin surface.

use crate::{
    Result, TicketQueueError,
    job::JobState,
    queue::DatabaseQueue,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

/// States reported by [`StatsReporter::get_stats`].
pub const REPORTED_STATES: [JobState; 5] = [
    JobState::Waiting,
    JobState::Active,
    JobState::Completed,
    JobState::Failed,
    JobState::Delayed,
];

/// Job counts of one queue at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueCounts {
    pub fn from_map(counts: &HashMap<JobState, u64>) -> Self {
        let get = |state| counts.get(&state).copied().unwrap_or(0);
        Self {
            waiting: get(JobState::Waiting),
            active: get(JobState::Active),
            completed: get(JobState::Completed),
            failed: get(JobState::Failed),
            delayed: get(JobState::Delayed),
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// Counts tagged with the queue they came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub counts: QueueCounts,
    pub collected_at: DateTime<Utc>,
}

/// Aggregates counts over the primary queue and, on request, any other
/// queue of the same broker.
pub struct StatsReporter<Q: DatabaseQueue> {
    primary: Arc<Q>,
}

impl<Q: DatabaseQueue> Clone for StatsReporter<Q> {
    fn clone(&self) -> Self {
        Self {
            primary: Arc::clone(&self.primary),
        }
    }
}

impl<Q: DatabaseQueue> StatsReporter<Q> {
    pub fn new(primary: Arc<Q>) -> Self {
        Self { primary }
    }

    pub fn primary_queue(&self) -> &str {
        self.primary.name()
    }

    /// Counts for `queue_name`.
    ///
    /// Other queues are read through a short-lived handle that is closed
    /// whether or not the query succeeded.
    pub async fn get_stats(&self, queue_name: &str) -> Result<QueueStats> {
        let counts = if queue_name == self.primary.name() {
            self.primary.get_counts(&REPORTED_STATES).await?
        } else {
            let handle = self.primary.open_sibling(queue_name);
            debug!("Opened read handle for queue {}", queue_name);
            let counts = handle.get_counts(&REPORTED_STATES).await;
            let closed = handle.close().await;

            match (counts, closed) {
                (Ok(counts), Ok(())) => counts,
                (Ok(_), Err(e)) => return Err(e),
                (Err(e), Ok(())) => return Err(e),
                (Err(query), Err(close)) => {
                    warn!("Failed to close read handle for {}: {}", queue_name, close);
                    return Err(TicketQueueError::Queue {
                        message: format!(
                            "stats for {} failed: {}; closing the handle also failed: {}",
                            queue_name, query, close
                        ),
                    });
                }
            }
        };

        Ok(QueueStats {
            queue_name: queue_name.to_string(),
            counts: QueueCounts::from_map(&counts),
            collected_at: Utc::now(),
        })
    }

    /// Counts for the primary queue.
    pub async fn get_primary_stats(&self) -> Result<QueueStats> {
        let name = self.primary.name().to_string();
        self.get_stats(&name).await
    }
}
