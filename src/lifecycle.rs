//! Hooks called by the ticket service when a ticket changes.
//!
//! Each hook only touches the queue and returns as soon as the broker has
//! acknowledged the write. Errors are returned to the caller so the intent is
//! never dropped silently; retrying a hook is always safe because job ids are
//! deterministic.

use crate::{
    Result,
    config::SchedulingConfig,
    job::JobHandle,
    queue::DatabaseQueue,
    ticket::{JobKind, TicketId, TicketPayload},
};
use std::sync::Arc;
use tracing::{debug, info};

/// Jobs scheduled for a newly created ticket.
#[derive(Debug, Clone)]
pub struct ScheduledJobs {
    pub notify: JobHandle,
    pub sla: JobHandle,
}

/// Pending jobs cancelled for a deleted ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledJobs {
    pub notify: bool,
    pub sla: bool,
}

pub struct TicketJobs<Q: DatabaseQueue> {
    queue: Arc<Q>,
    scheduling: SchedulingConfig,
}

impl<Q: DatabaseQueue> Clone for TicketJobs<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            scheduling: self.scheduling.clone(),
        }
    }
}

impl<Q: DatabaseQueue> TicketJobs<Q> {
    pub fn new(queue: Arc<Q>) -> Self {
        Self::with_scheduling(queue, SchedulingConfig::default())
    }

    pub fn with_scheduling(queue: Arc<Q>, scheduling: SchedulingConfig) -> Self {
        Self { queue, scheduling }
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Schedule the debounced notification and the SLA escalation.
    pub async fn on_ticket_created(&self, ticket_id: TicketId) -> Result<ScheduledJobs> {
        let payload = TicketPayload { ticket_id }.to_value();

        let notify = self
            .queue
            .enqueue(
                JobKind::Notify.as_str(),
                payload.clone(),
                self.scheduling
                    .notify_options(JobKind::Notify.job_id(ticket_id)),
            )
            .await?;

        let sla = self
            .queue
            .enqueue(
                JobKind::SlaEscalate.as_str(),
                payload,
                self.scheduling
                    .sla_options(JobKind::SlaEscalate.job_id(ticket_id)),
            )
            .await?;

        info!(
            "Scheduled jobs for ticket {}: {} at {}, {} at {}",
            ticket_id, notify.id, notify.ready_at, sla.id, sla.ready_at
        );
        Ok(ScheduledJobs { notify, sla })
    }

    /// Cancel the pending SLA escalation. Returns whether one was cancelled.
    pub async fn on_ticket_resolved(&self, ticket_id: TicketId) -> Result<bool> {
        let job_id = JobKind::SlaEscalate.job_id(ticket_id);
        let cancelled = self.queue.cancel(&job_id).await?;
        if cancelled {
            info!("Cancelled {} for resolved ticket {}", job_id, ticket_id);
        } else {
            debug!("No pending {} for resolved ticket {}", job_id, ticket_id);
        }
        Ok(cancelled)
    }

    /// Cancel every pending job of a deleted ticket.
    pub async fn on_ticket_deleted(&self, ticket_id: TicketId) -> Result<CancelledJobs> {
        let notify = self
            .queue
            .cancel(&JobKind::Notify.job_id(ticket_id))
            .await?;
        let sla = self
            .queue
            .cancel(&JobKind::SlaEscalate.job_id(ticket_id))
            .await?;

        debug!(
            "Ticket {} deleted; cancelled notify: {}, sla: {}",
            ticket_id, notify, sla
        );
        Ok(CancelledJobs { notify, sla })
    }
}
