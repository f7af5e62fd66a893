//! Ticket-side vocabulary: identifiers, statuses and the closed set of job
//! kinds scheduled on ticket events.

use crate::job::{Job, JobId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type TicketId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
}

impl TicketStatus {
    /// A resolved ticket needs no further notifications or escalation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketStatus::Resolved)
    }
}

/// Kinds of job this crate schedules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobKind {
    Notify,
    SlaEscalate,
}

impl JobKind {
    /// Stored `job_type` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Notify => "ticket.notify",
            JobKind::SlaEscalate => "ticket.sla",
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            JobKind::Notify => "notify",
            JobKind::SlaEscalate => "sla",
        }
    }

    /// Deterministic job id for a ticket, e.g. `notify-42` or `sla-42`.
    ///
    /// Re-enqueueing the same logical job always yields the same id, which is
    /// what makes duplicate scheduling a no-op.
    pub fn job_id(&self, ticket_id: TicketId) -> JobId {
        format!("{}-{}", self.id_prefix(), ticket_id)
    }

    pub fn from_type(job_type: &str) -> Option<Self> {
        match job_type {
            "ticket.notify" => Some(JobKind::Notify),
            "ticket.sla" => Some(JobKind::SlaEscalate),
            _ => None,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload stored with every ticket job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketPayload {
    pub ticket_id: TicketId,
}

impl TicketPayload {
    pub fn to_value(self) -> serde_json::Value {
        serde_json::json!({ "ticket_id": self.ticket_id })
    }
}

/// A claimed job decoded into something the worker can dispatch on.
///
/// Records whose type is unknown, or whose payload does not decode, land in
/// [`TicketJob::Unknown`] so the worker can drop them deliberately.
#[derive(Debug, Clone, PartialEq)]
pub enum TicketJob {
    Notify { ticket_id: TicketId },
    SlaEscalate { ticket_id: TicketId },
    Unknown { job_type: String, reason: String },
}

impl TicketJob {
    pub fn decode(job: &Job) -> Self {
        let Some(kind) = JobKind::from_type(&job.job_type) else {
            return TicketJob::Unknown {
                job_type: job.job_type.clone(),
                reason: "unrecognized job type".to_string(),
            };
        };

        match serde_json::from_value::<TicketPayload>(job.payload.clone()) {
            Ok(TicketPayload { ticket_id }) => match kind {
                JobKind::Notify => TicketJob::Notify { ticket_id },
                JobKind::SlaEscalate => TicketJob::SlaEscalate { ticket_id },
            },
            Err(e) => TicketJob::Unknown {
                job_type: job.job_type.clone(),
                reason: format!("invalid payload: {}", e),
            },
        }
    }
}
