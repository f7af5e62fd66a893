//! # ticket-queue
//!
//! Deferred, deduplicated and cancellable background jobs for a ticket service.
//!
//! Ticket lifecycle events schedule two kinds of work: a debounced
//! notification shortly after a ticket is created, and an SLA escalation that
//! fires if the ticket is still unresolved when its window runs out. Jobs are
//! stored durably in a broker (PostgreSQL), claimed atomically by a worker
//! and retried with backoff when a handler fails.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ticket_queue::{TicketHandlers, TicketQueueConfig, TicketQueueRuntime};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # #[cfg(feature = "postgres")]
//! # {
//! let config = TicketQueueConfig::new().with_broker_url("postgresql://localhost/ticket_queue");
//! let runtime = TicketQueueRuntime::connect(&config, TicketHandlers::logging()).await?;
//!
//! // Schedules notify-42 (3s debounce) and sla-42 (15 minute window).
//! runtime.jobs().on_ticket_created(42).await?;
//!
//! // The escalation is no longer needed.
//! assert!(runtime.jobs().on_ticket_resolved(42).await?);
//!
//! runtime.shutdown().await?;
//! # }
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Concepts
//!
//! ### Jobs
//!
//! Every job has a deterministic id (`notify-<ticket>`, `sla-<ticket>`).
//! Enqueueing an id that is still waiting, delayed or running returns the
//! existing job instead of scheduling a second one.
//!
//! ### Delivery
//!
//! Execution is at-least-once. Handlers look the ticket up again when they
//! run and treat a missing or resolved ticket as nothing to do, so running a
//! job twice is harmless.
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL broker (default)
//! - `admin` - warp admin endpoints for queue counts (default)
//! - `test` - in-memory broker and queue with a mock clock

#[cfg(feature = "admin")]
pub mod admin;
pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod job;
pub mod lifecycle;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod stats;
pub mod ticket;
pub mod worker;

pub use broker::{Broker, BrokerConnection, BrokerHealth, BrokerStatus};
pub use config::TicketQueueConfig;
pub use error::TicketQueueError;
pub use handlers::{EscalationSender, NotificationSender, TicketDirectory, TicketHandlers};
pub use job::{Job, JobHandle, JobId, JobOptions, JobState};
pub use lifecycle::TicketJobs;
pub use queue::{DatabaseQueue, JobQueue};
pub use retry::BackoffPolicy;
pub use runtime::TicketQueueRuntime;
pub use stats::{QueueCounts, QueueStats, StatsReporter};
pub use ticket::{JobKind, TicketId, TicketJob, TicketStatus};
pub use worker::{JobOutcome, Worker, WorkerHandle};

/// Queue used when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "tickets";

/// Convenient type alias for Results with [`TicketQueueError`] as the error type.
pub type Result<T> = std::result::Result<T, TicketQueueError>;
