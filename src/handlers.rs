//! Business logic run for claimed ticket jobs.
//!
//! The handlers themselves know nothing about queues. They look the ticket up
//! through a [`TicketDirectory`] and hand off to a sender. An `Err` from either
//! side counts as a failed attempt and feeds the job's retry budget.

use crate::{
    Result,
    ticket::{TicketId, TicketStatus},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Delivers the notification for a ticket.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, ticket_id: TicketId) -> Result<()>;
}

/// Performs the SLA escalation for a ticket.
#[async_trait]
pub trait EscalationSender: Send + Sync {
    async fn send(&self, ticket_id: TicketId) -> Result<()>;
}

/// Read access to ticket state.
#[async_trait]
pub trait TicketDirectory: Send + Sync {
    /// Current status, or `None` if the ticket no longer exists.
    async fn ticket_status(&self, ticket_id: TicketId) -> Result<Option<TicketStatus>>;
}

/// The two job handlers, wired to their collaborators.
#[derive(Clone)]
pub struct TicketHandlers {
    directory: Arc<dyn TicketDirectory>,
    notifier: Arc<dyn NotificationSender>,
    escalator: Arc<dyn EscalationSender>,
}

impl TicketHandlers {
    pub fn new(
        directory: Arc<dyn TicketDirectory>,
        notifier: Arc<dyn NotificationSender>,
        escalator: Arc<dyn EscalationSender>,
    ) -> Self {
        Self {
            directory,
            notifier,
            escalator,
        }
    }

    /// Handlers that only log, against a directory where every ticket is open.
    pub fn logging() -> Self {
        Self::new(
            Arc::new(OpenTicketDirectory),
            Arc::new(LoggingNotifier),
            Arc::new(LoggingEscalator),
        )
    }

    /// Send the notification for `ticket_id`.
    ///
    /// A ticket that has been deleted in the meantime is not an error: there is
    /// nobody left to notify, so the job completes.
    pub async fn notify(&self, ticket_id: TicketId) -> Result<()> {
        if self.directory.ticket_status(ticket_id).await?.is_none() {
            debug!("Ticket {} no longer exists; skipping notify", ticket_id);
            return Ok(());
        }
        self.notifier.send(ticket_id).await
    }

    /// Escalate `ticket_id` if it is still unresolved.
    pub async fn escalate(&self, ticket_id: TicketId) -> Result<()> {
        match self.directory.ticket_status(ticket_id).await? {
            None => {
                debug!("Ticket {} no longer exists; skipping escalation", ticket_id);
                Ok(())
            }
            Some(status) if status.is_terminal() => {
                debug!("Ticket {} already {:?}; skipping escalation", ticket_id, status);
                Ok(())
            }
            Some(_) => self.escalator.send(ticket_id).await,
        }
    }
}

/// Logs the notification instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotifier;

#[async_trait]
impl NotificationSender for LoggingNotifier {
    async fn send(&self, ticket_id: TicketId) -> Result<()> {
        info!("notify for ticket {}", ticket_id);
        Ok(())
    }
}

/// Logs the escalation instead of performing it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEscalator;

#[async_trait]
impl EscalationSender for LoggingEscalator {
    async fn send(&self, ticket_id: TicketId) -> Result<()> {
        info!("SLA escalate for ticket {}", ticket_id);
        Ok(())
    }
}

/// Directory that reports every ticket as open.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenTicketDirectory;

#[async_trait]
impl TicketDirectory for OpenTicketDirectory {
    async fn ticket_status(&self, _ticket_id: TicketId) -> Result<Option<TicketStatus>> {
        Ok(Some(TicketStatus::Open))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TicketQueueError;
    use std::{
        collections::HashMap,
        sync::Mutex,
    };

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<TicketId>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSender for Recorder {
        async fn send(&self, ticket_id: TicketId) -> Result<()> {
            if self.fail {
                return Err(TicketQueueError::handler("smtp down"));
            }
            self.sent.lock().unwrap().push(ticket_id);
            Ok(())
        }
    }

    #[async_trait]
    impl EscalationSender for Recorder {
        async fn send(&self, ticket_id: TicketId) -> Result<()> {
            self.sent.lock().unwrap().push(ticket_id);
            Ok(())
        }
    }

    struct Directory(HashMap<TicketId, TicketStatus>);

    #[async_trait]
    impl TicketDirectory for Directory {
        async fn ticket_status(&self, ticket_id: TicketId) -> Result<Option<TicketStatus>> {
            Ok(self.0.get(&ticket_id).copied())
        }
    }

    fn handlers(recorder: Arc<Recorder>) -> TicketHandlers {
        let directory = Directory(HashMap::from([
            (1, TicketStatus::Open),
            (2, TicketStatus::InProgress),
            (3, TicketStatus::Resolved),
        ]));
        TicketHandlers::new(Arc::new(directory), recorder.clone(), recorder)
    }

    #[tokio::test]
    async fn test_notify_sends_for_existing_ticket() {
        let recorder = Arc::new(Recorder::default());
        let handlers = handlers(recorder.clone());

        handlers.notify(1).await.unwrap();
        handlers.notify(404).await.unwrap();

        assert_eq!(*recorder.sent.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_notify_failure_propagates() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let err = handlers(recorder).notify(1).await.unwrap_err();
        assert!(matches!(err, TicketQueueError::Handler { .. }));
    }

    #[tokio::test]
    async fn test_escalate_skips_resolved_and_missing() {
        let recorder = Arc::new(Recorder::default());
        let handlers = handlers(recorder.clone());

        handlers.escalate(2).await.unwrap();
        handlers.escalate(3).await.unwrap();
        handlers.escalate(404).await.unwrap();

        assert_eq!(*recorder.sent.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_logging_handlers_succeed() {
        let handlers = TicketHandlers::logging();
        handlers.notify(5).await.unwrap();
        handlers.escalate(5).await.unwrap();
    }
}
