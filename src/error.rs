use thiserror::Error;

#[derive(Error, Debug)]
pub enum TicketQueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Broker unavailable: {message}")]
    BrokerUnavailable { message: String },

    #[error("Queue closed: {queue_name}")]
    QueueClosed { queue_name: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Handler error: {message}")]
    Handler { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Queue error: {message}")]
    Queue { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown failed with {} error(s): {}", errors.len(), join_messages(errors))]
    Shutdown { errors: Vec<TicketQueueError> },
}

impl TicketQueueError {
    /// Whether the caller may retry the same call once the broker recovers.
    ///
    /// Only transport-level failures qualify. A closed queue, a bad payload or
    /// a handler error will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        match self {
            TicketQueueError::BrokerUnavailable { .. } => true,
            TicketQueueError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        TicketQueueError::Handler {
            message: message.into(),
        }
    }
}

fn join_messages(errors: &[TicketQueueError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<toml::de::Error> for TicketQueueError {
    fn from(err: toml::de::Error) -> Self {
        TicketQueueError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for TicketQueueError {
    fn from(err: toml::ser::Error) -> Self {
        TicketQueueError::Config(format!("TOML serialization error: {}", err))
    }
}
