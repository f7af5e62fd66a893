//! Connection to the durable job store.
//!
//! The broker is constructed once per process and handed to every queue and
//! worker that needs it. Nothing in this crate keeps a global connection; the
//! owner decides when to close it, and closing happens exactly once.
//!
//! Dropped connections are re-established by the pool on the next acquire,
//! so a transient outage surfaces as a retryable error from the call that hit
//! it rather than a dead handle.

use crate::{Result, TicketQueueError, config::BrokerConfig, retry::BackoffPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, Database, Pool, pool::PoolOptions};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerStatus {
    Healthy,
    Unavailable,
    Closed,
}

/// Result of a broker health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerHealth {
    pub status: BrokerStatus,
    pub latency_ms: Option<u64>,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl BrokerHealth {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            status: BrokerStatus::Healthy,
            latency_ms: Some(latency.as_millis() as u64),
            message: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: BrokerStatus::Unavailable,
            latency_ms: None,
            message: Some(message.into()),
            checked_at: Utc::now(),
        }
    }

    pub fn closed() -> Self {
        Self {
            status: BrokerStatus::Closed,
            latency_ms: None,
            message: None,
            checked_at: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == BrokerStatus::Healthy
    }
}

/// Lifecycle operations shared by every broker backend.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Probe the store. Never fails; problems are reported in the result.
    async fn health(&self) -> BrokerHealth;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Pooled SQL connection to the job store.
pub struct BrokerConnection<DB: Database> {
    pool: Pool<DB>,
    closed: AtomicBool,
}

impl<DB: Database> BrokerConnection<DB> {
    /// Wrap an existing pool.
    pub fn new(pool: Pool<DB>) -> Self {
        Self {
            pool,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect using the configured reconnect policy.
    ///
    /// Each failed attempt waits an exponentially growing delay before the
    /// next one. The last error is returned once the attempts are spent.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let url = config.connection_url();
        let policy = &config.reconnect;
        let backoff = BackoffPolicy::exponential_capped(policy.initial_delay, policy.max_delay);
        let max_attempts = policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let options = PoolOptions::<DB>::new()
                .max_connections(config.pool_size)
                .acquire_timeout(config.connect_timeout)
                .test_before_acquire(true);

            match options.connect(&url).await {
                Ok(pool) => {
                    info!(
                        "Connected to broker at {} (attempt {}/{})",
                        config.display_target(),
                        attempt,
                        max_attempts
                    );
                    return Ok(Self::new(pool));
                }
                Err(e) if attempt < max_attempts => {
                    let delay = backoff.delay_for(attempt);
                    warn!(
                        "Broker connection attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(TicketQueueError::BrokerUnavailable {
                        message: format!(
                            "could not connect to {} after {} attempt(s): {}",
                            config.display_target(),
                            attempt,
                            e
                        ),
                    });
                }
            }
        }
    }

    /// The underlying pool, unless the connection has been closed.
    pub fn pool(&self) -> Result<&Pool<DB>> {
        if self.is_closed() {
            return Err(TicketQueueError::BrokerUnavailable {
                message: "broker connection is closed".to_string(),
            });
        }
        Ok(&self.pool)
    }
}

#[async_trait]
impl<DB: Database> Broker for BrokerConnection<DB> {
    async fn health(&self) -> BrokerHealth {
        if self.is_closed() {
            return BrokerHealth::closed();
        }

        let started = Instant::now();
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return BrokerHealth::unavailable(e.to_string()),
        };

        match conn.ping().await {
            Ok(()) => BrokerHealth::healthy(started.elapsed()),
            Err(e) => BrokerHealth::unavailable(e.to_string()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Broker connection already closed");
            return Ok(());
        }

        self.pool.close().await;
        info!("Broker connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_constructors() {
        let healthy = BrokerHealth::healthy(Duration::from_millis(12));
        assert!(healthy.is_healthy());
        assert_eq!(healthy.latency_ms, Some(12));

        let down = BrokerHealth::unavailable("connection refused");
        assert!(!down.is_healthy());
        assert_eq!(down.message.as_deref(), Some("connection refused"));

        assert_eq!(BrokerHealth::closed().status, BrokerStatus::Closed);
    }

    #[test]
    fn test_health_serializes_status_lowercase() {
        let value = serde_json::to_value(BrokerHealth::closed()).unwrap();
        assert_eq!(value["status"], "closed");
    }
}
