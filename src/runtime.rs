//! Process-level wiring: one broker, one primary queue, one worker.
//!
//! [`TicketQueueRuntime`] owns the three long-lived pieces and tears them
//! down in dependency order (worker, then queue, then broker). Every step of
//! the teardown runs even if an earlier one failed; the failures are reported
//! together as [`TicketQueueError::Shutdown`].

use crate::{
    Result, TicketQueueError,
    broker::{Broker, BrokerHealth},
    config::TicketQueueConfig,
    handlers::TicketHandlers,
    lifecycle::TicketJobs,
    queue::DatabaseQueue,
    stats::StatsReporter,
    worker::{Worker, WorkerHandle},
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::Mutex;
use tracing::{error, info};

pub struct TicketQueueRuntime<B: Broker + 'static, Q: DatabaseQueue + 'static> {
    broker: Arc<B>,
    queue: Arc<Q>,
    jobs: TicketJobs<Q>,
    stats: StatsReporter<Q>,
    worker: Mutex<Option<WorkerHandle>>,
    shut_down: AtomicBool,
}

impl<B: Broker + 'static, Q: DatabaseQueue + 'static> TicketQueueRuntime<B, Q> {
    /// Prepare the queue and start the worker.
    ///
    /// If startup fails, the queue and broker are closed before the error is
    /// returned.
    pub async fn start(
        broker: Arc<B>,
        queue: Arc<Q>,
        handlers: TicketHandlers,
        config: &TicketQueueConfig,
    ) -> Result<Self> {
        if config.broker.create_tables {
            if let Err(e) = queue.create_tables().await {
                error!("Failed to prepare queue {}: {}", queue.name(), e);
                let mut errors = vec![e];
                if let Err(e) = queue.close().await {
                    errors.push(e);
                }
                if let Err(e) = broker.close().await {
                    errors.push(e);
                }
                return Err(single_or_shutdown(errors));
            }
        }

        let worker = Worker::from_config(Arc::clone(&queue), handlers, &config.worker).spawn();
        info!(
            "Ticket queue runtime started on {} with worker {}",
            queue.name(),
            worker.worker_id()
        );

        Ok(Self {
            jobs: TicketJobs::with_scheduling(Arc::clone(&queue), config.scheduling.clone()),
            stats: StatsReporter::new(Arc::clone(&queue)),
            broker,
            queue,
            worker: Mutex::new(Some(worker)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Lifecycle hooks for the ticket service.
    pub fn jobs(&self) -> &TicketJobs<Q> {
        &self.jobs
    }

    pub fn stats(&self) -> &StatsReporter<Q> {
        &self.stats
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub async fn health(&self) -> BrokerHealth {
        self.broker.health().await
    }

    /// Stop the worker, close the queue, then close the broker.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Shutting down ticket queue runtime");
        let mut errors = Vec::new();

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.shutdown().await {
                error!("Worker shutdown failed: {}", e);
                errors.push(e);
            }
        }

        if let Err(e) = self.queue.close().await {
            error!("Queue close failed: {}", e);
            errors.push(e);
        }

        if let Err(e) = self.broker.close().await {
            error!("Broker close failed: {}", e);
            errors.push(e);
        }

        if errors.is_empty() {
            info!("Ticket queue runtime stopped");
            Ok(())
        } else {
            Err(TicketQueueError::Shutdown { errors })
        }
    }
}

#[cfg(feature = "postgres")]
impl
    TicketQueueRuntime<
        crate::broker::BrokerConnection<sqlx::Postgres>,
        crate::queue::JobQueue<sqlx::Postgres>,
    >
{
    /// Connect to PostgreSQL and start the runtime on the configured queue.
    pub async fn connect(config: &TicketQueueConfig, handlers: TicketHandlers) -> Result<Self> {
        let broker = Arc::new(crate::broker::BrokerConnection::connect(&config.broker).await?);
        let queue = Arc::new(crate::queue::JobQueue::new(
            Arc::clone(&broker),
            config.worker.queue_name.clone(),
        ));
        Self::start(broker, queue, handlers, config).await
    }
}

fn single_or_shutdown(mut errors: Vec<TicketQueueError>) -> TicketQueueError {
    if errors.len() == 1 {
        errors.remove(0)
    } else {
        TicketQueueError::Shutdown { errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::test::TestBroker;

    #[test]
    fn test_single_error_is_not_wrapped() {
        let err = single_or_shutdown(vec![TicketQueueError::Config("bad".to_string())]);
        assert!(matches!(err, TicketQueueError::Config(_)));

        let err = single_or_shutdown(vec![
            TicketQueueError::Config("a".to_string()),
            TicketQueueError::Config("b".to_string()),
        ]);
        assert!(matches!(err, TicketQueueError::Shutdown { ref errors } if errors.len() == 2));
    }

    #[tokio::test]
    async fn test_shutdown_closes_in_order_once() {
        let broker = Arc::new(TestBroker::new());
        let queue = Arc::new(broker.queue("tickets"));
        let runtime = TicketQueueRuntime::start(
            Arc::clone(&broker),
            Arc::clone(&queue),
            TicketHandlers::logging(),
            &TicketQueueConfig::default(),
        )
        .await
        .unwrap();

        assert!(runtime.health().await.is_healthy());
        runtime.shutdown().await.unwrap();
        runtime.shutdown().await.unwrap();

        assert!(queue.is_closed());
        assert!(broker.is_closed());
    }

    #[tokio::test]
    async fn test_failed_start_closes_broker() {
        let broker = Arc::new(TestBroker::new());
        let queue = Arc::new(broker.queue("tickets"));
        broker.set_available(false);

        let result = TicketQueueRuntime::start(
            Arc::clone(&broker),
            queue,
            TicketHandlers::logging(),
            &TicketQueueConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(TicketQueueError::BrokerUnavailable { .. })));
        assert!(broker.is_closed());
    }
}
