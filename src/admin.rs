//! Admin HTTP endpoints.
//!
//! - `GET /admin/queues/stats` - counts for the primary queue
//! - `GET /admin/queues/{name}/stats` - counts for any queue on the broker
//!
//! Bodies use the [`ApiResponse`] envelope. A broker outage answers
//! `503 Service Unavailable` so callers know to retry; other failures answer
//! `500`.

use crate::{
    TicketQueueError,
    queue::DatabaseQueue,
    stats::{QueueStats, StatsReporter},
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{info, warn};
use warp::{Filter, Reply, http::StatusCode};

/// Standard API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now(),
        }
    }
}

pub fn routes<Q>(
    reporter: Arc<StatsReporter<Q>>,
) -> impl Filter<Extract = impl Reply, Error = warp::Rejection> + Clone
where
    Q: DatabaseQueue + 'static,
{
    let reporter_filter = warp::any().map(move || reporter.clone());

    let primary_stats = warp::path!("admin" / "queues" / "stats")
        .and(warp::get())
        .and(reporter_filter.clone())
        .and_then(primary_stats_handler);

    let queue_stats = warp::path!("admin" / "queues" / String / "stats")
        .and(warp::get())
        .and(reporter_filter)
        .and_then(queue_stats_handler);

    primary_stats.or(queue_stats)
}

async fn primary_stats_handler<Q>(
    reporter: Arc<StatsReporter<Q>>,
) -> Result<impl Reply, warp::Rejection>
where
    Q: DatabaseQueue + 'static,
{
    Ok(stats_reply(reporter.get_primary_stats().await))
}

async fn queue_stats_handler<Q>(
    queue_name: String,
    reporter: Arc<StatsReporter<Q>>,
) -> Result<impl Reply, warp::Rejection>
where
    Q: DatabaseQueue + 'static,
{
    Ok(stats_reply(reporter.get_stats(&queue_name).await))
}

fn stats_reply(result: crate::Result<QueueStats>) -> warp::reply::WithStatus<warp::reply::Json> {
    match result {
        Ok(stats) => warp::reply::with_status(
            warp::reply::json(&ApiResponse::success(stats)),
            StatusCode::OK,
        ),
        Err(e) => {
            warn!("Stats request failed: {}", e);
            let status = status_for(&e);
            warp::reply::with_status(
                warp::reply::json(&ApiResponse::<()>::error(format!(
                    "Failed to get queue statistics: {}",
                    e
                ))),
                status,
            )
        }
    }
}

fn status_for(error: &TicketQueueError) -> StatusCode {
    if error.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// A running admin server.
pub struct AdminServer {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl AdminServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("Admin server task failed: {}", e);
        }
        info!("Admin server stopped");
    }
}

/// Serve the admin routes on `addr` until [`AdminServer::shutdown`].
pub fn serve<Q>(reporter: Arc<StatsReporter<Q>>, addr: SocketAddr) -> crate::Result<AdminServer>
where
    Q: DatabaseQueue + 'static,
{
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (addr, server) = warp::serve(routes(reporter))
        .try_bind_with_graceful_shutdown(addr, async {
            let _ = shutdown_rx.await;
        })
        .map_err(|e| TicketQueueError::Config(format!("cannot bind admin server: {}", e)))?;

    info!("Admin server listening on {}", addr);
    let handle = tokio::spawn(server);

    Ok(AdminServer {
        addr,
        shutdown_tx,
        handle,
    })
}
