//! Local status HTTP server.
//!
//! Provides:
//! - `GET /healthz`: always 200 `ok` while the process runs
//! - `GET /status`: JSON snapshot of delivery state and queue counts
//!
//! Read-only. Nothing here mutates the queue.

use crate::cycle::SharedState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use relay_queue::{QueueCounts, QueueStore};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

#[derive(Clone)]
pub struct StatusContext {
    pub version: String,
    pub device_key: String,
    pub queue: Arc<Mutex<QueueStore>>,
    pub forwarder: SharedState,
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub version: String,
    pub device_key: String,
    pub delivery_enabled: bool,
    pub consecutive_failures: u32,
    pub next_attempt_in_secs: u64,
    pub queue: QueueCounts,
    pub last_maintenance_date: Option<NaiveDate>,
}

pub fn build_router(ctx: StatusContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .with_state(ctx)
}

/// Bind `bind` and serve until `shutdown` flips. Returns the bound address.
pub async fn start(
    bind: &str,
    ctx: StatusContext,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SocketAddr, std::io::Error> {
    let listener = TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(ctx);
    tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "status HTTP server failed");
        }
    });
    Ok(local_addr)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn status(State(ctx): State<StatusContext>) -> impl IntoResponse {
    let counts = {
        let queue = ctx.queue.lock().await;
        queue.counts()
    };
    let counts = match counts {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };
    let fwd = ctx.forwarder.read().await.clone();
    let body = StatusBody {
        version: ctx.version.clone(),
        device_key: ctx.device_key.clone(),
        delivery_enabled: fwd.delivery_enabled,
        consecutive_failures: fwd.consecutive_failures,
        next_attempt_in_secs: fwd
            .next_attempt_at
            .saturating_duration_since(Instant::now())
            .as_secs(),
        queue: counts,
        last_maintenance_date: fwd.last_maintenance_date,
    };
    Json(body).into_response()
}
