//! # Query API
//!
//! Read-only HTTP surface over the runtime: task status, the action
//! ledger and its stats, and execution traces (live or persisted). Every
//! request passes the rate limiter; responses carry the `X-RateLimit-*`
//! headers and denials return 429 with `Retry-After`.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod state;

use axum::{middleware::from_fn_with_state, routing::get, Router};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{AgentCoreError, Result};
pub use errors::ApiError;
pub use state::AppState;

/// Build the versioned router with the admission layer applied
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/tasks/{task_id}", get(handlers::tasks::get_task))
        .route("/v1/action-log", get(handlers::action_log::list_entries))
        .route(
            "/v1/action-log/stats",
            get(handlers::action_log::get_stats),
        )
        .route("/v1/traces/{trace_id}", get(handlers::traces::get_trace))
        .route(
            "/v1/organizations/{organization_id}/traces",
            get(handlers::traces::list_recent),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admission_layer,
        ))
        .with_state(state)
}

/// Serve the query API until shutdown fires
pub async fn serve(state: AppState, bind_address: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .map_err(|e| {
            AgentCoreError::Configuration(format!("cannot bind {bind_address}: {e}"))
        })?;
    info!(bind_address, "query API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AgentCoreError::Configuration(format!("query API server error: {e}")))
}
