//! # Trace Handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::TraceSummary;
use crate::trace::ExecutionTrace;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

/// A trace is served live while resident, else from its persisted summary
#[derive(Debug, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum TraceResponse {
    Live { trace: ExecutionTrace },
    Persisted { summary: TraceSummary },
}

/// GET /v1/traces/{trace_id}
pub async fn get_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<Uuid>,
) -> ApiResult<Json<TraceResponse>> {
    if let Some(trace) = state.traces.get_trace(trace_id) {
        return Ok(Json(TraceResponse::Live { trace }));
    }
    let summary = state
        .traces
        .find_summary(trace_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("trace not found: {trace_id}")))?;
    Ok(Json(TraceResponse::Persisted { summary }))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

/// Recent summaries response
#[derive(Debug, Serialize)]
pub struct RecentTracesResponse {
    pub summaries: Vec<TraceSummary>,
    pub count: usize,
}

/// GET /v1/organizations/{organization_id}/traces
pub async fn list_recent(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Json<RecentTracesResponse>> {
    let summaries = state
        .traces
        .recent_summaries(&organization_id, query.limit)
        .await?;
    Ok(Json(RecentTracesResponse {
        count: summaries.len(),
        summaries,
    }))
}
