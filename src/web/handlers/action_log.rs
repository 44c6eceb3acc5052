//! # Action Log Handlers

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::actionlog::{ActionLogQuery, ActionLogStats};
use crate::models::ActionLogEntry;
use crate::web::errors::ApiResult;
use crate::web::state::AppState;

/// Ledger page response
#[derive(Debug, Serialize)]
pub struct ActionLogListResponse {
    pub entries: Vec<ActionLogEntry>,
    pub count: usize,
}

/// GET /v1/action-log
pub async fn list_entries(
    State(state): State<AppState>,
    Query(query): Query<ActionLogQuery>,
) -> ApiResult<Json<ActionLogListResponse>> {
    let entries = state.action_log.query(&query);
    Ok(Json(ActionLogListResponse {
        count: entries.len(),
        entries,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
}

fn default_window_hours() -> u32 {
    24
}

/// GET /v1/action-log/stats
pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<ActionLogStats>> {
    Ok(Json(state.action_log.stats(query.window_hours)))
}
