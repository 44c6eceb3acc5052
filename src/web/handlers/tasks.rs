//! # Task Status Handlers

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::Task;
use crate::state_machine::TaskStatus;
use crate::web::errors::{ApiError, ApiResult};
use crate::web::state::AppState;

/// Task detail response
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub id: Uuid,
    pub organization_id: String,
    pub task_type: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub retry_count: i32,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        let duration_ms = task.duration_ms();
        Self {
            id: task.id,
            organization_id: task.organization_id,
            task_type: task.task_type,
            agent_type: task.agent_type,
            status: task.status,
            priority: task.priority,
            output_data: task.output_data,
            error_message: task.error_message,
            scheduled_at: task.scheduled_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            duration_ms,
            retry_count: task.retry_count,
        }
    }
}

/// GET /v1/tasks/{task_id}
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<TaskResponse>> {
    let task = state
        .tasks
        .find_task(task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {task_id}")))?;
    Ok(Json(TaskResponse::from(task)))
}
