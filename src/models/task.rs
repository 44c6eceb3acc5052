//! # Task Model
//!
//! A task is one unit of automated work tracked through a
//! queued -> terminal lifecycle. Producers (workflow definitions,
//! cron-like schedules) create tasks; only the scheduler mutates them
//! during dispatch and completion. Tasks are retained indefinitely for
//! audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::TaskStatus;

/// A unit of automated work owned by the scheduler.
///
/// `input_data` carries the handler payload; `output_data` and
/// `error_message` record the outcome. When `idempotency_key` is set,
/// dispatch is wrapped by the idempotency manager so the logical
/// operation executes at most once per `(key, organization_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub organization_id: String,
    pub task_type: String,
    pub agent_type: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub input_data: serde_json::Value,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Wall-clock duration of the last execution, when both stamps exist
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => {
                Some(completed.signed_duration_since(started).num_milliseconds())
            }
            _ => None,
        }
    }

    /// Whether the task is due for dispatch at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Queued && self.scheduled_at <= now
    }
}

/// New task for creation (without generated fields)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub organization_id: String,
    pub task_type: String,
    pub agent_type: String,
    pub priority: i32,
    pub input_data: serde_json::Value,
    pub idempotency_key: Option<String>,
    /// Defaults to now when not provided
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Build a queued task ready for insertion
    pub fn into_task(self, now: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            task_type: self.task_type,
            agent_type: self.agent_type,
            status: TaskStatus::Queued,
            priority: self.priority,
            input_data: self.input_data,
            output_data: None,
            error_message: None,
            idempotency_key: self.idempotency_key,
            scheduled_at: self.scheduled_at.unwrap_or(now),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_new_task() -> NewTask {
        NewTask {
            organization_id: "org-1".to_string(),
            task_type: "send_email".to_string(),
            agent_type: "messaging".to_string(),
            priority: 2,
            input_data: json!({"to": "ops@example.com"}),
            idempotency_key: None,
            scheduled_at: None,
        }
    }

    #[test]
    fn test_new_task_defaults() {
        let now = Utc::now();
        let task = sample_new_task().into_task(now);

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.scheduled_at, now);
        assert!(task.started_at.is_none());
        assert!(task.is_due(now));
    }

    #[test]
    fn test_duration_requires_both_stamps() {
        let now = Utc::now();
        let mut task = sample_new_task().into_task(now);
        assert_eq!(task.duration_ms(), None);

        task.started_at = Some(now);
        task.completed_at = Some(now + chrono::Duration::milliseconds(125));
        assert_eq!(task.duration_ms(), Some(125));
    }

    #[test]
    fn test_future_task_not_due() {
        let now = Utc::now();
        let mut new_task = sample_new_task();
        new_task.scheduled_at = Some(now + chrono::Duration::seconds(30));
        let task = new_task.into_task(now);

        assert!(!task.is_due(now));
        assert!(task.is_due(now + chrono::Duration::seconds(31)));
    }
}
