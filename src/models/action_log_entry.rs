//! # Action Log Entry Model
//!
//! Append-only ledger entry for an executed action. Entries are never
//! deleted except by the ledger's size-bounded FIFO trim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::ActionStatus;

/// One executed action in the append-only ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: Uuid,
    pub playbook_id: String,
    pub action_type: String,
    pub status: ActionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// New ledger entry (id and start time assigned on append)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewActionLogEntry {
    pub playbook_id: String,
    pub action_type: String,
    pub status: ActionStatus,
}

impl ActionLogEntry {
    /// Recompute `duration_ms` from the start/completion stamps
    pub fn recompute_duration(&mut self) {
        self.duration_ms = self
            .completed_at
            .map(|done| done.signed_duration_since(self.started_at).num_milliseconds());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_recompute() {
        let started = Utc::now();
        let mut entry = ActionLogEntry {
            id: Uuid::new_v4(),
            playbook_id: "pb-1".to_string(),
            action_type: "crm_update".to_string(),
            status: ActionStatus::Completed,
            started_at: started,
            completed_at: Some(started + chrono::Duration::milliseconds(340)),
            duration_ms: None,
            output: None,
            error: None,
        };

        entry.recompute_duration();
        assert_eq!(entry.duration_ms, Some(340));

        entry.completed_at = None;
        entry.recompute_duration();
        assert_eq!(entry.duration_ms, None);
    }
}
