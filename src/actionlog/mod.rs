//! # Action Log
//!
//! Append-only, size-bounded ledger of executed actions with query and
//! aggregation support. Mutation is append/merge-only; entries only
//! leave the ledger through the FIFO trim once the cap is exceeded.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::VecDeque;
use tracing::debug;
use uuid::Uuid;

use crate::config::ActionLogConfig;
use crate::models::{ActionLogEntry, NewActionLogEntry};
use crate::state_machine::ActionStatus;

/// Filters for ledger queries; all optional, combined with AND
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionLogQuery {
    pub playbook_id: Option<String>,
    pub action_type: Option<String>,
    pub status: Option<ActionStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Mergeable fields for updating an entry in place
#[derive(Debug, Clone, Default)]
pub struct ActionLogPatch {
    pub status: Option<ActionStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Aggregated ledger statistics over a time window
#[derive(Debug, Clone, Serialize)]
pub struct ActionLogStats {
    pub window_hours: u32,
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_action_type: HashMap<String, usize>,
    pub average_duration_ms: f64,
    /// completed / (completed + failed); 0 when both counts are zero
    pub success_rate: f64,
    pub throughput_per_hour: f64,
}

/// Append-only action ledger, capped to a maximum retained count
pub struct ActionLog {
    config: ActionLogConfig,
    entries: RwLock<VecDeque<ActionLogEntry>>,
}

impl ActionLog {
    pub fn new(config: ActionLogConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(VecDeque::new()),
        }
    }

    /// Append a new entry, assigning id and start time, trimming FIFO
    /// when the cap is exceeded
    pub fn log(&self, action: NewActionLogEntry) -> ActionLogEntry {
        let entry = ActionLogEntry {
            id: Uuid::new_v4(),
            playbook_id: action.playbook_id,
            action_type: action.action_type,
            status: action.status,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            output: None,
            error: None,
        };

        let mut entries = self.entries.write();
        entries.push_back(entry.clone());
        while entries.len() > self.config.max_entries {
            entries.pop_front();
        }
        entry
    }

    /// Merge fields into an existing entry. Mutating an unknown or
    /// already-evicted id is a logged no-op; a second identical update
    /// converges to the same state.
    pub fn update(&self, id: Uuid, patch: ActionLogPatch) -> Option<ActionLogEntry> {
        let mut entries = self.entries.write();
        let entry = match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => entry,
            None => {
                debug!(%id, "action log update for unknown or evicted entry");
                return None;
            }
        };

        // Terminal entries are frozen: a second completion is a no-op
        if entry.status.is_terminal() {
            debug!(%id, "action log entry already terminal");
            return Some(entry.clone());
        }

        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(completed_at) = patch.completed_at {
            entry.completed_at = Some(completed_at);
        }
        if let Some(output) = patch.output {
            entry.output = Some(output);
        }
        if let Some(error) = patch.error {
            entry.error = Some(error);
        }
        entry.recompute_duration();
        Some(entry.clone())
    }

    /// Terminal merge: stamp completion and the final status
    pub fn complete(
        &self,
        id: Uuid,
        status: ActionStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Option<ActionLogEntry> {
        self.update(
            id,
            ActionLogPatch {
                status: Some(status),
                completed_at: Some(Utc::now()),
                output,
                error,
            },
        )
    }

    /// Filtered query, newest first, paginated via offset + limit
    pub fn query(&self, query: &ActionLogQuery) -> Vec<ActionLogEntry> {
        let entries = self.entries.read();
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);

        entries
            .iter()
            .rev()
            .filter(|e| {
                query
                    .playbook_id
                    .as_ref()
                    .map(|p| &e.playbook_id == p)
                    .unwrap_or(true)
                    && query
                        .action_type
                        .as_ref()
                        .map(|a| &e.action_type == a)
                        .unwrap_or(true)
                    && query.status.map(|s| e.status == s).unwrap_or(true)
                    && query.from.map(|from| e.started_at >= from).unwrap_or(true)
                    && query.to.map(|to| e.started_at <= to).unwrap_or(true)
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Counts, average duration, success rate, and throughput over the
    /// trailing window
    pub fn stats(&self, window_hours: u32) -> ActionLogStats {
        let cutoff = Utc::now() - chrono::Duration::hours(i64::from(window_hours));
        let entries = self.entries.read();

        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_action_type: HashMap<String, usize> = HashMap::new();
        let mut total = 0usize;
        let mut duration_sum = 0i64;
        let mut duration_count = 0usize;
        let mut completed = 0usize;
        let mut failed = 0usize;

        for entry in entries.iter().filter(|e| e.started_at >= cutoff) {
            total += 1;
            *by_status.entry(entry.status.to_string()).or_default() += 1;
            *by_action_type.entry(entry.action_type.clone()).or_default() += 1;
            if let Some(duration) = entry.duration_ms {
                duration_sum += duration;
                duration_count += 1;
            }
            match entry.status {
                ActionStatus::Completed => completed += 1,
                ActionStatus::Failed => failed += 1,
                _ => {}
            }
        }

        let average_duration_ms = if duration_count > 0 {
            duration_sum as f64 / duration_count as f64
        } else {
            0.0
        };
        let success_rate = if completed + failed > 0 {
            completed as f64 / (completed + failed) as f64
        } else {
            0.0
        };
        let throughput_per_hour = if window_hours > 0 {
            total as f64 / f64::from(window_hours)
        } else {
            0.0
        };

        ActionLogStats {
            window_hours,
            total,
            by_status,
            by_action_type,
            average_duration_ms,
            success_rate,
            throughput_per_hour,
        }
    }

    /// Current number of retained entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_cap(max_entries: usize) -> ActionLog {
        ActionLog::new(ActionLogConfig { max_entries })
    }

    fn new_entry(playbook: &str, action_type: &str) -> NewActionLogEntry {
        NewActionLogEntry {
            playbook_id: playbook.to_string(),
            action_type: action_type.to_string(),
            status: ActionStatus::Executing,
        }
    }

    #[test]
    fn test_cap_evicts_oldest_first() {
        let log = log_with_cap(100);
        let mut ids = Vec::new();
        for i in 0..150 {
            ids.push(log.log(new_entry(&format!("pb-{i}"), "crm_update")).id);
        }

        assert_eq!(log.len(), 100);
        let entries = log.query(&ActionLogQuery::default());
        assert_eq!(entries.len(), 100);
        // Newest first; the oldest 50 are gone
        assert_eq!(entries[0].id, ids[149]);
        assert_eq!(entries[99].id, ids[50]);
    }

    #[test]
    fn test_complete_computes_duration() {
        let log = log_with_cap(10);
        let entry = log.log(new_entry("pb-1", "send_email"));

        let updated = log
            .complete(entry.id, ActionStatus::Completed, Some(serde_json::json!({"ok": true})), None)
            .unwrap();
        assert_eq!(updated.status, ActionStatus::Completed);
        assert!(updated.completed_at.is_some());
        assert!(updated.duration_ms.is_some());
        assert!(updated.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn test_second_completion_is_noop() {
        let log = log_with_cap(10);
        let entry = log.log(new_entry("pb-1", "send_email"));

        let first = log
            .complete(entry.id, ActionStatus::Completed, None, None)
            .unwrap();
        let second = log
            .complete(entry.id, ActionStatus::Failed, None, Some("late".to_string()))
            .unwrap();

        assert_eq!(second.status, ActionStatus::Completed);
        assert_eq!(second.completed_at, first.completed_at);
        assert!(second.error.is_none());
    }

    #[test]
    fn test_update_unknown_entry_is_noop() {
        let log = log_with_cap(10);
        assert!(log
            .update(Uuid::new_v4(), ActionLogPatch::default())
            .is_none());
    }

    #[test]
    fn test_query_filters_and_pagination() {
        let log = log_with_cap(100);
        for i in 0..10 {
            let entry = log.log(new_entry("pb-1", if i % 2 == 0 { "email" } else { "sms" }));
            if i < 4 {
                log.complete(entry.id, ActionStatus::Completed, None, None);
            }
        }

        let emails = log.query(&ActionLogQuery {
            action_type: Some("email".to_string()),
            ..Default::default()
        });
        assert_eq!(emails.len(), 5);

        let completed = log.query(&ActionLogQuery {
            status: Some(ActionStatus::Completed),
            ..Default::default()
        });
        assert_eq!(completed.len(), 4);

        let page = log.query(&ActionLogQuery {
            limit: Some(3),
            offset: Some(8),
            ..Default::default()
        });
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_stats_success_rate() {
        let log = log_with_cap(100);
        for outcome in [
            ActionStatus::Completed,
            ActionStatus::Completed,
            ActionStatus::Completed,
            ActionStatus::Failed,
        ] {
            let entry = log.log(new_entry("pb-1", "email"));
            log.complete(entry.id, outcome, None, None);
        }
        // Still-executing entries do not skew the success rate
        log.log(new_entry("pb-1", "email"));

        let stats = log.stats(24);
        assert_eq!(stats.total, 5);
        assert_eq!(stats.success_rate, 0.75);
        assert_eq!(stats.by_status["completed"], 3);
        assert_eq!(stats.by_status["failed"], 1);
        assert_eq!(stats.by_action_type["email"], 5);
    }

    #[test]
    fn test_stats_zero_denominator_reports_zero() {
        let log = log_with_cap(100);
        log.log(new_entry("pb-1", "email"));

        let stats = log.stats(24);
        assert_eq!(stats.success_rate, 0.0);
        assert!(!stats.success_rate.is_nan());
    }

    #[test]
    fn test_stats_window_excludes_old_entries() {
        let log = log_with_cap(100);
        let entry = log.log(new_entry("pb-1", "email"));
        // Backdate beyond the window
        {
            let mut entries = log.entries.write();
            let stored = entries.iter_mut().find(|e| e.id == entry.id).unwrap();
            stored.started_at = Utc::now() - chrono::Duration::hours(48);
        }
        log.log(new_entry("pb-1", "email"));

        let stats = log.stats(24);
        assert_eq!(stats.total, 1);
    }
}
