//! # In-Memory Storage
//!
//! Concurrent-map-backed implementation of every storage trait. The map's
//! per-key entry guards serialize check-and-mutate sequences, which is
//! what makes `begin` and `claim_due_tasks` safe under concurrent
//! dispatch. Used for embedded deployments and throughout the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::VecDeque;
use uuid::Uuid;

use super::{IdempotencyBegin, IdempotencyStore, RuleStore, TaskStore, TraceStore};
use crate::error::{AgentCoreError, Result};
use crate::models::{
    IdempotencyRecord, NewStrategyRule, NewTask, StrategyRule, Task, TraceSummary,
};
use crate::state_machine::{IdempotencyStatus, TaskStatus};

const MAX_RETAINED_SUMMARIES: usize = 10_000;

/// All four stores in one struct; clone the `Arc` per consumer
#[derive(Default)]
pub struct InMemoryStorage {
    tasks: DashMap<Uuid, Task>,
    idempotency: DashMap<(String, String), IdempotencyRecord>,
    rules: DashMap<Uuid, StrategyRule>,
    summaries: RwLock<VecDeque<TraceSummary>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks currently held (any status)
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

fn unknown_task(task_id: Uuid) -> AgentCoreError {
    AgentCoreError::storage("task_lookup", format!("unknown task {task_id}"))
}

fn illegal_transition(operation: &str, from: TaskStatus, to: TaskStatus) -> AgentCoreError {
    AgentCoreError::storage(operation, format!("illegal transition {from} -> {to}"))
}

#[async_trait]
impl TaskStore for InMemoryStorage {
    async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        let task = new_task.into_task(Utc::now());
        self.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.tasks.get(&task_id).map(|t| t.clone()))
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>> {
        // Candidate scan without locks held, then a guarded per-task CAS.
        // A task raced away by another claimer simply drops out here.
        let mut due: Vec<(i32, DateTime<Utc>, Uuid)> = self
            .tasks
            .iter()
            .filter(|t| t.is_due(now))
            .map(|t| (t.priority, t.scheduled_at, t.id))
            .collect();
        due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut claimed = Vec::new();
        for (_, _, task_id) in due {
            if claimed.len() >= limit as usize {
                break;
            }
            if let Some(mut task) = self.tasks.get_mut(&task_id) {
                if task.is_due(now) {
                    task.status = TaskStatus::Running;
                    task.started_at = Some(now);
                    task.completed_at = None;
                    task.updated_at = now;
                    claimed.push(task.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        output: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut task = self.tasks.get_mut(&task_id).ok_or_else(|| unknown_task(task_id))?;
        if !task.status.can_transition_to(TaskStatus::Completed) {
            return Err(illegal_transition("complete_task", task.status, TaskStatus::Completed));
        }
        task.status = TaskStatus::Completed;
        task.output_data = Some(output);
        task.error_message = None;
        task.completed_at = Some(completed_at);
        task.updated_at = completed_at;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error_message: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<i32> {
        let mut task = self.tasks.get_mut(&task_id).ok_or_else(|| unknown_task(task_id))?;
        if !task.status.can_transition_to(TaskStatus::Failed) {
            return Err(illegal_transition("fail_task", task.status, TaskStatus::Failed));
        }
        task.status = TaskStatus::Failed;
        task.error_message = Some(error_message.to_string());
        task.completed_at = Some(failed_at);
        task.retry_count += 1;
        task.updated_at = failed_at;
        Ok(task.retry_count)
    }

    async fn requeue_task(&self, task_id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()> {
        let mut task = self.tasks.get_mut(&task_id).ok_or_else(|| unknown_task(task_id))?;
        if !task.status.can_transition_to(TaskStatus::Queued) {
            return Err(illegal_transition("requeue_task", task.status, TaskStatus::Queued));
        }
        task.status = TaskStatus::Queued;
        task.scheduled_at = scheduled_at;
        task.started_at = None;
        task.completed_at = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_task_if_queued(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut task = self.tasks.get_mut(&task_id).ok_or_else(|| unknown_task(task_id))?;
        if task.status != TaskStatus::Queued {
            return Ok(false);
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(at);
        task.updated_at = at;
        Ok(true)
    }

    async fn mark_task_cancelled(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut task = self.tasks.get_mut(&task_id).ok_or_else(|| unknown_task(task_id))?;
        if !task.status.can_transition_to(TaskStatus::Cancelled) {
            return Err(illegal_transition("mark_task_cancelled", task.status, TaskStatus::Cancelled));
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(at);
        task.updated_at = at;
        Ok(())
    }

    async fn reclaim_stale_tasks(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let stale: Vec<Uuid> = self
            .tasks
            .iter()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.started_at.map(|s| s < started_before).unwrap_or(true)
            })
            .map(|t| t.id)
            .collect();

        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for task_id in stale {
            if let Some(mut task) = self.tasks.get_mut(&task_id) {
                if task.status == TaskStatus::Running
                    && task.started_at.map(|s| s < started_before).unwrap_or(true)
                {
                    task.status = TaskStatus::Queued;
                    task.scheduled_at = now;
                    task.started_at = None;
                    task.updated_at = now;
                    reclaimed.push(task_id);
                }
            }
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStorage {
    async fn begin(
        &self,
        key: &str,
        organization_id: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyBegin> {
        let map_key = (key.to_string(), organization_id.to_string());
        match self.idempotency.entry(map_key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(IdempotencyRecord::processing(
                        key,
                        organization_id,
                        ttl,
                        now,
                    ));
                    Ok(IdempotencyBegin::Started)
                } else {
                    Ok(IdempotencyBegin::Existing(occupied.get().clone()))
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(IdempotencyRecord::processing(key, organization_id, ttl, now));
                Ok(IdempotencyBegin::Started)
            }
        }
    }

    async fn finish(
        &self,
        key: &str,
        organization_id: &str,
        status: IdempotencyStatus,
        response_data: Option<serde_json::Value>,
    ) -> Result<()> {
        let map_key = (key.to_string(), organization_id.to_string());
        let mut record = self.idempotency.get_mut(&map_key).ok_or_else(|| {
            AgentCoreError::storage("idempotency_finish", format!("no record for key {key}"))
        })?;
        record.status = status;
        record.response_data = response_data;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.idempotency.len();
        self.idempotency.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.idempotency.len()))
    }
}

#[async_trait]
impl RuleStore for InMemoryStorage {
    async fn insert_rule(&self, rule: NewStrategyRule) -> Result<StrategyRule> {
        let rule = rule.into_rule(Utc::now());
        self.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn rules_for_task_type(
        &self,
        organization_id: &str,
        task_type: &str,
    ) -> Result<Vec<StrategyRule>> {
        let mut rules: Vec<StrategyRule> = self
            .rules
            .iter()
            .filter(|r| r.organization_id == organization_id && r.task_type == task_type)
            .map(|r| r.clone())
            .collect();
        rules.sort_by(|a, b| {
            b.confidence_score
                .partial_cmp(&a.confidence_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rules)
    }

    async fn record_rule_applied(
        &self,
        rule_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<StrategyRule>> {
        match self.rules.get_mut(&rule_id) {
            Some(mut rule) => {
                rule.times_applied += 1;
                rule.confidence_score = (rule.confidence_score + 0.05).min(1.0);
                rule.last_applied_at = Some(at);
                Ok(Some(rule.clone()))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TraceStore for InMemoryStorage {
    async fn persist_summary(&self, summary: TraceSummary) -> Result<()> {
        let mut summaries = self.summaries.write();
        summaries.push_back(summary);
        while summaries.len() > MAX_RETAINED_SUMMARIES {
            summaries.pop_front();
        }
        Ok(())
    }

    async fn find_summary(&self, trace_id: Uuid) -> Result<Option<TraceSummary>> {
        Ok(self
            .summaries
            .read()
            .iter()
            .rev()
            .find(|s| s.trace_id == trace_id)
            .cloned())
    }

    async fn recent_summaries(
        &self,
        organization_id: &str,
        limit: u32,
    ) -> Result<Vec<TraceSummary>> {
        Ok(self
            .summaries
            .read()
            .iter()
            .rev()
            .filter(|s| s.organization_id == organization_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued_task(priority: i32) -> NewTask {
        NewTask {
            organization_id: "org-1".to_string(),
            task_type: "send_email".to_string(),
            agent_type: "messaging".to_string(),
            priority,
            input_data: json!({}),
            idempotency_key: None,
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_fifo() {
        let store = InMemoryStorage::new();
        let low = store.create_task(queued_task(1)).await.unwrap();
        let high = store.create_task(queued_task(5)).await.unwrap();

        let claimed = store.claim_due_tasks(Utc::now(), 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, high.id);
        assert_eq!(claimed[1].id, low.id);
        assert!(claimed.iter().all(|t| t.status == TaskStatus::Running));
        assert!(claimed.iter().all(|t| t.started_at.is_some()));
    }

    #[tokio::test]
    async fn test_claim_respects_limit_and_skips_claimed() {
        let store = InMemoryStorage::new();
        for _ in 0..5 {
            store.create_task(queued_task(1)).await.unwrap();
        }

        let first = store.claim_due_tasks(Utc::now(), 3).await.unwrap();
        let second = store.claim_due_tasks(Utc::now(), 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);

        let first_ids: Vec<Uuid> = first.iter().map(|t| t.id).collect();
        assert!(second.iter().all(|t| !first_ids.contains(&t.id)));
    }

    #[tokio::test]
    async fn test_terminal_tasks_reject_illegal_transitions() {
        let store = InMemoryStorage::new();
        let task = store.create_task(queued_task(1)).await.unwrap();
        store.claim_due_tasks(Utc::now(), 10).await.unwrap();
        store
            .complete_task(task.id, serde_json::json!({}), Utc::now())
            .await
            .unwrap();

        assert!(store
            .complete_task(task.id, serde_json::json!({}), Utc::now())
            .await
            .is_err());
        assert!(store.fail_task(task.id, "late", Utc::now()).await.is_err());
        assert!(store.requeue_task(task.id, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_begin_admits_exactly_one() {
        let store = std::sync::Arc::new(InMemoryStorage::new());
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(60);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.begin("key-1", "org-1", ttl, now).await.unwrap()
            }));
        }

        let mut started = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), IdempotencyBegin::Started) {
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_expired_record_restarts() {
        let store = InMemoryStorage::new();
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(10);

        assert!(matches!(
            store.begin("key-1", "org-1", ttl, now).await.unwrap(),
            IdempotencyBegin::Started
        ));

        let later = now + chrono::Duration::seconds(11);
        assert!(matches!(
            store.begin("key-1", "org-1", ttl, later).await.unwrap(),
            IdempotencyBegin::Started
        ));
    }

    #[tokio::test]
    async fn test_keys_scoped_per_organization() {
        let store = InMemoryStorage::new();
        let now = Utc::now();
        let ttl = chrono::Duration::seconds(60);

        store.begin("key-1", "org-1", ttl, now).await.unwrap();
        assert!(matches!(
            store.begin("key-1", "org-2", ttl, now).await.unwrap(),
            IdempotencyBegin::Started
        ));
    }

    #[tokio::test]
    async fn test_reclaim_only_stale_running() {
        let store = InMemoryStorage::new();
        let task = store.create_task(queued_task(1)).await.unwrap();
        store.claim_due_tasks(Utc::now(), 10).await.unwrap();

        // Nothing stale yet
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        assert!(store.reclaim_stale_tasks(cutoff).await.unwrap().is_empty());

        // Everything started before a future cutoff is stale
        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let reclaimed = store.reclaim_stale_tasks(cutoff).await.unwrap();
        assert_eq!(reclaimed, vec![task.id]);

        let task = store.find_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn test_rules_ordered_by_confidence() {
        let store = InMemoryStorage::new();
        for (pattern, confidence) in [("a", 0.3), ("b", 0.9), ("c", 0.6)] {
            store
                .insert_rule(NewStrategyRule {
                    organization_id: "org-1".to_string(),
                    task_type: "send_email".to_string(),
                    error_pattern: pattern.to_string(),
                    advice: "advice".to_string(),
                    confidence_score: confidence,
                })
                .await
                .unwrap();
        }

        let rules = store.rules_for_task_type("org-1", "send_email").await.unwrap();
        let scores: Vec<f64> = rules.iter().map(|r| r.confidence_score).collect();
        assert_eq!(scores, vec![0.9, 0.6, 0.3]);
    }

    #[tokio::test]
    async fn test_rule_applied_bumps_monotonically() {
        let store = InMemoryStorage::new();
        let rule = store
            .insert_rule(NewStrategyRule {
                organization_id: "org-1".to_string(),
                task_type: "send_email".to_string(),
                error_pattern: "timeout".to_string(),
                advice: "advice".to_string(),
                confidence_score: 0.97,
            })
            .await
            .unwrap();

        let updated = store
            .record_rule_applied(rule.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.times_applied, 1);
        assert_eq!(updated.confidence_score, 1.0);
        assert!(updated.last_applied_at.is_some());

        let again = store
            .record_rule_applied(rule.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.times_applied, 2);
        assert_eq!(again.confidence_score, 1.0);
    }
}
