//! # Storage Layer
//!
//! Persistence traits consumed by the core, with two shipped backends:
//!
//! - [`memory::InMemoryStorage`]: concurrent-map-backed, the default for
//!   embedded use and tests. Per-key entry guards supply the atomicity
//!   the idempotency and claim contracts require.
//! - [`postgres::PostgresStorage`]: SQLx-backed, relying on unique
//!   constraints (`ON CONFLICT`) and `FOR UPDATE SKIP LOCKED` for the
//!   same guarantees across processes.
//!
//! The traits are deliberately narrow: upsert-with-conflict-detection for
//! idempotency, an atomic claim for dispatch, ordered range reads for
//! rules and summaries. Anything wider belongs to the components.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    IdempotencyRecord, NewStrategyRule, NewTask, StrategyRule, Task, TraceSummary,
};
use crate::state_machine::IdempotencyStatus;

/// Outcome of an atomic idempotency begin
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyBegin {
    /// No live record existed; a `processing` record now holds the key
    /// and the caller owns the side effect.
    Started,
    /// A live record exists; the caller must not execute the side effect.
    Existing(IdempotencyRecord),
}

/// Task persistence: creation, atomic claim, and completion bookkeeping
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new queued task
    async fn create_task(&self, new_task: NewTask) -> Result<Task>;

    /// Fetch a task by id
    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>>;

    /// Atomically claim up to `limit` due tasks: queued, scheduled at or
    /// before `now`, highest priority first, FIFO within equal priority.
    /// Claimed tasks transition to running with `started_at` stamped.
    /// Two concurrent claimers never receive the same task.
    async fn claim_due_tasks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>>;

    /// Transition a running task to completed, recording its output
    async fn complete_task(
        &self,
        task_id: Uuid,
        output: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Transition a running task to failed, recording the error and
    /// incrementing `retry_count`. Returns the new retry count.
    async fn fail_task(
        &self,
        task_id: Uuid,
        error_message: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<i32>;

    /// Return a task to the queue for a later attempt. Keeps
    /// `retry_count`; clears the execution stamps.
    async fn requeue_task(&self, task_id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()>;

    /// Cancel a task that has not started. Returns false when the task
    /// was already running or terminal.
    async fn cancel_task_if_queued(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Mark a running task cancelled (cooperative cancellation observed)
    async fn mark_task_cancelled(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Crash recovery: re-queue running tasks whose `started_at` is older
    /// than `started_before`. Returns the reclaimed ids.
    async fn reclaim_stale_tasks(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>>;
}

/// Idempotency persistence with atomic check-then-insert
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Single logical check-then-insert for `(key, organization_id)`:
    /// delete an expired record and fall through; return an existing live
    /// record; otherwise insert `processing` with the TTL. Atomic with
    /// respect to concurrent callers on the same key.
    async fn begin(
        &self,
        key: &str,
        organization_id: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyBegin>;

    /// Store the terminal outcome for an in-flight key
    async fn finish(
        &self,
        key: &str,
        organization_id: &str,
        status: IdempotencyStatus,
        response_data: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Drop expired records; returns how many were removed
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Strategy rule persistence for the self-healing loop
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Persist a freshly diagnosed rule
    async fn insert_rule(&self, rule: NewStrategyRule) -> Result<StrategyRule>;

    /// Rules for a task type, ordered by descending confidence
    async fn rules_for_task_type(
        &self,
        organization_id: &str,
        task_type: &str,
    ) -> Result<Vec<StrategyRule>>;

    /// Bump `times_applied`/`confidence_score` and stamp
    /// `last_applied_at`. Returns the updated rule when it exists.
    async fn record_rule_applied(
        &self,
        rule_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<StrategyRule>>;
}

/// Persisted trace summaries, written on terminal transitions
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Persist the flattened summary of a finished trace
    async fn persist_summary(&self, summary: TraceSummary) -> Result<()>;

    /// Fetch one persisted summary by trace id
    async fn find_summary(&self, trace_id: Uuid) -> Result<Option<TraceSummary>>;

    /// Most recent summaries for an organization, newest first
    async fn recent_summaries(
        &self,
        organization_id: &str,
        limit: u32,
    ) -> Result<Vec<TraceSummary>>;
}
