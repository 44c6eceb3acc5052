//! # PostgreSQL Storage
//!
//! SQLx-backed implementation of the storage traits for multi-process
//! deployments. Atomicity comes from the database: the idempotency begin
//! is an `INSERT .. ON CONFLICT DO NOTHING` against the
//! `(key, organization_id)` unique constraint, and the dispatch claim is
//! an `UPDATE .. RETURNING` over `FOR UPDATE SKIP LOCKED` so two
//! executors never claim the same task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{IdempotencyBegin, IdempotencyStore, RuleStore, TaskStore, TraceStore};
use crate::error::{AgentCoreError, Result};
use crate::models::{
    IdempotencyRecord, NewStrategyRule, NewTask, SpanSummary, StrategyRule, Task, TraceSummary,
};
use crate::state_machine::IdempotencyStatus;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_tasks (
    id UUID PRIMARY KEY,
    organization_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    input_data JSONB NOT NULL,
    output_data JSONB,
    error_message TEXT,
    idempotency_key TEXT,
    scheduled_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_tasks_due
    ON agent_tasks (status, scheduled_at, priority);

CREATE TABLE IF NOT EXISTS agent_idempotency_records (
    key TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    status TEXT NOT NULL,
    response_data JSONB,
    expires_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (key, organization_id)
);

CREATE TABLE IF NOT EXISTS agent_strategy_rules (
    id UUID PRIMARY KEY,
    organization_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    error_pattern TEXT NOT NULL,
    advice TEXT NOT NULL,
    confidence_score DOUBLE PRECISION NOT NULL,
    times_applied BIGINT NOT NULL DEFAULT 0,
    last_applied_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_strategy_rules_lookup
    ON agent_strategy_rules (organization_id, task_type);

CREATE TABLE IF NOT EXISTS agent_trace_summaries (
    trace_id UUID PRIMARY KEY,
    organization_id TEXT NOT NULL,
    agent_type TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time TIMESTAMPTZ NOT NULL,
    end_time TIMESTAMPTZ,
    spans JSONB NOT NULL,
    metadata JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_trace_summaries_org
    ON agent_trace_summaries (organization_id, start_time DESC);
"#;

const TASK_COLUMNS: &str = "id, organization_id, task_type, agent_type, status, priority, \
     input_data, output_data, error_message, idempotency_key, scheduled_at, \
     started_at, completed_at, retry_count, created_at, updated_at";

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    organization_id: String,
    task_type: String,
    agent_type: String,
    status: String,
    priority: i32,
    input_data: serde_json::Value,
    output_data: Option<serde_json::Value>,
    error_message: Option<String>,
    idempotency_key: Option<String>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        Ok(Task {
            id: self.id,
            organization_id: self.organization_id,
            task_type: self.task_type,
            agent_type: self.agent_type,
            status: self
                .status
                .parse()
                .map_err(|e: String| AgentCoreError::storage("task_row", e))?,
            priority: self.priority,
            input_data: self.input_data,
            output_data: self.output_data,
            error_message: self.error_message,
            idempotency_key: self.idempotency_key,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            retry_count: self.retry_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct IdempotencyRow {
    key: String,
    organization_id: String,
    status: String,
    response_data: Option<serde_json::Value>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl IdempotencyRow {
    fn into_record(self) -> Result<IdempotencyRecord> {
        Ok(IdempotencyRecord {
            key: self.key,
            organization_id: self.organization_id,
            status: self
                .status
                .parse()
                .map_err(|e: String| AgentCoreError::storage("idempotency_row", e))?,
            response_data: self.response_data,
            expires_at: self.expires_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    id: Uuid,
    organization_id: String,
    task_type: String,
    error_pattern: String,
    advice: String,
    confidence_score: f64,
    times_applied: i64,
    last_applied_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl RuleRow {
    fn into_rule(self) -> StrategyRule {
        StrategyRule {
            id: self.id,
            organization_id: self.organization_id,
            task_type: self.task_type,
            error_pattern: self.error_pattern,
            advice: self.advice,
            confidence_score: self.confidence_score,
            times_applied: self.times_applied,
            last_applied_at: self.last_applied_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    trace_id: Uuid,
    organization_id: String,
    agent_type: String,
    status: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    spans: serde_json::Value,
    metadata: serde_json::Value,
}

impl SummaryRow {
    fn into_summary(self) -> Result<TraceSummary> {
        let spans: Vec<SpanSummary> = serde_json::from_value(self.spans)?;
        Ok(TraceSummary {
            trace_id: self.trace_id,
            organization_id: self.organization_id,
            agent_type: self.agent_type,
            status: self
                .status
                .parse()
                .map_err(|e: String| AgentCoreError::storage("summary_row", e))?,
            start_time: self.start_time,
            end_time: self.end_time,
            spans,
            metadata: self.metadata,
        })
    }
}

/// PostgreSQL-backed storage
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply the schema
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| AgentCoreError::storage("connect", e.to_string()))?;
        let storage = Self::new(pool);
        storage.migrate().await?;
        Ok(storage)
    }

    /// Apply the idempotent schema statements
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("storage schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresStorage {
    async fn create_task(&self, new_task: NewTask) -> Result<Task> {
        let task = new_task.into_task(Utc::now());
        let sql = format!(
            "INSERT INTO agent_tasks ({TASK_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        );
        sqlx::query(&sql)
            .bind(task.id)
            .bind(&task.organization_id)
            .bind(&task.task_type)
            .bind(&task.agent_type)
            .bind(task.status.to_string())
            .bind(task.priority)
            .bind(&task.input_data)
            .bind(&task.output_data)
            .bind(&task.error_message)
            .bind(&task.idempotency_key)
            .bind(task.scheduled_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(task.retry_count)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(task)
    }

    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM agent_tasks WHERE id = $1");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn claim_due_tasks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Task>> {
        let sql = format!(
            "UPDATE agent_tasks \
             SET status = 'running', started_at = $2, completed_at = NULL, updated_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM agent_tasks \
                 WHERE status = 'queued' AND scheduled_at <= $2 \
                 ORDER BY priority DESC, scheduled_at ASC \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {TASK_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(i64::from(limit))
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified; restore the claim order
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.scheduled_at.cmp(&b.scheduled_at)));
        debug!(claimed = tasks.len(), "claimed due tasks");
        Ok(tasks)
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        output: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agent_tasks \
             SET status = 'completed', output_data = $2, error_message = NULL, \
                 completed_at = $3, updated_at = $3 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(task_id)
        .bind(output)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error_message: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<i32> {
        let (retry_count,): (i32,) = sqlx::query_as(
            "UPDATE agent_tasks \
             SET status = 'failed', error_message = $2, completed_at = $3, \
                 retry_count = retry_count + 1, updated_at = $3 \
             WHERE id = $1 AND status = 'running' \
             RETURNING retry_count",
        )
        .bind(task_id)
        .bind(error_message)
        .bind(failed_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(retry_count)
    }

    async fn requeue_task(&self, task_id: Uuid, scheduled_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE agent_tasks \
             SET status = 'queued', scheduled_at = $2, started_at = NULL, \
                 completed_at = NULL, updated_at = $3 \
             WHERE id = $1 AND status IN ('running', 'failed')",
        )
        .bind(task_id)
        .bind(scheduled_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_task_if_queued(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE agent_tasks \
             SET status = 'cancelled', completed_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'queued'",
        )
        .bind(task_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_task_cancelled(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE agent_tasks \
             SET status = 'cancelled', completed_at = $2, updated_at = $2 \
             WHERE id = $1 AND status IN ('queued', 'running')",
        )
        .bind(task_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reclaim_stale_tasks(&self, started_before: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE agent_tasks \
             SET status = 'queued', scheduled_at = $2, started_at = NULL, updated_at = $2 \
             WHERE status = 'running' \
               AND (started_at IS NULL OR started_at < $1) \
             RETURNING id",
        )
        .bind(started_before)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStorage {
    async fn begin(
        &self,
        key: &str,
        organization_id: &str,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyBegin> {
        // Lazy expiry, then insert-or-observe. The unique constraint on
        // (key, organization_id) serializes concurrent first attempts; a
        // second pass covers the window where a peer's record expires
        // between our delete and insert.
        for _ in 0..2 {
            sqlx::query(
                "DELETE FROM agent_idempotency_records \
                 WHERE key = $1 AND organization_id = $2 AND expires_at <= $3",
            )
            .bind(key)
            .bind(organization_id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            let inserted = sqlx::query(
                "INSERT INTO agent_idempotency_records \
                 (key, organization_id, status, response_data, expires_at, created_at) \
                 VALUES ($1, $2, 'processing', NULL, $3, $4) \
                 ON CONFLICT (key, organization_id) DO NOTHING",
            )
            .bind(key)
            .bind(organization_id)
            .bind(now + ttl)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() > 0 {
                return Ok(IdempotencyBegin::Started);
            }

            let existing = sqlx::query_as::<_, IdempotencyRow>(
                "SELECT key, organization_id, status, response_data, expires_at, created_at \
                 FROM agent_idempotency_records \
                 WHERE key = $1 AND organization_id = $2",
            )
            .bind(key)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = existing {
                return Ok(IdempotencyBegin::Existing(row.into_record()?));
            }
        }

        Err(AgentCoreError::storage(
            "idempotency_begin",
            format!("could not settle key {key} for {organization_id}"),
        ))
    }

    async fn finish(
        &self,
        key: &str,
        organization_id: &str,
        status: IdempotencyStatus,
        response_data: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE agent_idempotency_records \
             SET status = $3, response_data = $4 \
             WHERE key = $1 AND organization_id = $2",
        )
        .bind(key)
        .bind(organization_id)
        .bind(status.to_string())
        .bind(response_data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM agent_idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl RuleStore for PostgresStorage {
    async fn insert_rule(&self, rule: NewStrategyRule) -> Result<StrategyRule> {
        let rule = rule.into_rule(Utc::now());
        sqlx::query(
            "INSERT INTO agent_strategy_rules \
             (id, organization_id, task_type, error_pattern, advice, confidence_score, \
              times_applied, last_applied_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(rule.id)
        .bind(&rule.organization_id)
        .bind(&rule.task_type)
        .bind(&rule.error_pattern)
        .bind(&rule.advice)
        .bind(rule.confidence_score)
        .bind(rule.times_applied)
        .bind(rule.last_applied_at)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(rule)
    }

    async fn rules_for_task_type(
        &self,
        organization_id: &str,
        task_type: &str,
    ) -> Result<Vec<StrategyRule>> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT id, organization_id, task_type, error_pattern, advice, confidence_score, \
                    times_applied, last_applied_at, created_at \
             FROM agent_strategy_rules \
             WHERE organization_id = $1 AND task_type = $2 \
             ORDER BY confidence_score DESC",
        )
        .bind(organization_id)
        .bind(task_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RuleRow::into_rule).collect())
    }

    async fn record_rule_applied(
        &self,
        rule_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<StrategyRule>> {
        let row = sqlx::query_as::<_, RuleRow>(
            "UPDATE agent_strategy_rules \
             SET times_applied = times_applied + 1, \
                 confidence_score = LEAST(confidence_score + 0.05, 1.0), \
                 last_applied_at = $2 \
             WHERE id = $1 \
             RETURNING id, organization_id, task_type, error_pattern, advice, \
                       confidence_score, times_applied, last_applied_at, created_at",
        )
        .bind(rule_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RuleRow::into_rule))
    }
}

#[async_trait]
impl TraceStore for PostgresStorage {
    async fn persist_summary(&self, summary: TraceSummary) -> Result<()> {
        let spans = serde_json::to_value(&summary.spans)?;
        sqlx::query(
            "INSERT INTO agent_trace_summaries \
             (trace_id, organization_id, agent_type, status, start_time, end_time, spans, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (trace_id) DO UPDATE \
             SET status = EXCLUDED.status, end_time = EXCLUDED.end_time, \
                 spans = EXCLUDED.spans, metadata = EXCLUDED.metadata",
        )
        .bind(summary.trace_id)
        .bind(&summary.organization_id)
        .bind(&summary.agent_type)
        .bind(summary.status.to_string())
        .bind(summary.start_time)
        .bind(summary.end_time)
        .bind(spans)
        .bind(&summary.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_summary(&self, trace_id: Uuid) -> Result<Option<TraceSummary>> {
        let row = sqlx::query_as::<_, SummaryRow>(
            "SELECT trace_id, organization_id, agent_type, status, start_time, end_time, \
                    spans, metadata \
             FROM agent_trace_summaries WHERE trace_id = $1",
        )
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SummaryRow::into_summary).transpose()
    }

    async fn recent_summaries(
        &self,
        organization_id: &str,
        limit: u32,
    ) -> Result<Vec<TraceSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT trace_id, organization_id, agent_type, status, start_time, end_time, \
                    spans, metadata \
             FROM agent_trace_summaries \
             WHERE organization_id = $1 \
             ORDER BY start_time DESC \
             LIMIT $2",
        )
        .bind(organization_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SummaryRow::into_summary).collect()
    }
}
