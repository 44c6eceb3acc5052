//! # Scheduler/Executor
//!
//! Polls for due tasks and dispatches them to their registered handlers
//! under the core's guards. The dispatch path per task:
//!
//! 1. rate-limiter admission (deny defers the task by `reset_in_ms`)
//! 2. strategy advice fetched for the task type
//! 3. trace opened, handler span added
//! 4. handler invoked under the per-dispatch timeout, wrapped by the
//!    idempotency manager when the task declares a key
//! 5. success: completed status, output recorded, action ledger entry,
//!    completed trace, surfaced advice marked applied
//! 6. failure: failed status, error recorded, healing loop consulted,
//!    re-queued with exponential backoff below the retry ceiling
//!
//! Admission and idempotency short-circuit before any side effect runs.
//! Handler failures are never silently swallowed: they land in the
//! action ledger, the trace, and the rule base.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::actionlog::ActionLog;
use crate::config::ExecutorConfig;
use crate::error::{AgentCoreError, Result};
use crate::healing::SelfHealingLoop;
use crate::idempotency::{with_idempotency, IdempotencyManager};
use crate::models::{NewActionLogEntry, StrategyRule, Task};
use crate::registry::{TaskContext, TaskHandlerRegistry};
use crate::resilience::RateLimiter;
use crate::state_machine::ActionStatus;
use crate::storage::TaskStore;
use crate::trace::{SpanOutcome, SpanSpec, TraceEvent, TraceManager};

/// How one dispatch settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed,
    /// Handler failed; `terminal` once the retry ceiling is reached
    Failed { terminal: bool },
    /// Admission denied; re-queued for `reset_in_ms` later
    Deferred,
    /// Cooperative cancellation observed
    Cancelled,
}

/// Counters for one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub deferred: usize,
    pub cancelled: usize,
}

/// Poll-and-dispatch executor over the storage, guard, and trace layers
pub struct Scheduler {
    config: ExecutorConfig,
    tasks: Arc<dyn TaskStore>,
    registry: Arc<TaskHandlerRegistry>,
    rate_limiter: Arc<RateLimiter>,
    idempotency: Arc<IdempotencyManager>,
    traces: Arc<TraceManager>,
    action_log: Arc<ActionLog>,
    healing: Arc<SelfHealingLoop>,
    /// Cancellation signals for running dispatches
    active: DashMap<Uuid, CancellationToken>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        tasks: Arc<dyn TaskStore>,
        registry: Arc<TaskHandlerRegistry>,
        rate_limiter: Arc<RateLimiter>,
        idempotency: Arc<IdempotencyManager>,
        traces: Arc<TraceManager>,
        action_log: Arc<ActionLog>,
        healing: Arc<SelfHealingLoop>,
    ) -> Self {
        Self {
            config,
            tasks,
            registry,
            rate_limiter,
            idempotency,
            traces,
            action_log,
            healing,
            active: DashMap::new(),
        }
    }

    /// Run one poll-and-dispatch cycle: claim a bounded batch of due
    /// tasks and process them concurrently.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let claimed = self
            .tasks
            .claim_due_tasks(Utc::now(), self.config.batch_size)
            .await?;
        if claimed.is_empty() {
            return Ok(CycleStats::default());
        }

        let mut stats = CycleStats {
            claimed: claimed.len(),
            ..CycleStats::default()
        };
        debug!(claimed = stats.claimed, "dispatching claimed tasks");

        let outcomes = join_all(claimed.into_iter().map(|task| self.dispatch(task))).await;
        for outcome in outcomes {
            match outcome {
                DispatchOutcome::Completed => stats.completed += 1,
                DispatchOutcome::Failed { .. } => stats.failed += 1,
                DispatchOutcome::Deferred => stats.deferred += 1,
                DispatchOutcome::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    /// Dispatch one claimed task through the guard stack
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn dispatch(&self, task: Task) -> DispatchOutcome {
        let task_id = task.id;
        let token = CancellationToken::new();
        self.active.insert(task_id, token.clone());
        let outcome = self.dispatch_inner(task, token).await;
        self.active.remove(&task_id);
        outcome
    }

    async fn dispatch_inner(&self, task: Task, token: CancellationToken) -> DispatchOutcome {
        // Admission control comes first: deny must short-circuit before
        // any side effect.
        let decision = self
            .rate_limiter
            .check(&task.organization_id, &task.agent_type);
        if !decision.allowed {
            let retry_at = Utc::now() + chrono::Duration::milliseconds(decision.reset_in_ms as i64);
            debug!(
                task_id = %task.id,
                endpoint_class = %task.agent_type,
                reset_in_ms = decision.reset_in_ms,
                "admission denied, deferring task"
            );
            if let Err(err) = self.tasks.requeue_task(task.id, retry_at).await {
                error!(task_id = %task.id, error = %err, "failed to defer denied task");
            }
            return DispatchOutcome::Deferred;
        }

        let advice = match self
            .healing
            .advice_for(&task.organization_id, &task.task_type)
            .await
        {
            Ok(advice) => advice,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "strategy advice unavailable");
                Vec::new()
            }
        };

        let trace_id = self.traces.start_trace(
            &task.organization_id,
            &task.agent_type,
            json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "retry_count": task.retry_count,
            }),
        );
        if !advice.is_empty() {
            let _ = self.traces.add_event(
                trace_id,
                TraceEvent::now(
                    "strategy advice attached",
                    Some(json!({ "rules": advice.len() })),
                ),
            );
        }

        let ledger_entry = self.action_log.log(NewActionLogEntry {
            playbook_id: playbook_id_of(&task),
            action_type: task.task_type.clone(),
            status: ActionStatus::Executing,
        });

        let handler_span = self
            .traces
            .add_span(
                trace_id,
                SpanSpec {
                    name: task.task_type.clone(),
                    span_type: "handler".to_string(),
                    input: Some(task.input_data.clone()),
                },
            )
            .ok();

        let result = self
            .invoke_handler(&task, advice.clone(), trace_id, token.clone())
            .await;

        match result {
            Ok(output) => {
                self.settle_success(&task, trace_id, handler_span, ledger_entry.id, output, advice)
                    .await
            }
            Err(_) if token.is_cancelled() => {
                self.settle_cancelled(&task, trace_id, handler_span, ledger_entry.id)
                    .await
            }
            Err(err) => {
                self.settle_failure(&task, trace_id, handler_span, ledger_entry.id, err)
                    .await
            }
        }
    }

    async fn invoke_handler(
        &self,
        task: &Task,
        advice: Vec<StrategyRule>,
        trace_id: Uuid,
        token: CancellationToken,
    ) -> Result<serde_json::Value> {
        let handler = self.registry.resolve(&task.task_type).ok_or_else(|| {
            AgentCoreError::handler_failure(
                task.task_type.clone(),
                format!("no handler registered for task type {}", task.task_type),
            )
        })?;

        let ctx = TaskContext::new(
            task.clone(),
            advice,
            trace_id,
            Arc::clone(&self.traces),
            token,
        );
        let timeout = self.config.handler_timeout();

        let run = async {
            match tokio::time::timeout(timeout, handler.handle(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(AgentCoreError::handler_failure(
                    task.task_type.clone(),
                    format!("handler timed out after {}ms", timeout.as_millis()),
                )),
            }
        };

        match &task.idempotency_key {
            // A duplicate returns the stored result without re-running;
            // an in-flight duplicate surfaces as an error so retry
            // policy re-checks later.
            Some(key) => {
                with_idempotency(&self.idempotency, key, &task.organization_id, || run).await
            }
            None => run.await,
        }
    }

    async fn settle_success(
        &self,
        task: &Task,
        trace_id: Uuid,
        handler_span: Option<Uuid>,
        ledger_id: Uuid,
        output: serde_json::Value,
        advice: Vec<StrategyRule>,
    ) -> DispatchOutcome {
        let now = Utc::now();
        if let Err(err) = self.tasks.complete_task(task.id, output.clone(), now).await {
            error!(task_id = %task.id, error = %err, "failed to record task completion");
        }

        if let Some(span_id) = handler_span {
            let _ = self.traces.end_span(
                trace_id,
                span_id,
                SpanOutcome::completed(Some(output.clone())),
            );
        }
        self.action_log
            .complete(ledger_id, ActionStatus::Completed, Some(output), None);
        if let Err(err) = self.traces.complete_trace(trace_id, None).await {
            warn!(task_id = %task.id, error = %err, "failed to complete trace");
        }

        // Surfaced rules are credited once the execution they advised
        // succeeds
        for rule in advice {
            if let Err(err) = self.healing.mark_applied(rule.id).await {
                debug!(rule_id = %rule.id, error = %err, "rule application not recorded");
            }
        }

        info!(task_id = %task.id, task_type = %task.task_type, "task completed");
        DispatchOutcome::Completed
    }

    async fn settle_cancelled(
        &self,
        task: &Task,
        trace_id: Uuid,
        handler_span: Option<Uuid>,
        ledger_id: Uuid,
    ) -> DispatchOutcome {
        let now = Utc::now();
        if let Err(err) = self.tasks.mark_task_cancelled(task.id, now).await {
            error!(task_id = %task.id, error = %err, "failed to record cancellation");
        }
        if let Some(span_id) = handler_span {
            let _ = self
                .traces
                .end_span(trace_id, span_id, SpanOutcome::failed("cancelled"));
        }
        self.action_log
            .complete(ledger_id, ActionStatus::Cancelled, None, None);
        let _ = self
            .traces
            .fail_trace(trace_id, TraceEvent::now("task cancelled", None))
            .await;

        info!(task_id = %task.id, "task cancelled during execution");
        DispatchOutcome::Cancelled
    }

    async fn settle_failure(
        &self,
        task: &Task,
        trace_id: Uuid,
        handler_span: Option<Uuid>,
        ledger_id: Uuid,
        err: AgentCoreError,
    ) -> DispatchOutcome {
        let now = Utc::now();
        let error_message = err.to_string();

        if let Some(span_id) = handler_span {
            let _ = self.traces.end_span(
                trace_id,
                span_id,
                SpanOutcome::failed(error_message.clone()),
            );
        }
        self.action_log.complete(
            ledger_id,
            ActionStatus::Failed,
            None,
            Some(error_message.clone()),
        );
        let _ = self
            .traces
            .fail_trace(trace_id, TraceEvent::now(error_message.clone(), None))
            .await;

        let retry_count = match self.tasks.fail_task(task.id, &error_message, now).await {
            Ok(count) => count,
            Err(store_err) => {
                error!(task_id = %task.id, error = %store_err, "failed to record task failure");
                task.retry_count + 1
            }
        };

        // Healing is best-effort and never masks the handler failure
        if let Err(heal_err) = self
            .healing
            .record_failure(
                &task.organization_id,
                &task.task_type,
                &error_message,
                &task.input_data,
            )
            .await
        {
            warn!(task_id = %task.id, error = %heal_err, "healing loop error");
        }

        let terminal = retry_count >= self.config.max_retries as i32;
        if terminal {
            error!(
                task_id = %task.id,
                task_type = %task.task_type,
                retry_count,
                error = %error_message,
                "task failed terminally"
            );
        } else {
            let delay = self.config.backoff.delay_for_attempt(retry_count as u32);
            let retry_at = now + delay;
            if let Err(requeue_err) = self.tasks.requeue_task(task.id, retry_at).await {
                error!(task_id = %task.id, error = %requeue_err, "failed to re-queue task");
            }
            warn!(
                task_id = %task.id,
                retry_count,
                delay_ms = delay.num_milliseconds(),
                "task failed, re-queued with backoff"
            );
        }
        DispatchOutcome::Failed { terminal }
    }

    /// Crash recovery: re-queue running tasks whose `started_at` is older
    /// than the stale timeout
    pub async fn reclaim_stale(&self) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - self.config.stale_task_timeout();
        let reclaimed = self.tasks.reclaim_stale_tasks(cutoff).await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed stale running tasks");
        }
        Ok(reclaimed)
    }

    /// Cancel a task: queued tasks flip to cancelled immediately; running
    /// tasks get their cooperative cancellation signal. Returns true when
    /// either applied.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        if self.tasks.cancel_task_if_queued(task_id, Utc::now()).await? {
            info!(%task_id, "queued task cancelled");
            return Ok(true);
        }
        if let Some(token) = self.active.get(&task_id) {
            token.cancel();
            info!(%task_id, "cancellation signalled to running task");
            return Ok(true);
        }
        Ok(false)
    }

    /// Drive cycles on the configured interval until shutdown fires
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.reclaim_stale().await {
                        error!(error = %err, "stale task reclaim failed");
                    }
                    match self.run_cycle().await {
                        Ok(stats) if stats.claimed > 0 => {
                            debug!(?stats, "cycle finished");
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "poll cycle failed"),
                    }
                }
            }
        }
    }
}

fn playbook_id_of(task: &Task) -> String {
    task.input_data
        .get("playbook_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| task.id.to_string())
}
