//! Shared fixtures for the integration suite.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use agent_core::config::AgentCoreConfig;
use agent_core::error::{AgentCoreError, Result};
use agent_core::healing::{Diagnosis, DiagnosticCollaborator};
use agent_core::models::NewTask;
use agent_core::registry::{TaskContext, TaskHandler};
use agent_core::runtime::{AgentRuntime, RuntimeStores};

/// Diagnostic that counts calls and returns a fixed low-overlap pattern
/// so rule dedup never suppresses a diagnosis unless a test wants it to.
pub struct CountingDiagnostic {
    pub calls: AtomicU32,
    pub root_cause: String,
}

impl CountingDiagnostic {
    pub fn new(root_cause: &str) -> Self {
        Self {
            calls: AtomicU32::new(0),
            root_cause: root_cause.to_string(),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagnosticCollaborator for CountingDiagnostic {
    async fn diagnose(
        &self,
        _task_type: &str,
        _error_log: &str,
        _context: &serde_json::Value,
    ) -> Result<Diagnosis> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Diagnosis {
            advice: "check the provider configuration".to_string(),
            confidence_score: 0.6,
            root_cause: self.root_cause.clone(),
        })
    }
}

/// Handler that counts executions and returns a fixed output
pub struct CountingHandler {
    pub calls: Arc<AtomicU32>,
    pub output: serde_json::Value,
}

impl CountingHandler {
    pub fn new(output: serde_json::Value) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                calls: Arc::clone(&calls),
                output,
            },
            calls,
        )
    }
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(&self, _ctx: &TaskContext) -> Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// Handler that always fails with the given message
pub struct AlwaysFailingHandler {
    pub message: String,
}

#[async_trait]
impl TaskHandler for AlwaysFailingHandler {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        Err(AgentCoreError::handler_failure(
            ctx.task().task_type.clone(),
            self.message.clone(),
        ))
    }
}

/// Handler that sleeps before answering
pub struct SlowHandler {
    pub delay: std::time::Duration,
}

#[async_trait]
impl TaskHandler for SlowHandler {
    async fn handle(&self, _ctx: &TaskContext) -> Result<serde_json::Value> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({"slow": true}))
    }
}

/// Handler that blocks until its cancellation signal fires
pub struct WaitForCancelHandler;

#[async_trait]
impl TaskHandler for WaitForCancelHandler {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
        ctx.cancelled().await;
        Err(AgentCoreError::handler_failure(
            ctx.task().task_type.clone(),
            "interrupted by cancellation",
        ))
    }
}

/// Fast-cycling configuration for tests: immediate backoff, short
/// timeouts
pub fn test_config() -> AgentCoreConfig {
    let mut config = AgentCoreConfig::default();
    config.executor.poll_interval_ms = 10;
    config.executor.handler_timeout_ms = 5_000;
    config.executor.backoff.base_delay_ms = 1;
    config.executor.backoff.max_delay_ms = 2;
    config.trace.retention_seconds = 60;
    config
}

/// Runtime over in-memory storage with the given diagnostic
pub fn runtime_with(
    config: AgentCoreConfig,
    diagnostic: Arc<dyn DiagnosticCollaborator>,
) -> AgentRuntime {
    AgentRuntime::new(config, RuntimeStores::in_memory(), diagnostic)
}

/// A queued task for `org-1`
pub fn new_task(task_type: &str, agent_type: &str) -> NewTask {
    NewTask {
        organization_id: "org-1".to_string(),
        task_type: task_type.to_string(),
        agent_type: agent_type.to_string(),
        priority: 1,
        input_data: json!({"playbook_id": "pb-1"}),
        idempotency_key: None,
        scheduled_at: None,
    }
}

/// Run cycles (with a short pause between them) until the task reaches a
/// terminal status or the attempts are used up
pub async fn run_until_terminal(runtime: &AgentRuntime, task_id: uuid::Uuid, attempts: u32) {
    for _ in 0..attempts {
        let _ = runtime.scheduler().run_cycle().await;
        if let Ok(Some(task)) = runtime.task_status(task_id).await {
            if task.status.is_terminal() {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
