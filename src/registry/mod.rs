//! # Task Handler Registry
//!
//! Typed registry resolving `task_type` strings to handler trait objects.
//! Handlers are the external collaborators that actually perform work;
//! the core hands them a context carrying the task, accumulated strategy
//! advice, the live trace, and the cooperative cancellation signal, and
//! receives back a result or an error, nothing more.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use agent_core::registry::{TaskContext, TaskHandler, TaskHandlerRegistry};
//! use agent_core::error::Result;
//!
//! struct SendEmailHandler;
//!
//! #[async_trait]
//! impl TaskHandler for SendEmailHandler {
//!     async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value> {
//!         // honor ctx.advice(), check ctx.is_cancelled() in long loops
//!         Ok(serde_json::json!({"sent": true}))
//!     }
//! }
//!
//! let registry = TaskHandlerRegistry::new();
//! registry.register("send_email", Arc::new(SendEmailHandler));
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{StrategyRule, Task};
use crate::trace::{SpanOutcome, SpanSpec, TraceEvent, TraceManager};

/// Execution context handed to a task handler
pub struct TaskContext {
    task: Task,
    advice: Vec<StrategyRule>,
    trace_id: Uuid,
    traces: Arc<TraceManager>,
    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(
        task: Task,
        advice: Vec<StrategyRule>,
        trace_id: Uuid,
        traces: Arc<TraceManager>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            task,
            advice,
            trace_id,
            traces,
            cancellation,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.task.input_data
    }

    /// Strategy rules for this task type, highest confidence first.
    /// Advisory: honoring them is the handler's responsibility.
    pub fn advice(&self) -> &[StrategyRule] {
        &self.advice
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Cooperative cancellation check; long-running handlers must poll
    /// this between units of work
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Await cancellation, for handlers that `select!` over it
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Open a child span on this execution's trace
    pub fn record_span(&self, spec: SpanSpec) -> Option<Uuid> {
        match self.traces.add_span(self.trace_id, spec) {
            Ok(span_id) => Some(span_id),
            Err(err) => {
                warn!(trace_id = %self.trace_id, error = %err, "span not recorded");
                None
            }
        }
    }

    /// Close a child span; idempotent
    pub fn end_span(&self, span_id: Uuid, outcome: SpanOutcome) {
        if let Err(err) = self.traces.end_span(self.trace_id, span_id, outcome) {
            warn!(trace_id = %self.trace_id, error = %err, "span not ended");
        }
    }

    /// Append a freeform event; never fails the execution
    pub fn record_event(&self, message: impl Into<String>, data: Option<serde_json::Value>) {
        if let Err(err) = self
            .traces
            .add_event(self.trace_id, TraceEvent::now(message, data))
        {
            debug!(trace_id = %self.trace_id, error = %err, "event not recorded");
        }
    }
}

/// External collaborator performing the task's side effect
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: &TaskContext) -> Result<serde_json::Value>;
}

/// Thread-safe registry keyed by `task_type`
#[derive(Default)]
pub struct TaskHandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a task type
    pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        debug!(task_type, "task handler registered");
        self.handlers.insert(task_type, handler);
    }

    /// Resolve the handler for a task type
    pub fn resolve(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).map(|h| Arc::clone(&h))
    }

    /// Registered task types, for diagnostics
    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
