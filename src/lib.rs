#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Agent Core
//!
//! The execution core of an agent automation platform: accepts units of
//! automated work, guarantees each logical operation executes at most
//! once despite retries, throttles load per caller, records a navigable
//! trace of every step for post-hoc debugging, and feeds failures back
//! into a persistent rule base consulted before future executions.
//!
//! ## Architecture
//!
//! The scheduler discovers due tasks, the rate limiter admits or defers
//! each dispatch, the idempotency manager reserves the operation key,
//! the trace manager opens a span tree, and the registered handler (an
//! external collaborator) does the actual work. Success stores the
//! result and writes the action ledger; failure feeds the self-healing
//! loop and the retry policy.
//!
//! ## Module Organization
//!
//! - [`models`] - Data structures shared across the core
//! - [`state_machine`] - Lifecycle states and transition legality
//! - [`resilience`] - Sliding-window admission control
//! - [`idempotency`] - At-most-once execution per operation key
//! - [`trace`] - Span trees, events, and flattened summaries
//! - [`actionlog`] - Append-only, size-bounded action ledger
//! - [`healing`] - Failure-derived strategy rules
//! - [`registry`] - Typed task handler registry
//! - [`orchestration`] - The poll-and-dispatch scheduler
//! - [`storage`] - Persistence traits plus memory and PostgreSQL backends
//! - [`runtime`] - Assembly and background loops
//! - [`web`] - Read-only query API
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_core::config::AgentCoreConfig;
//! use agent_core::runtime::{AgentRuntime, RuntimeStores};
//! # use agent_core::healing::{Diagnosis, DiagnosticCollaborator};
//! # use async_trait::async_trait;
//! # struct NullDiagnostic;
//! # #[async_trait]
//! # impl DiagnosticCollaborator for NullDiagnostic {
//! #     async fn diagnose(&self, _: &str, _: &str, _: &serde_json::Value)
//! #         -> agent_core::error::Result<Diagnosis> { unimplemented!() }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AgentCoreConfig::load()?;
//! let runtime = AgentRuntime::new(config, RuntimeStores::in_memory(), Arc::new(NullDiagnostic));
//!
//! // Register handlers, then start the loops
//! let handles = runtime.start();
//! # Ok(())
//! # }
//! ```

pub mod actionlog;
pub mod config;
pub mod error;
pub mod healing;
pub mod idempotency;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod resilience;
pub mod runtime;
pub mod state_machine;
pub mod storage;
pub mod trace;
pub mod web;

pub use actionlog::{ActionLog, ActionLogQuery, ActionLogStats};
pub use config::AgentCoreConfig;
pub use error::{AgentCoreError, Result};
pub use healing::{Diagnosis, DiagnosticCollaborator, SelfHealingLoop};
pub use idempotency::{with_idempotency, IdempotencyCheck, IdempotencyManager};
pub use models::{
    ActionLogEntry, IdempotencyRecord, NewTask, SpanSummary, StrategyRule, Task, TraceSummary,
};
pub use orchestration::{CycleStats, DispatchOutcome, Scheduler};
pub use registry::{TaskContext, TaskHandler, TaskHandlerRegistry};
pub use resilience::{RateLimitDecision, RateLimiter};
pub use runtime::{AgentRuntime, RuntimeStores};
pub use state_machine::{ActionStatus, IdempotencyStatus, TaskStatus, TraceStatus};
pub use trace::{ExecutionTrace, Span, SpanOutcome, SpanSpec, TraceEvent, TraceManager};
