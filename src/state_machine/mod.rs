//! # State Machine Foundation
//!
//! Lifecycle states for tasks, traces, actions, and idempotency records,
//! with explicit transition legality checks. Every mutation in the core
//! validates its transition here before touching storage.

pub mod states;

pub use states::{ActionStatus, IdempotencyStatus, TaskStatus, TraceStatus};
