//! # Query API Application State
//!
//! Shared read handles over the runtime's components.

use std::sync::Arc;

use crate::actionlog::ActionLog;
use crate::resilience::RateLimiter;
use crate::runtime::AgentRuntime;
use crate::storage::TaskStore;
use crate::trace::TraceManager;

/// State threaded through every handler
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<dyn TaskStore>,
    pub action_log: Arc<ActionLog>,
    pub traces: Arc<TraceManager>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        action_log: Arc<ActionLog>,
        traces: Arc<TraceManager>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            tasks,
            action_log,
            traces,
            rate_limiter,
        }
    }

    /// Borrow the runtime's components
    pub fn from_runtime(runtime: &AgentRuntime) -> Self {
        Self {
            tasks: Arc::clone(runtime.tasks()),
            action_log: Arc::clone(runtime.action_log()),
            traces: Arc::clone(runtime.traces()),
            rate_limiter: Arc::clone(runtime.rate_limiter()),
        }
    }
}
