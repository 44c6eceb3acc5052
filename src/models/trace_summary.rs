//! # Trace Summary Models
//!
//! Flattened form of an execution trace, persisted when the trace reaches
//! a terminal state. Live traces stay in memory; summaries are what
//! outlive the grace window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::TraceStatus;

/// Flattened per-span record within a persisted trace summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSummary {
    pub span_id: Uuid,
    pub name: String,
    pub span_type: String,
    pub status: TraceStatus,
    pub duration_ms: Option<i64>,
    pub has_output: bool,
    pub error: Option<String>,
}

/// Durable record of a finished (or reaped) execution trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: Uuid,
    pub organization_id: String,
    pub agent_type: String,
    pub status: TraceStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub spans: Vec<SpanSummary>,
    pub metadata: serde_json::Value,
}

impl TraceSummary {
    /// Total wall-clock duration when the trace ended cleanly
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| end.signed_duration_since(self.start_time).num_milliseconds())
    }
}
