//! # Trace Manager
//!
//! In-memory execution traces with a span arena per trace. Every
//! dispatched execution opens a trace; reasoning/action steps become
//! spans fanning out from the root span, freeform events annotate the
//! timeline, and a terminal transition persists a flattened summary
//! before the live trace is evicted after a grace window.
//!
//! Spans live in an arena indexed by span id with a parent/children
//! index, so locating a span is a map lookup and concurrent mutation of
//! disjoint traces never contends.
//!
//! Traces that are never completed or failed would leak until restart;
//! the [`TraceManager::reap_stale`] sweep fails `running` traces older
//! than the configured timeout.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TraceConfig;
use crate::error::{AgentCoreError, Result};
use crate::models::{SpanSummary, TraceSummary};
use crate::state_machine::TraceStatus;
use crate::storage::TraceStore;

/// A timed unit of work within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub span_type: String,
    pub status: TraceStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Span {
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| end.signed_duration_since(self.start_time).num_milliseconds())
    }

    fn to_summary(&self) -> SpanSummary {
        SpanSummary {
            span_id: self.span_id,
            name: self.name.clone(),
            span_type: self.span_type.clone(),
            status: self.status,
            duration_ms: self.duration_ms(),
            has_output: self.output.is_some(),
            error: self.error.clone(),
        }
    }
}

/// Parameters for opening a span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanSpec {
    pub name: String,
    pub span_type: String,
    pub input: Option<serde_json::Value>,
}

/// Terminal result for a span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanOutcome {
    pub status: TraceStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl SpanOutcome {
    pub fn completed(output: Option<serde_json::Value>) -> Self {
        Self {
            status: TraceStatus::Completed,
            output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TraceStatus::Failed,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Freeform timestamped log entry on a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl TraceEvent {
    pub fn now(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            message: message.into(),
            data,
        }
    }
}

/// One live execution trace: span arena plus event timeline
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTrace {
    pub trace_id: Uuid,
    pub organization_id: String,
    pub agent_type: String,
    pub status: TraceStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub root_span_id: Uuid,
    /// Span arena indexed by span id
    pub spans: HashMap<Uuid, Span>,
    /// Parent to ordered children index
    pub children: HashMap<Uuid, Vec<Uuid>>,
    pub events: Vec<TraceEvent>,
    pub metadata: serde_json::Value,
}

impl ExecutionTrace {
    fn new(
        organization_id: String,
        agent_type: String,
        metadata: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        let trace_id = Uuid::new_v4();
        let root_span_id = Uuid::new_v4();
        let root = Span {
            span_id: root_span_id,
            parent_id: None,
            name: agent_type.clone(),
            span_type: "root".to_string(),
            status: TraceStatus::Running,
            start_time: now,
            end_time: None,
            input: None,
            output: None,
            error: None,
        };

        let mut spans = HashMap::new();
        spans.insert(root_span_id, root);
        Self {
            trace_id,
            organization_id,
            agent_type,
            status: TraceStatus::Running,
            start_time: now,
            end_time: None,
            root_span_id,
            spans,
            children: HashMap::new(),
            events: Vec::new(),
            metadata,
        }
    }

    pub fn span(&self, span_id: Uuid) -> Option<&Span> {
        self.spans.get(&span_id)
    }

    pub fn root_span(&self) -> &Span {
        // The root span is inserted at construction and never removed
        &self.spans[&self.root_span_id]
    }

    /// Stamp a span's end at most once; later calls are no-ops
    fn end_span(&mut self, span_id: Uuid, outcome: SpanOutcome, now: DateTime<Utc>) -> bool {
        match self.spans.get_mut(&span_id) {
            Some(span) if span.end_time.is_none() => {
                span.end_time = Some(now.max(span.start_time));
                span.status = outcome.status;
                span.output = outcome.output;
                span.error = outcome.error;
                true
            }
            _ => false,
        }
    }

    /// Flatten the arena: root first, then children in creation order
    fn flatten(&self) -> Vec<SpanSummary> {
        let mut summaries = vec![self.root_span().to_summary()];
        if let Some(child_ids) = self.children.get(&self.root_span_id) {
            for child_id in child_ids {
                if let Some(span) = self.spans.get(child_id) {
                    summaries.push(span.to_summary());
                }
            }
        }
        summaries
    }

    fn to_summary(&self) -> TraceSummary {
        TraceSummary {
            trace_id: self.trace_id,
            organization_id: self.organization_id.clone(),
            agent_type: self.agent_type.clone(),
            status: self.status,
            start_time: self.start_time,
            end_time: self.end_time,
            spans: self.flatten(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Builds span trees per execution and persists flattened summaries on
/// terminal transitions
pub struct TraceManager {
    store: Arc<dyn TraceStore>,
    config: TraceConfig,
    traces: Arc<DashMap<Uuid, ExecutionTrace>>,
}

impl TraceManager {
    pub fn new(store: Arc<dyn TraceStore>, config: TraceConfig) -> Self {
        Self {
            store,
            config,
            traces: Arc::new(DashMap::new()),
        }
    }

    /// Open a trace for one execution; returns its id
    pub fn start_trace(
        &self,
        organization_id: &str,
        agent_type: &str,
        metadata: serde_json::Value,
    ) -> Uuid {
        let trace = ExecutionTrace::new(
            organization_id.to_string(),
            agent_type.to_string(),
            metadata,
            Utc::now(),
        );
        let trace_id = trace.trace_id;
        self.traces.insert(trace_id, trace);
        debug!(%trace_id, organization_id, agent_type, "trace started");
        trace_id
    }

    /// Append a span under the root span; returns the span id
    pub fn add_span(&self, trace_id: Uuid, spec: SpanSpec) -> Result<Uuid> {
        let mut trace = self.live_trace(trace_id)?;
        if trace.status.is_terminal() {
            return Err(AgentCoreError::Validation(format!(
                "trace {trace_id} is already terminal"
            )));
        }

        let span_id = Uuid::new_v4();
        let root_span_id = trace.root_span_id;
        trace.spans.insert(
            span_id,
            Span {
                span_id,
                parent_id: Some(root_span_id),
                name: spec.name,
                span_type: spec.span_type,
                status: TraceStatus::Running,
                start_time: Utc::now(),
                end_time: None,
                input: spec.input,
                output: None,
                error: None,
            },
        );
        trace
            .children
            .entry(root_span_id)
            .or_default()
            .push(span_id);
        Ok(span_id)
    }

    /// Append a freeform event. Events never fail the trace.
    pub fn add_event(&self, trace_id: Uuid, event: TraceEvent) -> Result<()> {
        let mut trace = self.live_trace(trace_id)?;
        trace.events.push(event);
        Ok(())
    }

    /// Stamp a span's end time and result. Idempotent: a second call for
    /// the same span is a no-op.
    pub fn end_span(&self, trace_id: Uuid, span_id: Uuid, outcome: SpanOutcome) -> Result<()> {
        let mut trace = self.live_trace(trace_id)?;
        trace.end_span(span_id, outcome, Utc::now());
        Ok(())
    }

    /// Terminal transition to completed; persists the flattened summary
    pub async fn complete_trace(
        &self,
        trace_id: Uuid,
        metadata: Option<serde_json::Value>,
    ) -> Result<TraceSummary> {
        self.finish_trace(trace_id, TraceStatus::Completed, metadata, None)
            .await
    }

    /// Terminal transition to failed; records the event, persists the
    /// flattened summary
    pub async fn fail_trace(&self, trace_id: Uuid, event: TraceEvent) -> Result<TraceSummary> {
        let error = event.message.clone();
        self.finish_trace(trace_id, TraceStatus::Failed, None, Some((event, error)))
            .await
    }

    async fn finish_trace(
        &self,
        trace_id: Uuid,
        status: TraceStatus,
        metadata: Option<serde_json::Value>,
        failure: Option<(TraceEvent, String)>,
    ) -> Result<TraceSummary> {
        let summary = {
            let mut trace = self.live_trace(trace_id)?;
            if trace.status.is_terminal() {
                // Terminal at most once; report the settled state
                return Ok(trace.to_summary());
            }

            let now = Utc::now();
            let root_span_id = trace.root_span_id;
            let root_outcome = match &failure {
                Some((event, error)) => {
                    trace.events.push(event.clone());
                    SpanOutcome::failed(error.clone())
                }
                None => SpanOutcome::completed(None),
            };
            trace.end_span(root_span_id, root_outcome, now);

            trace.status = status;
            trace.end_time = Some(now);
            if let Some(metadata) = metadata {
                trace.metadata = metadata;
            }
            trace.to_summary()
        };

        self.store.persist_summary(summary.clone()).await?;
        self.schedule_eviction(trace_id);
        debug!(%trace_id, status = %status, "trace finished");
        Ok(summary)
    }

    /// Live trace lookup (still resident in memory)
    pub fn get_trace(&self, trace_id: Uuid) -> Option<ExecutionTrace> {
        self.traces.get(&trace_id).map(|t| t.clone())
    }

    /// Persisted summary lookup, for traces already evicted
    pub async fn find_summary(&self, trace_id: Uuid) -> Result<Option<TraceSummary>> {
        self.store.find_summary(trace_id).await
    }

    /// Most recent persisted summaries for an organization
    pub async fn recent_summaries(
        &self,
        organization_id: &str,
        limit: u32,
    ) -> Result<Vec<TraceSummary>> {
        self.store.recent_summaries(organization_id, limit).await
    }

    /// Drop terminal traces past their retention window
    pub fn evict_expired(&self) -> usize {
        let retention = chrono::Duration::seconds(self.config.retention_seconds as i64);
        let now = Utc::now();
        let before = self.traces.len();
        self.traces.retain(|_, trace| {
            !(trace.status.is_terminal()
                && trace
                    .end_time
                    .map(|end| end + retention <= now)
                    .unwrap_or(false))
        });
        before.saturating_sub(self.traces.len())
    }

    /// Fail `running` traces older than the stale timeout. Returns the
    /// reaped trace ids.
    pub async fn reap_stale(&self) -> Vec<Uuid> {
        let cutoff = Utc::now() - self.config.stale_trace_timeout();
        let stale: Vec<Uuid> = self
            .traces
            .iter()
            .filter(|t| t.status == TraceStatus::Running && t.start_time < cutoff)
            .map(|t| t.trace_id)
            .collect();

        let mut reaped = Vec::new();
        for trace_id in stale {
            let event = TraceEvent::now("trace exceeded stale timeout, reaped", None);
            match self.fail_trace(trace_id, event).await {
                Ok(_) => reaped.push(trace_id),
                Err(err) => warn!(%trace_id, error = %err, "failed to reap stale trace"),
            }
        }
        if !reaped.is_empty() {
            warn!(count = reaped.len(), "reaped stale running traces");
        }
        reaped
    }

    /// Number of live traces currently resident
    pub fn live_count(&self) -> usize {
        self.traces.len()
    }

    fn live_trace(
        &self,
        trace_id: Uuid,
    ) -> Result<dashmap::mapref::one::RefMut<'_, Uuid, ExecutionTrace>> {
        self.traces
            .get_mut(&trace_id)
            .ok_or(AgentCoreError::TraceNotFound {
                trace_id: trace_id.to_string(),
            })
    }

    fn schedule_eviction(&self, trace_id: Uuid) {
        let traces = Arc::clone(&self.traces);
        let retention = self.config.retention();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            traces.remove(&trace_id);
        });
    }
}
