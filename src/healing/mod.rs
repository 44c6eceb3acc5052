//! # Self-Healing Feedback Loop
//!
//! Turns task failures into persistent, confidence-weighted strategy
//! rules. On failure the loop consults existing rules to avoid duplicate
//! advice, asks the diagnostic collaborator for a generalized prevention
//! rule, and persists it. Before the next execution of the same task
//! type the scheduler surfaces the accumulated rules to the handler as
//! advisory context.
//!
//! Healing is strictly best-effort: a failing or malformed diagnostic
//! never masks the original task failure, and a rule never blocks
//! execution.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{NewStrategyRule, StrategyRule};
use crate::storage::RuleStore;

/// Diagnosis produced by the external reasoning collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnosis {
    pub advice: String,
    pub confidence_score: f64,
    pub root_cause: String,
}

/// External reasoning collaborator consulted after a failure
#[async_trait]
pub trait DiagnosticCollaborator: Send + Sync {
    async fn diagnose(
        &self,
        task_type: &str,
        error_log: &str,
        context: &serde_json::Value,
    ) -> Result<Diagnosis>;
}

/// Derives prevention rules from failures and serves them back as advice
pub struct SelfHealingLoop {
    rules: Arc<dyn RuleStore>,
    diagnostic: Arc<dyn DiagnosticCollaborator>,
}

impl SelfHealingLoop {
    pub fn new(rules: Arc<dyn RuleStore>, diagnostic: Arc<dyn DiagnosticCollaborator>) -> Self {
        Self { rules, diagnostic }
    }

    /// Analyze a failure and persist a new rule unless an existing rule
    /// already covers the error.
    ///
    /// Never returns the diagnostic's failure to the caller: the task
    /// failure being handled is the error that matters, and healing must
    /// not mask it. Returns the new rule when one was created.
    pub async fn record_failure(
        &self,
        organization_id: &str,
        task_type: &str,
        error_log: &str,
        last_context: &serde_json::Value,
    ) -> Result<Option<StrategyRule>> {
        let existing = self
            .rules
            .rules_for_task_type(organization_id, task_type)
            .await?;
        if let Some(matched) = existing.iter().find(|rule| rule.matches(error_log)) {
            debug!(
                task_type,
                rule_id = %matched.id,
                "existing rule already covers this failure, skipping diagnosis"
            );
            return Ok(None);
        }

        let diagnosis = match self
            .diagnostic
            .diagnose(task_type, error_log, last_context)
            .await
        {
            Ok(diagnosis) => diagnosis,
            Err(err) => {
                warn!(task_type, error = %err, "diagnostic collaborator unavailable");
                return Ok(None);
            }
        };

        let rule = self
            .rules
            .insert_rule(NewStrategyRule {
                organization_id: organization_id.to_string(),
                task_type: task_type.to_string(),
                error_pattern: diagnosis.root_cause,
                advice: diagnosis.advice,
                confidence_score: diagnosis.confidence_score,
            })
            .await?;

        info!(
            task_type,
            rule_id = %rule.id,
            confidence = rule.confidence_score,
            "strategy rule recorded from failure"
        );
        Ok(Some(rule))
    }

    /// Accumulated rules for a task type, highest confidence first.
    /// Advisory only: the handler decides whether to honor them.
    pub async fn advice_for(
        &self,
        organization_id: &str,
        task_type: &str,
    ) -> Result<Vec<StrategyRule>> {
        self.rules
            .rules_for_task_type(organization_id, task_type)
            .await
    }

    /// Record that a rule was applied and judged to have helped. Bumps
    /// the counters monotonically; unknown ids are a no-op.
    pub async fn mark_applied(&self, rule_id: Uuid) -> Result<Option<StrategyRule>> {
        self.rules.record_rule_applied(rule_id, Utc::now()).await
    }
}
