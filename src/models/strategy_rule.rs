//! # Strategy Rule Model
//!
//! A persisted, confidence-weighted piece of advice derived from a past
//! failure. Rules are consulted before executing a task of the same type;
//! they are advisory, never hard constraints. `confidence_score` and
//! `times_applied` only move up under normal operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prevention advice accumulated by the self-healing feedback loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRule {
    pub id: Uuid,
    pub organization_id: String,
    pub task_type: String,
    /// Generalized pattern of the failure this rule guards against
    pub error_pattern: String,
    pub advice: String,
    pub confidence_score: f64,
    pub times_applied: i64,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StrategyRule {
    /// Whether this rule already covers the given error log
    pub fn matches(&self, error_log: &str) -> bool {
        !self.error_pattern.is_empty() && error_log.contains(self.error_pattern.as_str())
    }
}

/// New rule produced by a diagnostic pass (without generated fields)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStrategyRule {
    pub organization_id: String,
    pub task_type: String,
    pub error_pattern: String,
    pub advice: String,
    pub confidence_score: f64,
}

impl NewStrategyRule {
    /// Build a rule ready for insertion, clamping confidence into [0, 1]
    pub fn into_rule(self, now: DateTime<Utc>) -> StrategyRule {
        StrategyRule {
            id: Uuid::new_v4(),
            organization_id: self.organization_id,
            task_type: self.task_type,
            error_pattern: self.error_pattern,
            advice: self.advice,
            confidence_score: self.confidence_score.clamp(0.0, 1.0),
            times_applied: 0,
            last_applied_at: None,
            created_at: now,
        }
    }
}
