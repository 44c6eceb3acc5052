//! # Idempotency Record Model
//!
//! One record per logical operation, keyed by `(key, organization_id)`.
//! At most one record with `status = processing` may exist per key at any
//! instant; a second concurrent attempt observes either the in-flight
//! record or its terminal result, never re-executes the side effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::IdempotencyStatus;

/// Deduplication record for a caller-supplied idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub organization_id: String,
    pub status: IdempotencyStatus,
    pub response_data: Option<serde_json::Value>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Start a new in-flight record with the given TTL
    pub fn processing(
        key: impl Into<String>,
        organization_id: impl Into<String>,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            organization_id: organization_id.into(),
            status: IdempotencyStatus::Processing,
            response_data: None,
            expires_at: now + ttl,
            created_at: now,
        }
    }

    /// Whether the record's TTL has elapsed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
