//! # Idempotency Manager
//!
//! At-most-once execution of logical operations keyed by a
//! caller-supplied key plus tenant. The check-then-insert is a single
//! atomic operation at the store (entry guard in memory, unique
//! constraint in PostgreSQL), so two concurrent first attempts can never
//! both execute the side effect.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_core::idempotency::{with_idempotency, IdempotencyManager};
//! use agent_core::storage::memory::InMemoryStorage;
//!
//! # async fn example() -> Result<(), agent_core::error::AgentCoreError> {
//! let store = Arc::new(InMemoryStorage::new());
//! let manager = IdempotencyManager::new(store, chrono::Duration::hours(24));
//!
//! let response = with_idempotency(&manager, "charge-42", "org-1", || async {
//!     // side effect runs at most once per (key, org)
//!     Ok(serde_json::json!({"charged": true}))
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AgentCoreError, Result};
use crate::state_machine::IdempotencyStatus;
use crate::storage::{IdempotencyBegin, IdempotencyStore};

/// Result of an idempotency check
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyCheck {
    /// True when a live record already holds the key; the caller must
    /// not execute the side effect.
    pub is_processed: bool,
    /// Terminal status of the prior attempt, when it finished
    pub status: Option<IdempotencyStatus>,
    /// Stored response of the prior attempt, when present
    pub response: Option<Value>,
}

/// Deduplicates operations keyed by `(key, organization_id)` within a TTL
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
    default_ttl: chrono::Duration,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn IdempotencyStore>, default_ttl: chrono::Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> chrono::Duration {
        self.default_ttl
    }

    /// Check the key and reserve it when free.
    ///
    /// Returns `is_processed = false` exactly once per live key: that
    /// caller owns the side effect and must later call [`store_result`].
    /// Everyone else observes the in-flight record or its terminal
    /// result.
    ///
    /// [`store_result`]: IdempotencyManager::store_result
    pub async fn check_or_store(
        &self,
        key: &str,
        organization_id: &str,
        ttl: Option<chrono::Duration>,
    ) -> Result<IdempotencyCheck> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        match self
            .store
            .begin(key, organization_id, ttl, Utc::now())
            .await?
        {
            IdempotencyBegin::Started => {
                debug!(key, organization_id, "idempotency key reserved");
                Ok(IdempotencyCheck {
                    is_processed: false,
                    status: None,
                    response: None,
                })
            }
            IdempotencyBegin::Existing(record) => {
                debug!(
                    key,
                    organization_id,
                    status = %record.status,
                    "idempotency key already held"
                );
                Ok(IdempotencyCheck {
                    is_processed: true,
                    status: Some(record.status),
                    response: record.response_data,
                })
            }
        }
    }

    /// Persist the terminal outcome for a reserved key
    pub async fn store_result(
        &self,
        key: &str,
        organization_id: &str,
        response: Option<Value>,
        status: IdempotencyStatus,
    ) -> Result<()> {
        self.store
            .finish(key, organization_id, status, response)
            .await
    }

    /// Drop expired records; callable from a periodic sweep
    pub async fn sweep_expired(&self) -> Result<usize> {
        let removed = self.store.delete_expired(Utc::now()).await?;
        if removed > 0 {
            debug!(removed, "swept expired idempotency records");
        }
        Ok(removed)
    }
}

/// Run `operation` under idempotency protection.
///
/// First attempt: executes the operation, persists success or failure,
/// and returns (or re-raises) the outcome. Later attempts: return the
/// stored success, re-raise the stored failure, or report the in-flight
/// attempt as [`AgentCoreError::DuplicateOperation`]; the side effect
/// never runs twice.
pub async fn with_idempotency<F, Fut>(
    manager: &IdempotencyManager,
    key: &str,
    organization_id: &str,
    operation: F,
) -> Result<Value>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let check = manager.check_or_store(key, organization_id, None).await?;

    if check.is_processed {
        return match check.status {
            Some(IdempotencyStatus::Completed) => Ok(check.response.unwrap_or(Value::Null)),
            Some(IdempotencyStatus::Failed) => {
                let message = check
                    .response
                    .as_ref()
                    .and_then(|v| v.get("error"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("prior attempt failed")
                    .to_string();
                Err(AgentCoreError::handler_failure(key, message))
            }
            _ => Err(AgentCoreError::DuplicateOperation {
                key: key.to_string(),
            }),
        };
    }

    match operation().await {
        Ok(response) => {
            manager
                .store_result(
                    key,
                    organization_id,
                    Some(response.clone()),
                    IdempotencyStatus::Completed,
                )
                .await?;
            Ok(response)
        }
        Err(err) => {
            // Store the failure so retries observe it instead of
            // re-attempting blindly
            let stored = serde_json::json!({ "error": err.to_string() });
            if let Err(store_err) = manager
                .store_result(key, organization_id, Some(stored), IdempotencyStatus::Failed)
                .await
            {
                warn!(key, error = %store_err, "failed to store idempotency failure");
            }
            Err(err)
        }
    }
}
