//! # Sliding-Window Rate Limiter
//!
//! Admission control per (endpoint class, caller identifier). Uses
//! reset-on-expiry windows: the first request after a window elapses
//! starts a fresh window with `count = 1`. Check-and-mutate runs under
//! the concurrent map's per-key entry guard, so two concurrent checks on
//! the same bucket can never both observe the last free slot.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace};

use crate::config::{RateLimitPolicy, RateLimitsConfig};

/// Outcome of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Request ceiling for the active window
    pub limit: u32,
    /// Slots left in the active window
    pub remaining: u32,
    /// Milliseconds until the active window resets
    pub reset_in_ms: u64,
}

impl RateLimitDecision {
    /// Standard rate-limit headers for attaching to any admission decision
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_in_ms.to_string()),
        ]
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

/// Counters for observability; admission decisions never depend on these
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub total_allowed: u64,
    pub total_denied: u64,
    pub active_windows: usize,
}

/// Sliding-window admission control, fixed configuration at startup
pub struct RateLimiter {
    config: RateLimitsConfig,
    windows: DashMap<(String, String), Window>,
    total_allowed: AtomicU64,
    total_denied: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter from the startup policy table
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            total_allowed: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        }
    }

    /// Policy for an endpoint class, falling back to the default policy
    pub fn policy(&self, endpoint_class: &str) -> &RateLimitPolicy {
        self.config
            .endpoint_classes
            .get(endpoint_class)
            .unwrap_or(&self.config.default_policy)
    }

    /// Check admission for one request.
    ///
    /// Never blocks; denial is immediate and advisory. The entry guard
    /// keeps the check-and-increment atomic per
    /// (endpoint class, identifier).
    pub fn check(&self, identifier: &str, endpoint_class: &str) -> RateLimitDecision {
        let policy = self.policy(endpoint_class).clone();
        let window_len = policy.window();
        let key = (endpoint_class.to_string(), identifier.to_string());

        let mut entry = self.windows.entry(key).or_insert_with(|| Window {
            started: Instant::now(),
            count: 0,
        });

        let elapsed = entry.started.elapsed();
        if elapsed >= window_len {
            entry.started = Instant::now();
            entry.count = 1;
            drop(entry);
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
            trace!(identifier, endpoint_class, "fresh rate-limit window");
            return RateLimitDecision {
                allowed: true,
                limit: policy.max_requests,
                remaining: policy.max_requests - 1,
                reset_in_ms: policy.window_ms,
            };
        }

        let reset_in_ms = window_len
            .saturating_sub(elapsed)
            .as_millis()
            .min(u128::from(u64::MAX)) as u64;

        if entry.count >= policy.max_requests {
            drop(entry);
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            debug!(
                identifier,
                endpoint_class,
                reset_in_ms,
                limit = policy.max_requests,
                "admission denied"
            );
            return RateLimitDecision {
                allowed: false,
                limit: policy.max_requests,
                remaining: 0,
                reset_in_ms,
            };
        }

        entry.count += 1;
        let remaining = policy.max_requests - entry.count;
        drop(entry);
        self.total_allowed.fetch_add(1, Ordering::Relaxed);
        RateLimitDecision {
            allowed: true,
            limit: policy.max_requests,
            remaining,
            reset_in_ms,
        }
    }

    /// Error-style admission check for callers that propagate with `?`:
    /// denial becomes [`AgentCoreError::AdmissionDenied`]
    pub fn check_allowed(
        &self,
        identifier: &str,
        endpoint_class: &str,
    ) -> crate::error::Result<RateLimitDecision> {
        let decision = self.check(identifier, endpoint_class);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(crate::error::AgentCoreError::AdmissionDenied {
                identifier: identifier.to_string(),
                endpoint_class: endpoint_class.to_string(),
                reset_in_ms: decision.reset_in_ms,
            })
        }
    }

    /// Drop windows idle longer than `idle_sweep_multiplier` times their
    /// window length. Bounds memory when callers churn.
    pub fn prune_idle(&self) -> usize {
        let multiplier = u64::from(self.config.idle_sweep_multiplier.max(1));
        let before = self.windows.len();
        self.windows.retain(|(endpoint_class, _), window| {
            let policy = self
                .config
                .endpoint_classes
                .get(endpoint_class)
                .unwrap_or(&self.config.default_policy);
            window.started.elapsed() < policy.window() * multiplier as u32
        });
        let pruned = before.saturating_sub(self.windows.len());
        if pruned > 0 {
            debug!(pruned, "pruned idle rate-limit windows");
        }
        pruned
    }

    /// Snapshot of limiter counters
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            total_allowed: self.total_allowed.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
            active_windows: self.windows.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter_with(window_ms: u64, max_requests: u32) -> RateLimiter {
        let mut config = RateLimitsConfig::default();
        config.endpoint_classes.insert(
            "messaging".to_string(),
            RateLimitPolicy {
                window_ms,
                max_requests,
            },
        );
        RateLimiter::new(config)
    }

    #[test]
    fn test_twenty_first_call_denied() {
        let limiter = limiter_with(60_000, 20);

        for i in 0..20 {
            let decision = limiter.check("org-1", "messaging");
            assert!(decision.allowed, "call {} should be admitted", i + 1);
            assert_eq!(decision.remaining, 19 - i);
        }

        let denied = limiter.check("org-1", "messaging");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.reset_in_ms <= 60_000);
    }

    #[test]
    fn test_identifiers_do_not_share_windows() {
        let limiter = limiter_with(60_000, 1);

        assert!(limiter.check("org-1", "messaging").allowed);
        assert!(!limiter.check("org-1", "messaging").allowed);
        assert!(limiter.check("org-2", "messaging").allowed);
    }

    #[test]
    fn test_unknown_class_uses_default_policy() {
        let limiter = limiter_with(60_000, 1);
        let decision = limiter.check("org-1", "unconfigured");
        assert_eq!(
            decision.limit,
            RateLimitsConfig::default().default_policy.max_requests
        );
    }

    #[tokio::test]
    async fn test_window_expiry_resets_count() {
        let limiter = limiter_with(40, 1);

        assert!(limiter.check("org-1", "messaging").allowed);
        assert!(!limiter.check("org-1", "messaging").allowed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let fresh = limiter.check("org-1", "messaging");
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 0);
    }

    #[tokio::test]
    async fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(limiter_with(60_000, 50));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                let mut admitted = 0u32;
                for _ in 0..25 {
                    if limiter.check("org-1", "messaging").allowed {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn test_prune_drops_only_idle_windows() {
        let limiter = limiter_with(20, 5);
        limiter.check("org-idle", "messaging");
        tokio::time::sleep(Duration::from_millis(100)).await;
        limiter.check("org-live", "messaging");

        let pruned = limiter.prune_idle();
        assert_eq!(pruned, 1);
        assert_eq!(limiter.stats().active_windows, 1);
    }

    #[test]
    fn test_check_allowed_propagates_denial() {
        let limiter = limiter_with(60_000, 1);
        assert!(limiter.check_allowed("org-1", "messaging").is_ok());

        let err = limiter.check_allowed("org-1", "messaging").unwrap_err();
        match err {
            crate::error::AgentCoreError::AdmissionDenied {
                endpoint_class,
                reset_in_ms,
                ..
            } => {
                assert_eq!(endpoint_class, "messaging");
                assert!(reset_in_ms <= 60_000);
            }
            other => panic!("expected AdmissionDenied, got {other:?}"),
        }
    }

    #[test]
    fn test_headers_shape() {
        let limiter = limiter_with(60_000, 20);
        let decision = limiter.check("org-1", "messaging");
        let headers = decision.headers();

        assert_eq!(headers[0].0, "X-RateLimit-Limit");
        assert_eq!(headers[0].1, "20");
        assert_eq!(headers[1].0, "X-RateLimit-Remaining");
        assert_eq!(headers[1].1, "19");
        assert_eq!(headers[2].0, "X-RateLimit-Reset");
    }
}
