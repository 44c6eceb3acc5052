//! # Resilience Module
//!
//! Admission control guarding dispatch and the query API. The rate
//! limiter is the first gate on every dispatch: it decides in bounded,
//! sub-millisecond local time and never blocks the caller: denial is
//! advisory, and the caller chooses whether to queue, reject, or back
//! off.
//!
//! ## Usage
//!
//! ```rust
//! use agent_core::config::RateLimitsConfig;
//! use agent_core::resilience::RateLimiter;
//!
//! let limiter = RateLimiter::new(RateLimitsConfig::default());
//!
//! let decision = limiter.check("org-1", "messaging");
//! if decision.allowed {
//!     // dispatch
//! } else {
//!     // re-queue after decision.reset_in_ms
//! }
//! ```

pub mod rate_limiter;

pub use rate_limiter::{RateLimitDecision, RateLimiter};
