//! Distributed admission control.
//!
//! [`RateLimitEngine`] is the single owner of window and bucket state in the
//! shared store. It makes pure admission decisions: retry, breaker and
//! fallback behaviour live in [`ResilienceWrapper`](crate::ResilienceWrapper).

mod rate_limit_engine;
pub use rate_limit_engine::*;
