//! Protection around the downstream call.
//!
//! - [`CircuitBreaker`]: stops calling a dependency that keeps failing
//! - [`RetryPolicy`] / [`AdmissionPolicy`]: how long to keep trying for admission
//! - [`DegradationFallback`]: what happens to a message that gives up
//! - [`ResilienceWrapper`]: the per-message chain tying these to a [`RateLimitEngine`](crate::RateLimitEngine)

mod circuit_breaker;
pub use circuit_breaker::*;

mod fallback;
pub use fallback::*;

mod resilience_wrapper;
pub use resilience_wrapper::*;

mod retry_policy;
pub use retry_policy::*;
