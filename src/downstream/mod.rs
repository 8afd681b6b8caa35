//! The rate-constrained dependency being protected.
//!
//! [`Downstream`] is the call interface; [`LocalQuotaSimulator`] stands in for
//! a real client with its own undisclosed per-second ceiling.

use std::future::Future;

mod local_quota_simulator;
pub use local_quota_simulator::*;

/// Error reported by a downstream call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownstreamError {
    /// The dependency rejected the call because of its own rate limit.
    #[error("downstream rate limited: {0}")]
    RateLimited(String),
    /// Any other failure.
    #[error("downstream failure: {0}")]
    Failure(String),
}

/// Classified result of one downstream call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call succeeded.
    Success,
    /// The dependency signalled its own ceiling.
    RateLimited,
    /// The call failed for any other reason.
    Failure,
}

impl CallOutcome {
    /// Whether the outcome counts as healthy for the circuit breaker.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl<T> From<&Result<T, DownstreamError>> for CallOutcome {
    fn from(result: &Result<T, DownstreamError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(DownstreamError::RateLimited(_)) => Self::RateLimited,
            Err(DownstreamError::Failure(_)) => Self::Failure,
        }
    }
}

/// A call to the protected dependency.
pub trait Downstream: Send + Sync {
    /// Deliver `payload` downstream.
    fn call(&self, payload: &str) -> impl Future<Output = Result<(), DownstreamError>> + Send;
}
