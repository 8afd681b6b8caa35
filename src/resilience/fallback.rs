use std::future::Future;

use crate::{CallOutcome, RateLimitKey};

/// Why a message was handed to the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationReason {
    /// Blocking admission did not obtain a permit before its timeout.
    AdmissionTimeout,
    /// Every attempt of the retry loop was denied or failed.
    RetriesExhausted,
}

/// What the fallback did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDisposition {
    /// Nothing; the message should be redelivered later.
    Defer,
    /// The message was handled elsewhere (parked, queued, persisted) and must
    /// not be redelivered.
    Diverted,
}

/// Everything the fallback knows about a degraded message.
#[derive(Debug, Clone, Copy)]
pub struct DegradationContext<'a> {
    /// Rate limit key the message was admitted against.
    pub key: &'a RateLimitKey,
    /// The message body.
    pub payload: &'a str,
    /// Why admission or delivery gave up.
    pub reason: DegradationReason,
    /// Admission attempts made.
    pub attempts: u32,
    /// Outcome of the last downstream call, if one was made.
    pub last_outcome: Option<CallOutcome>,
}

/// Strategy applied when a message cannot be delivered within its policy.
pub trait DegradationFallback: Send + Sync {
    /// Handle the degraded message.
    fn degrade(
        &self,
        context: &DegradationContext<'_>,
    ) -> impl Future<Output = FallbackDisposition> + Send;
}

/// Logs the degraded message and defers it for redelivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAndDefer;

impl DegradationFallback for LogAndDefer {
    async fn degrade(&self, context: &DegradationContext<'_>) -> FallbackDisposition {
        tracing::warn!(
            key = %context.key,
            reason = ?context.reason,
            attempts = context.attempts,
            last_outcome = ?context.last_outcome,
            payload = context.payload,
            "message degraded, deferring"
        );

        FallbackDisposition::Defer
    }
}
