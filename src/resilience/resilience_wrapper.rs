use std::{sync::Arc, time::Duration};

use crate::{
    AdmissionPolicy, Algorithm, BreakerConfig, BreakerStatus, CallOutcome, CircuitBreaker,
    DegradationContext, DegradationFallback, DegradationReason, Downstream, DownstreamError,
    FallbackDisposition, QuotaGuardError, RateLimitEngine, RateLimitKey, RetryPolicy, Shutdown,
    StoreClient,
};

/// Configuration for [`ResilienceWrapper`].
#[derive(Debug, Clone)]
pub struct ResilienceOptions {
    /// Admission algorithm and its parameters.
    pub algorithm: Algorithm,
    /// How admission is obtained.
    pub admission: AdmissionPolicy,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
}

/// Result of [`ResilienceWrapper::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The downstream call succeeded.
    Completed,
    /// The breaker rejected the call; nothing was attempted.
    CircuitOpen,
    /// Admission or delivery gave up and the fallback ran.
    Degraded {
        /// Why the message degraded.
        reason: DegradationReason,
        /// What the fallback did with it.
        disposition: FallbackDisposition,
    },
    /// The admitted downstream call failed (blocking admission only).
    Failed(CallOutcome),
    /// Shutdown was requested while waiting.
    Cancelled,
}

enum Admission {
    Granted,
    TimedOut,
    Cancelled,
}

/// Admission, breaker, retry and fallback around one [`Downstream`].
///
/// # Per-message flow
///
/// 1. Ask the [`CircuitBreaker`]; if open, return [`Execution::CircuitOpen`]
/// 2. Obtain admission from the [`RateLimitEngine`] per the [`AdmissionPolicy`]
/// 3. On admission, call the downstream and record the outcome in the breaker
/// 4. If admission cannot be obtained or retries run out, run the fallback
///
/// No lock is held across the downstream call or any sleep, and every sleep
/// ends early on [`Shutdown`].
#[derive(Debug)]
pub struct ResilienceWrapper<S, D, F> {
    engine: Arc<RateLimitEngine<S>>,
    downstream: Arc<D>,
    fallback: F,
    breaker: CircuitBreaker,
    algorithm: Algorithm,
    admission: AdmissionPolicy,
    shutdown: Shutdown,
}

impl<S, D, F> ResilienceWrapper<S, D, F>
where
    S: StoreClient,
    D: Downstream,
    F: DegradationFallback,
{
    /// Create a wrapper. The breaker reads time from the engine's clock.
    pub fn new(
        options: ResilienceOptions,
        engine: Arc<RateLimitEngine<S>>,
        downstream: Arc<D>,
        fallback: F,
        shutdown: Shutdown,
    ) -> Result<Self, QuotaGuardError> {
        match options.admission {
            AdmissionPolicy::Blocking { poll_interval, .. } if poll_interval.is_zero() => {
                return Err(QuotaGuardError::InvalidConfiguration(
                    "Poll interval must be greater than 0".to_string(),
                ));
            }
            AdmissionPolicy::RetryLoop(RetryPolicy { max_attempts: 0, .. }) => {
                return Err(QuotaGuardError::InvalidConfiguration(
                    "Retry policy must allow at least 1 attempt".to_string(),
                ));
            }
            _ => {}
        }

        let breaker = CircuitBreaker::new(options.breaker, Arc::clone(engine.clock()))?;

        Ok(Self {
            engine,
            downstream,
            fallback,
            breaker,
            algorithm: options.algorithm,
            admission: options.admission,
            shutdown,
        })
    } // end constructor

    /// The shared rate limit engine.
    pub fn engine(&self) -> &Arc<RateLimitEngine<S>> {
        &self.engine
    }

    /// The protected dependency.
    pub fn downstream(&self) -> &Arc<D> {
        &self.downstream
    }

    /// Snapshot of this wrapper's breaker.
    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    /// Run one message through the protection chain.
    ///
    /// Store failures surface as `Err` only under
    /// [`StoreFailurePolicy::Propagate`](crate::StoreFailurePolicy::Propagate).
    pub async fn execute(
        &self,
        key: &RateLimitKey,
        payload: &str,
    ) -> Result<Execution, QuotaGuardError> {
        if !self.breaker.try_acquire() {
            tracing::warn!(key = %key, "circuit breaker open, skipping downstream call");
            return Ok(Execution::CircuitOpen);
        }

        match self.admission {
            AdmissionPolicy::Blocking {
                timeout,
                poll_interval,
            } => self.execute_blocking(key, payload, timeout, poll_interval).await,
            AdmissionPolicy::RetryLoop(policy) => self.execute_retrying(key, payload, policy).await,
        }
    } // end method execute

    async fn execute_blocking(
        &self,
        key: &RateLimitKey,
        payload: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Execution, QuotaGuardError> {
        match self.acquire_blocking(key, timeout, poll_interval).await? {
            Admission::Granted => {}
            Admission::Cancelled => return Ok(Execution::Cancelled),
            Admission::TimedOut => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(key = %key, timeout_ms, "admission timed out");
                return Ok(self
                    .degrade(key, payload, DegradationReason::AdmissionTimeout, 1, None)
                    .await);
            }
        }

        let outcome = self.call_downstream(key, payload).await;
        if outcome.is_success() {
            Ok(Execution::Completed)
        } else {
            Ok(Execution::Failed(outcome))
        }
    } // end method execute_blocking

    async fn acquire_blocking(
        &self,
        key: &RateLimitKey,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Admission, QuotaGuardError> {
        // a timeout past the representable range waits until shutdown
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            if self.shutdown.is_shutdown() {
                return Ok(Admission::Cancelled);
            }

            if self.engine.allow(key, &self.algorithm).await?.is_allowed() {
                return Ok(Admission::Granted);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(Admission::TimedOut);
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };

            if !self.pause(wait).await {
                return Ok(Admission::Cancelled);
            }
        }
    }

    async fn execute_retrying(
        &self,
        key: &RateLimitKey,
        payload: &str,
        policy: RetryPolicy,
    ) -> Result<Execution, QuotaGuardError> {
        let mut last_outcome = None;
        let mut attempts = 0;

        for attempt in 0..policy.max_attempts {
            if attempt > 0 && !self.breaker.try_acquire() {
                tracing::warn!(key = %key, attempt, "circuit breaker opened during retries");
                return Ok(Execution::CircuitOpen);
            }

            attempts += 1;

            if self.engine.allow(key, &self.algorithm).await?.is_allowed() {
                let outcome = self.call_downstream(key, payload).await;
                if outcome.is_success() {
                    return Ok(Execution::Completed);
                }
                last_outcome = Some(outcome);
            } else {
                tracing::debug!(key = %key, attempt, "admission denied");
            }

            let Some(delay) = policy.delay_after(attempt) else {
                break;
            };

            if !self.pause(delay).await {
                return Ok(Execution::Cancelled);
            }
        }

        tracing::warn!(key = %key, attempts, last_outcome = ?last_outcome, "retries exhausted");

        Ok(self
            .degrade(
                key,
                payload,
                DegradationReason::RetriesExhausted,
                attempts,
                last_outcome,
            )
            .await)
    } // end method execute_retrying

    async fn call_downstream(&self, key: &RateLimitKey, payload: &str) -> CallOutcome {
        let result = self.downstream.call(payload).await;
        let outcome = CallOutcome::from(&result);

        match result {
            Ok(()) => {}
            Err(DownstreamError::RateLimited(ref reason)) => {
                tracing::warn!(key = %key, reason = %reason, "downstream signalled its own rate limit");
            }
            Err(ref err) => {
                tracing::error!(key = %key, error = ?err, "downstream call failed");
            }
        }

        self.breaker.record(outcome);
        outcome
    }

    async fn degrade(
        &self,
        key: &RateLimitKey,
        payload: &str,
        reason: DegradationReason,
        attempts: u32,
        last_outcome: Option<CallOutcome>,
    ) -> Execution {
        let context = DegradationContext {
            key,
            payload,
            reason,
            attempts,
            last_outcome,
        };

        let disposition = self.fallback.degrade(&context).await;

        Execution::Degraded {
            reason,
            disposition,
        }
    }

    /// Sleep for `duration`; `false` if shutdown interrupted the sleep.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.wait() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
