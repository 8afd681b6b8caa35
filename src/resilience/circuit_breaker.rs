use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::{CallOutcome, Clock, QuotaGuardError};

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before letting a call through again.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(10),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected without reaching the dependency.
    Open,
    /// The reset timeout has elapsed; the next call is tried and decides.
    HalfOpen,
}

/// Snapshot of a breaker for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerStatus {
    /// Current state.
    pub state: BreakerState,
    /// Failures observed since the last success or reset.
    pub consecutive_failures: u32,
    /// When the breaker opened (epoch ms), if it is open.
    pub opened_at_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at_ms: Option<u64>,
}

/// Consecutive-failure circuit breaker for one consumption path.
///
/// # States
///
/// ```text
/// Closed --failure--> Closed (count += 1), Open once count reaches the threshold
/// Closed --success--> Closed (count = 0)
/// Open   --call before reset_timeout--> rejected, not counted
/// Open   --call after reset_timeout--> Closed (count = 0), call goes through
/// ```
///
/// The breaker is process-local and owned by a single
/// [`ConsumptionLoop`](crate::ConsumptionLoop); concurrent workers of that loop
/// serialise on an internal mutex that is never held across an `.await`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Result<Self, QuotaGuardError> {
        if config.failure_threshold == 0 {
            return Err(QuotaGuardError::InvalidConfiguration(
                "Failure threshold must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            config,
            clock,
            inner: Mutex::new(BreakerInner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset_timeout_ms(&self) -> u64 {
        u64::try_from(self.config.reset_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Ask whether a call may proceed.
    ///
    /// Returns `false` while open. Once the reset timeout has elapsed the
    /// breaker closes with a cleared failure count and the call is let through.
    /// Rejections are not counted as failures.
    pub fn try_acquire(&self) -> bool {
        let now_ms = self.clock.now_ms();
        let mut inner = self.lock();

        let Some(opened_at_ms) = inner.opened_at_ms else {
            return true;
        };

        if now_ms.saturating_sub(opened_at_ms) < self.reset_timeout_ms() {
            return false;
        }

        tracing::info!(
            open_for_ms = now_ms.saturating_sub(opened_at_ms),
            "circuit breaker reset timeout elapsed, letting calls through"
        );
        inner.opened_at_ms = None;
        inner.consecutive_failures = 0;

        true
    } // end method try_acquire

    /// Record the outcome of an attempted call.
    pub fn record(&self, outcome: CallOutcome) {
        if outcome.is_success() {
            self.record_success();
        } else {
            self.record_failure();
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.lock();

        if inner.consecutive_failures > 0 || inner.opened_at_ms.is_some() {
            tracing::info!(
                consecutive_failures = inner.consecutive_failures,
                "circuit breaker reset after success"
            );
            inner.consecutive_failures = 0;
            inner.opened_at_ms = None;
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let now_ms = self.clock.now_ms();
        let mut inner = self.lock();

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        tracing::warn!(
            consecutive_failures = inner.consecutive_failures,
            threshold = self.config.failure_threshold,
            "downstream call failed"
        );

        if inner.opened_at_ms.is_none()
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.opened_at_ms = Some(now_ms);
            tracing::error!(
                consecutive_failures = inner.consecutive_failures,
                reset_timeout_ms = self.reset_timeout_ms(),
                "circuit breaker opened"
            );
        }
    } // end method record_failure

    /// Current state without side effects.
    pub fn status(&self) -> BreakerStatus {
        let now_ms = self.clock.now_ms();
        let inner = self.lock();

        let state = match inner.opened_at_ms {
            None => BreakerState::Closed,
            Some(opened_at_ms)
                if now_ms.saturating_sub(opened_at_ms) < self.reset_timeout_ms() =>
            {
                BreakerState::Open
            }
            Some(_) => BreakerState::HalfOpen,
        };

        BreakerStatus {
            state,
            consecutive_failures: inner.consecutive_failures,
            opened_at_ms: inner.opened_at_ms,
        }
    }

    /// Whether calls are currently rejected.
    pub fn is_open(&self) -> bool {
        self.status().state == BreakerState::Open
    }
}
