use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{Clock, Downstream, DownstreamError, QuotaGuardError, SystemClock};

/// Configuration for [`LocalQuotaSimulator`].
#[derive(Clone, Debug)]
pub struct LocalQuotaSimulatorOptions {
    /// Calls accepted per wall-clock second before answering `RateLimited`.
    pub max_calls_per_second: u64,
    /// Simulated latency of an accepted call.
    pub latency: Duration,
    /// Time source deciding which second a call falls in.
    pub clock: Arc<dyn Clock>,
}

impl Default for LocalQuotaSimulatorOptions {
    fn default() -> Self {
        Self {
            max_calls_per_second: 5,
            latency: Duration::from_millis(100),
            clock: Arc::new(SystemClock),
        }
    }
}

#[derive(Debug)]
struct SecondWindow {
    second: u64,
    calls: u64,
}

/// In-process stand-in for a third-party API with a per-second call cap.
///
/// The counter is process-local on purpose: it plays the role of the
/// dependency's own limit, which the distributed limiter must stay under
/// without ever seeing it.
#[derive(Debug)]
pub struct LocalQuotaSimulator {
    max_calls_per_second: u64,
    latency: Duration,
    clock: Arc<dyn Clock>,
    window: Mutex<SecondWindow>,
    accepted: AtomicU64,
    rate_limited: AtomicU64,
}

impl LocalQuotaSimulator {
    /// Create a simulator.
    pub fn new(options: LocalQuotaSimulatorOptions) -> Result<Self, QuotaGuardError> {
        if options.max_calls_per_second == 0 {
            return Err(QuotaGuardError::InvalidConfiguration(
                "Simulated calls per second must be at least 1".to_string(),
            ));
        }

        let second = options.clock.now_ms() / 1000;

        Ok(Self {
            max_calls_per_second: options.max_calls_per_second,
            latency: options.latency,
            clock: options.clock,
            window: Mutex::new(SecondWindow { second, calls: 0 }),
            accepted: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        })
    }

    /// Calls still accepted in the current second.
    pub fn remaining_calls(&self) -> u64 {
        let current_second = self.clock.now_ms() / 1000;
        let window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if current_second > window.second {
            return self.max_calls_per_second;
        }

        self.max_calls_per_second.saturating_sub(window.calls)
    }

    /// Calls accepted since creation.
    pub fn accepted_calls(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Calls rejected with `RateLimited` since creation.
    pub fn rate_limited_calls(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    /// Count the call against the current second; `Err` when over the cap.
    fn admit(&self) -> Result<u64, DownstreamError> {
        let current_second = self.clock.now_ms() / 1000;
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if current_second > window.second {
            window.second = current_second;
            window.calls = 0;
            tracing::debug!(second = current_second, "simulated quota counter reset");
        }

        window.calls += 1;

        if window.calls > self.max_calls_per_second {
            tracing::warn!(
                calls = window.calls,
                limit = self.max_calls_per_second,
                "simulated downstream rate limit exceeded"
            );
            return Err(DownstreamError::RateLimited(format!(
                "exceeded {} calls per second",
                self.max_calls_per_second
            )));
        }

        Ok(window.calls)
    }
}

impl Downstream for LocalQuotaSimulator {
    async fn call(&self, payload: &str) -> Result<(), DownstreamError> {
        let calls = match self.admit() {
            Ok(calls) => calls,
            Err(err) => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            calls,
            limit = self.max_calls_per_second,
            payload,
            "simulated downstream call succeeded"
        );

        Ok(())
    }
}
