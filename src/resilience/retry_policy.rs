use std::time::Duration;

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// Same delay every time.
    Fixed,
    /// `initial × factor^attempt`, capped at `max`.
    Exponential,
}

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Schedule shape.
    pub kind: BackoffKind,
    /// First delay.
    pub initial: Duration,
    /// Growth factor for [`BackoffKind::Exponential`].
    pub factor: f32,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl Backoff {
    /// Constant `delay` between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            initial: delay,
            factor: 1.0,
            max: delay,
        }
    }

    /// Exponentially growing delay.
    pub fn exponential(initial: Duration, factor: f32, max: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            initial,
            factor,
            max,
        }
    }

    /// Delay to wait after the zero-based `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.initial,
            BackoffKind::Exponential => {
                let mult = self.factor.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
                if !mult.is_finite() {
                    return self.max;
                }

                let d = self.initial.mul_f32(mult.max(0.0));
                if d > self.max { self.max } else { d }
            }
        }
    }
}

/// Bounded retry with backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per message, including the first one.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    /// Three attempts, 200 ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::fixed(Duration::from_millis(200)),
        }
    }
}

impl RetryPolicy {
    /// One attempt, no retries.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::fixed(Duration::ZERO),
        }
    }

    /// Delay before the attempt following the zero-based `attempt`, or `None`
    /// when `attempt` was the last one allowed.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt.saturating_add(1) >= self.max_attempts {
            return None;
        }

        Some(self.backoff.delay_for_attempt(attempt))
    }
}

/// How a message obtains admission from the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionPolicy {
    /// Poll the limiter until admitted or `timeout` elapses, then degrade.
    Blocking {
        /// Upper bound on the wait.
        timeout: Duration,
        /// Pause between polls.
        poll_interval: Duration,
    },
    /// Up to `max_attempts` admission-and-call attempts with backoff between them.
    RetryLoop(RetryPolicy),
}

impl AdmissionPolicy {
    /// Blocking acquire with a 3 s bound, polling every 50 ms.
    pub fn blocking() -> Self {
        Self::Blocking {
            timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self::RetryLoop(RetryPolicy::default())
    }
}
