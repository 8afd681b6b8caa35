use std::{fmt, ops::Deref, sync::Arc};

use crate::QuotaGuardError;

/// Identifier of one logical resource being protected (e.g. `"third_party_api"`).
///
/// Constraints:
/// - Must not be empty
/// - Must not be longer than 255 characters
/// - Must not contain colons (colons separate the namespace segments of store keys)
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct RateLimitKey(Arc<str>);

impl Deref for RateLimitKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RateLimitKey {
    type Error = QuotaGuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(QuotaGuardError::InvalidRateLimitKey(
                "Rate limit key must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(QuotaGuardError::InvalidRateLimitKey(
                "Rate limit key must not be longer than 255 characters".to_string(),
            ))
        } else if value.contains(':') {
            Err(QuotaGuardError::InvalidRateLimitKey(
                "Rate limit key must not contain colons".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for RateLimitKey {
    type Error = QuotaGuardError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// Maximum number of admissions per window (or bucket capacity). At least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Limit(u64);

impl Deref for Limit {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for Limit {
    type Error = QuotaGuardError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(QuotaGuardError::InvalidLimit(
                "Limit must be at least 1".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Window duration in whole seconds. At least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowSizeSeconds(u64);

impl WindowSizeSeconds {
    /// Window duration in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0.saturating_mul(1000)
    }
}

impl Deref for WindowSizeSeconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for WindowSizeSeconds {
    type Error = QuotaGuardError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(QuotaGuardError::InvalidWindowSize(
                "Window size must be at least 1".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Token refill rate per second. Must be finite and greater than 0.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct RatePerSecond(f64);

impl Deref for RatePerSecond {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for RatePerSecond {
    type Error = QuotaGuardError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value <= 0f64 {
            Err(QuotaGuardError::InvalidRate(
                "Rate must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Admission algorithm together with its parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Algorithm {
    /// Count events in the trailing `window`; admit while fewer than `limit`.
    SlidingWindow {
        /// Admissions allowed within any window.
        limit: Limit,
        /// Trailing window length.
        window: WindowSizeSeconds,
    },
    /// Spend one token per admission; tokens refill at `rate` up to `capacity`.
    TokenBucket {
        /// Bucket size, also the burst allowance.
        capacity: Limit,
        /// Tokens added per second.
        rate: RatePerSecond,
    },
    /// Count admissions per `floor(now / window)` epoch bucket.
    ///
    /// Up to `2 × limit` admissions can happen across an epoch boundary.
    FixedWindow {
        /// Admissions allowed per epoch bucket.
        limit: Limit,
        /// Epoch bucket length.
        window: WindowSizeSeconds,
    },
}

impl Algorithm {
    /// Store namespace segment for this algorithm.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::SlidingWindow { .. } => "sliding",
            Self::TokenBucket { .. } => "token",
            Self::FixedWindow { .. } => "fixed",
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The call may proceed.
    Allowed,
    /// The call exceeds the configured ceiling.
    Rejected,
}

impl RateLimitDecision {
    /// Whether the decision admits the call.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

impl From<bool> for RateLimitDecision {
    fn from(allowed: bool) -> Self {
        if allowed { Self::Allowed } else { Self::Rejected }
    }
}
