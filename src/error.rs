/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum QuotaGuardError {
    /// Redis error.
    #[cfg(feature = "redis-tokio")]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// The shared store could not be reached or refused the command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// An atomic script returned a reply the caller cannot interpret.
    #[error("unexpected script reply: {0}")]
    UnexpectedScriptReply(String),

    /// A store key held a value of a different type than the command expects.
    #[error("wrong type for key {0}")]
    WrongType(String),

    /// Invalid rate limit key.
    #[error("invalid rate limit key: {0}")]
    InvalidRateLimitKey(String),

    /// Invalid admission limit.
    #[error("invalid limit: {0}")]
    InvalidLimit(String),

    /// Invalid window size.
    #[error("invalid window size: {0}")]
    InvalidWindowSize(String),

    /// Invalid refill rate.
    #[error("invalid rate: {0}")]
    InvalidRate(String),

    /// Invalid store client connection count.
    #[error("invalid connection count: {0}")]
    InvalidConnectionCount(String),

    /// Invalid component configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The message transport has been closed.
    #[error("transport closed")]
    TransportClosed,
}

impl QuotaGuardError {
    /// Whether the error originates from the shared store.
    ///
    /// Store errors are the ones [`StoreFailurePolicy`](crate::StoreFailurePolicy)
    /// decides on; everything else is a wiring or validation failure.
    pub fn is_store_error(&self) -> bool {
        match self {
            #[cfg(feature = "redis-tokio")]
            Self::RedisError(_) => true,
            Self::StoreUnavailable(_) | Self::UnexpectedScriptReply(_) | Self::WrongType(_) => true,
            _ => false,
        }
    }
}

impl PartialEq<&str> for QuotaGuardError {
    fn eq(&self, other: &&str) -> bool {
        match self {
            Self::InvalidRateLimitKey(msg)
            | Self::InvalidLimit(msg)
            | Self::InvalidWindowSize(msg)
            | Self::InvalidRate(msg)
            | Self::InvalidConnectionCount(msg)
            | Self::InvalidConfiguration(msg) => msg == other,
            _ => false,
        }
    }
}
