use std::sync::Arc;

const SLIDING_WINDOW_LUA: &str = r#"
    local key = KEYS[1]

    local now_ms = tonumber(ARGV[1])
    local window_ms = tonumber(ARGV[2])
    local limit = tonumber(ARGV[3])
    local ttl_seconds = tonumber(ARGV[4])
    local member = ARGV[5]

    -- evict events that left the window
    redis.call("ZREMRANGEBYSCORE", key, "-inf", now_ms - window_ms)

    local current = redis.call("ZCARD", key)

    if current < limit then
        redis.call("ZADD", key, now_ms, member)
        redis.call("EXPIRE", key, ttl_seconds)
        return 1
    end

    return 0
"#;

const TOKEN_BUCKET_LUA: &str = r#"
    local key = KEYS[1]

    local now_ms = tonumber(ARGV[1])
    local capacity = tonumber(ARGV[2])
    local rate = tonumber(ARGV[3])
    local ttl_seconds = tonumber(ARGV[4])

    local state = redis.call("HMGET", key, "tokens", "last_refill_ms")
    local tokens = tonumber(state[1])
    local last_refill_ms = tonumber(state[2])

    if tokens == nil or last_refill_ms == nil then
        tokens = capacity
        last_refill_ms = now_ms
    end

    local elapsed_ms = math.max(0, now_ms - last_refill_ms)
    local refill = math.floor(elapsed_ms * rate / 1000)

    tokens = math.min(capacity, tokens + refill)
    last_refill_ms = now_ms

    local allowed = 0
    if tokens >= 1 then
        tokens = tokens - 1
        allowed = 1
    end

    redis.call("HSET", key, "tokens", tokens, "last_refill_ms", last_refill_ms)
    redis.call("EXPIRE", key, ttl_seconds)

    return allowed
"#;

const FIXED_WINDOW_LUA: &str = r#"
    local key = KEYS[1]
    local ttl_seconds = tonumber(ARGV[1])

    local count = redis.call("INCR", key)

    if count == 1 then
        redis.call("EXPIRE", key, ttl_seconds)
    end

    return count
"#;

/// Hash field holding the token count of a bucket.
pub const TOKENS_FIELD: &str = "tokens";

/// Hash field holding the last refill instant of a bucket.
pub const LAST_REFILL_FIELD: &str = "last_refill_ms";

/// One invocation of an admission script.
///
/// Each variant is a complete read-modify-write sequence that a
/// [`StoreClient`](crate::StoreClient) must execute as a single uninterruptible
/// unit. The Lua text in [`AtomicScript::body`] is the canonical definition;
/// non-Redis stores reproduce it under their own exclusive section.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomicScript {
    /// Evict stale events, count, and record `member` at `now_ms` if under `limit`.
    ///
    /// Replies `1` when admitted and `0` otherwise.
    SlidingWindow {
        /// Sorted set key.
        key: Arc<str>,
        /// Evaluation instant.
        now_ms: u64,
        /// Window length in milliseconds.
        window_ms: u64,
        /// Maximum events within the window.
        limit: u64,
        /// TTL refreshed on every admission.
        ttl_seconds: u64,
        /// Unique set member so simultaneous events are never collapsed.
        member: String,
    },
    /// Refill whole tokens, restart the refill clock at `now_ms`, then spend
    /// one token.
    ///
    /// Replies `1` when a token was spent and `0` otherwise.
    TokenBucket {
        /// Hash key holding `tokens` and `last_refill_ms`.
        key: Arc<str>,
        /// Evaluation instant.
        now_ms: u64,
        /// Bucket capacity.
        capacity: u64,
        /// Tokens added per second.
        rate_per_second: f64,
        /// TTL refreshed on every check.
        ttl_seconds: u64,
    },
    /// Increment the epoch counter, arming its TTL on first use.
    ///
    /// Replies with the post-increment value.
    FixedWindow {
        /// Counter key of the current epoch bucket.
        key: Arc<str>,
        /// Evaluation instant. Redis arms the TTL on its own clock, so the
        /// Lua script does not read it.
        now_ms: u64,
        /// TTL set when the counter is created.
        ttl_seconds: u64,
    },
}

impl AtomicScript {
    /// Short name used for logging and script caching.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SlidingWindow { .. } => "sliding_window",
            Self::TokenBucket { .. } => "token_bucket",
            Self::FixedWindow { .. } => "fixed_window",
        }
    }

    /// Lua source of the script.
    pub fn body(&self) -> &'static str {
        match self {
            Self::SlidingWindow { .. } => SLIDING_WINDOW_LUA,
            Self::TokenBucket { .. } => TOKEN_BUCKET_LUA,
            Self::FixedWindow { .. } => FIXED_WINDOW_LUA,
        }
    }

    /// `KEYS` passed to the script.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Self::SlidingWindow { key, .. }
            | Self::TokenBucket { key, .. }
            | Self::FixedWindow { key, .. } => vec![&**key],
        }
    }

    /// `ARGV` passed to the script, in declaration order.
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::SlidingWindow {
                now_ms,
                window_ms,
                limit,
                ttl_seconds,
                member,
                ..
            } => vec![
                now_ms.to_string(),
                window_ms.to_string(),
                limit.to_string(),
                ttl_seconds.to_string(),
                member.clone(),
            ],
            Self::TokenBucket {
                now_ms,
                capacity,
                rate_per_second,
                ttl_seconds,
                ..
            } => vec![
                now_ms.to_string(),
                capacity.to_string(),
                rate_per_second.to_string(),
                ttl_seconds.to_string(),
            ],
            Self::FixedWindow { ttl_seconds, .. } => vec![ttl_seconds.to_string()],
        }
    }
}
