use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    Algorithm, AtomicScript, Clock, LAST_REFILL_FIELD, Limit, QuotaGuardError, RateLimitDecision,
    RateLimitKey, RatePerSecond, StoreClient, SystemClock, TOKENS_FIELD, WindowSizeSeconds,
    store::KeyGenerator,
};

/// TTL of a token bucket hash, refreshed on every check.
const TOKEN_BUCKET_TTL_SECONDS: u64 = 60;

/// What an admission check answers when the store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Admit the call and log the failure.
    ///
    /// Keeps the limiter from becoming an availability bottleneck; the
    /// downstream ceiling is unenforced while the store is unreachable.
    #[default]
    FailOpen,
    /// Deny the call and log the failure.
    FailClosed,
    /// Return the error to the caller.
    Propagate,
}

/// Configuration for [`RateLimitEngine`].
#[derive(Clone, Debug)]
pub struct RateLimitEngineOptions {
    /// Optional prefix for all store keys.
    ///
    /// If `None`, defaults to `"ratelimit"`. Must not be empty or contain `:`.
    pub prefix: Option<String>,

    /// Decision taken when the store cannot answer.
    pub failure_policy: StoreFailurePolicy,

    /// Time source for `now`. Every process sharing a store should run on a
    /// synchronised wall clock.
    pub clock: Arc<dyn Clock>,
}

impl Default for RateLimitEngineOptions {
    fn default() -> Self {
        Self {
            prefix: None,
            failure_policy: StoreFailurePolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Distributed admission control over a shared [`StoreClient`].
///
/// Three interchangeable algorithms share one engine; each is namespaced in the
/// store so the same [`RateLimitKey`] can be limited by several of them at once
/// without collision.
///
/// # Algorithms
///
/// - [`sliding_window`](Self::sliding_window): exact ceiling over any trailing window
/// - [`token_bucket`](Self::token_bucket): burst of `capacity`, sustained `rate`
/// - [`fixed_window`](Self::fixed_window): O(1) per-epoch counter
///
/// # Consistency
///
/// Each check is one [`AtomicScript`] round trip. There is no local cache of
/// window or bucket state, so any number of engines in any number of processes
/// can share the same keys.
///
/// # Known weakness of the fixed window
///
/// Counters reset at epoch boundaries, so `limit` admissions just before a
/// boundary and `limit` just after it all succeed: up to `2 × limit` within one
/// window length. Use the sliding window when the bound must be strict.
#[derive(Debug)]
pub struct RateLimitEngine<S> {
    store: S,
    key_generator: KeyGenerator,
    failure_policy: StoreFailurePolicy,
    clock: Arc<dyn Clock>,
    instance_id: u64,
    member_sequence: AtomicU64,
}

impl<S: StoreClient> RateLimitEngine<S> {
    /// Create an engine over `store`.
    pub fn new(store: S, options: RateLimitEngineOptions) -> Result<Self, QuotaGuardError> {
        Ok(Self {
            store,
            key_generator: KeyGenerator::new(options.prefix.as_deref())?,
            failure_policy: options.failure_policy,
            clock: options.clock,
            instance_id: rand::random(),
            member_sequence: AtomicU64::new(0),
        })
    } // end constructor

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The engine's time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Check admission for `key` with the given algorithm.
    pub async fn allow(
        &self,
        key: &RateLimitKey,
        algorithm: &Algorithm,
    ) -> Result<RateLimitDecision, QuotaGuardError> {
        match *algorithm {
            Algorithm::SlidingWindow { limit, window } => {
                self.sliding_window(key, limit, window).await
            }
            Algorithm::TokenBucket { capacity, rate } => {
                self.token_bucket(key, capacity, rate).await
            }
            Algorithm::FixedWindow { limit, window } => self.fixed_window(key, limit, window).await,
        }
    }

    /// Sliding window admission.
    ///
    /// Atomically:
    /// 1. Evict events with timestamp `<= now - window`
    /// 2. Count the remaining events
    /// 3. If fewer than `limit`, record an event at `now` (with a unique member,
    ///    so simultaneous callers are never collapsed) and refresh the TTL to `window`
    ///
    /// For any instant `t`, at most `limit` admitted events fall in `(t - window, t]`.
    pub async fn sliding_window(
        &self,
        key: &RateLimitKey,
        limit: Limit,
        window: WindowSizeSeconds,
    ) -> Result<RateLimitDecision, QuotaGuardError> {
        let now_ms = self.clock.now_ms();

        let script = AtomicScript::SlidingWindow {
            key: self.key_generator.get_sliding_key(key),
            now_ms,
            window_ms: window.as_millis(),
            limit: *limit,
            ttl_seconds: *window,
            member: self.unique_member(now_ms),
        };

        let reply = self.store.atomic_script(&script).await;
        self.resolve(key, &script, reply, |admitted| admitted == 1)
    } // end method sliding_window

    /// Token bucket admission.
    ///
    /// Atomically refills `floor(elapsed_ms × rate / 1000)` whole tokens (capped at
    /// `capacity`), moves the refill instant to `now`, then spends one token if
    /// available. A missing bucket starts full.
    ///
    /// Elapsed time that did not produce a whole token is discarded, so checks
    /// arriving more often than `1 / rate` seconds never refill the bucket.
    pub async fn token_bucket(
        &self,
        key: &RateLimitKey,
        capacity: Limit,
        rate: RatePerSecond,
    ) -> Result<RateLimitDecision, QuotaGuardError> {
        let script = AtomicScript::TokenBucket {
            key: self.key_generator.get_token_key(key),
            now_ms: self.clock.now_ms(),
            capacity: *capacity,
            rate_per_second: *rate,
            ttl_seconds: TOKEN_BUCKET_TTL_SECONDS,
        };

        let reply = self.store.atomic_script(&script).await;
        self.resolve(key, &script, reply, |spent| spent == 1)
    } // end method token_bucket

    /// Fixed window admission.
    ///
    /// Increments the counter of epoch `floor(now / window)`, arming a TTL of
    /// `window` when the counter is created, and admits while the post-increment
    /// value is `<= limit`.
    pub async fn fixed_window(
        &self,
        key: &RateLimitKey,
        limit: Limit,
        window: WindowSizeSeconds,
    ) -> Result<RateLimitDecision, QuotaGuardError> {
        let now_ms = self.clock.now_ms();
        let epoch = now_ms / window.as_millis();

        let script = AtomicScript::FixedWindow {
            key: self.key_generator.get_fixed_key(key, epoch),
            now_ms,
            ttl_seconds: *window,
        };

        let reply = self.store.atomic_script(&script).await;
        let limit = i64::try_from(*limit).unwrap_or(i64::MAX);
        self.resolve(key, &script, reply, |count| count <= limit)
    } // end method fixed_window

    /// Number of events currently recorded in the sliding window of `key`.
    ///
    /// Events are evicted lazily on admission checks, so this may include
    /// events that have already left the window.
    pub async fn sliding_window_count(&self, key: &RateLimitKey) -> Result<u64, QuotaGuardError> {
        self.store
            .zcard(&self.key_generator.get_sliding_key(key))
            .await
    }

    /// Tokens left in the bucket of `key` as of its last check, or `None` if
    /// the bucket does not exist (it would start full).
    pub async fn token_bucket_remaining(
        &self,
        key: &RateLimitKey,
    ) -> Result<Option<f64>, QuotaGuardError> {
        let tokens = self
            .store
            .hash_get(&self.key_generator.get_token_key(key), TOKENS_FIELD)
            .await?;

        tokens
            .map(|tokens| {
                tokens.parse::<f64>().map_err(|_| {
                    QuotaGuardError::UnexpectedScriptReply(format!(
                        "token count is not a number: {tokens}"
                    ))
                })
            })
            .transpose()
    }

    /// Instant (epoch ms) of the last refill of the bucket of `key`.
    pub async fn token_bucket_last_refill_ms(
        &self,
        key: &RateLimitKey,
    ) -> Result<Option<u64>, QuotaGuardError> {
        let last = self
            .store
            .hash_get(&self.key_generator.get_token_key(key), LAST_REFILL_FIELD)
            .await?;

        Ok(last
            .and_then(|last| last.parse::<f64>().ok())
            .map(|last| last as u64))
    }

    /// Admissions counted in the current fixed-window epoch of `key`.
    pub async fn fixed_window_count(
        &self,
        key: &RateLimitKey,
        window: WindowSizeSeconds,
    ) -> Result<u64, QuotaGuardError> {
        let epoch = self.clock.now_ms() / window.as_millis();
        let count = self
            .store
            .get(&self.key_generator.get_fixed_key(key, epoch))
            .await?;

        Ok(count.and_then(|c| c.parse::<u64>().ok()).unwrap_or(0))
    }

    /// Drop the sliding window and token bucket state of `key`.
    pub async fn reset(&self, key: &RateLimitKey) -> Result<(), QuotaGuardError> {
        self.store
            .delete(&self.key_generator.get_sliding_key(key))
            .await?;
        self.store
            .delete(&self.key_generator.get_token_key(key))
            .await?;

        tracing::info!(key = %key, "rate limit state reset");

        Ok(())
    }

    /// Drop the current fixed-window epoch counter of `key`.
    pub async fn reset_fixed_window(
        &self,
        key: &RateLimitKey,
        window: WindowSizeSeconds,
    ) -> Result<bool, QuotaGuardError> {
        let epoch = self.clock.now_ms() / window.as_millis();
        self.store
            .delete(&self.key_generator.get_fixed_key(key, epoch))
            .await
    }

    fn unique_member(&self, now_ms: u64) -> String {
        let sequence = self.member_sequence.fetch_add(1, Ordering::Relaxed);
        format!("{now_ms}-{:016x}-{sequence}", self.instance_id)
    }

    fn resolve(
        &self,
        key: &RateLimitKey,
        script: &AtomicScript,
        reply: Result<i64, QuotaGuardError>,
        is_allowed: impl FnOnce(i64) -> bool,
    ) -> Result<RateLimitDecision, QuotaGuardError> {
        let err = match reply {
            Ok(value) => {
                let decision = RateLimitDecision::from(is_allowed(value));

                match decision {
                    RateLimitDecision::Allowed => {
                        tracing::debug!(key = %key, algorithm = script.name(), reply = value, "admission granted");
                    }
                    RateLimitDecision::Rejected => {
                        tracing::warn!(key = %key, algorithm = script.name(), reply = value, "admission denied");
                    }
                }

                return Ok(decision);
            }
            Err(err) => err,
        };

        if !err.is_store_error() {
            return Err(err);
        }

        match self.failure_policy {
            StoreFailurePolicy::FailOpen => {
                tracing::error!(key = %key, algorithm = script.name(), error = ?err, "rate limit store failure, failing open");
                Ok(RateLimitDecision::Allowed)
            }
            StoreFailurePolicy::FailClosed => {
                tracing::error!(key = %key, algorithm = script.name(), error = ?err, "rate limit store failure, failing closed");
                Ok(RateLimitDecision::Rejected)
            }
            StoreFailurePolicy::Propagate => {
                tracing::error!(key = %key, algorithm = script.name(), error = ?err, "rate limit store failure");
                Err(err)
            }
        }
    } // end method resolve
}
