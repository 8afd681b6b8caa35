use std::sync::Arc;

use dashmap::DashMap;

use crate::{QuotaGuardError, RateLimitKey};

/// Builds namespaced store keys: `<prefix>:<algorithm>:<key>` and
/// `<prefix>:fixed:<key>:<epoch>`.
///
/// Only key *names* are cached here; limiter state always stays in the store.
#[derive(Debug)]
pub(crate) struct KeyGenerator {
    prefix: Arc<str>,

    // caches
    sliding_key_cache: DashMap<RateLimitKey, Arc<str>>,
    token_key_cache: DashMap<RateLimitKey, Arc<str>>,
}

impl KeyGenerator {
    pub(crate) const DEFAULT_PREFIX: &'static str = "ratelimit";

    pub(crate) fn new(prefix: Option<&str>) -> Result<Self, QuotaGuardError> {
        let prefix = prefix.unwrap_or(Self::DEFAULT_PREFIX);

        if prefix.is_empty() || prefix.contains(':') {
            return Err(QuotaGuardError::InvalidConfiguration(
                "Key prefix must be non-empty and must not contain colons".to_string(),
            ));
        }

        Ok(Self {
            prefix: Arc::from(prefix),
            sliding_key_cache: DashMap::new(),
            token_key_cache: DashMap::new(),
        })
    }

    fn cached(
        &self,
        cache: &DashMap<RateLimitKey, Arc<str>>,
        key: &RateLimitKey,
        namespace: &str,
    ) -> Arc<str> {
        match cache.get(key) {
            Some(value) => value.clone(),
            None => {
                let value: Arc<str> = Arc::from(format!("{}:{}:{}", self.prefix, namespace, key));
                cache.insert(key.clone(), value.clone());

                value
            }
        }
    }

    pub(crate) fn get_sliding_key(&self, key: &RateLimitKey) -> Arc<str> {
        self.cached(&self.sliding_key_cache, key, "sliding")
    }

    pub(crate) fn get_token_key(&self, key: &RateLimitKey) -> Arc<str> {
        self.cached(&self.token_key_cache, key, "token")
    }

    pub(crate) fn get_fixed_key(&self, key: &RateLimitKey, epoch: u64) -> Arc<str> {
        Arc::from(format!("{}:fixed:{}:{}", self.prefix, key, epoch))
    }
}
