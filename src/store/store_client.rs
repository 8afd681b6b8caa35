use std::future::Future;

use crate::{AtomicScript, QuotaGuardError};

/// Shared key-value store with atomic read-modify-write primitives.
///
/// The store is the only place limiter state lives. Implementations must run
/// [`StoreClient::atomic_script`] as one uninterruptible unit; the remaining
/// commands back the administrative queries and need no extra atomicity.
pub trait StoreClient: Send + Sync {
    /// Execute an admission script atomically and return its integer reply.
    fn atomic_script(
        &self,
        script: &AtomicScript,
    ) -> impl Future<Output = Result<i64, QuotaGuardError>> + Send;

    /// Increment an integer key by one and return the new value.
    fn increment(&self, key: &str) -> impl Future<Output = Result<i64, QuotaGuardError>> + Send;

    /// Set a TTL on `key`. Returns `false` when the key does not exist.
    fn expire(
        &self,
        key: &str,
        ttl_seconds: u64,
    ) -> impl Future<Output = Result<bool, QuotaGuardError>> + Send;

    /// Delete `key`. Returns `true` when something was removed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, QuotaGuardError>> + Send;

    /// Cardinality of the sorted set at `key` (0 when absent).
    fn zcard(&self, key: &str) -> impl Future<Output = Result<u64, QuotaGuardError>> + Send;

    /// Value of `field` in the hash at `key`.
    fn hash_get(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<Option<String>, QuotaGuardError>> + Send;

    /// String value at `key`.
    fn get(&self, key: &str)
    -> impl Future<Output = Result<Option<String>, QuotaGuardError>> + Send;
}
