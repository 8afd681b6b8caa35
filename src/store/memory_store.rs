use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    AtomicScript, Clock, QuotaGuardError, StoreClient, SystemClock,
    store::atomic_script::{LAST_REFILL_FIELD, TOKENS_FIELD},
};

#[derive(Debug, Clone)]
enum Value {
    Integer(i64),
    /// Members ordered by `(score, member)`.
    SortedSet(BTreeSet<(u64, String)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

/// Single-process [`StoreClient`] holding its whole keyspace behind one mutex.
///
/// Every [`AtomicScript`] runs natively inside that critical section, which
/// gives the same all-or-nothing semantics Redis gives a Lua script. TTLs are
/// evaluated against the injected [`Clock`] so tests can expire keys by moving
/// a [`ManualClock`](crate::ManualClock).
///
/// State is shared by clones of the same store only; it is not a substitute
/// for a real shared store across processes.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose TTLs follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.lock()
            .values()
            .filter(|entry| !Self::is_expired(entry, now_ms))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining TTL of `key` in milliseconds, if it has one.
    pub fn ttl_ms(&self, key: &str) -> Option<u64> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.lock();
        Self::live(&mut entries, key, now_ms)?
            .expires_at_ms
            .map(|at| at.saturating_sub(now_ms))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        // Mutations are single map operations, so a poisoned map is still consistent.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_expired(entry: &Entry, now_ms: u64) -> bool {
        matches!(entry.expires_at_ms, Some(at) if at <= now_ms)
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now_ms: u64,
    ) -> Option<&'a mut Entry> {
        if entries
            .get(key)
            .is_some_and(|entry| Self::is_expired(entry, now_ms))
        {
            entries.remove(key);
        }

        entries.get_mut(key)
    }

    fn set_ttl(entries: &mut HashMap<String, Entry>, key: &str, ttl_seconds: u64, now_ms: u64) {
        if let Some(entry) = Self::live(entries, key, now_ms) {
            entry.expires_at_ms = Some(now_ms.saturating_add(ttl_seconds.saturating_mul(1000)));
        }
    }

    fn incr(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now_ms: u64,
    ) -> Result<i64, QuotaGuardError> {
        match Self::live(entries, key, now_ms) {
            Some(Entry {
                value: Value::Integer(n),
                ..
            }) => {
                *n = n.saturating_add(1);
                Ok(*n)
            }
            Some(_) => Err(QuotaGuardError::WrongType(key.to_string())),
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Integer(1),
                        expires_at_ms: None,
                    },
                );
                Ok(1)
            }
        }
    }

    fn run_sliding_window(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u64,
        ttl_seconds: u64,
        member: &str,
    ) -> Result<i64, QuotaGuardError> {
        let window_start = now_ms.saturating_sub(window_ms);

        let current = match Self::live(entries, key, now_ms) {
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => {
                while set
                    .first()
                    .is_some_and(|(score, _)| *score <= window_start)
                {
                    set.pop_first();
                }
                set.len() as u64
            }
            Some(_) => return Err(QuotaGuardError::WrongType(key.to_string())),
            None => 0,
        };

        if current >= limit {
            return Ok(0);
        }

        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::SortedSet(BTreeSet::new()),
            expires_at_ms: None,
        });

        // members are unique per invocation, so no existing score to replace
        if let Value::SortedSet(set) = &mut entry.value {
            set.insert((now_ms, member.to_string()));
        }

        Self::set_ttl(entries, key, ttl_seconds, now_ms);

        Ok(1)
    }

    fn run_token_bucket(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        now_ms: u64,
        capacity: u64,
        rate_per_second: f64,
        ttl_seconds: u64,
    ) -> Result<i64, QuotaGuardError> {
        let capacity = capacity as f64;

        let stored = match Self::live(entries, key, now_ms) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => {
                let tokens = hash.get(TOKENS_FIELD).and_then(|v| v.parse::<f64>().ok());
                let last = hash
                    .get(LAST_REFILL_FIELD)
                    .and_then(|v| v.parse::<f64>().ok());
                tokens.zip(last)
            }
            Some(_) => return Err(QuotaGuardError::WrongType(key.to_string())),
            None => None,
        };

        let (mut tokens, mut last_refill_ms) = stored.unwrap_or((capacity, now_ms as f64));

        let elapsed_ms = (now_ms as f64 - last_refill_ms).max(0f64);
        let refill = (elapsed_ms * rate_per_second / 1000f64).floor();

        tokens = capacity.min(tokens + refill);
        last_refill_ms = now_ms as f64;

        let allowed = if tokens >= 1f64 {
            tokens -= 1f64;
            1
        } else {
            0
        };

        let mut hash = HashMap::with_capacity(2);
        hash.insert(TOKENS_FIELD.to_string(), tokens.to_string());
        hash.insert(LAST_REFILL_FIELD.to_string(), last_refill_ms.to_string());

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(hash),
                expires_at_ms: None,
            },
        );
        Self::set_ttl(entries, key, ttl_seconds, now_ms);

        Ok(allowed)
    }
}

impl StoreClient for MemoryStore {
    async fn atomic_script(&self, script: &AtomicScript) -> Result<i64, QuotaGuardError> {
        let mut entries = self.lock();

        match script {
            AtomicScript::SlidingWindow {
                key,
                now_ms,
                window_ms,
                limit,
                ttl_seconds,
                member,
            } => Self::run_sliding_window(
                &mut entries,
                key,
                *now_ms,
                *window_ms,
                *limit,
                *ttl_seconds,
                member,
            ),
            AtomicScript::TokenBucket {
                key,
                now_ms,
                capacity,
                rate_per_second,
                ttl_seconds,
            } => Self::run_token_bucket(
                &mut entries,
                key,
                *now_ms,
                *capacity,
                *rate_per_second,
                *ttl_seconds,
            ),
            AtomicScript::FixedWindow {
                key,
                now_ms,
                ttl_seconds,
            } => {
                let count = Self::incr(&mut entries, key, *now_ms)?;
                if count == 1 {
                    Self::set_ttl(&mut entries, key, *ttl_seconds, *now_ms);
                }
                Ok(count)
            }
        }
    }

    async fn increment(&self, key: &str) -> Result<i64, QuotaGuardError> {
        let now_ms = self.clock.now_ms();
        Self::incr(&mut self.lock(), key, now_ms)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, QuotaGuardError> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.lock();

        if Self::live(&mut entries, key, now_ms).is_none() {
            return Ok(false);
        }

        Self::set_ttl(&mut entries, key, ttl_seconds, now_ms);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, QuotaGuardError> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.lock();

        let existed = Self::live(&mut entries, key, now_ms).is_some();
        entries.remove(key);

        Ok(existed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, QuotaGuardError> {
        let now_ms = self.clock.now_ms();

        match Self::live(&mut self.lock(), key, now_ms) {
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(QuotaGuardError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, QuotaGuardError> {
        let now_ms = self.clock.now_ms();

        match Self::live(&mut self.lock(), key, now_ms) {
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(QuotaGuardError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QuotaGuardError> {
        let now_ms = self.clock.now_ms();

        match Self::live(&mut self.lock(), key, now_ms) {
            Some(Entry {
                value: Value::Integer(n),
                ..
            }) => Ok(Some(n.to_string())),
            Some(_) => Err(QuotaGuardError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }
}
