//! Shared key-value store abstraction.
//!
//! Limiter state lives only in the store. Every admission decision is a single
//! [`AtomicScript`] invocation, so concurrent consumers in different processes
//! never interleave a read and a write of the same window or bucket.
//!
//! # Backends
//!
//! - [`RedisStore`]: the shared store for multi-process deployments (feature `redis-tokio`)
//! - [`MemoryStore`]: single-process store for tests, benches and local demos
//!
//! # Key layout
//!
//! - Sliding window: `<prefix>:sliding:<key>` (sorted set, score = event time in ms)
//! - Token bucket: `<prefix>:token:<key>` (hash with `tokens` and `last_refill_ms`)
//! - Fixed window: `<prefix>:fixed:<key>:<epoch>` (integer counter)
//!
//! The default prefix is `ratelimit`.

mod atomic_script;
pub use atomic_script::*;

mod store_client;
pub use store_client::*;

mod memory_store;
pub use memory_store::*;

#[cfg(feature = "redis-tokio")]
mod redis_store;
#[cfg(feature = "redis-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-tokio")))]
pub use redis_store::*;

mod key_generator;
pub(crate) use key_generator::KeyGenerator;
