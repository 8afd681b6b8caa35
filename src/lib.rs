#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod clock;
pub use clock::*;

mod common;
pub use common::{
    Algorithm, Limit, RateLimitDecision, RateLimitKey, RatePerSecond, WindowSizeSeconds,
};

mod error;
pub use error::*;

mod store;
pub use store::*;

mod limiter;
pub use limiter::*;

mod downstream;
pub use downstream::*;

mod resilience;
pub use resilience::*;

mod shutdown;
pub use shutdown::*;

mod consumer;
pub use consumer::*;

#[cfg(test)]
mod tests;
