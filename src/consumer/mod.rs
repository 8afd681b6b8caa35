//! Message consumption.
//!
//! A [`ConsumptionLoop`] turns each message into one protected downstream call
//! and answers the transport with a [`Delivery`]. [`InMemoryTransport`] runs
//! loops as [`MessageHandler`]s with at-least-once redelivery.

mod consumption_loop;
pub use consumption_loop::*;

mod transport;
pub use transport::*;
