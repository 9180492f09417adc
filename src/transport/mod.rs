//! Transport Layer
//!
//! Responsibilities:
//! - Own the listening socket and every peer connection
//! - Move opaque bytes in both directions, no framing, no decoding
//! - Report each send's outcome through a one-shot delivery future
//!
//! Threads: one reactor (readiness poll), one sender (outbound queue).

mod connection;
mod delivery;
mod engine;
mod multiplexer;
mod reactor;
mod sender;

pub use connection::{CloseReason, Connection, ConnectionTable, Direction};
pub use delivery::{
    BroadcastFuture, DeliveryFuture, DeliveryOutcome, DeliveryPromise, DeliveryResult,
    OutboundRequest,
};
pub use multiplexer::ConnectionMultiplexer;
