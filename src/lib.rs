//! Peerlink - multiplexed TCP transport for vehicles and ground stations
//!
//! # Architecture
//!
//! ```text
//! sockets → Reactor → inbound queue → NotificationDispatcher → listeners
//!                                                                 ↓
//!                                                     StreamDemultiplexer
//!                                                                 ↓
//!                                           ByteStreamBridge (one per peer)
//!                                                                 ↓
//!                                                  consumer task (decoder)
//!
//! send_message → outbound queue → sender loop → Connection → socket
//! ```
//!
//! ## Core Principles
//!
//! - Bytes are opaque; framing and decoding belong to the consumer tasks
//! - The I/O thread never runs listener or decoder code
//! - Byte order is preserved per peer, never across peers
//! - Every send resolves its delivery future exactly once
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: PeerId, InboundEvent, ByteStreamBridge
//! ├── transport/       # Reactor, sender, connections, delivery futures
//! └── app/             # Dispatcher, StreamDemultiplexer, WorkerPool, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod transport;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{BridgeReader, BridgeWriter, ByteStreamBridge, InboundEvent, InboundListener, PeerId};
pub use config::{Config, TransportConfig};
pub use error::{ConnectErrorKind, Error, Result};

// Architecture re-exports
pub use app::{StreamDemultiplexer, WorkerPool};
pub use transport::{ConnectionMultiplexer, DeliveryFuture, DeliveryOutcome, DeliveryResult};
