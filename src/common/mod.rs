//! Common types and abstractions
//!
//! This module defines the core types used throughout the transport:
//! - PeerId: resolved remote endpoint identity
//! - InboundEvent: bytes (or end of stream) received from a peer
//! - ByteStreamBridge: push-to-pull adapter feeding per-peer decoders
//! - Error: unified error types

mod bridge;
mod event;
mod peer;

pub use bridge::{is_stream_closed, BridgeReader, BridgeWriter, ByteStreamBridge, ReadState};
pub use event::{InboundEvent, InboundListener};
pub use peer::PeerId;

// Re-export error types from crate root
pub use crate::error::{Error, Result};
