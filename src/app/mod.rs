//! Application Layer
//!
//! This module contains:
//! - Dispatcher: drains the inbound queue into registered listeners
//! - Demux: splits inbound events into one byte stream per peer
//! - Worker: elastic thread pool running per-peer consumers
//! - Metrics: Prometheus counters for the whole transport

mod dispatcher;
mod demux;
pub mod metrics;
mod worker;

pub use demux::{ConsumerTask, StreamDemultiplexer};
pub use dispatcher::{ListenerRegistry, NotificationDispatcher};
pub use worker::WorkerPool;
