//! Stream demultiplexer - one byte stream per peer
//!
//! Registered as an inbound listener, it splits the flat event stream by
//! peer:
//! - the first event from a peer creates its bridge and asks the factory
//!   for a consumer task, scheduled once on the worker pool
//! - data is appended to the peer's bridge in arrival order
//! - end of stream closes the bridge and forgets the peer; the consumer
//!   still drains what was buffered before it sees the close
//!
//! Appending to a bridge never blocks, so forwarding happens on the calling
//! thread. Only consumer tasks, which do block, run on the pool.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::common::{BridgeReader, BridgeWriter, ByteStreamBridge, InboundEvent, InboundListener, PeerId};

use super::metrics::{STREAMS_ACTIVE, STREAMS_OPENED};
use super::worker::WorkerPool;

/// Work run for one peer, typically a decode loop over the reader
pub type ConsumerTask = Box<dyn FnOnce() + Send + 'static>;

type ConsumerFactory = dyn Fn(&PeerId, BridgeReader) -> Option<ConsumerTask> + Send + Sync;

#[derive(Default)]
struct DemuxState {
    bridges: HashMap<PeerId, BridgeWriter>,
    /// None when the factory declined to consume the peer
    tasks: HashMap<PeerId, Option<JoinHandle<()>>>,
}

pub struct StreamDemultiplexer {
    factory: Box<ConsumerFactory>,
    pool: Arc<WorkerPool>,
    state: Mutex<DemuxState>,
}

impl StreamDemultiplexer {
    pub fn new<F>(pool: Arc<WorkerPool>, factory: F) -> Self
    where
        F: Fn(&PeerId, BridgeReader) -> Option<ConsumerTask> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            pool,
            state: Mutex::new(DemuxState::default()),
        }
    }

    /// Peers with an open stream
    pub fn active_streams(&self) -> usize {
        self.state.lock().bridges.len()
    }

    pub fn has_stream(&self, peer: &PeerId) -> bool {
        self.state.lock().bridges.contains_key(peer)
    }

    /// Close every stream so blocked consumers return
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let closed = state.bridges.len();
        for (_, writer) in state.bridges.drain() {
            writer.close();
        }
        state.tasks.clear();
        STREAMS_ACTIVE.sub(closed as i64);
        debug!("Demultiplexer closed {} streams", closed);
    }

    fn forward(&self, event: &InboundEvent) {
        let peer = event.peer;
        let mut state = self.state.lock();
        let DemuxState { bridges, tasks } = &mut *state;

        let writer = match bridges.entry(peer) {
            Entry::Occupied(entry) => entry.into_mut(),
            // Nothing to close for a peer we never saw data from
            Entry::Vacant(_) if event.is_eos() => return,
            Entry::Vacant(entry) => {
                let (writer, reader) = ByteStreamBridge::new().split();
                STREAMS_OPENED.inc();
                STREAMS_ACTIVE.inc();
                if !tasks.contains_key(&peer) {
                    let task = (self.factory)(&peer, reader);
                    debug!(
                        "New stream from {} ({})",
                        peer,
                        if task.is_some() { "consumer scheduled" } else { "no consumer" }
                    );
                    tasks.insert(peer, task.map(|task| self.pool.spawn(task)));
                }
                entry.insert(writer)
            }
        };

        if let Err(e) = writer.on_data(&event.payload, event.is_eos()) {
            trace!("Dropping {} bytes for {}: {}", event.len(), peer, e);
        }

        if event.is_eos() {
            bridges.remove(&peer);
            tasks.remove(&peer);
            STREAMS_ACTIVE.dec();
            debug!("Stream from {} ended", peer);
        }
    }
}

impl InboundListener for StreamDemultiplexer {
    fn on_inbound(&self, event: &InboundEvent) {
        self.forward(event);
    }
}

impl Drop for StreamDemultiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
