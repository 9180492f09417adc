//! Sender loop - drains the outbound queue
//!
//! Each request gets exactly one write attempt with its full payload. Short
//! writes are not retried: the connection is closed and the request fails.
//!
//! Dials never run on this loop. A request for a peer with no open
//! connection is parked and a connect thread is started for that peer; later
//! requests for the same peer join the parked list instead of dialing again.
//! When the dial settles the parked requests are written in arrival order,
//! or all failed with the dial's error.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{select, unbounded, Sender};
use tracing::{debug, trace, warn};

use crate::common::PeerId;
use crate::error::{Error, Result};

use super::connection::{CloseReason, Connection};
use super::delivery::{DeliveryResult, OutboundRequest};
use super::engine::Engine;

/// Outcome of one connect thread
type Dialed = (PeerId, Result<Arc<Connection>>);

/// Requests waiting on an in-flight dial, keyed by peer
type Parked = HashMap<PeerId, Vec<OutboundRequest>>;

pub(crate) fn run(engine: Arc<Engine>) {
    let poll = engine.config.queue_poll();
    let (dialed_tx, dialed_rx) = unbounded::<Dialed>();
    let mut parked = Parked::new();

    while !engine.is_stopped() {
        select! {
            recv(engine.outbound_rx) -> request => match request {
                Ok(request) => route(&engine, request, &mut parked, &dialed_tx),
                Err(_) => break,
            },
            recv(dialed_rx) -> dialed => {
                if let Ok((peer, result)) = dialed {
                    settle(&engine, peer, result, &mut parked, &dialed_tx);
                }
            },
            recv(engine.shutdown_rx) -> _ => break,
            default(poll) => {}
        }
        engine.set_parked(parked.values().map(Vec::len).sum());
    }

    let abandoned: usize = parked.values().map(Vec::len).sum();
    for request in parked.into_values().flatten() {
        request.complete(DeliveryResult::error(Error::Shutdown));
    }
    debug!(
        "Sender on {} exited, {} sends abandoned mid-connect",
        engine.local_addr, abandoned
    );
}

/// Write now, join an in-flight dial, or start one
fn route(
    engine: &Arc<Engine>,
    request: OutboundRequest,
    parked: &mut Parked,
    dialed_tx: &Sender<Dialed>,
) {
    if engine.is_stopped() {
        request.complete(DeliveryResult::error(Error::Shutdown));
        return;
    }

    let peer = request.peer;
    if let Some(waiting) = parked.get_mut(&peer) {
        trace!("Joining pending connect to {}", peer);
        waiting.push(request);
        return;
    }
    if let Some(conn) = engine.connections.find(&peer) {
        deliver(engine, &conn, request);
        return;
    }

    let dialer = Arc::clone(engine);
    let tx = dialed_tx.clone();
    let spawned = thread::Builder::new()
        .name("peerlink-connect".into())
        .spawn(move || {
            let result = dialer.connect(peer);
            // The sender may already be gone; its exit failed the parked requests
            let _ = tx.send((peer, result));
        });
    match spawned {
        Ok(_) => {
            parked.insert(peer, vec![request]);
        }
        Err(e) => {
            warn!("Failed to start connect thread for {}: {}", peer, e);
            request.complete(DeliveryResult::error(Error::Io(e)));
        }
    }
}

/// Flush or fail the requests parked on a finished dial
fn settle(
    engine: &Arc<Engine>,
    peer: PeerId,
    result: Result<Arc<Connection>>,
    parked: &mut Parked,
    dialed_tx: &Sender<Dialed>,
) {
    let waiting = parked.remove(&peer).unwrap_or_default();
    match result {
        Ok(conn) => {
            for request in waiting {
                if conn.is_open() {
                    deliver(engine, &conn, request);
                } else {
                    // An earlier write closed it; dial again for the rest
                    route(engine, request, parked, dialed_tx);
                }
            }
        }
        Err(e) => {
            debug!("Failing {} sends to {}: {}", waiting.len(), peer, e);
            for request in waiting {
                request.complete(DeliveryResult::error(replicate(&e)));
            }
        }
    }
}

fn deliver(engine: &Engine, conn: &Connection, request: OutboundRequest) {
    let peer = request.peer;
    let expected = request.payload.len();
    let written = match conn.write_once(&request.payload) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
        Err(e) => {
            debug!("Write to {} failed: {}", peer, e);
            engine.retire(conn, CloseReason::WriteError);
            request.complete(DeliveryResult::error(write_error(peer, e)));
            return;
        }
    };

    if written == expected {
        trace!("Sent {} bytes to {}", written, peer);
        request.complete(DeliveryResult::success());
    } else {
        warn!("Partial write to {}: {} of {} bytes", peer, written, expected);
        engine.retire(conn, CloseReason::WriteError);
        request.complete(DeliveryResult::error(Error::PartialWrite {
            peer,
            written,
            expected,
        }));
    }
}

/// Resets and broken pipes mean the peer went away under us
fn write_error(peer: PeerId, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => Error::PeerClosed(peer),
        _ => Error::Io(err),
    }
}

/// One dial error handed to every request that waited on it
fn replicate(err: &Error) -> Error {
    match err {
        Error::Connect { peer, kind } => Error::Connect {
            peer: *peer,
            kind: *kind,
        },
        Error::Shutdown => Error::Shutdown,
        Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
        other => Error::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
    }
}
