//! Reactor - the single I/O thread
//!
//! Owns the readiness poll. Each turn:
//! - waits on the poll for at most the poll timeout
//! - sweeps idle, dead and quiet connections
//! - accepts, reads and probes on ready sockets
//!
//! Readiness is edge-triggered, so accepts and reads always run until the
//! socket reports `WouldBlock`.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Events, Poll, Token};
use tracing::{debug, error, info, trace};

use crate::common::InboundEvent;

use super::connection::{CloseReason, Connection};
use super::engine::{Engine, LISTENER, WAKER};

/// Poll event capacity per turn
const EVENTS_CAPACITY: usize = 1024;

/// Interval between connection count reports
const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Readiness collected from one poll turn
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

pub(crate) struct Reactor {
    engine: Arc<Engine>,
    poll: Poll,
    events: Events,
    read_buf: Vec<u8>,
    last_sweep: Instant,
    last_report: Instant,
    reported_count: usize,
}

impl Reactor {
    pub(crate) fn new(engine: Arc<Engine>, poll: Poll) -> Self {
        let read_buf = vec![0u8; engine.config.max_read_size];
        let now = Instant::now();
        Self {
            engine,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            read_buf,
            last_sweep: now,
            last_report: now,
            reported_count: 0,
        }
    }

    /// Run until stopped or until the poll itself fails
    pub(crate) fn run(mut self) {
        info!("Listening on {}", self.engine.local_addr);
        while !self.engine.is_stopped() {
            if let Err(e) = self.turn() {
                error!("Reactor on {} failed: {}", self.engine.local_addr, e);
                self.engine.fail();
                break;
            }
        }
        debug!("Reactor on {} exited", self.engine.local_addr);
    }

    fn turn(&mut self) -> io::Result<()> {
        let timeout = self.engine.config.poll_timeout();
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        if self.last_sweep.elapsed() >= timeout {
            self.sweep();
            self.last_sweep = Instant::now();
        }

        let ready: Vec<Ready> = self
            .events
            .iter()
            .map(|event| Ready {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable(),
            })
            .collect();

        for event in ready {
            if self.engine.is_stopped() {
                break;
            }
            match event.token {
                LISTENER => self.engine.accept_pending(),
                WAKER => {}
                token => self.ready(token, event.readable, event.writable),
            }
        }

        self.report();
        Ok(())
    }

    fn ready(&mut self, token: Token, readable: bool, writable: bool) {
        // Events for connections closed earlier in this turn are stale
        let Some(conn) = self.engine.connections.get(token) else {
            return;
        };
        if writable {
            conn.set_writable(true);
            self.maybe_probe(&conn, Instant::now());
        }
        if readable && conn.is_open() {
            self.drain(&conn);
        }
    }

    /// Read until the socket would block, the peer closes or the read fails
    fn drain(&mut self, conn: &Arc<Connection>) {
        loop {
            match conn.read_chunk(&mut self.read_buf) {
                // With a non-empty buffer, zero bytes is the peer's FIN
                Ok(0) => {
                    debug!("Peer {} closed the connection", conn.peer());
                    self.engine.retire(conn, CloseReason::PeerClosed);
                    return;
                }
                Ok(n) => {
                    trace!("Read {} bytes from {}", n, conn.peer());
                    let payload = Bytes::copy_from_slice(&self.read_buf[..n]);
                    if !self.engine.publish(InboundEvent::data(conn.peer(), payload)) {
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Read from {} failed: {}", conn.peer(), e);
                    self.engine.retire(conn, CloseReason::ReadError);
                    return;
                }
            }
        }
    }

    /// Write a keep-alive probe if the connection has been quiet
    fn maybe_probe(&self, conn: &Connection, now: Instant) {
        if !self.engine.config.keep_alive
            || !conn.is_writable()
            || !conn.probe_due(now, self.engine.config.keep_alive_probe())
        {
            return;
        }
        match conn.probe() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => conn.set_writable(false),
            Err(e) => {
                debug!("Keep-alive probe to {} failed: {}", conn.peer(), e);
                self.engine.retire(conn, CloseReason::ProbeFailed);
            }
        }
    }

    /// Close idle and dead connections, probe quiet ones
    fn sweep(&self) {
        let now = Instant::now();
        let idle_timeout = self.engine.config.idle_timeout();
        for conn in self.engine.connections.snapshot() {
            if !conn.is_open() {
                continue;
            }
            if conn.is_dead() {
                debug!("Connection to {} died", conn.peer());
                self.engine.retire(&conn, CloseReason::Dead);
            } else if conn.idle_for(now) >= idle_timeout {
                debug!(
                    "Connection to {} idle for {:?}, closing",
                    conn.peer(),
                    conn.idle_for(now)
                );
                self.engine.retire(&conn, CloseReason::Idle);
            } else {
                self.maybe_probe(&conn, now);
            }
        }
    }

    fn report(&mut self) {
        if self.last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        let count = self.engine.connections.len();
        if count != self.reported_count {
            debug!("{} open connections on {}", count, self.engine.local_addr);
            self.reported_count = count;
        }
    }
}
