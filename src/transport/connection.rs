//! Connections and the active connection set
//!
//! A [`Connection`] wraps one non-blocking socket registered with the
//! reactor. Once closed it is never reopened; the next lookup for the same
//! peer creates a fresh instance.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use tracing::trace;

use crate::app::metrics::{BYTES_RECEIVED, BYTES_SENT};
use crate::common::PeerId;

/// How the connection came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted on the listening socket
    Inbound,
    /// Opened on demand to send
    Outbound,
}

/// Why a connection was closed, used for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    WriteError,
    ProbeFailed,
    Idle,
    Dead,
    Duplicate,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadError => "read_error",
            CloseReason::WriteError => "write_error",
            CloseReason::ProbeFailed => "probe_failed",
            CloseReason::Idle => "idle",
            CloseReason::Dead => "dead",
            CloseReason::Duplicate => "duplicate",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Timestamps feeding the idle sweep and keep-alive probes
struct Activity {
    /// Last accept or successful read
    last_activity: Instant,
    /// Last regular write or keep-alive probe
    last_write: Instant,
}

/// One open TCP connection to a peer
pub struct Connection {
    token: Token,
    peer: PeerId,
    direction: Direction,
    stream: Mutex<TcpStream>,
    open: AtomicBool,
    /// Set by writable readiness, cleared when a write would block
    writable: AtomicBool,
    activity: Mutex<Activity>,
    created_at: Instant,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl Connection {
    /// Register `stream` for read and write readiness and wrap it
    pub(crate) fn register(
        registry: &Registry,
        token: Token,
        peer: PeerId,
        direction: Direction,
        mut stream: TcpStream,
    ) -> io::Result<Arc<Self>> {
        registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        let now = Instant::now();
        Ok(Arc::new(Self {
            token,
            peer,
            direction,
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            writable: AtomicBool::new(false),
            activity: Mutex::new(Activity {
                last_activity: now,
                last_write: now,
            }),
            created_at: now,
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }))
    }

    pub fn id(&self) -> usize {
        self.token.0
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn last_activity(&self) -> Instant {
        self.activity.lock().last_activity
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Stamp activity, feeds the idle sweep
    pub(crate) fn touch(&self) {
        self.activity.lock().last_activity = Instant::now();
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.activity.lock().last_activity)
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    /// One non-blocking read attempt
    pub(crate) fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream.lock().read(buf)?;
        if n > 0 {
            self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            BYTES_RECEIVED.inc_by(n as u64);
            self.touch();
        }
        Ok(n)
    }

    /// One non-blocking write attempt; returns how much the kernel accepted
    pub(crate) fn write_once(&self, payload: &[u8]) -> io::Result<usize> {
        let n = self.stream.lock().write(payload)?;
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        BYTES_SENT.inc_by(n as u64);
        self.activity.lock().last_write = Instant::now();
        Ok(n)
    }

    /// No read or write happened within `quiet`
    pub(crate) fn probe_due(&self, now: Instant, quiet: Duration) -> bool {
        let activity = self.activity.lock();
        let last = activity.last_activity.max(activity.last_write);
        now.saturating_duration_since(last) >= quiet
    }

    /// Zero-length keep-alive write
    pub(crate) fn probe(&self) -> io::Result<()> {
        trace!("Keep-alive probe to {}", self.peer);
        self.stream.lock().write(&[])?;
        self.activity.lock().last_write = Instant::now();
        Ok(())
    }

    /// Socket-level error or hang-up noticed without an explicit close
    pub(crate) fn is_dead(&self) -> bool {
        let stream = self.stream.lock();
        matches!(stream.take_error(), Ok(Some(_)) | Err(_))
    }

    /// Transition to closed; returns false if it already was
    pub(crate) fn close(&self, registry: &Registry) -> bool {
        if !self.open.swap(false, Ordering::SeqCst) {
            return false;
        }
        let mut stream = self.stream.lock();
        // Either may fail if the socket is already gone
        let _ = registry.deregister(&mut *stream);
        let _ = stream.shutdown(Shutdown::Both);
        true
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.token.0)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Default)]
struct TableInner {
    by_token: HashMap<Token, Arc<Connection>>,
    by_peer: HashMap<PeerId, Token>,
}

/// Active connection set, at most one open connection per peer
///
/// The lock is only held for the map update itself.
#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<TableInner>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` unless the peer already has an open connection
    ///
    /// On conflict the existing connection is returned and `conn` is left
    /// for the caller to close.
    pub fn insert_if_absent(&self, conn: Arc<Connection>) -> Result<(), Arc<Connection>> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .by_peer
            .get(&conn.peer())
            .and_then(|token| inner.by_token.get(token))
        {
            if existing.is_open() {
                return Err(Arc::clone(existing));
            }
        }
        inner.by_peer.insert(conn.peer(), conn.token());
        inner.by_token.insert(conn.token(), conn);
        Ok(())
    }

    pub fn get(&self, token: Token) -> Option<Arc<Connection>> {
        self.inner.lock().by_token.get(&token).cloned()
    }

    /// Open connection for `peer`, if any
    pub fn find(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        let inner = self.inner.lock();
        inner
            .by_peer
            .get(peer)
            .and_then(|token| inner.by_token.get(token))
            .filter(|conn| conn.is_open())
            .cloned()
    }

    pub fn remove(&self, token: Token) -> Option<Arc<Connection>> {
        let mut inner = self.inner.lock();
        let conn = inner.by_token.remove(&token)?;
        if inner.by_peer.get(&conn.peer()) == Some(&token) {
            inner.by_peer.remove(&conn.peer());
        }
        Some(conn)
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().by_token.values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.lock();
        inner.by_peer.clear();
        inner.by_token.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;

    /// Loopback pair: a registered mio client plus the accepted std peer
    fn connected(poll: &Poll, token: usize) -> (Arc<Connection>, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        let peer = PeerId::from(client.peer_addr().unwrap());
        let conn = Connection::register(
            poll.registry(),
            Token(token),
            peer,
            Direction::Outbound,
            TcpStream::from_std(client),
        )
        .unwrap();
        (conn, server)
    }

    #[test]
    fn test_close_is_once() {
        let poll = Poll::new().unwrap();
        let (conn, _server) = connected(&poll, 1);

        assert!(conn.is_open());
        assert!(conn.close(poll.registry()));
        assert!(!conn.is_open());
        assert!(!conn.close(poll.registry()));
    }

    #[test]
    fn test_write_and_read_counters() {
        let poll = Poll::new().unwrap();
        let (conn, mut server) = connected(&poll, 1);

        assert_eq!(conn.write_once(b"ping").unwrap(), 4);
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(conn.bytes_sent(), 4);

        server.write_all(b"pong").unwrap();
        let mut received = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while received.len() < 4 && Instant::now() < deadline {
            match conn.read_chunk(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(received, b"pong");
        assert_eq!(conn.bytes_received(), 4);
    }

    #[test]
    fn test_table_one_open_connection_per_peer() {
        let poll = Poll::new().unwrap();
        let table = ConnectionTable::new();
        let (first, _s1) = connected(&poll, 1);
        assert!(table.insert_if_absent(Arc::clone(&first)).is_ok());

        // Same peer identity, different socket
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let other = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        other.set_nonblocking(true).unwrap();
        let duplicate = Connection::register(
            poll.registry(),
            Token(2),
            first.peer(),
            Direction::Outbound,
            TcpStream::from_std(other),
        )
        .unwrap();

        let existing = table.insert_if_absent(duplicate).unwrap_err();
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(table.len(), 1);

        first.close(poll.registry());
        assert!(table.find(&first.peer()).is_none());
        assert!(table.remove(first.token()).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_probe_due_after_quiet_period() {
        let poll = Poll::new().unwrap();
        let (conn, _server) = connected(&poll, 1);
        let now = Instant::now();
        assert!(!conn.probe_due(now, Duration::from_secs(2)));
        assert!(conn.probe_due(now + Duration::from_secs(3), Duration::from_secs(2)));

        conn.probe().unwrap();
        assert!(!conn.probe_due(Instant::now(), Duration::from_secs(2)));
    }
}
