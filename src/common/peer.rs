//! Peer identity for remote connection endpoints

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::{ConnectErrorKind, Error, Result};

/// Resolved (host, port) pair identifying a remote endpoint
///
/// Equality, hashing and ordering all follow the canonical `ip:port` form,
/// so two identities built from different spellings of the same host
/// compare equal once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    addr: SocketAddr,
}

impl PeerId {
    /// Create from an already resolved socket address
    pub fn new(addr: SocketAddr) -> Self {
        // Drop IPv6 flow info so equality matches the canonical string form
        let addr = match addr {
            SocketAddr::V6(v6) => SocketAddr::new(IpAddr::V6(*v6.ip()), v6.port()),
            v4 => v4,
        };
        Self { addr }
    }

    /// Resolve a host name (or literal IP) and port
    pub fn resolve(host: &str, port: u16) -> Result<Self> {
        let unresolved = || Error::Connect {
            peer: PeerId::unspecified(port),
            kind: ConnectErrorKind::Unresolved,
        };

        let all: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|_| unresolved())?
            .collect();
        // Prefer IPv4, the vehicles' networks rarely route v6
        all.iter()
            .find(|a| a.is_ipv4())
            .or_else(|| all.first())
            .map(|a| PeerId::new(*a))
            .ok_or_else(unresolved)
    }

    /// Parse a `host:port` string, resolving the host
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::new(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        Self::resolve(host, port)
    }

    fn unspecified(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        PeerId::new(addr)
    }
}
