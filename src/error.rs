//! Error types for peerlink

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::common::PeerId;

/// Why an outbound connection could not be established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Host or network unreachable
    NoRoute,
    /// Remote actively refused the connection
    Refused,
    /// Host name did not resolve to any address
    Unresolved,
    /// Connect did not complete within the configured timeout
    Timeout,
    /// Anything else reported by the socket layer
    Other,
}

impl ConnectErrorKind {
    /// Classify a socket error raised while connecting
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                ConnectErrorKind::NoRoute
            }
            io::ErrorKind::TimedOut => ConnectErrorKind::Timeout,
            _ => ConnectErrorKind::Other,
        }
    }

    /// Failures that happen routinely when a vehicle is switched off or out of range
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ConnectErrorKind::NoRoute | ConnectErrorKind::Refused | ConnectErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectErrorKind::NoRoute => "no route to host",
            ConnectErrorKind::Refused => "connection refused",
            ConnectErrorKind::Unresolved => "unresolved host",
            ConnectErrorKind::Timeout => "connect timeout",
            ConnectErrorKind::Other => "connect failed",
        };
        f.write_str(s)
    }
}

/// Main error type for peerlink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Cannot connect to {peer}: {kind}")]
    Connect { peer: PeerId, kind: ConnectErrorKind },

    #[error("Partial write to {peer}: {written} of {expected} bytes")]
    PartialWrite {
        peer: PeerId,
        written: usize,
        expected: usize,
    },

    #[error("Peer closed: {0}")]
    PeerClosed(PeerId),

    #[error("Transport is shutting down")]
    Shutdown,

    #[error("Outbound queue is full")]
    QueueFull,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl Error {
    /// Connect failure with the kind derived from a socket error
    pub fn connect(peer: PeerId, err: &io::Error) -> Self {
        Error::Connect {
            peer,
            kind: ConnectErrorKind::from_io(err),
        }
    }
}

/// Result type alias for peerlink
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_kind_classification() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(ConnectErrorKind::from_io(&refused), ConnectErrorKind::Refused);

        let unreachable = io::Error::new(io::ErrorKind::HostUnreachable, "unreachable");
        assert_eq!(ConnectErrorKind::from_io(&unreachable), ConnectErrorKind::NoRoute);

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(ConnectErrorKind::from_io(&timeout), ConnectErrorKind::Timeout);

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(ConnectErrorKind::from_io(&other), ConnectErrorKind::Other);
        assert!(!ConnectErrorKind::Other.is_expected());
    }

    #[test]
    fn test_error_display() {
        let peer = PeerId::from("127.0.0.1:7011".parse::<SocketAddr>().unwrap());
        let err = Error::PartialWrite {
            peer,
            written: 10,
            expected: 20,
        };
        assert_eq!(err.to_string(), "Partial write to 127.0.0.1:7011: 10 of 20 bytes");
    }
}
