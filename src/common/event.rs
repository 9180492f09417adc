//! Inbound notifications produced by the reactor

use std::time::SystemTime;

use bytes::Bytes;

use super::peer::PeerId;

/// Bytes received from a peer, or the end of its stream
///
/// Created once per successful read or detected close, consumed exactly
/// once by the dispatcher.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub peer: PeerId,
    pub payload: Bytes,
    pub eos: bool,
    pub timestamp: SystemTime,
}

impl InboundEvent {
    pub fn data(peer: PeerId, payload: Bytes) -> Self {
        Self {
            peer,
            payload,
            eos: false,
            timestamp: SystemTime::now(),
        }
    }

    /// End-of-stream marker, always with an empty payload
    pub fn end_of_stream(peer: PeerId) -> Self {
        Self {
            peer,
            payload: Bytes::new(),
            eos: true,
            timestamp: SystemTime::now(),
        }
    }

    pub fn is_eos(&self) -> bool {
        self.eos
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Receiver of inbound events, invoked off the I/O thread
///
/// Implementations must be cheap or hand work off; every listener runs on
/// the single dispatcher thread, one event at a time.
pub trait InboundListener: Send + Sync {
    fn on_inbound(&self, event: &InboundEvent);
}

impl<F> InboundListener for F
where
    F: Fn(&InboundEvent) + Send + Sync,
{
    fn on_inbound(&self, event: &InboundEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_eos_has_empty_payload() {
        let peer = PeerId::from(SocketAddr::from(([10, 0, 0, 1], 6002)));
        let event = InboundEvent::end_of_stream(peer);
        assert!(event.is_eos());
        assert!(event.is_empty());

        let data = InboundEvent::data(peer, Bytes::from_static(&[1, 2, 3]));
        assert!(!data.is_eos());
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_closure_listener() {
        let seen = AtomicUsize::new(0);
        let listener = |event: &InboundEvent| {
            seen.fetch_add(event.len(), Ordering::SeqCst);
        };
        let peer = PeerId::from(SocketAddr::from(([127, 0, 0, 1], 1)));
        listener.on_inbound(&InboundEvent::data(peer, Bytes::from_static(b"abcd")));
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }
}
