//! Dispatcher - fans inbound events out to listeners
//!
//! Flow:
//! ```text
//! Reactor → inbound queue → NotificationDispatcher → listeners (in order)
//! ```
//!
//! A single thread takes one event at a time and hands it to every
//! registered listener, so listeners see events in enqueue order. A panic
//! in one listener is caught and logged; the others still run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, Receiver};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::common::{InboundEvent, InboundListener};

use super::metrics::LISTENER_PANICS;

// ============================================================================
// Listener Registry
// ============================================================================

type ListenerList = Arc<Vec<Arc<dyn InboundListener>>>;

/// Copy-on-write listener set
///
/// Dispatch works on a snapshot, so registration changes never race with a
/// fan-out already in progress. They take effect from the next event.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<ListenerList>,
}

/// Listeners are identified by allocation, not by value
fn same_listener(a: &Arc<dyn InboundListener>, b: &Arc<dyn InboundListener>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; false if it was already registered
    pub fn add(&self, listener: Arc<dyn InboundListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        let mut next = Vec::with_capacity(listeners.len() + 1);
        next.extend(listeners.iter().cloned());
        next.push(listener);
        *listeners = Arc::new(next);
        true
    }

    /// Unregister a listener; false if it was not registered
    pub fn remove(&self, listener: &Arc<dyn InboundListener>) -> bool {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| same_listener(l, listener)) {
            return false;
        }
        let next: Vec<_> = listeners
            .iter()
            .filter(|l| !same_listener(l, listener))
            .cloned()
            .collect();
        *listeners = Arc::new(next);
        true
    }

    pub fn snapshot(&self) -> ListenerList {
        Arc::clone(&self.listeners.read())
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Drains the inbound queue on its own thread
pub struct NotificationDispatcher {
    listeners: Arc<ListenerRegistry>,
    queue: Receiver<InboundEvent>,
    shutdown: Receiver<()>,
    poll_interval: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        listeners: Arc<ListenerRegistry>,
        queue: Receiver<InboundEvent>,
        shutdown: Receiver<()>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            listeners,
            queue,
            shutdown,
            poll_interval,
        }
    }

    /// Loop until the shutdown channel closes or the queue disconnects
    pub fn run(self) {
        loop {
            select! {
                recv(self.queue) -> event => match event {
                    Ok(event) => self.dispatch(&event),
                    Err(_) => break,
                },
                recv(self.shutdown) -> _ => break,
                default(self.poll_interval) => {}
            }
        }
        debug!("Dispatcher exited");
    }

    /// Deliver one event to every listener in registration order
    pub fn dispatch(&self, event: &InboundEvent) {
        for listener in self.listeners.snapshot().iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| listener.on_inbound(event)));
            if let Err(cause) = result {
                LISTENER_PANICS.inc();
                error!(
                    "Listener panicked on event from {}: {}",
                    event.peer,
                    panic_message(&*cause)
                );
            }
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
