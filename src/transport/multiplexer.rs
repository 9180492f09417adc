//! Connection multiplexer - the transport's public face
//!
//! Architecture:
//! ```text
//!              ┌──────────── reactor thread ────────────┐
//! sockets ───► │ accept / read / probe / idle sweep      │ ──► inbound queue ──► dispatcher thread ──► listeners
//!              └─────────────────────────────────────────┘
//! callers ───► outbound queue ──► sender thread ──► connect_or_reuse + one write ──► delivery future
//! ```
//!
//! All three threads are detached; `stop` signals them and returns without
//! joining.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::app::{ListenerRegistry, NotificationDispatcher};
use crate::common::{InboundListener, PeerId};
use crate::config::TransportConfig;
use crate::error::{Error, Result};

use super::connection::Connection;
use super::delivery::{BroadcastFuture, DeliveryFuture, DeliveryResult};
use super::engine::Engine;
use super::sender;

/// Multiplexes message exchange with many peers over one listening port
pub struct ConnectionMultiplexer {
    config: Mutex<TransportConfig>,
    listeners: Arc<ListenerRegistry>,
    /// Engine of the current (or last) start
    engine: RwLock<Option<Arc<Engine>>>,
    bind_error: AtomicBool,
}

impl ConnectionMultiplexer {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: Mutex::new(config),
            listeners: Arc::new(ListenerRegistry::new()),
            engine: RwLock::new(None),
            bind_error: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> TransportConfig {
        self.config.lock().clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind the configured port and start the reactor, dispatcher and sender
    ///
    /// Already running: returns the bound address. A bind failure is
    /// remembered (see [`is_on_bind_error`](Self::is_on_bind_error)) and not
    /// retried.
    pub fn start(&self) -> Result<SocketAddr> {
        let mut current = self.engine.write();
        if let Some(engine) = current.as_ref().filter(|e| !e.is_stopped()) {
            return Ok(engine.local_addr);
        }

        let config = self.config();
        config.validate()?;
        let (engine, reactor) = match Engine::bind(&config) {
            Ok(bound) => bound,
            Err(e) => {
                self.bind_error.store(true, Ordering::SeqCst);
                error!("Transport not started: {}", e);
                return Err(e);
            }
        };
        self.bind_error.store(false, Ordering::SeqCst);

        let dispatcher = NotificationDispatcher::new(
            Arc::clone(&self.listeners),
            engine.inbound_rx.clone(),
            engine.shutdown_rx.clone(),
            config.queue_poll(),
        );
        let sender_engine = Arc::clone(&engine);
        let spawned = thread::Builder::new()
            .name("peerlink-reactor".into())
            .spawn(move || reactor.run())
            .and_then(|_| {
                thread::Builder::new()
                    .name("peerlink-dispatch".into())
                    .spawn(move || dispatcher.run())
            })
            .and_then(|_| {
                thread::Builder::new()
                    .name("peerlink-sender".into())
                    .spawn(move || sender::run(sender_engine))
            });
        if let Err(e) = spawned {
            engine.shutdown();
            error!("Failed to spawn transport threads: {}", e);
            return Err(e.into());
        }

        info!("Transport started on {}", engine.local_addr);
        let local_addr = engine.local_addr;
        *current = Some(engine);
        Ok(local_addr)
    }

    /// Start on a different port, keeping every other setting
    pub fn start_on(&self, bind_port: u16) -> Result<SocketAddr> {
        self.config.lock().bind_port = bind_port;
        self.start()
    }

    /// Abrupt stop: fail queued sends, close every connection
    ///
    /// Safe to call any number of times.
    pub fn stop(&self) {
        if let Some(engine) = self.current() {
            engine.shutdown();
        }
    }

    /// Graceful stop: refuse new sends, wait for both queues to drain, stop
    pub fn purge(&self) {
        let Some(engine) = self.current() else {
            return;
        };
        engine.begin_purge();
        let interval = engine.config.queue_poll();
        while !engine.is_stopped() && !engine.is_idle() {
            debug!("Purging: waiting for queues to drain");
            thread::sleep(interval);
        }
        engine.shutdown();
    }

    /// Start again after a stop; false if still running or the bind failed
    pub fn restart(&self) -> bool {
        if self.is_running() {
            warn!("Restart ignored, transport is still running");
            return false;
        }
        self.start().is_ok()
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn current(&self) -> Option<Arc<Engine>> {
        self.engine.read().clone()
    }

    fn running(&self) -> Option<Arc<Engine>> {
        self.current().filter(|e| !e.is_stopped())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Running and neither failed nor stuck on a bind error
    pub fn is_running_normally(&self) -> bool {
        !self.is_on_bind_error()
            && self
                .running()
                .map(|e| !e.is_failed())
                .unwrap_or(false)
    }

    pub fn is_on_bind_error(&self) -> bool {
        self.bind_error.load(Ordering::SeqCst)
    }

    /// Address actually bound, useful with port 0
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().map(|e| e.local_addr)
    }

    pub fn active_connection_count(&self) -> usize {
        self.current().map(|e| e.connections.len()).unwrap_or(0)
    }

    pub fn is_connection_established(&self, peer: &PeerId) -> bool {
        self.running()
            .map(|e| e.connections.find(peer).is_some())
            .unwrap_or(false)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// The peer's open connection, or a newly established one
    ///
    /// Returns None if the connect failed or the transport is not running.
    pub fn connect_or_reuse(&self, peer: PeerId) -> Option<Arc<Connection>> {
        let engine = self.running()?;
        engine.connect(peer).ok()
    }

    pub fn connect_if_not_connected(&self, peer: PeerId) -> bool {
        self.connect_or_reuse(peer).is_some()
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Queue `payload` for `peer`; the future reports the outcome
    pub fn send_message(&self, peer: PeerId, payload: impl Into<Bytes>) -> DeliveryFuture {
        match self.running() {
            Some(engine) => engine.submit(peer, payload.into()),
            None => DeliveryFuture::ready(DeliveryResult::unfinished(Error::Shutdown)),
        }
    }

    /// Resolve `host` and send; resolution failures are `Unreachable`
    pub fn send_to(&self, host: &str, port: u16, payload: impl Into<Bytes>) -> DeliveryFuture {
        match PeerId::resolve(host, port) {
            Ok(peer) => self.send_message(peer, payload),
            Err(e) => {
                debug!("Cannot resolve {}:{}: {}", host, port, e);
                DeliveryFuture::ready(DeliveryResult::unreachable(e))
            }
        }
    }

    /// Send `payload` to every open connection
    pub fn broadcast(&self, payload: impl Into<Bytes>) -> BroadcastFuture {
        let payload = payload.into();
        let Some(engine) = self.running() else {
            return BroadcastFuture::new(Vec::new());
        };
        let mut peers: Vec<PeerId> = engine
            .connections
            .snapshot()
            .iter()
            .filter(|c| c.is_open())
            .map(|c| c.peer())
            .collect();
        peers.sort();
        let deliveries = peers
            .into_iter()
            .map(|peer| (peer, engine.submit(peer, payload.clone())))
            .collect();
        BroadcastFuture::new(deliveries)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a listener for inbound events; false if already registered
    pub fn add_listener(&self, listener: Arc<dyn InboundListener>) -> bool {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, listener: &Arc<dyn InboundListener>) -> bool {
        self.listeners.remove(listener)
    }
}

impl Drop for ConnectionMultiplexer {
    fn drop(&mut self) {
        self.stop();
    }
}
