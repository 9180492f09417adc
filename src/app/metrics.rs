//! Prometheus-based metrics module
//!
//! Provides metrics collection using Prometheus client library.
//! The text exposition is available through [`render`].

use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Connection Metrics ===

    /// Connections accepted on the listening socket
    pub static ref CONNECTIONS_ACCEPTED: IntCounter = IntCounter::new(
        "peerlink_connections_accepted_total",
        "Total number of inbound connections accepted"
    ).unwrap();

    /// Outbound connections established on demand
    pub static ref CONNECTIONS_OPENED: IntCounter = IntCounter::new(
        "peerlink_connections_opened_total",
        "Total number of outbound connections established"
    ).unwrap();

    /// Failed outbound connection attempts
    pub static ref CONNECTIONS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("peerlink_connections_failed_total", "Failed outbound connection attempts"),
        &["kind"]
    ).unwrap();

    /// Closed connections by reason
    pub static ref CONNECTIONS_CLOSED: IntCounterVec = IntCounterVec::new(
        Opts::new("peerlink_connections_closed_total", "Closed connections by reason"),
        &["reason"]
    ).unwrap();

    /// Currently open connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "peerlink_connections_active",
        "Number of currently open connections"
    ).unwrap();

    /// Outbound connect latency
    pub static ref CONNECT_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "peerlink_connect_duration_seconds",
            "Time spent establishing outbound connections"
        ).buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0])
    ).unwrap();

    // === Traffic Metrics ===

    /// Bytes read from sockets
    pub static ref BYTES_RECEIVED: IntCounter = IntCounter::new(
        "peerlink_bytes_received_total",
        "Total bytes received"
    ).unwrap();

    /// Bytes written to sockets
    pub static ref BYTES_SENT: IntCounter = IntCounter::new(
        "peerlink_bytes_sent_total",
        "Total bytes sent"
    ).unwrap();

    // === Delivery Metrics ===

    /// Inbound events queued for dispatch
    pub static ref INBOUND_EVENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("peerlink_inbound_events_total", "Inbound events by kind"),
        &["kind"]
    ).unwrap();

    /// Resolved send requests by outcome
    pub static ref DELIVERIES: IntCounterVec = IntCounterVec::new(
        Opts::new("peerlink_deliveries_total", "Send requests by delivery outcome"),
        &["outcome"]
    ).unwrap();

    /// Listener invocations that panicked
    pub static ref LISTENER_PANICS: IntCounter = IntCounter::new(
        "peerlink_listener_panics_total",
        "Listener invocations that panicked"
    ).unwrap();

    // === Demultiplexer Metrics ===

    /// Per-peer streams created
    pub static ref STREAMS_OPENED: IntCounter = IntCounter::new(
        "peerlink_streams_opened_total",
        "Per-peer byte streams created"
    ).unwrap();

    /// Per-peer streams still open
    pub static ref STREAMS_ACTIVE: IntGauge = IntGauge::new(
        "peerlink_streams_active",
        "Per-peer byte streams currently open"
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    // Connection metrics
    REGISTRY.register(Box::new(CONNECTIONS_ACCEPTED.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_OPENED.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_CLOSED.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(CONNECT_DURATION_SECONDS.clone())).ok();

    // Traffic metrics
    REGISTRY.register(Box::new(BYTES_RECEIVED.clone())).ok();
    REGISTRY.register(Box::new(BYTES_SENT.clone())).ok();

    // Delivery metrics
    REGISTRY.register(Box::new(INBOUND_EVENTS.clone())).ok();
    REGISTRY.register(Box::new(DELIVERIES.clone())).ok();
    REGISTRY.register(Box::new(LISTENER_PANICS.clone())).ok();

    // Demultiplexer metrics
    REGISTRY.register(Box::new(STREAMS_OPENED.clone())).ok();
    REGISTRY.register(Box::new(STREAMS_ACTIVE.clone())).ok();
}

/// Text exposition of every registered metric
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper struct for timing a single outbound connect
pub struct ConnectTimer {
    start_time: Instant,
}

impl ConnectTimer {
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }

    /// Record a successful connect with its duration
    pub fn record_success(&self) {
        CONNECTIONS_OPENED.inc();
        CONNECT_DURATION_SECONDS.observe(self.start_time.elapsed().as_secs_f64());
    }

    /// Record a failed connect attempt
    pub fn record_failure(&self, kind: &str) {
        CONNECTIONS_FAILED.with_label_values(&[kind]).inc();
    }
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
