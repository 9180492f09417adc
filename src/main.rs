//! Peerlink - a console node exchanging raw messages with peers

use std::io::{BufRead, Read};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use peerlink::app::{metrics, ConsumerTask};
use peerlink::common::is_stream_closed;
use peerlink::config::Config;
use peerlink::error::Result;
use peerlink::{ConnectionMultiplexer, PeerId, StreamDemultiplexer, WorkerPool};

/// Bytes shown per received chunk
const PREVIEW_LEN: usize = 32;

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.transport.bind_port = port;
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| Some(config.log.level.clone()))
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }

    metrics::init_metrics();
    info!("Peerlink v{} starting...", env!("CARGO_PKG_VERSION"));

    let peers = args
        .peers
        .iter()
        .map(|p| PeerId::parse(p))
        .collect::<Result<Vec<_>>>()?;

    let mux = ConnectionMultiplexer::new(config.transport.clone());
    let pool = Arc::new(WorkerPool::new(config.transport.max_worker_threads)?);
    let demux = Arc::new(StreamDemultiplexer::new(pool, |peer, reader| {
        let peer = *peer;
        Some(Box::new(move || print_stream(peer, reader)) as ConsumerTask)
    }));
    mux.add_listener(demux.clone());

    let addr = mux.start()?;
    info!("Listening on {}, type lines to send them", addr);

    for peer in &peers {
        if !mux.connect_if_not_connected(*peer) {
            warn!("{} is not reachable yet, sends will retry the connect", peer);
        }
    }

    // Each stdin line goes to the configured peers, or to everyone connected
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let payload = bytes::Bytes::from(format!("{}\n", line));
        if peers.is_empty() {
            for (peer, result) in mux.broadcast(payload).wait() {
                report(&peer, &result);
            }
        } else {
            for peer in &peers {
                let result = mux.send_message(*peer, payload.clone()).wait();
                report(peer, &result);
            }
        }
    }

    info!("Input closed, draining queues");
    mux.purge();
    demux.shutdown();
    info!("Metrics:\n{}", metrics::render());
    info!("Goodbye!");
    Ok(())
}

fn report(peer: &PeerId, result: &peerlink::DeliveryResult) {
    match &result.cause {
        None => info!("Sent to {}", peer),
        Some(cause) => error!("Send to {} {}: {}", peer, result.outcome.as_str(), cause),
    }
}

/// Consumer task: log every chunk received from one peer
fn print_stream(peer: PeerId, mut reader: peerlink::BridgeReader) {
    let mut buf = vec![0u8; 4096];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buf) {
            Ok(n) => {
                total += n as u64;
                let preview: Vec<String> = buf[..n.min(PREVIEW_LEN)]
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect();
                info!("{} sent {} bytes: {}", peer, n, preview.join(" "));
            }
            Err(e) if is_stream_closed(&e) => break,
            Err(e) => {
                error!("Stream from {} failed: {}", peer, e);
                break;
            }
        }
    }
    info!(
        "Stream from {} ended after {}",
        peer,
        metrics::format_bytes(total)
    );
}

/// Simple command line argument parser
struct Args {
    config: Option<PathBuf>,
    port: Option<u16>,
    peers: Vec<String>,
    version: bool,
}

impl Args {
    fn parse() -> Self {
        let args: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut port = None;
        let mut peers = Vec::new();
        let mut version = false;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < args.len() {
                        config = Some(PathBuf::from(&args[i + 1]));
                        i += 1;
                    }
                }
                "-p" | "--port" => {
                    if i + 1 < args.len() {
                        port = args[i + 1].parse().ok();
                        i += 1;
                    }
                }
                "--peer" => {
                    if i + 1 < args.len() {
                        peers.push(args[i + 1].clone());
                        i += 1;
                    }
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Self {
            config,
            port,
            peers,
            version,
        }
    }
}

fn print_help() {
    println!(
        r#"Peerlink - multiplexed TCP message transport

USAGE:
    peerlink [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -p, --port <PORT>       Listening port (default 7011)
    --peer <HOST:PORT>      Send stdin lines to this peer (repeatable)
    -v, --version           Print version information
    -h, --help              Print help information

Without --peer, each line is broadcast to every connected peer.

EXAMPLES:
    peerlink -p 6002
    peerlink -c node.json --peer 10.0.10.50:6002
"#
    );
}

fn print_version() {
    println!("peerlink {}", env!("CARGO_PKG_VERSION"));
}
