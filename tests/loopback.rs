//! End-to-end tests over loopback: real sockets, real threads

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use peerlink::app::ConsumerTask;
use peerlink::common::is_stream_closed;
use peerlink::{ConnectionMultiplexer, PeerId, StreamDemultiplexer, TransportConfig, WorkerPool};

/// What one consumer task saw before its stream ended
struct Drained {
    peer: PeerId,
    bytes: Vec<u8>,
    closed_at: Instant,
    closed_cleanly: bool,
}

fn node() -> (ConnectionMultiplexer, Arc<StreamDemultiplexer>, mpsc::Receiver<Drained>) {
    let mux = ConnectionMultiplexer::new(
        TransportConfig::loopback().with_queue_poll(Duration::from_millis(50)),
    );
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let pool = Arc::new(WorkerPool::new(8).unwrap());
    let demux = Arc::new(StreamDemultiplexer::new(pool, move |peer, mut reader| {
        let tx = tx.lock().clone();
        let peer = *peer;
        Some(Box::new(move || {
            let mut bytes = Vec::new();
            let mut buf = [0u8; 7];
            let closed_cleanly = loop {
                match reader.read(&mut buf) {
                    Ok(n) => bytes.extend_from_slice(&buf[..n]),
                    Err(e) => break is_stream_closed(&e),
                }
            };
            let _ = tx.send(Drained {
                peer,
                bytes,
                closed_at: Instant::now(),
                closed_cleanly,
            });
        }) as ConsumerTask)
    }));
    mux.add_listener(demux.clone());
    mux.start().unwrap();
    (mux, demux, rx)
}

#[test]
fn test_per_peer_streams_keep_byte_order() {
    let (mux, demux, rx) = node();
    let addr = mux.local_addr().unwrap();

    let writers: Vec<_> = (0..3u8)
        .map(|id| {
            thread::spawn(move || {
                let mut client = TcpStream::connect(addr).unwrap();
                let local = client.local_addr().unwrap();
                let mut sent = Vec::new();
                for chunk in 0..50u8 {
                    let bytes = [id, chunk, chunk.wrapping_mul(3)];
                    client.write_all(&bytes).unwrap();
                    sent.extend_from_slice(&bytes);
                }
                (PeerId::from(local), sent)
            })
        })
        .collect();
    let expected: Vec<(PeerId, Vec<u8>)> = writers.into_iter().map(|h| h.join().unwrap()).collect();

    let mut drained: Vec<Drained> = (0..3)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    drained.sort_by_key(|d| d.peer);

    let mut expected = expected;
    expected.sort_by_key(|(peer, _)| *peer);
    for (got, (peer, sent)) in drained.iter().zip(expected.iter()) {
        assert_eq!(got.peer, *peer);
        assert_eq!(&got.bytes, sent);
        assert!(got.closed_cleanly);
    }
    assert_eq!(demux.active_streams(), 0);
}

#[test]
fn test_read_after_eos_fails_promptly() {
    let (mux, _demux, rx) = node();
    let mut client = TcpStream::connect(mux.local_addr().unwrap()).unwrap();
    client.write_all(&[0x01, 0x02, 0x03]).unwrap();
    // Give the bytes a head start so they land before the close
    thread::sleep(Duration::from_millis(100));
    let closed = Instant::now();
    drop(client);

    let drained = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(drained.bytes, vec![0x01, 0x02, 0x03]);
    assert!(drained.closed_cleanly);
    assert!(drained.closed_at.duration_since(closed) < Duration::from_secs(2));
}

#[test]
fn test_two_nodes_exchange_messages() {
    let (a, _demux_a, _rx_a) = node();
    let (b, _demux_b, rx_b) = node();
    let b_addr = PeerId::from(b.local_addr().unwrap());

    let result = a.send_message(b_addr, &b"status"[..]).wait();
    assert!(result.is_success());
    assert_eq!(a.active_connection_count(), 1);

    // Closing node A ends the stream B sees from it
    a.stop();
    let drained = rx_b.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(drained.bytes, b"status");
    assert!(drained.closed_cleanly);
}

#[test]
fn test_purge_leaves_no_connections() {
    let (mux, demux, _rx) = node();
    let clients: Vec<TcpStream> = (0..4)
        .map(|_| TcpStream::connect(mux.local_addr().unwrap()).unwrap())
        .collect();
    let deadline = Instant::now() + Duration::from_secs(3);
    while mux.active_connection_count() < clients.len() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(mux.active_connection_count(), 4);

    mux.purge();
    assert_eq!(mux.active_connection_count(), 0);
    assert!(!mux.is_running());
    demux.shutdown();
}
