//! Bridge - push-delivered chunks exposed as a blocking byte stream
//!
//! A bridge has exactly one writer (the demultiplexer forwarding reactor
//! reads) and one reader (a decoding task). It keeps three states apart:
//! - data available
//! - temporarily empty (would block)
//! - closed (end of stream reached and buffer drained)
//!
//! Reads on a drained, closed bridge fail with a stream-closed error instead
//! of returning zero, so a consumer looping on `read` always terminates.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::error::Error;

/// Initial buffer capacity, grows on demand
const INITIAL_CAPACITY: usize = 8 * 1024;

/// Result of a non-blocking read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// This many bytes were copied into the caller's buffer
    Data(usize),
    /// Nothing buffered yet, the writer is still open
    WouldBlock,
    /// Writer closed and every buffered byte was consumed
    Closed,
}

/// Buffered bytes plus lifecycle flags, guarded together
struct BridgeBuffer {
    data: BytesMut,
    /// Set once by the writer on end of stream
    closed: bool,
    /// Set when the reader is dropped, later pushes are discarded
    reader_gone: bool,
}

impl BridgeBuffer {
    fn take_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        n
    }
}

/// Shared state for writer/reader coordination
struct BridgeState {
    buffer: Mutex<BridgeBuffer>,
    /// Notified on every push and on close
    readable: Condvar,
}

impl BridgeState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(BridgeBuffer {
                data: BytesMut::with_capacity(INITIAL_CAPACITY),
                closed: false,
                reader_gone: false,
            }),
            readable: Condvar::new(),
        })
    }

    fn push(&self, bytes: &[u8]) -> io::Result<()> {
        let mut inner = self.buffer.lock();
        if inner.closed {
            return Err(stream_closed());
        }
        if inner.reader_gone || bytes.is_empty() {
            return Ok(());
        }
        inner.data.extend_from_slice(bytes);
        drop(inner);
        self.readable.notify_one();
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.buffer.lock();
        if !inner.closed {
            inner.closed = true;
            drop(inner);
            self.readable.notify_all();
        }
    }

    fn mark_reader_gone(&self) {
        let mut inner = self.buffer.lock();
        inner.reader_gone = true;
        inner.data.clear();
    }
}

/// The error returned once a bridge is closed and drained
fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, Error::StreamClosed)
}

/// Check whether an I/O error came from reading a closed bridge
pub fn is_stream_closed(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|e| e.downcast_ref::<Error>())
        .map(|e| matches!(e, Error::StreamClosed))
        .unwrap_or(false)
}

/// A push-to-pull byte stream for one peer.
pub struct ByteStreamBridge {
    pub writer: BridgeWriter,
    pub reader: BridgeReader,
}

impl ByteStreamBridge {
    pub fn new() -> Self {
        let state = BridgeState::new();
        Self {
            writer: BridgeWriter {
                state: Arc::clone(&state),
            },
            reader: BridgeReader { state },
        }
    }

    /// Split into writer and reader (consumes self)
    pub fn split(self) -> (BridgeWriter, BridgeReader) {
        (self.writer, self.reader)
    }
}

impl Default for ByteStreamBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Write half, fed by the demultiplexer
pub struct BridgeWriter {
    state: Arc<BridgeState>,
}

impl BridgeWriter {
    /// Append a chunk, closing the stream afterwards when `eos` is set
    pub fn on_data(&self, bytes: &[u8], eos: bool) -> io::Result<()> {
        let result = self.state.push(bytes);
        if eos {
            self.state.close();
        }
        result
    }

    /// Signal end of stream; the reader drains what is left, then fails
    pub fn close(&self) {
        self.state.close();
    }

    pub fn is_closed(&self) -> bool {
        self.state.buffer.lock().closed
    }

    /// True once the consumer dropped its reader
    pub fn is_reader_gone(&self) -> bool {
        self.state.buffer.lock().reader_gone
    }

    /// Bytes pushed but not read yet
    pub fn buffered(&self) -> usize {
        self.state.buffer.lock().data.len()
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        self.state.close();
    }
}

/// Read half, handed to the per-peer consumer task
pub struct BridgeReader {
    state: Arc<BridgeState>,
}

impl BridgeReader {
    /// Non-blocking read reporting the three bridge states explicitly
    pub fn try_read(&mut self, buf: &mut [u8]) -> ReadState {
        let mut inner = self.state.buffer.lock();
        if !inner.data.is_empty() {
            return ReadState::Data(inner.take_into(buf));
        }
        if inner.closed {
            ReadState::Closed
        } else {
            ReadState::WouldBlock
        }
    }

    /// Block for at most `timeout` waiting for data
    ///
    /// Returns `ErrorKind::TimedOut` if nothing arrived in time.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.buffer.lock();
        loop {
            if !inner.data.is_empty() {
                return Ok(inner.take_into(buf));
            }
            if inner.closed {
                return Err(stream_closed());
            }
            if self
                .state
                .readable
                .wait_until(&mut inner, deadline)
                .timed_out()
                && inner.data.is_empty()
                && !inner.closed
            {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "bridge read timed out"));
            }
        }
    }

    /// Bytes ready to read without blocking
    ///
    /// Fails with a stream-closed error once closed and drained, so zero
    /// always means "wait", never "done".
    pub fn available(&self) -> io::Result<usize> {
        let inner = self.state.buffer.lock();
        if inner.data.is_empty() && inner.closed {
            return Err(stream_closed());
        }
        Ok(inner.data.len())
    }

    /// Writer signalled end of stream (bytes may still be buffered)
    pub fn is_closed(&self) -> bool {
        self.state.buffer.lock().closed
    }

    /// Closed and nothing left to read
    pub fn is_exhausted(&self) -> bool {
        let inner = self.state.buffer.lock();
        inner.closed && inner.data.is_empty()
    }
}

impl Read for BridgeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.state.buffer.lock();
        loop {
            if !inner.data.is_empty() {
                return Ok(inner.take_into(buf));
            }
            if inner.closed {
                return Err(stream_closed());
            }
            self.state.readable.wait(&mut inner);
        }
    }
}

impl Drop for BridgeReader {
    fn drop(&mut self) {
        self.state.mark_reader_gone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_three_states() {
        let (writer, mut reader) = ByteStreamBridge::new().split();
        let mut buf = [0u8; 8];

        assert_eq!(reader.try_read(&mut buf), ReadState::WouldBlock);
        assert_eq!(reader.available().unwrap(), 0);

        writer.on_data(&[1, 2, 3], false).unwrap();
        assert_eq!(reader.try_read(&mut buf), ReadState::Data(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);

        writer.close();
        assert_eq!(reader.try_read(&mut buf), ReadState::Closed);
        assert!(reader.available().is_err());
    }

    #[test]
    fn test_buffered_bytes_survive_close() {
        let (writer, mut reader) = ByteStreamBridge::new().split();
        writer.on_data(b"tail", true).unwrap();

        assert!(reader.is_closed());
        assert!(!reader.is_exhausted());

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert!(reader.is_exhausted());

        let err = reader.read(&mut buf).unwrap_err();
        assert!(is_stream_closed(&err));
    }

    #[test]
    fn test_blocking_read_preserves_order() {
        let (writer, mut reader) = ByteStreamBridge::new().split();

        let producer = thread::spawn(move || {
            for chunk in 0u8..50 {
                writer.on_data(&[chunk; 3], false).unwrap();
            }
            writer.close();
        });

        let mut received = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            match reader.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) => {
                    assert!(is_stream_closed(&e));
                    break;
                }
            }
        }
        producer.join().unwrap();

        let expected: Vec<u8> = (0u8..50).flat_map(|c| [c; 3]).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_blocked_reader_wakes_on_close() {
        let (writer, mut reader) = ByteStreamBridge::new().split();

        let consumer = thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(50));
        drop(writer);

        let result = consumer.join().unwrap();
        assert!(is_stream_closed(&result.unwrap_err()));
    }

    #[test]
    fn test_read_timeout() {
        let (_writer, mut reader) = ByteStreamBridge::new().split();
        let mut buf = [0u8; 4];
        let err = reader
            .read_timeout(&mut buf, Duration::from_millis(20))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_push_after_close_fails() {
        let (writer, _reader) = ByteStreamBridge::new().split();
        writer.close();
        let err = writer.on_data(&[1], false).unwrap_err();
        assert!(is_stream_closed(&err));
    }

    #[test]
    fn test_reader_drop_discards_pushes() {
        let (writer, reader) = ByteStreamBridge::new().split();
        writer.on_data(&[1, 2], false).unwrap();
        drop(reader);

        assert!(writer.is_reader_gone());
        writer.on_data(&[3, 4], false).unwrap();
        assert_eq!(writer.buffered(), 0);
    }
}
