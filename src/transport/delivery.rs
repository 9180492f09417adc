//! Delivery promises and futures for outbound requests
//!
//! Every send returns a [`DeliveryFuture`] resolved exactly once. The
//! matching [`DeliveryPromise`] is owned by whoever holds the request, and
//! completing it consumes it; a promise dropped without completion resolves
//! its future as `Unfinished` so no caller waits forever.

use std::future::{Future, IntoFuture};
use std::pin::{pin, Pin};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

use bytes::Bytes;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::oneshot;

use crate::app::metrics::DELIVERIES;
use crate::common::PeerId;
use crate::error::Error;

/// Final outcome of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The whole payload was written to the socket
    Success,
    /// Connect or write failed, or the request was failed at shutdown
    Error,
    /// Destination could not be resolved
    Unreachable,
    /// Rejected because the transport is stopping
    Unfinished,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Success => "success",
            DeliveryOutcome::Error => "error",
            DeliveryOutcome::Unreachable => "unreachable",
            DeliveryOutcome::Unfinished => "unfinished",
        }
    }
}

/// Outcome plus the error that caused it, if any
#[derive(Debug)]
pub struct DeliveryResult {
    pub outcome: DeliveryOutcome,
    pub cause: Option<Error>,
}

impl DeliveryResult {
    pub fn success() -> Self {
        Self {
            outcome: DeliveryOutcome::Success,
            cause: None,
        }
    }

    pub fn error(cause: Error) -> Self {
        Self {
            outcome: DeliveryOutcome::Error,
            cause: Some(cause),
        }
    }

    pub fn unreachable(cause: Error) -> Self {
        Self {
            outcome: DeliveryOutcome::Unreachable,
            cause: Some(cause),
        }
    }

    pub fn unfinished(cause: Error) -> Self {
        Self {
            outcome: DeliveryOutcome::Unfinished,
            cause: Some(cause),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == DeliveryOutcome::Success
    }
}

/// Write side of a delivery future, completed exactly once
pub struct DeliveryPromise {
    tx: Option<oneshot::Sender<DeliveryResult>>,
}

impl DeliveryPromise {
    pub fn new() -> (Self, DeliveryFuture) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, DeliveryFuture { rx })
    }

    /// Resolve the future; consuming `self` rules out a second completion
    pub fn complete(mut self, result: DeliveryResult) {
        self.resolve(result);
    }

    fn resolve(&mut self, result: DeliveryResult) {
        if let Some(tx) = self.tx.take() {
            DELIVERIES.with_label_values(&[result.outcome.as_str()]).inc();
            // Receiver may be gone, the caller stopped caring
            let _ = tx.send(result);
        }
    }
}

impl Drop for DeliveryPromise {
    fn drop(&mut self) {
        self.resolve(DeliveryResult::unfinished(Error::Shutdown));
    }
}

/// A queued send: destination, payload and the promise to resolve
pub struct OutboundRequest {
    pub peer: PeerId,
    pub payload: Bytes,
    pub promise: DeliveryPromise,
}

impl OutboundRequest {
    pub fn new(peer: PeerId, payload: Bytes) -> (Self, DeliveryFuture) {
        let (promise, future) = DeliveryPromise::new();
        (
            Self {
                peer,
                payload,
                promise,
            },
            future,
        )
    }

    pub fn complete(self, result: DeliveryResult) {
        self.promise.complete(result);
    }
}

/// One-shot handle on the outcome of a send
///
/// Await it from async code, or call [`DeliveryFuture::wait`] from a plain
/// thread.
pub struct DeliveryFuture {
    rx: oneshot::Receiver<DeliveryResult>,
}

impl DeliveryFuture {
    /// A future that is already resolved
    pub fn ready(result: DeliveryResult) -> Self {
        let (promise, future) = DeliveryPromise::new();
        promise.complete(result);
        future
    }

    /// Block the current thread until the outcome is known
    ///
    /// Parks the thread rather than entering the runtime, so it is safe on
    /// worker pool threads and does not panic inside an async context. On an
    /// async worker it still blocks that worker; await the future there.
    pub fn wait(self) -> DeliveryResult {
        let waker = Waker::from(Arc::new(Unparker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        // Unconstrained so an exhausted task budget cannot keep it pending
        let mut rx = pin!(tokio::task::unconstrained(self.rx));
        loop {
            if let Poll::Ready(result) = rx.as_mut().poll(&mut cx) {
                return result.unwrap_or_else(|_| DeliveryResult::unfinished(Error::Shutdown));
            }
            thread::park();
        }
    }

    /// Outcome if already resolved, without blocking
    pub fn try_result(&mut self) -> Option<DeliveryResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(DeliveryResult::unfinished(Error::Shutdown))
            }
        }
    }
}

impl Future for DeliveryFuture {
    type Output = DeliveryResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| DeliveryResult::unfinished(Error::Shutdown)))
    }
}

/// Wakes a thread parked in [`DeliveryFuture::wait`]
struct Unparker(Thread);

impl Wake for Unparker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Aggregate of one delivery per open connection
pub struct BroadcastFuture {
    deliveries: Vec<(PeerId, DeliveryFuture)>,
}

impl BroadcastFuture {
    pub(crate) fn new(deliveries: Vec<(PeerId, DeliveryFuture)>) -> Self {
        Self { deliveries }
    }

    /// Number of peers the payload was fanned out to
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Block until every per-peer delivery resolved
    pub fn wait(self) -> Vec<(PeerId, DeliveryResult)> {
        self.deliveries
            .into_iter()
            .map(|(peer, future)| (peer, future.wait()))
            .collect()
    }
}

impl IntoFuture for BroadcastFuture {
    type Output = Vec<(PeerId, DeliveryResult)>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        let (peers, futures): (Vec<PeerId>, Vec<DeliveryFuture>) =
            self.deliveries.into_iter().unzip();
        async move {
            let results = join_all(futures).await;
            peers.into_iter().zip(results).collect()
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerId {
        PeerId::from(std::net::SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_complete_once() {
        let (promise, future) = DeliveryPromise::new();
        promise.complete(DeliveryResult::success());
        assert!(future.wait().is_success());
    }

    #[test]
    fn test_dropped_promise_resolves_unfinished() {
        let (promise, future) = DeliveryPromise::new();
        drop(promise);
        let result = future.wait();
        assert_eq!(result.outcome, DeliveryOutcome::Unfinished);
        assert!(matches!(result.cause, Some(Error::Shutdown)));
    }

    #[test]
    fn test_try_result_pending() {
        let (promise, mut future) = DeliveryPromise::new();
        assert!(future.try_result().is_none());
        promise.complete(DeliveryResult::error(Error::QueueFull));
        let result = future.try_result().unwrap();
        assert_eq!(result.outcome, DeliveryOutcome::Error);
    }

    #[tokio::test]
    async fn test_wait_inside_runtime() {
        let (promise, future) = DeliveryPromise::new();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            promise.complete(DeliveryResult::success());
        });
        assert!(future.wait().is_success());

        let (promise, future) = DeliveryPromise::new();
        drop(promise);
        let broadcast = BroadcastFuture::new(vec![(peer(1), future)]);
        let results = broadcast.wait();
        assert_eq!(results[0].1.outcome, DeliveryOutcome::Unfinished);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wait_on_blocking_pool() {
        let (promise, future) = DeliveryPromise::new();
        let waiter = tokio::task::spawn_blocking(move || future.wait());
        promise.complete(DeliveryResult::error(Error::QueueFull));
        let result = waiter.await.unwrap();
        assert_eq!(result.outcome, DeliveryOutcome::Error);
        assert!(matches!(result.cause, Some(Error::QueueFull)));
    }

    #[tokio::test]
    async fn test_await_ready() {
        let result = DeliveryFuture::ready(DeliveryResult::unreachable(Error::InvalidAddress(
            "nowhere".into(),
        )))
        .await;
        assert_eq!(result.outcome, DeliveryOutcome::Unreachable);
    }

    #[tokio::test]
    async fn test_broadcast_keeps_peer_order() {
        let (p1, f1) = DeliveryPromise::new();
        let (p2, f2) = DeliveryPromise::new();
        let broadcast = BroadcastFuture::new(vec![(peer(1), f1), (peer(2), f2)]);
        assert_eq!(broadcast.len(), 2);

        p2.complete(DeliveryResult::error(Error::Shutdown));
        p1.complete(DeliveryResult::success());

        let results = broadcast.await;
        assert_eq!(results[0].0, peer(1));
        assert!(results[0].1.is_success());
        assert_eq!(results[1].1.outcome, DeliveryOutcome::Error);
    }
}
