//! Worker pool for per-peer consumer tasks
//!
//! Consumer tasks block on bridge reads, so they run on tokio's blocking
//! pool: threads are created lazily, reaped when idle, and capped by the
//! configured maximum.

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;

/// Elastic pool of background threads
pub struct WorkerPool {
    /// Owned runtime, None when borrowing an existing one
    runtime: Option<Runtime>,
    handle: Handle,
}

impl WorkerPool {
    /// Create a pool with its own runtime
    pub fn new(max_threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads.max(1))
            .thread_name("peerlink-worker")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        debug!("Worker pool created (max {} threads)", max_threads);
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// Run tasks on an existing runtime's blocking pool
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            runtime: None,
            handle,
        }
    }

    /// Schedule a blocking task
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn_blocking(task)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Do not wait for consumers still blocked on reads
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_spawn_runs_task() {
        let pool = WorkerPool::new(4).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(42).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    }

    #[test]
    fn test_drop_does_not_wait_for_blocked_task() {
        let pool = WorkerPool::new(2).unwrap();
        let (_tx, rx) = mpsc::channel::<()>();
        pool.spawn(move || {
            let _ = rx.recv();
        });
        // Returns even though the task never finishes
        drop(pool);
    }

    #[tokio::test]
    async fn test_from_handle() {
        let pool = WorkerPool::from_handle(Handle::current());
        let result = pool.spawn(|| ()).await;
        assert!(result.is_ok());
    }
}
