//! Deferred index maintenance.
//!
//! Higher layers queue futures here instead of updating secondary indexes
//! inline. The queue is drained before a batch's final flush and at every
//! checkpoint, always with write access held.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::ArborResult;

/// A queued index operation.
pub type PendingOp = BoxFuture<'static, ArborResult<()>>;

/// Most operations one drain will run before giving up.
pub const DRAIN_CEILING: usize = 100_000;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the queue the current task is draining.
    static DRAIN_SCOPE: u64;
}

/// Clears the draining flag and wakes waiters even if an operation
/// panics mid-drain.
struct DrainGuard<'a>(&'a BackgroundQueue);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.draining.store(false, Ordering::Release);
        self.0.done.notify_waiters();
    }
}

pub struct BackgroundQueue {
    id: u64,
    queue: Mutex<VecDeque<PendingOp>>,
    ceiling: usize,
    draining: AtomicBool,
    done: Notify,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Default for BackgroundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundQueue {
    pub fn new() -> Self {
        Self::with_ceiling(DRAIN_CEILING)
    }

    /// Queue whose drains stop after `ceiling` operations.
    pub fn with_ceiling(ceiling: usize) -> Self {
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            queue: Mutex::new(VecDeque::new()),
            ceiling: ceiling.max(1),
            draining: AtomicBool::new(false),
            done: Notify::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn push<F>(&self, op: F)
    where
        F: Future<Output = ArborResult<()>> + Send + 'static,
    {
        self.queue.lock().push_back(Box::pin(op));
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Whether the current task is inside this queue's drain loop.
    pub fn in_drain(&self) -> bool {
        DRAIN_SCOPE.try_with(|id| *id == self.id).unwrap_or(false)
    }

    /// Operations that ran to completion, successfully or not.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Run queued operations in FIFO order until the queue is empty.
    ///
    /// Only one drain loop runs at a time. A caller arriving while one is
    /// in flight waits for it to finish, then drains whatever it left
    /// behind. Returns the number of operations this call ran.
    pub async fn drain(&self) -> usize {
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.draining.swap(true, Ordering::AcqRel) {
                let _guard = DrainGuard(self);
                return DRAIN_SCOPE.scope(self.id, self.run_ops()).await;
            }

            notified.await;
            if self.is_empty() {
                return 0;
            }
        }
    }

    async fn run_ops(&self) -> usize {
        let mut ran = 0;
        while ran < self.ceiling {
            let Some(op) = self.queue.lock().pop_front() else {
                break;
            };
            if let Err(e) = op.await {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!("Background index operation failed: {}", e);
            }
            self.completed.fetch_add(1, Ordering::Relaxed);
            ran += 1;
        }

        if ran >= self.ceiling && !self.is_empty() {
            tracing::warn!(
                "Background drain stopped after {} operations with {} still queued",
                ran,
                self.len()
            );
        }
        ran
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArborError;
    use futures::FutureExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drain_runs_in_order_and_survives_failures() {
        let queue = BackgroundQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let log = log.clone();
            queue.push(async move {
                log.lock().push(i);
                if i == 2 {
                    return Err(ArborError::Index("boom".into()));
                }
                Ok(())
            });
        }

        assert_eq!(queue.drain().await, 5);
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.failed(), 1);
        assert_eq!(queue.completed(), 5);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drain_waits_for_inflight() {
        let queue = Arc::new(BackgroundQueue::new());
        let gate = Arc::new(Notify::new());

        let release = gate.clone();
        queue.push(async move {
            release.notified().await;
            Ok(())
        });

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        while !queue.is_draining() {
            tokio::task::yield_now().await;
        }

        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        tokio::task::yield_now().await;
        gate.notify_one();

        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 0);
        assert!(!queue.is_draining());
    }

    fn requeue(queue: Arc<BackgroundQueue>, runs: Arc<AtomicU64>) -> PendingOp {
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            let again = requeue(queue.clone(), runs);
            queue.push(again);
            Ok(())
        }
        .boxed()
    }

    #[tokio::test]
    async fn test_drain_stops_at_ceiling() {
        let queue = Arc::new(BackgroundQueue::with_ceiling(10));
        let runs = Arc::new(AtomicU64::new(0));
        queue.push(requeue(queue.clone(), runs.clone()));

        assert_eq!(queue.drain().await, 10);
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn test_panicking_op_releases_drain() {
        let queue = Arc::new(BackgroundQueue::new());
        queue.push(async {
            if true {
                panic!("index op blew up");
            }
            Ok(())
        });

        let crashed = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        assert!(crashed.await.unwrap_err().is_panic());
        assert!(!queue.is_draining());

        let ran = Arc::new(AtomicU64::new(0));
        {
            let ran = ran.clone();
            queue.push(async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(queue.drain().await, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drain_scope_is_per_task() {
        let queue = Arc::new(BackgroundQueue::new());
        assert!(!queue.in_drain());

        let seen = Arc::new(AtomicBool::new(false));
        {
            let queue_ref = queue.clone();
            let seen = seen.clone();
            queue.push(async move {
                seen.store(queue_ref.in_drain(), Ordering::SeqCst);
                Ok(())
            });
        }
        queue.drain().await;
        assert!(seen.load(Ordering::SeqCst));
        assert!(!queue.in_drain());
    }
}
