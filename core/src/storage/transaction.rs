//! Reader/writer coordination.
//!
//! One coordinator per database. Reads share access, writes are exclusive
//! and admitted in FIFO order (tokio's `RwLock` is fair). A task that
//! already holds write access runs nested reads and writes directly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio::sync::RwLock;

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the coordinator whose write access the current task holds.
    static WRITE_SCOPE: u64;
}

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Reading(usize),
    Writing,
}

/// Decrements a counter when dropped, so cancelled waiters are not
/// left counted.
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Coordinator {
    id: u64,
    lock: RwLock<()>,
    queued_writers: AtomicUsize,
    readers: AtomicUsize,
    writing: AtomicBool,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            lock: RwLock::new(()),
            queued_writers: AtomicUsize::new(0),
            readers: AtomicUsize::new(0),
            writing: AtomicBool::new(false),
        }
    }

    /// Whether the current task holds this coordinator's write access.
    pub fn in_write_scope(&self) -> bool {
        WRITE_SCOPE.try_with(|id| *id == self.id).unwrap_or(false)
    }

    /// Writers waiting for access.
    pub fn queued_writers(&self) -> usize {
        self.queued_writers.load(Ordering::Acquire)
    }

    pub fn has_queued_writers(&self) -> bool {
        self.queued_writers() > 0
    }

    pub fn state(&self) -> LockState {
        if self.writing.load(Ordering::Acquire) {
            return LockState::Writing;
        }
        match self.readers.load(Ordering::Acquire) {
            0 => LockState::Idle,
            n => LockState::Reading(n),
        }
    }

    /// Run `f` with shared access.
    pub async fn run_read<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if self.in_write_scope() {
            return f().await;
        }

        let _access = self.lock.read().await;
        let _reading = CountGuard::enter(&self.readers);
        f().await
    }

    /// Run `f` with exclusive access.
    pub async fn run_write<F, Fut, R>(&self, f: F) -> R
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if self.in_write_scope() {
            return f().await;
        }

        let access = {
            let _queued = CountGuard::enter(&self.queued_writers);
            self.lock.write().await
        };

        self.writing.store(true, Ordering::Release);
        let _writing = FlagGuard(&self.writing);
        let out = WRITE_SCOPE.scope(self.id, f()).await;
        drop(access);
        out
    }
}
