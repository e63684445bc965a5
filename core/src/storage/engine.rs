//! Database facade.
//!
//! A [`Database`] owns the pager, allocator, coordinator, background queue,
//! structure cache and index registry of one data file. It is a cheap
//! clonable handle; every clone talks to the same instance.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::codec::{self, Value};
use crate::config::Config;
use crate::error::{ArborError, ArborResult};
use crate::index::{IndexManager, IndexRegistry};
use crate::storage::allocator::{Allocator, AllocatorStats};
use crate::storage::background::BackgroundQueue;
use crate::storage::cache::{CachedStructure, StructKey, StructureCache};
use crate::storage::chain::{read_chain_safe, write_chain_safe};
use crate::storage::layout::{HEAP_MAX, INLINE_MAX, MAGIC_DICT_DIR, TypeTag};
use crate::storage::pager::{Pager, PagerStats};
use crate::storage::pointer::{Location, SmartPointer};
use crate::storage::transaction::{Coordinator, LockState};

// Root provider

/// Materializes the root structure of a fresh data file.
#[async_trait]
pub trait RootProvider: Send + Sync {
    /// Store an empty root and return its pointer. Runs once, on first
    /// open, with write access held.
    async fn create(&self, db: &Database) -> ArborResult<SmartPointer>;
}

/// Writes an empty dictionary directory into its own block.
pub struct DefaultRoot;

#[async_trait]
impl RootProvider for DefaultRoot {
    async fn create(&self, db: &Database) -> ArborResult<SmartPointer> {
        let mut dir = Vec::with_capacity(8);
        dir.extend_from_slice(MAGIC_DICT_DIR);
        dir.extend_from_slice(&0u32.to_be_bytes());
        db.write_block_value(TypeTag::Dictionary, &dir)
    }
}

// Statistics

#[derive(Debug, Clone)]
pub struct DatabaseStats {
    pub pager: PagerStats,
    pub allocator: AllocatorStats,
    pub cached_structures: usize,
    pub struct_cache_limit: usize,
    pub pending_index_ops: usize,
    pub failed_index_ops: u64,
    pub index_managers: usize,
    pub mutations: u64,
    pub lock: LockState,
}

// Database

struct DatabaseInner {
    config: Config,
    pager: Arc<Pager>,
    allocator: Allocator,
    coordinator: Coordinator,
    background: BackgroundQueue,
    structures: StructureCache,
    indexes: IndexRegistry,
    root: RwLock<Option<SmartPointer>>,
    mutations: AtomicU64,
    /// Depth of `batch` calls inside the current write scope.
    batch_depth: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Open the data file described by `config`, creating an empty root
    /// dictionary on first use.
    pub async fn open(config: Config) -> ArborResult<Self> {
        Self::open_with_root(config, &DefaultRoot).await
    }

    /// Open with a caller-supplied root provider.
    pub async fn open_with_root(config: Config, provider: &dyn RootProvider) -> ArborResult<Self> {
        config.validate()?;

        let pager = Arc::new(Pager::open(&config.path, config.cache_blocks())?);
        let allocator = Allocator::new(pager.clone(), config.debug);
        allocator.init()?;

        let db = Self {
            inner: Arc::new(DatabaseInner {
                structures: StructureCache::new(config.struct_cache_limit()),
                pager,
                allocator,
                coordinator: Coordinator::new(),
                background: BackgroundQueue::new(),
                indexes: IndexRegistry::new(),
                root: RwLock::new(None),
                mutations: AtomicU64::new(0),
                batch_depth: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                config,
            }),
        };

        match db.inner.allocator.root() {
            Some(r) => {
                let root = SmartPointer {
                    type_tag: TypeTag::Dictionary,
                    location: Location::Block(r),
                };
                tracing::debug!("Recovered root {}", root);
                *db.inner.root.write() = Some(root);
            }
            None => {
                let root = db.execute(|| provider.create(&db)).await?;
                db.inner.allocator.set_root(&root)?;
                db.inner.allocator.save_state()?;
                db.inner.pager.sync()?;
                tracing::info!("Created root {}", root);
                *db.inner.root.write() = Some(root);
            }
        }

        tracing::info!(
            "Opened {} ({} blocks, cache {} blocks)",
            db.inner.config.path.display(),
            db.inner.pager.extent(),
            db.inner.config.cache_blocks()
        );
        Ok(db)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn path(&self) -> &Path {
        self.inner.pager.path()
    }

    /// Pointer to the root dictionary.
    pub fn root(&self) -> Option<SmartPointer> {
        *self.inner.root.read()
    }

    /// Replace the root pointer. Reaches the superblock at the next
    /// checkpoint.
    pub fn set_root(&self, root: SmartPointer) -> ArborResult<()> {
        self.inner.allocator.set_root(&root)?;
        *self.inner.root.write() = Some(root);
        Ok(())
    }

    /// Monotonic count of chain writes.
    pub fn mutation_count(&self) -> u64 {
        self.inner.mutations.load(Ordering::Acquire)
    }

    pub fn lock_state(&self) -> LockState {
        self.inner.coordinator.state()
    }

    pub fn allocator(&self) -> &Allocator {
        &self.inner.allocator
    }

    pub fn pager(&self) -> &Pager {
        &self.inner.pager
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> ArborResult<()> {
        if self.is_closed() {
            return Err(ArborError::Closed);
        }
        Ok(())
    }

    // Coordination

    /// Run `f` with shared access.
    pub async fn run_read<F, Fut, R>(&self, f: F) -> ArborResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ArborResult<R>>,
    {
        self.ensure_open()?;
        self.inner.coordinator.run_read(f).await
    }

    /// Run `f` with exclusive access and no batching of its own.
    pub async fn run_write<F, Fut, R>(&self, f: F) -> ArborResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ArborResult<R>>,
    {
        self.ensure_open()?;
        self.inner.coordinator.run_write(f).await
    }

    /// Single write transaction.
    ///
    /// Opens a pager batch unless one is open, flushes the allocator when
    /// `f` finishes, and closes the batch it opened. A top-level call that
    /// found no other writer waiting when it was admitted then schedules a
    /// background drain.
    pub async fn execute<F, Fut, R>(&self, f: F) -> ArborResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ArborResult<R>>,
    {
        self.ensure_open()?;
        let nested = self.inner.coordinator.in_write_scope();
        let mut writers_waiting = false;

        let out = self
            .inner
            .coordinator
            .run_write(|| async {
                writers_waiting = self.inner.coordinator.has_queued_writers();
                let pager = &self.inner.pager;
                let owns_batch = !pager.is_batching();
                if owns_batch {
                    pager.start_batch();
                }

                let result = f().await;
                let flushed = self.flush_allocator();
                let ended = if owns_batch { pager.end_batch() } else { Ok(()) };

                let out = result?;
                flushed?;
                ended?;
                Ok(out)
            })
            .await;

        if !nested && !writers_waiting {
            self.spawn_drain();
        }
        out
    }

    /// Grouped write transaction. Nests, also inside `execute`; only the
    /// outermost call drains pending index operations and flushes indexes,
    /// allocator and pager.
    /// Flushing runs even when `f` fails, and `f`'s error wins.
    pub async fn batch<F, Fut, R>(&self, f: F) -> ArborResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ArborResult<R>>,
    {
        self.ensure_open()?;

        self.inner
            .coordinator
            .run_write(|| async {
                let pager = &self.inner.pager;
                let inside_execute = pager.is_batching();
                let depth = self.inner.batch_depth.fetch_add(1, Ordering::AcqRel);
                let outermost = depth == 0 && !inside_execute;
                pager.start_batch();

                let result = f().await;
                self.inner.batch_depth.fetch_sub(1, Ordering::AcqRel);

                if !outermost {
                    let ended = pager.end_batch();
                    let out = result?;
                    ended?;
                    return Ok(out);
                }

                self.drain_pending().await;
                let indexed = self.inner.indexes.flush_all().await;
                let flushed = self.flush_allocator();
                let ended = pager.end_batch();

                let out = result?;
                indexed?;
                flushed?;
                ended?;
                Ok(out)
            })
            .await
    }

    /// Checkpoint: drain, flush everything, persist the superblock and
    /// sync the file.
    pub async fn wait_for_idle(&self) -> ArborResult<()> {
        self.ensure_open()?;

        self.inner
            .coordinator
            .run_write(|| async {
                self.drain_pending().await;
                self.inner.indexes.flush_all().await?;
                self.flush_allocator()?;
                self.inner.allocator.save_state()?;
                self.inner.pager.sync()?;
                tracing::debug!("Checkpoint complete");
                Ok(())
            })
            .await
    }

    /// Checkpoint and release the file. Further calls fail with `Closed`.
    pub async fn close(&self) -> ArborResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.wait_for_idle().await?;

        self.inner
            .coordinator
            .run_write(|| async {
                self.inner.closed.store(true, Ordering::Release);
                self.inner.structures.clear();
                self.inner.pager.close()
            })
            .await?;
        tracing::info!("Closed {}", self.path().display());
        Ok(())
    }

    fn flush_allocator(&self) -> ArborResult<()> {
        self.inner.allocator.flush_heap()?;
        self.inner.allocator.flush()
    }

    /// Drain the background queue unless this task is already draining it.
    async fn drain_pending(&self) {
        if self.inner.background.in_drain() {
            return;
        }
        let ran = self.inner.background.drain().await;
        if ran > 0 {
            tracing::debug!("Drained {} pending index operations", ran);
        }
    }

    /// Drain queued index work on a separate task under write access.
    fn spawn_drain(&self) {
        if self.inner.background.is_empty() || self.is_closed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let db = self.clone();
        runtime.spawn(async move {
            let result = db
                .run_write(|| async {
                    db.drain_pending().await;
                    db.inner.pager.start_batch();
                    let flushed = db.flush_allocator();
                    let ended = db.inner.pager.end_batch();
                    flushed?;
                    ended
                })
                .await;
            match result {
                Ok(()) | Err(ArborError::Closed) => {}
                Err(e) => tracing::warn!("Background drain failed: {}", e),
            }
        });
    }

    // Background index work and index managers

    /// Queue an index operation to run before the next batch flush or
    /// checkpoint.
    pub fn enqueue_index_op<F>(&self, op: F)
    where
        F: Future<Output = ArborResult<()>> + Send + 'static,
    {
        self.inner.background.push(op);
    }

    pub fn pending_index_ops(&self) -> usize {
        self.inner.background.len()
    }

    pub fn register_index(&self, manager: Arc<dyn IndexManager>) {
        self.inner.indexes.register(manager);
    }

    // Structure cache

    pub fn cache_structure<T: CachedStructure>(&self, block_id: u64, structure: Arc<T>) {
        self.inner.structures.cache_structure(block_id, structure);
    }

    pub fn get_cached_structure<T: CachedStructure>(
        &self,
        key: impl Into<StructKey>,
    ) -> Option<Arc<T>> {
        self.inner.structures.get_cached_structure(key)
    }

    pub fn structures(&self) -> &StructureCache {
        &self.inner.structures
    }

    // Values

    /// Store raw bytes, choosing inline, heap or block storage by size.
    pub async fn write_value(&self, type_tag: TypeTag, bytes: &[u8]) -> ArborResult<SmartPointer> {
        self.execute(|| async { self.store_bytes(type_tag, bytes) })
            .await
    }

    /// Bytes addressed by `ptr`.
    pub async fn read_value(&self, ptr: &SmartPointer) -> ArborResult<Vec<u8>> {
        self.run_read(|| async { self.load_bytes(ptr) }).await
    }

    /// Release the storage behind `ptr`.
    pub async fn free_value(&self, ptr: &SmartPointer) -> ArborResult<()> {
        self.execute(|| async {
            self.inner.allocator.free(ptr)?;
            if let Some(r) = ptr.block_ref() {
                self.inner.structures.invalidate_block(r.block_id);
            }
            Ok(())
        })
        .await
    }

    /// Encode and store a value.
    pub async fn store(&self, value: &Value) -> ArborResult<SmartPointer> {
        let bytes = codec::encode(value);
        self.write_value(value.type_tag(), &bytes).await
    }

    /// Load and decode the value behind `ptr`.
    pub async fn load(&self, ptr: &SmartPointer) -> ArborResult<Value> {
        let bytes = self.read_value(ptr).await?;
        codec::decode(&bytes)
    }

    /// Overwrite the bytes of an existing block value in place.
    pub async fn write_chain(&self, ptr: &SmartPointer, bytes: &[u8]) -> ArborResult<()> {
        self.execute(|| async {
            write_chain_safe(&self.inner.allocator, ptr, bytes, &self.inner.mutations)?;
            if let Some(r) = ptr.block_ref() {
                self.inner.structures.invalidate_block(r.block_id);
            }
            Ok(())
        })
        .await
    }

    /// Read a block value, `None` when `ptr` has no block location.
    pub async fn read_chain(&self, ptr: &SmartPointer) -> ArborResult<Option<Vec<u8>>> {
        self.run_read(|| async { read_chain_safe(&self.inner.allocator, ptr) })
            .await
    }

    fn store_bytes(&self, type_tag: TypeTag, bytes: &[u8]) -> ArborResult<SmartPointer> {
        if bytes.len() <= INLINE_MAX {
            SmartPointer::inline(type_tag, bytes)
        } else if bytes.len() <= HEAP_MAX {
            self.inner.allocator.store_heap(type_tag, bytes)
        } else {
            self.write_block_value(type_tag, bytes)
        }
    }

    /// Store `bytes` in dedicated blocks regardless of size.
    fn write_block_value(&self, type_tag: TypeTag, bytes: &[u8]) -> ArborResult<SmartPointer> {
        let ptr = self.inner.allocator.allocate_chain(type_tag, bytes.len())?;
        write_chain_safe(&self.inner.allocator, &ptr, bytes, &self.inner.mutations)?;
        Ok(ptr)
    }

    fn load_bytes(&self, ptr: &SmartPointer) -> ArborResult<Vec<u8>> {
        ptr.validate()?;
        match &ptr.location {
            Location::Inline { len, bytes } => Ok(bytes[..*len as usize].to_vec()),
            Location::Heap(_) => self.inner.allocator.read_heap(ptr),
            Location::Block(_) => read_chain_safe(&self.inner.allocator, ptr)?
                .ok_or_else(|| ArborError::InvalidPointer(format!("{} has no block", ptr))),
        }
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            pager: self.inner.pager.stats(),
            allocator: self.inner.allocator.stats(),
            cached_structures: self.inner.structures.len(),
            struct_cache_limit: self.inner.structures.limit(),
            pending_index_ops: self.inner.background.len(),
            failed_index_ops: self.inner.background.failed(),
            index_managers: self.inner.indexes.len(),
            mutations: self.mutation_count(),
            lock: self.inner.coordinator.state(),
        }
    }
}
