//! Block-granular file access.
//!
//! The pager owns the data file. Inside a batch window writes are held as
//! dirty buffers and reach the file when the outermost window closes;
//! outside a window they are written straight through. Clean blocks are
//! kept in a clock-sweep cache bounded by the configured budget.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::{ArborError, ArborResult};
use crate::storage::layout::BLOCK_SIZE;

// Clock-sweep cache for clean blocks

struct CacheSlot {
    block_id: u64,
    data: Vec<u8>,
    referenced: bool,
}

/// Clock-sweep replacement approximating LRU over a circular slot list.
struct ClockCache {
    slots: Vec<CacheSlot>,
    index: HashMap<u64, usize>,
    hand: usize,
    capacity: usize,
    evictions: u64,
}

impl ClockCache {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(1024)),
            index: HashMap::new(),
            hand: 0,
            capacity: capacity.max(1),
            evictions: 0,
        }
    }

    fn get(&mut self, block_id: u64) -> Option<&[u8]> {
        let idx = *self.index.get(&block_id)?;
        let slot = &mut self.slots[idx];
        slot.referenced = true;
        Some(&slot.data)
    }

    fn insert(&mut self, block_id: u64, data: Vec<u8>) {
        if let Some(&idx) = self.index.get(&block_id) {
            let slot = &mut self.slots[idx];
            slot.data = data;
            slot.referenced = true;
            return;
        }

        if self.slots.len() < self.capacity {
            self.index.insert(block_id, self.slots.len());
            self.slots.push(CacheSlot {
                block_id,
                data,
                referenced: true,
            });
            return;
        }

        // Sweep until a slot without its reference bit turns up
        loop {
            let slot = &mut self.slots[self.hand];
            if slot.referenced {
                slot.referenced = false;
                self.hand = (self.hand + 1) % self.slots.len();
                continue;
            }
            self.index.remove(&slot.block_id);
            self.index.insert(block_id, self.hand);
            *slot = CacheSlot {
                block_id,
                data,
                referenced: true,
            };
            self.hand = (self.hand + 1) % self.slots.len();
            self.evictions += 1;
            return;
        }
    }

    fn remove(&mut self, block_id: u64) {
        let Some(idx) = self.index.remove(&block_id) else {
            return;
        };
        self.slots.swap_remove(idx);
        if idx < self.slots.len() {
            let moved = self.slots[idx].block_id;
            self.index.insert(moved, idx);
        }
        if self.hand >= self.slots.len() {
            self.hand = 0;
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

// Pager statistics

#[derive(Debug, Clone, Default)]
pub struct PagerStats {
    /// Blocks in the file, including buffered ones not yet written.
    pub extent: u64,
    pub dirty: usize,
    pub cached: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Blocks written to the file.
    pub flushes: u64,
}

// Pager

pub struct Pager {
    path: PathBuf,
    file: Mutex<Option<File>>,
    /// Number of addressable blocks.
    extent: AtomicU64,
    dirty: Mutex<BTreeMap<u64, Vec<u8>>>,
    cache: Mutex<ClockCache>,
    batch_depth: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    flushes: AtomicU64,
}

impl Pager {
    /// Open or create the data file.
    pub fn open<P: AsRef<Path>>(path: P, cache_blocks: usize) -> ArborResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len % BLOCK_SIZE as u64 != 0 {
            tracing::warn!(
                "Data file {} has {} trailing bytes past the last whole block",
                path.display(),
                len % BLOCK_SIZE as u64
            );
        }

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            extent: AtomicU64::new(len / BLOCK_SIZE as u64),
            dirty: Mutex::new(BTreeMap::new()),
            cache: Mutex::new(ClockCache::new(cache_blocks)),
            batch_depth: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of addressable blocks.
    pub fn extent(&self) -> u64 {
        self.extent.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    /// Length of the backing file in bytes, ignoring buffered writes.
    pub fn file_len(&self) -> ArborResult<u64> {
        let file = self.file.lock();
        let file = file.as_ref().ok_or(ArborError::Closed)?;
        Ok(file.metadata()?.len())
    }

    // Batch windows

    /// Open a write-coalescing window. Windows nest.
    pub fn start_batch(&self) {
        self.batch_depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Close a window. Only the outermost close flushes to the file.
    pub fn end_batch(&self) -> ArborResult<()> {
        let prev = self
            .batch_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1));
        match prev {
            Ok(1) => self.flush(),
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!("end_batch called without an open batch");
                Ok(())
            }
        }
    }

    pub fn is_batching(&self) -> bool {
        self.batch_depth.load(Ordering::Acquire) > 0
    }

    // Block I/O

    /// Read one block.
    pub fn read_block(&self, block_id: u64) -> ArborResult<Vec<u8>> {
        let extent = self.extent();
        if block_id >= extent {
            return Err(ArborError::BlockOutOfRange {
                block: block_id,
                extent,
            });
        }

        if let Some(buf) = self.dirty.lock().get(&block_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(buf.clone());
        }

        if let Some(buf) = self.cache.lock().get(block_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(buf.to_vec());
        }

        let buf = self.read_file(block_id)?;
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.cache.lock().insert(block_id, buf.clone());
        Ok(buf)
    }

    /// Read up to `count` consecutive blocks starting at `block_id`.
    ///
    /// The run is cut short at the end of the file; the caller decides
    /// whether a short run is acceptable.
    pub fn read_sequential(&self, block_id: u64, count: usize) -> ArborResult<Vec<u8>> {
        let extent = self.extent();
        if block_id >= extent {
            return Err(ArborError::BlockOutOfRange {
                block: block_id,
                extent,
            });
        }

        let available = (extent - block_id).min(count as u64);
        let mut out = Vec::with_capacity(available as usize * BLOCK_SIZE);
        for id in block_id..block_id + available {
            out.extend_from_slice(&self.read_block(id)?);
        }
        Ok(out)
    }

    /// Write one full block.
    pub fn write_block(&self, block_id: u64, data: &[u8]) -> ArborResult<()> {
        if data.len() != BLOCK_SIZE {
            return Err(ArborError::Storage(format!(
                "block data must be {} bytes, got {}",
                BLOCK_SIZE,
                data.len()
            )));
        }

        if self.is_batching() {
            self.cache.lock().remove(block_id);
            self.dirty.lock().insert(block_id, data.to_vec());
        } else {
            self.write_file(block_id, data)?;
            self.cache.lock().insert(block_id, data.to_vec());
        }

        self.extent.fetch_max(block_id + 1, Ordering::AcqRel);
        Ok(())
    }

    /// In-place access to a buffered block, if one is buffered.
    pub fn dirty_buffer(&self, block_id: u64) -> Option<MappedMutexGuard<'_, [u8]>> {
        MutexGuard::try_map(self.dirty.lock(), |dirty| {
            dirty.get_mut(&block_id).map(|buf| buf.as_mut_slice())
        })
        .ok()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// Write every buffered block to the file.
    ///
    /// A block leaves the dirty set only once its write succeeded, so a
    /// failed flush keeps the unwritten blocks readable and retryable.
    pub fn flush(&self) -> ArborResult<()> {
        let mut dirty = self.dirty.lock();
        if dirty.is_empty() {
            return Ok(());
        }

        let count = dirty.len();
        while let Some(entry) = dirty.first_entry() {
            self.write_file(*entry.key(), entry.get())?;
            let (block_id, data) = entry.remove_entry();
            self.cache.lock().insert(block_id, data);
        }
        tracing::trace!("Flushed {} dirty blocks", count);
        Ok(())
    }

    /// Flush and force everything to stable storage.
    pub fn sync(&self) -> ArborResult<()> {
        self.flush()?;
        let file = self.file.lock();
        let file = file.as_ref().ok_or(ArborError::Closed)?;
        file.sync_all()?;
        Ok(())
    }

    /// Sync and release the file handle.
    pub fn close(&self) -> ArborResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.sync()?;
        *self.file.lock() = None;
        Ok(())
    }

    pub fn stats(&self) -> PagerStats {
        let dirty = self.dirty_count();
        let cache = self.cache.lock();
        PagerStats {
            extent: self.extent(),
            dirty,
            cached: cache.len(),
            capacity: cache.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: cache.evictions,
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }

    // File access

    fn read_file(&self, block_id: u64) -> ArborResult<Vec<u8>> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(ArborError::Closed)?;
        let offset = block_id * BLOCK_SIZE as u64;

        let mut buf = vec![0u8; BLOCK_SIZE];
        // Blocks inside the extent that were never written read as zeroes
        if offset + BLOCK_SIZE as u64 > file.metadata()?.len() {
            return Ok(buf);
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_file(&self, block_id: u64, data: &[u8]) -> ArborResult<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(ArborError::Closed)?;

        file.seek(SeekFrom::Start(block_id * BLOCK_SIZE as u64))?;
        file.write_all(data)?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn block_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn test_write_through_and_read() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.db"), 8).unwrap();

        pager.write_block(0, &block_of(1)).unwrap();
        pager.write_block(2, &block_of(3)).unwrap();
        assert_eq!(pager.extent(), 3);

        assert_eq!(pager.read_block(2).unwrap(), block_of(3));
        // gap block reads as zeroes
        assert_eq!(pager.read_block(1).unwrap(), block_of(0));
        assert!(matches!(
            pager.read_block(3),
            Err(ArborError::BlockOutOfRange { block: 3, extent: 3 })
        ));
    }

    #[test]
    fn test_batch_nesting_defers_file_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.db");
        let pager = Pager::open(&path, 8).unwrap();

        pager.start_batch();
        pager.start_batch();
        pager.write_block(0, &block_of(7)).unwrap();
        assert_eq!(pager.dirty_count(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        pager.end_batch().unwrap();
        assert!(pager.is_batching());
        assert_eq!(pager.dirty_count(), 1);

        pager.end_batch().unwrap();
        assert!(!pager.is_batching());
        assert_eq!(pager.dirty_count(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), BLOCK_SIZE as u64);
    }

    #[test]
    fn test_failed_flush_keeps_dirty_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.db");
        let pager = Pager::open(&path, 8).unwrap();

        pager.start_batch();
        pager.write_block(0, &block_of(4)).unwrap();
        pager.write_block(1, &block_of(9)).unwrap();

        let file = pager.file.lock().take();
        assert!(matches!(pager.end_batch(), Err(ArborError::Closed)));
        *pager.file.lock() = file;

        assert_eq!(pager.dirty_count(), 2);
        assert_eq!(pager.read_block(1).unwrap(), block_of(9));

        pager.flush().unwrap();
        assert_eq!(pager.dirty_count(), 0);
        pager.close().unwrap();

        let pager = Pager::open(&path, 8).unwrap();
        assert_eq!(pager.read_block(0).unwrap(), block_of(4));
        assert_eq!(pager.read_block(1).unwrap(), block_of(9));
    }

    #[test]
    fn test_dirty_buffer_in_place() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.db"), 8).unwrap();

        assert!(pager.dirty_buffer(0).is_none());

        pager.start_batch();
        pager.write_block(0, &block_of(0)).unwrap();
        {
            let mut buf = pager.dirty_buffer(0).unwrap();
            buf[100] = 42;
        }
        assert_eq!(pager.read_block(0).unwrap()[100], 42);
        pager.end_batch().unwrap();
        assert_eq!(pager.read_block(0).unwrap()[100], 42);
    }

    #[test]
    fn test_sequential_read_stops_at_extent() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.db"), 8).unwrap();
        for id in 0..3 {
            pager.write_block(id, &block_of(id as u8)).unwrap();
        }

        let run = pager.read_sequential(1, 5).unwrap();
        assert_eq!(run.len(), 2 * BLOCK_SIZE);
        assert_eq!(run[0], 1);
        assert_eq!(run[BLOCK_SIZE], 2);
    }

    #[test]
    fn test_clock_cache_bounded() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.db"), 2).unwrap();
        for id in 0..5 {
            pager.write_block(id, &block_of(id as u8)).unwrap();
        }
        for id in 0..5 {
            assert_eq!(pager.read_block(id).unwrap()[0], id as u8);
        }

        let stats = pager.stats();
        assert_eq!(stats.cached, 2);
        assert!(stats.evictions >= 3);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.db");
        {
            let pager = Pager::open(&path, 8).unwrap();
            pager.write_block(0, &block_of(9)).unwrap();
            pager.close().unwrap();
            assert!(matches!(pager.read_block(0), Ok(_) | Err(ArborError::Closed)));
        }

        let pager = Pager::open(&path, 8).unwrap();
        assert_eq!(pager.extent(), 1);
        assert_eq!(pager.read_block(0).unwrap(), block_of(9));
    }
}
