//! Block and page-heap allocation.
//!
//! The allocator owns the superblock, the page-heap bitmaps, the set of
//! reusable free blocks and a small read cache shadowing the pager. Small
//! values are sub-allocated from `PAGE` blocks in 32-byte units; values too
//! large for the heap get a run of consecutive `OVERFLOW` blocks.
//!
//! All state lives behind one mutex. Callers that need several block
//! operations under a single acquisition use [`Allocator::execute_locked`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{ArborError, ArborResult};
use crate::storage::chain::chain_span;
use crate::storage::heap::{PageBitmap, offset_unit, unit_offset, units_for};
use crate::storage::layout::{
    BLOCK_SIZE, BlockType, HEADER_SIZE, HEAP_MAGIC_OFFSET, HEAP_MAX, HEAP_PAGE_MAGIC,
    OVERFLOW_HEAD_OFFSET, OVERFLOW_SEGMENT_OFFSET, ROOT_CHAIN_OFFSET, ROOT_ID_OFFSET,
    ROOT_LEN_OFFSET, ROOT_OFFSET_OFFSET, SUPERBLOCK_CURSOR_OFFSET, SUPERBLOCK_ID,
    SUPERBLOCK_MAGIC, SUPERBLOCK_MAGIC_OFFSET, SUPERBLOCK_VERSION, SUPERBLOCK_VERSION_OFFSET,
    TypeTag, read_u16, read_u32, read_u48, read_u64, write_u16, write_u32, write_u48, write_u64,
};
use crate::storage::pager::Pager;
use crate::storage::pointer::{BlockRef, Location, SmartPointer};

/// Blocks held by the allocator's own read cache.
const BLOCK_CACHE_CAPACITY: usize = 256;

// Allocator block cache

/// Insertion-ordered read cache. Entries are copies; anything that writes
/// a block behind the allocator's back must invalidate first.
struct BlockCache {
    entries: HashMap<u64, Vec<u8>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, block_id: u64) -> Option<&Vec<u8>> {
        self.entries.get(&block_id)
    }

    fn insert(&mut self, block_id: u64, data: Vec<u8>) {
        if self.entries.insert(block_id, data).is_none() {
            self.order.push_back(block_id);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
    }

    fn invalidate(&mut self, block_id: u64) {
        if self.entries.remove(&block_id).is_some() {
            self.order.retain(|&id| id != block_id);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// Allocator state

/// Heap page currently receiving small writes.
struct ActivePage {
    id: u64,
    buffer: Vec<u8>,
    dirty: bool,
}

struct AllocatorState {
    superblock: Vec<u8>,
    super_dirty: bool,
    heap_pages: BTreeMap<u64, PageBitmap>,
    dirty_bitmaps: BTreeSet<u64>,
    active: Option<ActivePage>,
    cache: BlockCache,
    free_blocks: BTreeSet<u64>,
    /// First never-allocated block id.
    next_block: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AllocatorStats {
    pub extent: u64,
    pub next_block: u64,
    pub free_blocks: usize,
    pub heap_pages: usize,
    pub free_heap_units: usize,
    pub dirty_bitmaps: usize,
    pub cached_blocks: usize,
}

pub struct Allocator {
    pager: Arc<Pager>,
    state: Mutex<AllocatorState>,
    debug: bool,
}

impl Allocator {
    pub fn new(pager: Arc<Pager>, debug: bool) -> Self {
        Self {
            pager,
            state: Mutex::new(AllocatorState {
                superblock: vec![0u8; BLOCK_SIZE],
                super_dirty: false,
                heap_pages: BTreeMap::new(),
                dirty_bitmaps: BTreeSet::new(),
                active: None,
                cache: BlockCache::new(BLOCK_CACHE_CAPACITY),
                free_blocks: BTreeSet::new(),
                next_block: 1,
            }),
            debug,
        }
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Read or format the superblock, then rebuild free-space state from
    /// block headers.
    pub fn init(&self) -> ArborResult<()> {
        let mut state = self.state.lock();
        let extent = self.pager.extent();

        if extent == 0 {
            if self.pager.file_len()? > 0 {
                return Err(ArborError::CorruptSuperblock(
                    "file is shorter than one block".into(),
                ));
            }
            let mut superblock = Self::format_block(BlockType::Meta);
            superblock[SUPERBLOCK_MAGIC_OFFSET..SUPERBLOCK_MAGIC_OFFSET + SUPERBLOCK_MAGIC.len()]
                .copy_from_slice(SUPERBLOCK_MAGIC);
            write_u16(&mut superblock, SUPERBLOCK_VERSION_OFFSET, SUPERBLOCK_VERSION);
            write_u64(&mut superblock, SUPERBLOCK_CURSOR_OFFSET, 1);
            self.pager.write_block(SUPERBLOCK_ID, &superblock)?;

            state.superblock = superblock;
            state.super_dirty = false;
            state.next_block = 1;
            tracing::info!("Formatted new data file {}", self.pager.path().display());
            return Ok(());
        }

        let superblock = self.pager.read_block(SUPERBLOCK_ID)?;
        Self::check_superblock(&superblock)?;
        let cursor = read_u64(&superblock, SUPERBLOCK_CURSOR_OFFSET);
        state.superblock = superblock;
        state.super_dirty = false;
        state.next_block = cursor.max(extent).max(1);

        for block_id in 1..extent {
            let block = self.pager.read_block(block_id)?;
            match BlockType::of(&block) {
                Ok(BlockType::Free) => {
                    state.free_blocks.insert(block_id);
                }
                Ok(BlockType::Page) => {
                    if read_u16(&block, HEAP_MAGIC_OFFSET) == HEAP_PAGE_MAGIC {
                        state
                            .heap_pages
                            .insert(block_id, PageBitmap::from_block(&block));
                    } else if self.debug {
                        tracing::debug!("Block {} is a PAGE without heap magic", block_id);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Skipping block {} during allocator scan: {}", block_id, e);
                }
            }
        }

        tracing::debug!(
            "Allocator ready: {} blocks, {} free, {} heap pages",
            extent,
            state.free_blocks.len(),
            state.heap_pages.len()
        );
        Ok(())
    }

    fn check_superblock(block: &[u8]) -> ArborResult<()> {
        match BlockType::of(block) {
            Ok(BlockType::Meta) => {}
            Ok(other) => {
                return Err(ArborError::CorruptSuperblock(format!(
                    "block 0 has type {:?}",
                    other
                )));
            }
            Err(e) => return Err(ArborError::CorruptSuperblock(e.to_string())),
        }
        let magic = &block[SUPERBLOCK_MAGIC_OFFSET..SUPERBLOCK_MAGIC_OFFSET + SUPERBLOCK_MAGIC.len()];
        if magic != SUPERBLOCK_MAGIC {
            return Err(ArborError::CorruptSuperblock("bad magic".into()));
        }
        let version = read_u16(block, SUPERBLOCK_VERSION_OFFSET);
        if version != SUPERBLOCK_VERSION {
            return Err(ArborError::CorruptSuperblock(format!(
                "unsupported format version {}",
                version
            )));
        }
        Ok(())
    }

    /// Zeroed block stamped with `block_type`. Heap pages also get a clear
    /// bitmap and the heap magic.
    pub fn format_block(block_type: BlockType) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block_type.stamp(&mut block);
        if block_type == BlockType::Page {
            PageBitmap::new().write_to(&mut block);
            write_u16(&mut block, HEAP_MAGIC_OFFSET, HEAP_PAGE_MAGIC);
        }
        block
    }

    /// Run `f` with the allocator lock held for its whole duration.
    pub fn execute_locked<R, F>(&self, f: F) -> ArborResult<R>
    where
        F: FnOnce(&mut LockedAllocator<'_>) -> ArborResult<R>,
    {
        let mut locked = LockedAllocator {
            allocator: self,
            state: self.state.lock(),
        };
        f(&mut locked)
    }

    pub fn read_block_locked(&self, block_id: u64) -> ArborResult<Vec<u8>> {
        self.execute_locked(|locked| locked.read_block(block_id))
    }

    /// Up to `count` consecutive blocks starting at `block_id`, concatenated.
    /// The result is shorter when the run reaches the end of the file.
    pub fn read_sequential_locked(&self, block_id: u64, count: usize) -> ArborResult<Vec<u8>> {
        self.execute_locked(|locked| {
            let extent = locked.allocator.pager.extent();
            if block_id >= extent {
                return Err(ArborError::BlockOutOfRange {
                    block: block_id,
                    extent,
                });
            }
            let available = (extent - block_id).min(count as u64);
            let mut out = Vec::with_capacity(available as usize * BLOCK_SIZE);
            for id in block_id..block_id + available {
                out.extend_from_slice(&locked.read_block(id)?);
            }
            Ok(out)
        })
    }

    // Superblock

    /// Mutate the in-memory superblock. Durable at the next `save_state`.
    pub fn update_super_block<F>(&self, mutator: F)
    where
        F: FnOnce(&mut [u8]),
    {
        let mut state = self.state.lock();
        mutator(&mut state.superblock);
        state.super_dirty = true;
    }

    pub fn super_block(&self) -> Vec<u8> {
        self.state.lock().superblock.clone()
    }

    pub fn is_super_dirty(&self) -> bool {
        self.state.lock().super_dirty
    }

    /// Root record from the superblock, `None` when no root exists yet.
    pub fn root(&self) -> Option<BlockRef> {
        let state = self.state.lock();
        let sb = &state.superblock;
        let block_id = read_u48(sb, ROOT_ID_OFFSET);
        if block_id == 0 {
            return None;
        }
        Some(BlockRef {
            block_id,
            length: read_u32(sb, ROOT_LEN_OFFSET),
            offset: read_u32(sb, ROOT_OFFSET_OFFSET),
            chained: sb[ROOT_CHAIN_OFFSET] == 1,
        })
    }

    /// Record `root` in the superblock.
    pub fn set_root(&self, root: &SmartPointer) -> ArborResult<()> {
        let r = match &root.location {
            Location::Block(r) => *r,
            _ => {
                return Err(ArborError::InvalidPointer(format!(
                    "root must own its blocks, got {}",
                    root
                )));
            }
        };
        self.update_super_block(|sb| {
            write_u48(sb, ROOT_ID_OFFSET, r.block_id);
            write_u32(sb, ROOT_LEN_OFFSET, r.length);
            write_u32(sb, ROOT_OFFSET_OFFSET, r.offset);
            sb[ROOT_CHAIN_OFFSET] = r.chained as u8;
        });
        Ok(())
    }

    /// Write the superblock, including the allocation cursor.
    pub fn save_state(&self) -> ArborResult<()> {
        let mut state = self.state.lock();
        let cursor = state.next_block;
        write_u64(&mut state.superblock, SUPERBLOCK_CURSOR_OFFSET, cursor);
        self.pager.write_block(SUPERBLOCK_ID, &state.superblock)?;
        state.cache.invalidate(SUPERBLOCK_ID);
        state.super_dirty = false;
        Ok(())
    }

    // Allocation

    /// Reserve heap units for `bytes` and copy them in.
    pub fn store_heap(&self, type_tag: TypeTag, bytes: &[u8]) -> ArborResult<SmartPointer> {
        if bytes.len() > HEAP_MAX {
            return Err(ArborError::Storage(format!(
                "{} bytes exceed the heap limit of {}",
                bytes.len(),
                HEAP_MAX
            )));
        }
        self.execute_locked(|locked| {
            let (block_id, unit) = locked.allocate_units(units_for(bytes.len()))?;
            let offset = unit_offset(unit);
            let page = locked.activate(block_id)?;
            let at = offset as usize;
            page.buffer[at..at + bytes.len()].copy_from_slice(bytes);
            page.dirty = true;
            Ok(SmartPointer::heap(
                type_tag,
                block_id,
                bytes.len() as u32,
                offset,
            ))
        })
    }

    pub fn read_heap(&self, ptr: &SmartPointer) -> ArborResult<Vec<u8>> {
        let Location::Heap(r) = ptr.location else {
            return Err(ArborError::InvalidPointer(format!("{} is not a heap pointer", ptr)));
        };
        let start = r.offset as usize;
        let end = start + r.length as usize;
        if start < HEADER_SIZE || end > BLOCK_SIZE {
            return Err(ArborError::InvalidPointer(format!(
                "{} runs outside its page",
                ptr
            )));
        }
        let block = self.read_block_locked(r.block_id)?;
        Ok(block[start..end].to_vec())
    }

    /// Reserve `OVERFLOW` blocks for a value of `length` bytes. Every block
    /// is formatted with the chain head id and its segment index; the
    /// payload itself is written through chain I/O.
    pub fn allocate_chain(&self, type_tag: TypeTag, length: usize) -> ArborResult<SmartPointer> {
        let count = chain_span(length, HEADER_SIZE);
        self.execute_locked(|locked| {
            let head = locked.take_blocks(count);
            for segment in 0..count {
                let mut block = Self::format_block(BlockType::Overflow);
                write_u48(&mut block, OVERFLOW_HEAD_OFFSET, head);
                write_u32(&mut block, OVERFLOW_SEGMENT_OFFSET, segment as u32);
                locked.write_block(head + segment as u64, &block)?;
            }
            Ok(SmartPointer::block(
                type_tag,
                head,
                length as u32,
                count > 1,
                HEADER_SIZE as u32,
            ))
        })
    }

    /// Release the storage behind `ptr`. Inline pointers own nothing.
    pub fn free(&self, ptr: &SmartPointer) -> ArborResult<()> {
        match ptr.location {
            Location::Inline { .. } => Ok(()),
            Location::Heap(r) => self.execute_locked(|locked| {
                let unit = offset_unit(r.offset)?;
                let bitmap = locked.state.heap_pages.get_mut(&r.block_id).ok_or_else(|| {
                    ArborError::InvalidPointer(format!("block {} is not a heap page", r.block_id))
                })?;
                bitmap.clear_range(unit, units_for(r.length as usize));
                locked.state.dirty_bitmaps.insert(r.block_id);
                Ok(())
            }),
            Location::Block(r) => self.execute_locked(|locked| {
                let count = chain_span(r.length as usize, r.offset as usize) as u64;
                let free = Self::format_block(BlockType::Free);
                for block_id in r.block_id..r.block_id + count {
                    locked.write_block(block_id, &free)?;
                    locked.state.free_blocks.insert(block_id);
                }
                Ok(())
            }),
        }
    }

    // Flushing

    /// Write the active heap page and every dirty bitmap to the pager.
    pub fn flush_heap(&self) -> ArborResult<()> {
        self.execute_locked(|locked| locked.flush_heap())
    }

    /// Push all buffered allocator state to the pager and release the
    /// active page. The superblock is left to `save_state`.
    pub fn flush(&self) -> ArborResult<()> {
        self.execute_locked(|locked| {
            locked.flush_heap()?;
            if let Some(page) = locked.state.active.take() {
                locked.state.cache.insert(page.id, page.buffer);
            }
            Ok(())
        })
    }

    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            extent: self.pager.extent(),
            next_block: state.next_block,
            free_blocks: state.free_blocks.len(),
            heap_pages: state.heap_pages.len(),
            free_heap_units: state.heap_pages.values().map(|b| b.free_units()).sum(),
            dirty_bitmaps: state.dirty_bitmaps.len(),
            cached_blocks: state.cache.len(),
        }
    }

    /// Bitmap of a heap page as currently tracked.
    pub fn heap_bitmap(&self, block_id: u64) -> Option<PageBitmap> {
        self.state.lock().heap_pages.get(&block_id).copied()
    }
}

// Locked access

/// Allocator view held under its lock.
pub struct LockedAllocator<'a> {
    allocator: &'a Allocator,
    state: MutexGuard<'a, AllocatorState>,
}

impl LockedAllocator<'_> {
    pub fn read_block(&mut self, block_id: u64) -> ArborResult<Vec<u8>> {
        if let Some(page) = &self.state.active
            && page.id == block_id
        {
            return Ok(page.buffer.clone());
        }
        if let Some(buf) = self.state.cache.get(block_id) {
            return Ok(buf.clone());
        }
        let buf = self.allocator.pager.read_block(block_id)?;
        self.state.cache.insert(block_id, buf.clone());
        Ok(buf)
    }

    pub fn write_block(&mut self, block_id: u64, data: &[u8]) -> ArborResult<()> {
        if let Some(page) = self.state.active.as_mut()
            && page.id == block_id
        {
            page.buffer.copy_from_slice(data);
            page.dirty = true;
            return Ok(());
        }
        self.allocator.pager.write_block(block_id, data)?;
        self.state.cache.insert(block_id, data.to_vec());
        Ok(())
    }

    pub fn invalidate_cache(&mut self, block_id: u64) {
        self.state.cache.invalidate(block_id);
    }

    /// Copy `data` into block `block_id` at byte `at`, mutating a buffered
    /// copy in place when one exists. A block that was never written is
    /// formatted as a sealed heap page first.
    pub fn patch_block(&mut self, block_id: u64, at: usize, data: &[u8]) -> ArborResult<()> {
        if at + data.len() > BLOCK_SIZE {
            return Err(ArborError::Storage(format!(
                "patch of {} bytes at {} overruns block {}",
                data.len(),
                at,
                block_id
            )));
        }

        if let Some(page) = self.state.active.as_mut()
            && page.id == block_id
        {
            page.buffer[at..at + data.len()].copy_from_slice(data);
            page.dirty = true;
            return Ok(());
        }

        if let Some(mut buf) = self.allocator.pager.dirty_buffer(block_id) {
            buf[at..at + data.len()].copy_from_slice(data);
            return Ok(());
        }

        let existing = if block_id < self.allocator.pager.extent() {
            Some(self.allocator.pager.read_block(block_id)?)
        } else {
            None
        };

        let mut block = match existing {
            Some(block) if block.iter().any(|&b| b != 0) => block,
            _ => {
                if self.allocator.debug {
                    tracing::warn!("Block {} missing during chain write, formatting", block_id);
                }
                let mut block = Allocator::format_block(BlockType::Page);
                PageBitmap::sealed().write_to(&mut block);
                if block_id >= self.state.next_block {
                    self.state.next_block = block_id + 1;
                }
                self.state.free_blocks.remove(&block_id);
                block
            }
        };

        block[at..at + data.len()].copy_from_slice(data);
        self.allocator.pager.write_block(block_id, &block)
    }

    /// Claim `count` consecutive blocks, reusing the first free run that
    /// fits before growing the file.
    fn take_blocks(&mut self, count: usize) -> u64 {
        let count = count.max(1) as u64;

        let mut run_start = 0;
        let mut run_len = 0;
        let mut found = None;
        for &id in &self.state.free_blocks {
            if run_len > 0 && id == run_start + run_len {
                run_len += 1;
            } else {
                run_start = id;
                run_len = 1;
            }
            if run_len == count {
                found = Some(run_start);
                break;
            }
        }

        if let Some(start) = found {
            for id in start..start + count {
                self.state.free_blocks.remove(&id);
            }
            return start;
        }

        let start = self.state.next_block;
        let next = start + count;
        self.state.next_block = next;
        write_u64(&mut self.state.superblock, SUPERBLOCK_CURSOR_OFFSET, next);
        self.state.super_dirty = true;
        start
    }

    /// First-fit over existing heap pages, else a fresh page.
    fn allocate_units(&mut self, units: usize) -> ArborResult<(u64, usize)> {
        let found = self
            .state
            .heap_pages
            .iter()
            .find_map(|(&id, bitmap)| bitmap.find_run(units).map(|unit| (id, unit)));

        let (block_id, unit) = match found {
            Some(hit) => hit,
            None => {
                let block_id = self.take_blocks(1);
                let page = Allocator::format_block(BlockType::Page);
                self.write_block(block_id, &page)?;
                self.state.heap_pages.insert(block_id, PageBitmap::new());
                tracing::trace!("New heap page {}", block_id);
                (block_id, 0)
            }
        };

        if let Some(bitmap) = self.state.heap_pages.get_mut(&block_id) {
            bitmap.set_range(unit, units);
        }
        self.state.dirty_bitmaps.insert(block_id);
        Ok((block_id, unit))
    }

    /// Make `block_id` the active heap page, retiring the previous one.
    fn activate(&mut self, block_id: u64) -> ArborResult<&mut ActivePage> {
        let already = matches!(&self.state.active, Some(page) if page.id == block_id);
        if !already {
            self.retire_active()?;
            let buffer = self.read_block(block_id)?;
            self.state.cache.invalidate(block_id);
            self.state.active = Some(ActivePage {
                id: block_id,
                buffer,
                dirty: false,
            });
        }
        self.state
            .active
            .as_mut()
            .ok_or_else(|| ArborError::Storage("no active heap page".into()))
    }

    fn retire_active(&mut self) -> ArborResult<()> {
        let Some(mut page) = self.state.active.take() else {
            return Ok(());
        };
        if page.dirty || self.state.dirty_bitmaps.contains(&page.id) {
            if let Some(bitmap) = self.state.heap_pages.get(&page.id) {
                bitmap.write_to(&mut page.buffer);
            }
            self.allocator.pager.write_block(page.id, &page.buffer)?;
            self.state.dirty_bitmaps.remove(&page.id);
        }
        self.state.cache.insert(page.id, page.buffer);
        Ok(())
    }

    fn flush_heap(&mut self) -> ArborResult<()> {
        let dirty: Vec<u64> = std::mem::take(&mut self.state.dirty_bitmaps)
            .into_iter()
            .collect();

        for block_id in dirty {
            let Some(bitmap) = self.state.heap_pages.get(&block_id).copied() else {
                continue;
            };
            if let Some(page) = self.state.active.as_mut()
                && page.id == block_id
            {
                bitmap.write_to(&mut page.buffer);
                page.dirty = true;
                continue;
            }
            let mut block = self.read_block(block_id)?;
            bitmap.write_to(&mut block);
            self.write_block(block_id, &block)?;
        }

        if let Some(page) = self.state.active.as_mut()
            && page.dirty
        {
            self.allocator.pager.write_block(page.id, &page.buffer)?;
            page.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_allocator(dir: &std::path::Path) -> Allocator {
        let pager = Arc::new(Pager::open(dir.join("a.db"), 64).unwrap());
        let allocator = Allocator::new(pager, true);
        allocator.init().unwrap();
        allocator
    }

    #[test]
    fn test_format_and_reopen_superblock() {
        let dir = tempdir().unwrap();
        {
            let allocator = open_allocator(dir.path());
            let sb = allocator.super_block();
            assert_eq!(BlockType::of(&sb).unwrap(), BlockType::Meta);
            assert!(allocator.root().is_none());

            let root = SmartPointer::block(TypeTag::Dictionary, 5, 100, false, 64);
            allocator.set_root(&root).unwrap();
            assert!(allocator.is_super_dirty());
            allocator.save_state().unwrap();
            allocator.pager().sync().unwrap();
        }

        let allocator = open_allocator(dir.path());
        let root = allocator.root().unwrap();
        assert_eq!(root.block_id, 5);
        assert_eq!(root.length, 100);
        assert_eq!(root.offset, 64);
    }

    #[test]
    fn test_root_must_own_its_blocks() {
        let dir = tempdir().unwrap();
        let allocator = open_allocator(dir.path());

        let heap = SmartPointer::heap(TypeTag::Dictionary, 1, 40, 64);
        assert!(matches!(
            allocator.set_root(&heap),
            Err(ArborError::InvalidPointer(_))
        ));
        let inline = SmartPointer::inline(TypeTag::Dictionary, b"tiny").unwrap();
        assert!(allocator.set_root(&inline).is_err());

        assert!(allocator.root().is_none());
        assert!(!allocator.is_super_dirty());
    }

    #[test]
    fn test_corrupt_superblock_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        std::fs::write(&path, vec![0xAB; BLOCK_SIZE]).unwrap();

        let allocator = Allocator::new(Arc::new(Pager::open(&path, 8).unwrap()), false);
        let err = allocator.init().unwrap_err();
        assert_eq!(err.kind(), "corrupt_superblock");

        std::fs::write(&path, vec![0u8; 100]).unwrap();
        let allocator = Allocator::new(Arc::new(Pager::open(&path, 8).unwrap()), false);
        assert!(matches!(
            allocator.init(),
            Err(ArborError::CorruptSuperblock(_))
        ));
    }

    #[test]
    fn test_heap_first_fit_reuses_freed_units() {
        let dir = tempdir().unwrap();
        let allocator = open_allocator(dir.path());

        let a = allocator.store_heap(TypeTag::String, &[1u8; 40]).unwrap();
        let b = allocator.store_heap(TypeTag::String, &[2u8; 100]).unwrap();
        let ra = a.block_ref().unwrap();
        let rb = b.block_ref().unwrap();
        assert_eq!(ra.block_id, rb.block_id);
        assert_eq!(ra.offset, 64);
        assert_eq!(rb.offset, 64 + 2 * 32);

        allocator.free(&a).unwrap();
        let c = allocator.store_heap(TypeTag::String, &[3u8; 20]).unwrap();
        assert_eq!(c.block_ref().unwrap().offset, 64);

        assert_eq!(allocator.read_heap(&b).unwrap(), vec![2u8; 100]);
        assert_eq!(allocator.read_heap(&c).unwrap(), vec![3u8; 20]);
    }

    #[test]
    fn test_heap_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let ptr = {
            let allocator = open_allocator(dir.path());
            let ptr = allocator.store_heap(TypeTag::Buffer, b"persisted bytes!").unwrap();
            allocator.flush().unwrap();
            allocator.save_state().unwrap();
            ptr
        };

        let allocator = open_allocator(dir.path());
        assert_eq!(allocator.read_heap(&ptr).unwrap(), b"persisted bytes!");

        let id = ptr.block_ref().unwrap().block_id;
        let bitmap = allocator.heap_bitmap(id).unwrap();
        assert!(bitmap.is_set(0));
        assert!(!bitmap.is_set(1));
    }

    #[test]
    fn test_chain_blocks_reuse_free_run() {
        let dir = tempdir().unwrap();
        let allocator = open_allocator(dir.path());

        let big = allocator.allocate_chain(TypeTag::Buffer, 9000).unwrap();
        let r = big.block_ref().unwrap();
        assert!(r.chained);
        assert_eq!(r.offset, HEADER_SIZE as u32);

        let seg = allocator.read_block_locked(r.block_id + 2).unwrap();
        assert_eq!(BlockType::of(&seg).unwrap(), BlockType::Overflow);
        assert_eq!(read_u48(&seg, OVERFLOW_HEAD_OFFSET), r.block_id);
        assert_eq!(read_u32(&seg, OVERFLOW_SEGMENT_OFFSET), 2);

        allocator.free(&big).unwrap();
        assert_eq!(allocator.stats().free_blocks, 3);

        let again = allocator.allocate_chain(TypeTag::Buffer, 5000).unwrap();
        assert_eq!(again.block_ref().unwrap().block_id, r.block_id);
        assert_eq!(allocator.stats().free_blocks, 1);
    }

    #[test]
    fn test_sequential_read_range() {
        let dir = tempdir().unwrap();
        let allocator = open_allocator(dir.path());
        let extent = allocator.pager().extent();

        assert!(matches!(
            allocator.read_sequential_locked(extent, 1),
            Err(ArborError::BlockOutOfRange { .. })
        ));
        assert_eq!(
            allocator.read_sequential_locked(0, 10).unwrap().len(),
            extent as usize * BLOCK_SIZE
        );
    }
}
