//! Values spanning several blocks.
//!
//! The first block of a chain holds `BLOCK_SIZE - offset` payload bytes,
//! every continuation block `BLOCK_SIZE - HEADER_SIZE`, leaving its header
//! for chain metadata.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ArborError, ArborResult};
use crate::storage::allocator::Allocator;
use crate::storage::layout::{BLOCK_DATA_SIZE, BLOCK_SIZE, HEADER_SIZE};
use crate::storage::pointer::SmartPointer;

/// Number of blocks a value of `length` bytes starting at `offset` covers.
pub fn chain_span(length: usize, offset: usize) -> usize {
    let first = BLOCK_SIZE.saturating_sub(offset);
    if length <= first {
        1
    } else {
        1 + (length - first).div_ceil(BLOCK_DATA_SIZE)
    }
}

/// Byte range inside block `index` of a chain, as `(start, len)`.
fn segment(index: usize, offset: usize, remaining: usize) -> (usize, usize) {
    let start = if index == 0 { offset } else { HEADER_SIZE };
    (start, (BLOCK_SIZE - start).min(remaining))
}

/// Read the bytes addressed by a block pointer.
///
/// Returns `Ok(None)` for pointers that do not address a block. A file
/// that ends before the chain does is reported as a torn read.
pub fn read_chain_safe(
    allocator: &Allocator,
    ptr: &SmartPointer,
) -> ArborResult<Option<Vec<u8>>> {
    let Some(r) = ptr.block_ref() else {
        return Ok(None);
    };
    let offset = r.offset as usize;
    let length = r.length as usize;
    if offset >= BLOCK_SIZE {
        return Err(ArborError::InvalidPointer(format!(
            "chain offset {} lies outside the first block",
            offset
        )));
    }

    let blocks = chain_span(length, offset);
    let raw = allocator.read_sequential_locked(r.block_id, blocks)?;
    if raw.len() < blocks * BLOCK_SIZE {
        return Err(ArborError::TornChainRead {
            block: r.block_id,
            expected: blocks * BLOCK_SIZE,
            actual: raw.len(),
        });
    }

    let mut out = Vec::with_capacity(length);
    for index in 0..blocks {
        let (start, len) = segment(index, offset, length - out.len());
        let base = index * BLOCK_SIZE;
        out.extend_from_slice(&raw[base + start..base + start + len]);
    }
    Ok(Some(out))
}

/// Write `bytes` across the blocks addressed by `ptr` under one allocator
/// lock, then bump `mutations`.
pub fn write_chain_safe(
    allocator: &Allocator,
    ptr: &SmartPointer,
    bytes: &[u8],
    mutations: &AtomicU64,
) -> ArborResult<()> {
    let r = ptr.block_ref().ok_or_else(|| {
        ArborError::InvalidPointer(format!("{} does not address a block", ptr))
    })?;
    if bytes.len() != r.length as usize {
        return Err(ArborError::InvalidPointer(format!(
            "{} expects {} bytes, got {}",
            ptr,
            r.length,
            bytes.len()
        )));
    }
    let offset = r.offset as usize;
    if offset >= BLOCK_SIZE {
        return Err(ArborError::InvalidPointer(format!(
            "chain offset {} lies outside the first block",
            offset
        )));
    }

    let blocks = chain_span(bytes.len(), offset);
    allocator.execute_locked(|locked| {
        let mut written = 0;
        for index in 0..blocks {
            let block_id = r.block_id + index as u64;
            let (start, len) = segment(index, offset, bytes.len() - written);
            locked.invalidate_cache(block_id);
            locked.patch_block(block_id, start, &bytes[written..written + len])?;
            written += len;
        }
        Ok(())
    })?;

    mutations.fetch_add(1, Ordering::AcqRel);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::TypeTag;
    use crate::storage::pager::Pager;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn open(dir: &std::path::Path) -> Allocator {
        let pager = Arc::new(Pager::open(dir.join("c.db"), 64).unwrap());
        let allocator = Allocator::new(pager, false);
        allocator.init().unwrap();
        allocator
    }

    #[test]
    fn test_span_geometry() {
        assert_eq!(chain_span(0, HEADER_SIZE), 1);
        assert_eq!(chain_span(BLOCK_SIZE - HEADER_SIZE, HEADER_SIZE), 1);
        assert_eq!(chain_span(BLOCK_SIZE - HEADER_SIZE + 1, HEADER_SIZE), 2);
        assert_eq!(chain_span(BLOCK_SIZE - 100, 100), 1);
        assert_eq!(chain_span(BLOCK_SIZE - 100 + 2 * BLOCK_DATA_SIZE, 100), 3);
    }

    #[test]
    fn test_round_trip_multi_block() {
        let dir = tempdir().unwrap();
        let allocator = open(dir.path());
        let counter = AtomicU64::new(0);

        for len in [5000, 3 * BLOCK_DATA_SIZE + 17, 20_000] {
            let ptr = allocator.allocate_chain(TypeTag::Buffer, len).unwrap();
            let data = pattern(len);
            write_chain_safe(&allocator, &ptr, &data, &counter).unwrap();
            assert_eq!(read_chain_safe(&allocator, &ptr).unwrap().unwrap(), data);
        }
        assert_eq!(counter.load(Ordering::Acquire), 3);
    }

    #[test]
    fn test_exact_first_block_fill() {
        let dir = tempdir().unwrap();
        let allocator = open(dir.path());
        let counter = AtomicU64::new(0);

        let len = BLOCK_SIZE - HEADER_SIZE;
        let ptr = allocator.allocate_chain(TypeTag::Buffer, len).unwrap();
        assert!(!ptr.block_ref().unwrap().chained);

        let data = pattern(len);
        write_chain_safe(&allocator, &ptr, &data, &counter).unwrap();
        assert_eq!(read_chain_safe(&allocator, &ptr).unwrap().unwrap(), data);
        // nothing was written past the one block
        assert_eq!(
            allocator.pager().extent(),
            ptr.block_ref().unwrap().block_id + 1
        );
    }

    #[test]
    fn test_torn_read_reported() {
        let dir = tempdir().unwrap();
        let allocator = open(dir.path());

        let head = allocator.allocate_chain(TypeTag::Buffer, 100).unwrap();
        let id = head.block_ref().unwrap().block_id;
        // claims three blocks where the file holds one
        let forged = SmartPointer::block(TypeTag::Buffer, id, 10_000, true, HEADER_SIZE as u32);
        let err = read_chain_safe(&allocator, &forged).unwrap_err();
        assert!(matches!(err, ArborError::TornChainRead { .. }));
    }

    #[test]
    fn test_missing_block_is_formatted() {
        let dir = tempdir().unwrap();
        let allocator = open(dir.path());
        let counter = AtomicU64::new(0);

        let ptr = SmartPointer::block(TypeTag::Buffer, 7, 10, false, HEADER_SIZE as u32);
        write_chain_safe(&allocator, &ptr, b"recovered!", &counter).unwrap();

        let block = allocator.read_block_locked(7).unwrap();
        assert_eq!(
            crate::storage::layout::BlockType::of(&block).unwrap(),
            crate::storage::layout::BlockType::Page
        );
        assert_eq!(&block[HEADER_SIZE..HEADER_SIZE + 10], b"recovered!");
        assert_eq!(read_chain_safe(&allocator, &ptr).unwrap().unwrap(), b"recovered!");
    }

    #[test]
    fn test_inline_pointer_has_no_chain() {
        let dir = tempdir().unwrap();
        let allocator = open(dir.path());
        let ptr = SmartPointer::inline(TypeTag::String, b"hi").unwrap();
        assert!(read_chain_safe(&allocator, &ptr).unwrap().is_none());
    }

    #[test]
    fn test_batched_write_mutates_dirty_buffer() {
        let dir = tempdir().unwrap();
        let allocator = open(dir.path());
        let counter = AtomicU64::new(0);

        allocator.pager().start_batch();
        let ptr = allocator.allocate_chain(TypeTag::Buffer, 6000).unwrap();
        let data = pattern(6000);
        write_chain_safe(&allocator, &ptr, &data, &counter).unwrap();
        assert!(allocator.pager().dirty_count() >= 2);
        assert_eq!(read_chain_safe(&allocator, &ptr).unwrap().unwrap(), data);
        allocator.pager().end_batch().unwrap();

        assert_eq!(allocator.pager().dirty_count(), 0);
        assert_eq!(read_chain_safe(&allocator, &ptr).unwrap().unwrap(), data);
    }
}
