//! Decoded-structure cache.
//!
//! Two levels: block id, then byte offset inside the block. Eviction works
//! on whole block groups in insertion order. A miss is always safe; callers
//! re-read and re-decode.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::pointer::SmartPointer;

/// A decoded on-disk structure that knows where it was read from.
pub trait CachedStructure: Any + Send + Sync {
    /// Byte offset of the structure inside its block.
    fn offset(&self) -> u32;
}

/// Lookup key: `(block_id, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StructKey {
    pub block_id: u64,
    pub offset: u32,
}

impl From<u64> for StructKey {
    fn from(block_id: u64) -> Self {
        Self {
            block_id,
            offset: 0,
        }
    }
}

impl From<(u64, u32)> for StructKey {
    fn from((block_id, offset): (u64, u32)) -> Self {
        Self { block_id, offset }
    }
}

impl From<&SmartPointer> for StructKey {
    fn from(ptr: &SmartPointer) -> Self {
        match ptr.block_ref() {
            Some(r) => Self {
                block_id: r.block_id,
                offset: r.offset,
            },
            // block 0 is the superblock and never holds a structure
            None => Self {
                block_id: 0,
                offset: 0,
            },
        }
    }
}

type Entry = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct CacheInner {
    groups: HashMap<u64, HashMap<u32, Entry>>,
    order: VecDeque<u64>,
}

pub struct StructureCache {
    inner: Mutex<CacheInner>,
    limit: usize,
}

impl StructureCache {
    /// Cache holding at most `limit` block groups.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Insert or replace the structure at `(block_id, structure.offset())`.
    pub fn cache_structure<T: CachedStructure>(&self, block_id: u64, structure: Arc<T>) {
        let offset = structure.offset();
        let mut inner = self.inner.lock();

        if !inner.groups.contains_key(&block_id) {
            while inner.groups.len() >= self.limit {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                inner.groups.remove(&oldest);
            }
            inner.order.push_back(block_id);
        }

        inner
            .groups
            .entry(block_id)
            .or_default()
            .insert(offset, structure);
    }

    /// Cached structure at `key`, if present and of type `T`.
    pub fn get_cached_structure<T: CachedStructure>(
        &self,
        key: impl Into<StructKey>,
    ) -> Option<Arc<T>> {
        let key = key.into();
        let entry = {
            let inner = self.inner.lock();
            inner.groups.get(&key.block_id)?.get(&key.offset)?.clone()
        };
        entry.downcast::<T>().ok()
    }

    /// Drop every structure decoded from `block_id`.
    pub fn invalidate_block(&self, block_id: u64) {
        let mut inner = self.inner.lock();
        if inner.groups.remove(&block_id).is_some() {
            inner.order.retain(|&id| id != block_id);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.groups.clear();
        inner.order.clear();
    }

    /// Number of cached block groups.
    pub fn len(&self) -> usize {
        self.inner.lock().groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::layout::TypeTag;

    #[derive(Debug, PartialEq)]
    struct Node {
        offset: u32,
        keys: Vec<String>,
    }

    impl CachedStructure for Node {
        fn offset(&self) -> u32 {
            self.offset
        }
    }

    fn node(offset: u32, key: &str) -> Arc<Node> {
        Arc::new(Node {
            offset,
            keys: vec![key.to_string()],
        })
    }

    #[test]
    fn test_store_and_fetch() {
        let cache = StructureCache::new(4);
        cache.cache_structure(3, node(0, "a"));
        cache.cache_structure(3, node(128, "b"));

        let a: Arc<Node> = cache.get_cached_structure(3u64).unwrap();
        assert_eq!(a.keys, vec!["a"]);
        let b: Arc<Node> = cache.get_cached_structure((3u64, 128u32)).unwrap();
        assert_eq!(b.keys, vec!["b"]);
        assert!(cache.get_cached_structure::<Node>((3u64, 64u32)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lookup_by_pointer() {
        let cache = StructureCache::new(4);
        cache.cache_structure(9, node(64, "root"));

        let ptr = SmartPointer::block(TypeTag::Dictionary, 9, 200, false, 64);
        let hit: Arc<Node> = cache.get_cached_structure(&ptr).unwrap();
        assert_eq!(hit.offset, 64);

        let inline = SmartPointer::inline(TypeTag::String, b"x").unwrap();
        assert!(cache.get_cached_structure::<Node>(&inline).is_none());
    }

    #[test]
    fn test_oldest_group_evicted() {
        let cache = StructureCache::new(2);
        cache.cache_structure(1, node(0, "one"));
        cache.cache_structure(1, node(64, "one-b"));
        cache.cache_structure(2, node(0, "two"));
        // same group again does not evict
        cache.cache_structure(2, node(64, "two-b"));
        assert_eq!(cache.len(), 2);

        cache.cache_structure(3, node(0, "three"));
        assert!(cache.get_cached_structure::<Node>(1u64).is_none());
        assert!(cache.get_cached_structure::<Node>((1u64, 64u32)).is_none());
        assert!(cache.get_cached_structure::<Node>(2u64).is_some());
        assert!(cache.get_cached_structure::<Node>(3u64).is_some());
    }

    #[test]
    fn test_wrong_type_misses() {
        struct Other;
        impl CachedStructure for Other {
            fn offset(&self) -> u32 {
                0
            }
        }

        let cache = StructureCache::new(2);
        cache.cache_structure(5, Arc::new(Other));
        assert!(cache.get_cached_structure::<Node>(5u64).is_none());
        assert!(cache.get_cached_structure::<Other>(5u64).is_some());

        cache.invalidate_block(5);
        assert!(cache.is_empty());
    }
}
