//! Block storage: layout, pager, allocation, coordination and chain I/O.

pub mod allocator;
pub mod background;
pub mod cache;
pub mod chain;
pub mod engine;
pub mod heap;
pub mod layout;
pub mod pager;
pub mod pointer;
pub mod transaction;


pub use allocator::{Allocator, AllocatorStats, LockedAllocator};
pub use background::{BackgroundQueue, DRAIN_CEILING, PendingOp};
pub use cache::{CachedStructure, StructKey, StructureCache};
pub use chain::{chain_span, read_chain_safe, write_chain_safe};
pub use engine::{Database, DatabaseStats, DefaultRoot, RootProvider};
pub use heap::PageBitmap;
pub use layout::{BLOCK_SIZE, BlockType, HEADER_SIZE, StorageMode, TypeTag, ValTag};
pub use pager::{Pager, PagerStats};
pub use pointer::{BlockRef, Location, SmartPointer};
pub use transaction::{Coordinator, LockState};
