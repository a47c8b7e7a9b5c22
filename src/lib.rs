#![cfg_attr(not(test), no_std)]

//! Fixed-capacity arena allocators.
//!
//! Each allocator owns one contiguous arena, taken either from the process
//! heap or from a parent [`Allocator`], and hands out regions of it. All
//! bookkeeping lives inside the arena itself. Four strategies for tracking
//! free space are provided, all behind the same [`ArenaAllocator`] interface:
//!
//! - [`BoundaryTags`]: only occupied blocks are linked; free space is the
//!   gaps between them.
//! - [`Buddies`]: power-of-two blocks, split and merged with their buddies.
//! - [`RedBlackTree`]: free blocks indexed by size in a red-black tree.
//! - [`SortedList`]: free blocks in an address-ordered list.
//!
//! Every strategy chooses among fitting free blocks with a [`FitMode`], can
//! narrate what it does to an optional [`log::Log`] implementation, and
//! rejects regions it did not issue.
//!
//! ```
//! use arena_alloc::{Allocator, ArenaAllocator, ArenaConfig, AllocatorKind, FitMode};
//!
//! let config = ArenaConfig::default().with_fit_mode(FitMode::BestFit);
//! let allocator = AllocatorKind::SortedList.build(4096, config).unwrap();
//!
//! let region = allocator.allocate(8, 16).unwrap();
//! allocator.deallocate(region.as_ptr()).unwrap();
//! assert_eq!(allocator.available_size(), 4096);
//! ```

extern crate alloc;

use alloc::boxed::Box;

pub mod allocator;
pub mod arena;
pub mod blocks;
pub mod boundary_tags;
pub mod buddies;
pub mod error;
pub mod fit;
pub mod global_heap;
pub mod logging;
pub mod red_black_tree;
pub mod sorted_list;

pub use crate::allocator::{construct, destruct, Allocator, ArenaAllocator};
pub use crate::arena::ArenaConfig;
pub use crate::blocks::{BlockInfo, Coalescing, Stats, Validity};
pub use crate::boundary_tags::BoundaryTags;
pub use crate::buddies::Buddies;
pub use crate::error::{Error, Result};
pub use crate::fit::FitMode;
pub use crate::global_heap::GlobalHeap;
pub use crate::logging::LoggerRef;
pub use crate::red_black_tree::RedBlackTree;
pub use crate::sorted_list::SortedList;

/// The available free-space strategies, for picking one at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    BoundaryTags,
    Buddies,
    RedBlackTree,
    SortedList,
}

impl AllocatorKind {
    pub const ALL: [AllocatorKind; 4] = [
        AllocatorKind::BoundaryTags,
        AllocatorKind::Buddies,
        AllocatorKind::RedBlackTree,
        AllocatorKind::SortedList,
    ];

    /// Build an allocator of this kind over `capacity` bytes.
    ///
    /// The buddy strategy rounds `capacity` up to a power of two.
    pub fn build(self, capacity: usize, config: ArenaConfig) -> Result<Box<dyn ArenaAllocator>> {
        Ok(match self {
            AllocatorKind::BoundaryTags => Box::new(BoundaryTags::with_config(capacity, config)?),
            AllocatorKind::Buddies => Box::new(Buddies::with_config(capacity, config)?),
            AllocatorKind::RedBlackTree => Box::new(RedBlackTree::with_config(capacity, config)?),
            AllocatorKind::SortedList => Box::new(SortedList::with_config(capacity, config)?),
        })
    }

    /// Bytes of header each occupied block carries.
    pub fn block_overhead(self) -> usize {
        match self {
            AllocatorKind::BoundaryTags => BoundaryTags::block_overhead(),
            AllocatorKind::Buddies => Buddies::block_overhead(),
            AllocatorKind::RedBlackTree => RedBlackTree::block_overhead(),
            AllocatorKind::SortedList => SortedList::block_overhead(),
        }
    }
}
