//! Behaviour every strategy shares, checked through the common interface.

use std::ptr::NonNull;
use std::sync::Arc;

use arena_alloc::{
    construct, destruct, Allocator, AllocatorKind, ArenaAllocator, ArenaConfig, BlockInfo,
    BoundaryTags, Buddies, Error, FitMode, GlobalHeap, Result,
};

use test_log::test;

/// Lends a shared arena allocator out as a plain parent.
struct Shared(Arc<dyn ArenaAllocator>);

impl Allocator for Shared {
    fn allocate(&self, value_size: usize, values_count: usize) -> Result<NonNull<u8>> {
        self.0.allocate(value_size, values_count)
    }

    fn deallocate(&self, at: *mut u8) -> Result<()> {
        self.0.deallocate(at)
    }
}

#[test]
fn test_foreign_pointers_are_rejected() {
    for kind in AllocatorKind::ALL {
        for other in AllocatorKind::ALL {
            let a = kind.build(1024, ArenaConfig::default()).unwrap();
            let b = other.build(1024, ArenaConfig::default()).unwrap();

            let p = a.allocate(16, 2).unwrap();
            let q = b.allocate(16, 2).unwrap();
            let err = b.deallocate(p.as_ptr()).unwrap_err();
            assert!(
                matches!(err, Error::ForeignPointer { .. }),
                "{:?} accepted a region of {:?}",
                other,
                kind
            );
            assert!(!err.is_recoverable());

            // The failed attempt left both arenas untouched.
            a.deallocate(p.as_ptr()).unwrap();
            b.deallocate(q.as_ptr()).unwrap();
            assert_eq!(a.blocks_info(), [BlockInfo::free(1024)]);
            assert_eq!(b.blocks_info(), [BlockInfo::free(1024)]);
        }
    }
}

#[test]
fn test_double_free_is_rejected() {
    for kind in AllocatorKind::ALL {
        let allocator = kind.build(1024, ArenaConfig::default()).unwrap();
        let p = allocator.allocate(40, 1).unwrap();
        let _q = allocator.allocate(40, 1).unwrap();
        allocator.deallocate(p.as_ptr()).unwrap();
        assert!(
            matches!(
                allocator.deallocate(p.as_ptr()),
                Err(Error::ForeignPointer { .. })
            ),
            "{:?}",
            kind
        );
        assert_eq!(allocator.deallocate(std::ptr::null_mut()), Ok(()));
    }
}

#[test]
fn test_exhaustion_is_recoverable() {
    for kind in AllocatorKind::ALL {
        let allocator = kind.build(512, ArenaConfig::default()).unwrap();
        let err = allocator.allocate(1024, 1).unwrap_err();
        assert_eq!(err, Error::OutOfMemory { requested: 1024 }, "{:?}", kind);
        assert!(err.is_recoverable());

        let err = allocator.allocate(usize::MAX, 2).unwrap_err();
        assert!(err.is_recoverable(), "{:?}", kind);

        // Still usable afterwards.
        let p = allocator.allocate(64, 1).unwrap();
        allocator.deallocate(p.as_ptr()).unwrap();
    }
}

#[test]
fn test_round_trip() {
    for kind in AllocatorKind::ALL {
        let allocator = kind.build(16384, ArenaConfig::default()).unwrap();
        let pointers: Vec<_> = (0..24)
            .map(|i| allocator.allocate(1 + i * 7, 1 + i % 3).unwrap())
            .collect();

        // Odd ones first, then the rest from the back.
        let order = (0..24)
            .filter(|i| i % 2 == 1)
            .chain((0..24).filter(|i| i % 2 == 0).rev());
        for ix in order {
            allocator.deallocate(pointers[ix].as_ptr()).unwrap();
            let (validity, _) = allocator.stats();
            assert!(validity.is_valid(), "{:?}: {:?}", kind, validity);
        }

        assert_eq!(allocator.blocks_info(), [BlockInfo::free(16384)], "{:?}", kind);
        assert_eq!(allocator.available_size(), 16384);
    }
}

#[test]
fn test_regions_are_word_aligned_and_disjoint() {
    for kind in AllocatorKind::ALL {
        let allocator = kind.build(4096, ArenaConfig::default()).unwrap();
        let mut regions: Vec<(usize, usize)> = Vec::new();
        for size in [1, 3, 8, 17, 64, 5, 100] {
            let p = allocator.allocate(size, 1).unwrap();
            let start = p.as_ptr() as usize;
            assert_eq!(start % std::mem::size_of::<usize>(), 0, "{:?}", kind);
            for &(other, other_size) in &regions {
                assert!(start >= other + other_size || start + size <= other);
            }
            regions.push((start, size));
        }
    }
}

#[test]
fn test_fit_mode_switches_at_run_time() {
    for kind in AllocatorKind::ALL {
        let allocator = kind.build(2048, ArenaConfig::default()).unwrap();
        for mode in [FitMode::BestFit, FitMode::WorstFit, FitMode::FirstFit] {
            allocator.set_fit_mode(mode);
            assert_eq!(allocator.fit_mode(), mode);
            let p = allocator.allocate(32, 1).unwrap();
            allocator.deallocate(p.as_ptr()).unwrap();
        }
    }
}

#[test]
fn test_nesting() {
    let heap: Arc<dyn Allocator> = Arc::new(GlobalHeap::new());

    for outer_kind in AllocatorKind::ALL {
        let outer: Arc<dyn ArenaAllocator> = Arc::from(
            outer_kind
                .build(8192, ArenaConfig::default().with_parent(heap.clone()))
                .unwrap(),
        );
        let parent: Arc<dyn Allocator> = Arc::new(Shared(outer.clone()));

        for inner_kind in AllocatorKind::ALL {
            let inner = inner_kind
                .build(512, ArenaConfig::default().with_parent(parent.clone()))
                .unwrap();
            assert!(outer.available_size() < 8192);

            let p = inner.allocate(8, 4).unwrap();
            // The outer arena holds the inner one, but not its blocks.
            assert!(matches!(
                outer.deallocate(p.as_ptr()),
                Err(Error::ForeignPointer { .. })
            ));
            inner.deallocate(p.as_ptr()).unwrap();

            drop(inner);
            assert_eq!(
                outer.available_size(),
                8192,
                "{:?} in {:?}",
                inner_kind,
                outer_kind
            );
        }
    }
}

#[test]
fn test_construct_in_arena() {
    let allocator = BoundaryTags::new(1024).unwrap();
    let region = allocator
        .allocate(std::mem::size_of::<(u64, String)>(), 1)
        .unwrap();

    let value = unsafe { construct(region, (7u64, String::from("seven"))) };
    assert_eq!(unsafe { value.as_ref() }.1, "seven");
    unsafe { destruct(value) };
    allocator.deallocate(region.as_ptr()).unwrap();
}

#[test]
fn test_boundary_tags_reuse_middle_gap() {
    let allocator = BoundaryTags::new(4096).unwrap();
    let overhead = BoundaryTags::block_overhead();

    let _a = allocator.allocate(100, 1).unwrap();
    let b = allocator.allocate(200, 1).unwrap();
    let _c = allocator.allocate(300, 1).unwrap();
    allocator.deallocate(b.as_ptr()).unwrap();

    let d = allocator.allocate(150, 1).unwrap();
    assert_eq!(d, b);

    let blocks = allocator.blocks_info();
    assert_eq!(blocks.iter().filter(|b| b.occupied).count(), 3);

    // Exactly one free segment follows the third block, and it runs to the
    // end of the arena.
    let third = blocks.iter().rposition(|b| b.occupied).unwrap();
    assert_eq!(blocks.len() - third - 1, 1);
    assert!(!blocks[third + 1].occupied);
    assert!(blocks[third].size >= 300 + overhead);

    let total: usize = blocks.iter().map(|b| b.size).sum();
    assert_eq!(total, 4096);
}

#[test]
fn test_buddy_power_law() {
    let allocator = Buddies::new(3000).unwrap();
    assert_eq!(allocator.total_size(), 4096);

    let mut live = Vec::new();
    for size in [1, 30, 100, 7, 250, 64, 500, 3] {
        live.push(allocator.allocate(size, 1).unwrap());
        for block in allocator.blocks_info() {
            assert!(block.size.is_power_of_two(), "{:?}", block);
        }
    }
    for p in live.drain(..).rev() {
        allocator.deallocate(p.as_ptr()).unwrap();
        for block in allocator.blocks_info() {
            assert!(block.size.is_power_of_two(), "{:?}", block);
        }
    }
    assert_eq!(allocator.blocks_info(), [BlockInfo::free(4096)]);
}

#[test]
fn test_owned_region_written_during_allocation() {
    for kind in AllocatorKind::ALL {
        let allocator: Arc<dyn ArenaAllocator> =
            Arc::from(kind.build(4096, ArenaConfig::default()).unwrap());
        let region = allocator.allocate(8, 8).unwrap();
        // Addresses are plain integers so the writer can be moved to a thread.
        let address = region.as_ptr() as usize;

        let writer = std::thread::spawn(move || {
            let at = address as *mut u8;
            for i in 0..2000 {
                for offset in 0..64 {
                    unsafe { at.add(offset).write_volatile(i as u8) };
                }
            }
        });

        for i in 0..2000 {
            let p = allocator.allocate(8, 1 + i % 5).unwrap();
            allocator.deallocate(p.as_ptr()).unwrap();
        }
        writer.join().unwrap();

        let written = unsafe { std::slice::from_raw_parts(region.as_ptr(), 64) };
        assert!(written.iter().all(|&b| b == (1999 % 256) as u8), "{:?}", kind);
        allocator.deallocate(region.as_ptr()).unwrap();
        assert_eq!(allocator.available_size(), 4096, "{:?}", kind);
    }
}
