//! An arena allocator keeping its free blocks in a singly linked list,
//! sorted by address.
//!
//! Keeping the list sorted means a freed block only needs to look at its
//! predecessor and successor in the list to find out whether it can merge
//! with them: no two blocks in the list are ever directly adjacent.
//!
//! Block layout, every field one word:
//!
//! ```text
//! +------+-------+-----------------------------+---------
//! | size | flags | next (free) / owner (occup) | payload
//! +------+-------+-----------------------------+---------
//! ```
//!
//! `size` covers the whole block, header included.

use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::const_assert;

use crate::allocator::{Allocator, ArenaAllocator};
use crate::arena::{requested_size, Arena, ArenaConfig, NIL, WORD};
use crate::blocks::BlockInfo;
use crate::error::{Error, Result};
use crate::fit::{FitMode, FitSelector};
use crate::logging::Narrator;

const SIZE: usize = 0;
const FLAGS: usize = WORD;
const LINK: usize = 2 * WORD;

/// Header size of every block, free or occupied. Also the smallest block
/// that can exist, so it bounds how far a block can be split.
const META: usize = 3 * WORD;

const OCCUPIED: usize = 1;

const_assert!(META % WORD == 0);

fn size(arena: &Arena, block: usize) -> usize {
    arena.word(block + SIZE)
}

fn is_occupied(arena: &Arena, block: usize) -> bool {
    arena.word(block + FLAGS) & OCCUPIED != 0
}

fn next(arena: &Arena, block: usize) -> usize {
    arena.word(block + LINK)
}

fn write_free(arena: &mut Arena, block: usize, size: usize, next: usize) {
    arena.set_word(block + SIZE, size);
    arena.set_word(block + FLAGS, 0);
    arena.set_word(block + LINK, next);
}

fn write_occupied(arena: &mut Arena, block: usize, size: usize) {
    let owner = arena.owner();
    arena.set_word(block + SIZE, size);
    arena.set_word(block + FLAGS, OCCUPIED);
    arena.set_word(block + LINK, owner);
}

/// Make `block` follow `prev` in the free list, or head it when `prev` is
/// nil.
fn relink(arena: &mut Arena, prev: usize, block: usize) {
    if prev == NIL {
        arena.set_root(block);
    } else {
        arena.set_word(prev + LINK, block);
    }
}

/// Walk the arena block by block; a block is free exactly when it is the
/// next entry of the free list.
fn blocks_info(arena: &Arena) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    let mut free = arena.root();
    let mut block = arena.data_start();

    while block < arena.data_end() {
        let block_size = size(arena, block);
        if block == free {
            free = next(arena, block);
            blocks.push(BlockInfo::free(block_size));
        } else {
            blocks.push(BlockInfo::occupied(block_size));
        }
        block += block_size;
    }

    blocks
}

/// An arena allocator with an address-ordered free list.
pub struct SortedList {
    arena: Mutex<Arena>,
    log: Narrator,
}

impl SortedList {
    /// Per-block bookkeeping overhead, in bytes.
    pub const fn block_overhead() -> usize {
        META
    }

    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(capacity, ArenaConfig::default())
    }

    pub fn with_config(capacity: usize, config: ArenaConfig) -> Result<Self> {
        let log = Narrator::new(config.logger, module_path!());
        log.trace(format_args!("new({}) : called.", capacity));

        if capacity < META {
            log.error(format_args!(
                "new({}) : size is too small to initialize allocator instance, minimum is {} bytes.",
                capacity, META
            ));
            return Err(Error::TooSmall {
                requested: capacity,
                minimum: META,
            });
        }

        let mut arena = Arena::acquire(capacity, config.fit_mode, config.parent, log.clone())
            .map_err(|e| {
                log.error(format_args!("new({}) : cannot acquire arena: {}.", capacity, e));
                e
            })?;

        let first = arena.data_start();
        write_free(&mut arena, first, capacity, NIL);
        arena.set_root(first);

        log.trace(format_args!("new({}) : finished.", capacity));
        Ok(SortedList {
            arena: Mutex::new(arena),
            log,
        })
    }

    /// Check that a block offset recovered from a caller's pointer is one
    /// this allocator issued and has not taken back.
    fn is_issued(arena: &Arena, block: usize) -> bool {
        (block - arena.data_start()) % WORD == 0
            && is_occupied(arena, block)
            && next(arena, block) == arena.owner()
            && size(arena, block) >= META
            && size(arena, block)
                .checked_add(block)
                .map_or(false, |end| end <= arena.data_end())
    }
}

impl Allocator for SortedList {
    fn allocate(&self, value_size: usize, values_count: usize) -> Result<NonNull<u8>> {
        let mut arena = self.arena.lock();
        self.log
            .trace(format_args!("allocate : called."))
            .debug(format_args!(
                "allocate : value_size = {}, values_count = {}.",
                value_size, values_count
            ));

        let requested = requested_size(value_size, values_count)?;
        let needed = requested.checked_add(META).ok_or(Error::OutOfMemory { requested })?;

        let mut selector = FitSelector::new(arena.fit_mode(), needed);
        let mut prev = NIL;
        let mut block = arena.root();
        while block != NIL {
            if selector.offer((prev, block), size(&arena, block)) {
                break;
            }
            prev = block;
            block = next(&arena, block);
        }

        let ((prev, target), target_size) = match selector.finish() {
            Some(found) => found,
            None => {
                self.log.error(format_args!(
                    "allocate : no space to allocate requested {} bytes.",
                    requested
                ));
                return Err(Error::OutOfMemory { requested });
            }
        };

        let leftover = target_size - needed;
        let (block_size, successor) = if leftover < META {
            // Too small to stand on its own: hand the whole block out.
            if leftover > 0 {
                self.log.warning(format_args!(
                    "allocate : request of {} bytes was enlarged to {} bytes.",
                    requested,
                    target_size - META
                ));
            }
            (target_size, next(&arena, target))
        } else {
            let remainder = target + needed;
            let after = next(&arena, target);
            write_free(&mut arena, remainder, leftover, after);
            (needed, remainder)
        };

        relink(&mut arena, prev, successor);
        write_occupied(&mut arena, target, block_size);
        let available = arena.available() - block_size;
        arena.set_available(available);

        self.log
            .debug(format_args!(
                "allocate : allocated {}(+{}) bytes.",
                block_size - META,
                META
            ))
            .memory_map("allocate", || blocks_info(&arena))
            .information(format_args!("allocate : available size is {} bytes.", available))
            .trace(format_args!("allocate : finished."));

        Ok(arena.ptr_at(target + META))
    }

    fn deallocate(&self, at: *mut u8) -> Result<()> {
        let mut arena = self.arena.lock();
        self.log.trace(format_args!("deallocate : called."));

        if at.is_null() {
            return Ok(());
        }

        let block = match arena
            .block_offset_of(at, META)
            .filter(|&block| Self::is_issued(&arena, block))
        {
            Some(block) => block,
            None => {
                self.log.error(format_args!(
                    "deallocate : tried to deallocate non-related memory."
                ));
                return Err(Error::ForeignPointer {
                    address: at as usize,
                });
            }
        };

        let block_size = size(&arena, block);
        self.log.released(
            "deallocate",
            block_size - META,
            META,
            arena.region(block + META, block + block_size),
        );

        // Find the free blocks either side of this one.
        let mut prev = NIL;
        let mut following = arena.root();
        while following != NIL && following < block {
            prev = following;
            following = next(&arena, following);
        }

        let (merged_size, successor) = if following != NIL && block + block_size == following {
            (
                block_size + size(&arena, following),
                next(&arena, following),
            )
        } else {
            (block_size, following)
        };
        write_free(&mut arena, block, merged_size, successor);

        if prev != NIL && prev + size(&arena, prev) == block {
            let grown = size(&arena, prev) + merged_size;
            write_free(&mut arena, prev, grown, successor);
        } else {
            relink(&mut arena, prev, block);
        }

        let available = arena.available() + block_size;
        arena.set_available(available);

        self.log
            .memory_map("deallocate", || blocks_info(&arena))
            .information(format_args!("deallocate : available size is {} bytes.", available))
            .trace(format_args!("deallocate : finished."));

        Ok(())
    }
}

impl ArenaAllocator for SortedList {
    fn set_fit_mode(&self, mode: FitMode) {
        self.arena.lock().set_fit_mode(mode);
    }

    fn fit_mode(&self) -> FitMode {
        self.arena.lock().fit_mode()
    }

    fn blocks_info(&self) -> Vec<BlockInfo> {
        let arena = self.arena.lock();
        self.log.trace(format_args!("blocks_info : called."));
        blocks_info(&arena)
    }

    fn available_size(&self) -> usize {
        self.arena.lock().available()
    }

    fn total_size(&self) -> usize {
        self.arena.lock().total()
    }
}
