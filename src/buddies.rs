//! A binary buddy allocator.
//!
//! The data region is `2^p` bytes and every block is a power of two, aligned
//! (relative to the start of the data region) to its own size. A block's
//! buddy is found by flipping the bit of its relative offset that equals its
//! size. Splitting halves a block and frees the upper half; freeing merges a
//! block with its buddy for as long as the buddy is free and whole.
//!
//! The first byte of every block holds its power, with the high bit set
//! while the block is occupied:
//!
//! ```text
//! occupied: | power|0x80 | owner | payload ...
//! free:     | power      | prev  | next | ...
//! ```
//!
//! The tag takes a whole word so the words after it stay aligned. Free blocks
//! of every size share one doubly linked list, newest first.

use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::const_assert;

use crate::allocator::{Allocator, ArenaAllocator};
use crate::arena::{requested_size, Arena, ArenaConfig, NIL, WORD};
use crate::blocks::{BlockInfo, Coalescing};
use crate::error::{Error, Result};
use crate::fit::{FitMode, FitSelector};
use crate::logging::Narrator;

const TAG: usize = 0;
const OWNER: usize = WORD;
const PREV: usize = WORD;
const NEXT: usize = 2 * WORD;

/// Header of an occupied block.
const META: usize = 2 * WORD;
/// Header of a free block.
const FREE_META: usize = 3 * WORD;

const OCCUPIED: u8 = 0x80;
const POWER_MASK: u8 = !OCCUPIED;

/// Power of the smallest block, which must be able to hold the free links.
const MIN_POWER: u32 = ceil_log2(FREE_META);

const_assert!(1 << MIN_POWER >= FREE_META);
const_assert!((usize::BITS as u8) < OCCUPIED);

/// `ceil(log2(value))`, with `ceil_log2(0) == ceil_log2(1) == 0`.
pub const fn ceil_log2(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        usize::BITS - (value - 1).leading_zeros()
    }
}

fn power(arena: &Arena, block: usize) -> u32 {
    (arena.byte(block + TAG) & POWER_MASK) as u32
}

fn is_occupied(arena: &Arena, block: usize) -> bool {
    arena.byte(block + TAG) & OCCUPIED != 0
}

fn block_size(arena: &Arena, block: usize) -> usize {
    1 << power(arena, block)
}

fn next(arena: &Arena, block: usize) -> usize {
    arena.word(block + NEXT)
}

fn buddy_of(arena: &Arena, block: usize, power: u32) -> usize {
    let start = arena.data_start();
    start + ((block - start) ^ (1 << power))
}

fn write_tag(arena: &mut Arena, block: usize, tag: u8) {
    arena.set_word(block + TAG, 0);
    arena.set_byte(block + TAG, tag);
}

/// Write a free header and push the block onto the front of the free list.
fn push_free(arena: &mut Arena, block: usize, power: u32) {
    let head = arena.root();
    write_tag(arena, block, power as u8);
    arena.set_word(block + PREV, NIL);
    arena.set_word(block + NEXT, head);
    if head != NIL {
        arena.set_word(head + PREV, block);
    }
    arena.set_root(block);
}

fn unlink_free(arena: &mut Arena, block: usize) {
    let prev = arena.word(block + PREV);
    let next = next(arena, block);
    if prev == NIL {
        arena.set_root(next);
    } else {
        arena.set_word(prev + NEXT, next);
    }
    if next != NIL {
        arena.set_word(next + PREV, prev);
    }
}

fn blocks_info(arena: &Arena) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    let mut block = arena.data_start();
    while block < arena.data_end() {
        let size = block_size(arena, block);
        blocks.push(BlockInfo {
            size,
            occupied: is_occupied(arena, block),
        });
        block += size;
    }
    blocks
}

/// A buddy-system arena allocator.
pub struct Buddies {
    arena: Mutex<Arena>,
    power: u32,
    log: Narrator,
}

impl Buddies {
    /// Per-block bookkeeping overhead of an occupied block, in bytes.
    pub const fn block_overhead() -> usize {
        META
    }

    /// Build an allocator of at least `capacity` bytes; the capacity is
    /// rounded up to the next power of two.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(capacity, ArenaConfig::default())
    }

    pub fn with_config(capacity: usize, config: ArenaConfig) -> Result<Self> {
        Self::build(capacity, ceil_log2(capacity), config)
    }

    /// Build an allocator of exactly `2^power` bytes.
    pub fn with_power(power: u32, config: ArenaConfig) -> Result<Self> {
        let capacity = 1usize.checked_shl(power).unwrap_or(usize::MAX);
        Self::build(capacity, power, config)
    }

    fn build(capacity: usize, power: u32, config: ArenaConfig) -> Result<Self> {
        let log = Narrator::new(config.logger, module_path!());
        log.trace(format_args!("new({}) : called.", capacity));

        if capacity < FREE_META {
            log.error(format_args!(
                "new({}) : size is too small to initialize allocator instance, minimum is {} bytes.",
                capacity, FREE_META
            ));
            return Err(Error::TooSmall {
                requested: capacity,
                minimum: FREE_META,
            });
        }
        if power >= usize::BITS {
            log.error(format_args!("new({}) : size cannot be a power of two.", capacity));
            return Err(Error::OutOfMemory {
                requested: capacity,
            });
        }

        let mut arena = Arena::acquire(1 << power, config.fit_mode, config.parent, log.clone())
            .map_err(|e| {
                log.error(format_args!("new({}) : cannot acquire arena: {}.", capacity, e));
                e
            })?;
        let start = arena.data_start();
        push_free(&mut arena, start, power);

        log.trace(format_args!("new({}) : finished.", capacity));
        Ok(Buddies {
            arena: Mutex::new(arena),
            power,
            log,
        })
    }

    fn is_issued(&self, arena: &Arena, block: usize) -> bool {
        let relative = block - arena.data_start();
        if relative % (1 << MIN_POWER) != 0 || !is_occupied(arena, block) {
            return false;
        }
        let power = power(arena, block);
        power <= self.power
            && relative % (1 << power) == 0
            && arena.word(block + OWNER) == arena.owner()
    }
}

impl Allocator for Buddies {
    fn allocate(&self, value_size: usize, values_count: usize) -> Result<NonNull<u8>> {
        let mut arena = self.arena.lock();
        self.log
            .trace(format_args!("allocate : called."))
            .debug(format_args!(
                "allocate : value_size = {}, values_count = {}.",
                value_size, values_count
            ));

        let requested = requested_size(value_size, values_count)?;
        let out_of_memory = |log: &Narrator| {
            log.error(format_args!(
                "allocate : no space to allocate requested {} bytes.",
                requested
            ));
            Error::OutOfMemory { requested }
        };

        let target = match requested.checked_add(META) {
            Some(needed) => ceil_log2(needed).max(MIN_POWER),
            None => return Err(out_of_memory(&self.log)),
        };
        if target > self.power {
            return Err(out_of_memory(&self.log));
        }

        let mut selector = FitSelector::new(arena.fit_mode(), 1 << target);
        let mut block = arena.root();
        while block != NIL {
            if selector.offer(block, block_size(&arena, block)) {
                break;
            }
            block = next(&arena, block);
        }

        let (block, size) = match selector.finish() {
            Some(found) => found,
            None => return Err(out_of_memory(&self.log)),
        };

        unlink_free(&mut arena, block);

        // Split: keep the lower half, free the upper half.
        let mut power = power(&arena, block);
        while power > target {
            power -= 1;
            push_free(&mut arena, block + (1 << power), power);
        }

        let owner = arena.owner();
        write_tag(&mut arena, block, target as u8 | OCCUPIED);
        arena.set_word(block + OWNER, owner);

        let granted = 1usize << target;
        let available = arena.available() - granted;
        arena.set_available(available);

        self.log
            .debug(format_args!(
                "allocate : allocated {}(+{}) bytes from a {} byte block.",
                granted - META,
                META,
                size
            ))
            .memory_map("allocate", || blocks_info(&arena))
            .information(format_args!("allocate : available size is {} bytes.", available))
            .trace(format_args!("allocate : finished."));

        Ok(arena.ptr_at(block + META))
    }

    fn deallocate(&self, at: *mut u8) -> Result<()> {
        let mut arena = self.arena.lock();
        self.log.trace(format_args!("deallocate : called."));

        if at.is_null() {
            return Ok(());
        }

        let block = match arena
            .block_offset_of(at, META)
            .filter(|&block| self.is_issued(&arena, block))
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

        let released = block_size(&arena, block);
        self.log.released(
            "deallocate",
            released - META,
            META,
            arena.region(block + META, block + released),
        );

        let mut power = power(&arena, block);
        // A lower buddy may absorb this block without rewriting its header.
        write_tag(&mut arena, block, power as u8);
        arena.set_word(block + OWNER, 0);

        let mut block = block;
        while power < self.power {
            let buddy = buddy_of(&arena, block, power);
            if is_occupied(&arena, buddy) || self::power(&arena, buddy) != power {
                break;
            }
            unlink_free(&mut arena, buddy);
            block = block.min(buddy);
            power += 1;
        }
        push_free(&mut arena, block, power);

        let available = arena.available() + released;
        arena.set_available(available);

        self.log
            .memory_map("deallocate", || blocks_info(&arena))
            .information(format_args!("deallocate : available size is {} bytes.", available))
            .trace(format_args!("deallocate : finished."));

        Ok(())
    }
}

impl ArenaAllocator for Buddies {
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

    fn coalescing(&self) -> Coalescing {
        Coalescing::Buddy
    }
}
