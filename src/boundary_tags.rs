//! An arena allocator that only tracks occupied blocks.
//!
//! Occupied blocks form a doubly linked list in address order. Free space is
//! never written down anywhere: it is whatever lies between two consecutive
//! occupied blocks (or between one and an end of the arena). Freeing a block
//! only has to unlink it, and the gap it leaves is automatically as large as
//! it can be.
//!
//! Block layout, every field one word:
//!
//! ```text
//! +------+-------+-------+------+------+---------
//! | size | flags | owner | prev | next | payload
//! +------+-------+-------+------+------+---------
//! ```
//!
//! Unlike the other strategies, `size` is the payload size only.

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
const OWNER: usize = 2 * WORD;
const PREV: usize = 3 * WORD;
const NEXT: usize = 4 * WORD;

const META: usize = 5 * WORD;

const OCCUPIED: usize = 1;

const_assert!(META % WORD == 0);

fn size(arena: &Arena, block: usize) -> usize {
    arena.word(block + SIZE)
}

fn prev(arena: &Arena, block: usize) -> usize {
    arena.word(block + PREV)
}

fn next(arena: &Arena, block: usize) -> usize {
    arena.word(block + NEXT)
}

/// First byte after `block`.
fn end_of(arena: &Arena, block: usize) -> usize {
    block + META + size(arena, block)
}

/// Where the gap following `block` (or preceding the first block, for
/// `NIL`) ends.
fn gap_end(arena: &Arena, block: usize) -> usize {
    let following = if block == NIL {
        arena.root()
    } else {
        next(arena, block)
    };
    if following == NIL {
        arena.data_end()
    } else {
        following
    }
}

/// Where the gap following `block` (or preceding the first block, for
/// `NIL`) starts.
fn gap_start(arena: &Arena, block: usize) -> usize {
    if block == NIL {
        arena.data_start()
    } else {
        end_of(arena, block)
    }
}

fn blocks_info(arena: &Arena) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();

    let leading = gap_end(arena, NIL) - arena.data_start();
    if leading > 0 {
        blocks.push(BlockInfo::free(leading));
    }

    let mut block = arena.root();
    while block != NIL {
        blocks.push(BlockInfo::occupied(META + size(arena, block)));
        let gap = gap_end(arena, block) - end_of(arena, block);
        if gap > 0 {
            blocks.push(BlockInfo::free(gap));
        }
        block = next(arena, block);
    }

    blocks
}

/// An arena allocator that infers free space from the gaps between
/// occupied blocks.
pub struct BoundaryTags {
    arena: Mutex<Arena>,
    log: Narrator,
}

impl BoundaryTags {
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

        // No occupied blocks yet: the root stays nil.
        let arena = Arena::acquire(capacity, config.fit_mode, config.parent, log.clone())
            .map_err(|e| {
                log.error(format_args!("new({}) : cannot acquire arena: {}.", capacity, e));
                e
            })?;

        log.trace(format_args!("new({}) : finished.", capacity));
        Ok(BoundaryTags {
            arena: Mutex::new(arena),
            log,
        })
    }

    fn is_issued(arena: &Arena, block: usize) -> bool {
        (block - arena.data_start()) % WORD == 0
            && arena.word(block + FLAGS) & OCCUPIED != 0
            && arena.word(block + OWNER) == arena.owner()
            && size(arena, block)
                .checked_add(block + META)
                .map_or(false, |end| end <= arena.data_end())
    }
}

impl Allocator for BoundaryTags {
    fn allocate(&self, value_size: usize, values_count: usize) -> Result<NonNull<u8>> {
        let mut arena = self.arena.lock();
        self.log
            .trace(format_args!("allocate : called."))
            .debug(format_args!(
                "allocate : value_size = {}, values_count = {}.",
                value_size, values_count
            ));

        let mut requested = requested_size(value_size, values_count)?;
        let needed = requested.checked_add(META).ok_or(Error::OutOfMemory { requested })?;

        // Candidates are identified by the occupied block preceding the gap.
        let mut selector = FitSelector::new(arena.fit_mode(), needed);
        let mut before = NIL;
        loop {
            let gap = gap_end(&arena, before) - gap_start(&arena, before);
            if selector.offer(before, gap) {
                break;
            }
            before = if before == NIL {
                arena.root()
            } else {
                next(&arena, before)
            };
            if before == NIL {
                break;
            }
        }

        let (before, gap) = match selector.finish() {
            Some(found) => found,
            None => {
                self.log.error(format_args!(
                    "allocate : no space to allocate requested {} bytes.",
                    requested
                ));
                return Err(Error::OutOfMemory { requested });
            }
        };

        let leftover = gap - needed;
        if leftover > 0 && leftover < META {
            self.log.warning(format_args!(
                "allocate : request of {} bytes was enlarged to {} bytes.",
                requested,
                gap - META
            ));
            requested = gap - META;
        }

        let block = gap_start(&arena, before);
        let after = if before == NIL {
            arena.root()
        } else {
            next(&arena, before)
        };

        let owner = arena.owner();
        arena.set_word(block + SIZE, requested);
        arena.set_word(block + FLAGS, OCCUPIED);
        arena.set_word(block + OWNER, owner);
        arena.set_word(block + PREV, before);
        arena.set_word(block + NEXT, after);

        if before == NIL {
            arena.set_root(block);
        } else {
            arena.set_word(before + NEXT, block);
        }
        if after != NIL {
            arena.set_word(after + PREV, block);
        }

        let available = arena.available() - (requested + META);
        arena.set_available(available);

        self.log
            .debug(format_args!(
                "allocate : allocated {}(+{}) bytes.",
                requested, META
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
            block_size,
            META,
            arena.region(block + META, end_of(&arena, block)),
        );

        let before = prev(&arena, block);
        let after = next(&arena, block);
        if before == NIL {
            arena.set_root(after);
        } else {
            arena.set_word(before + NEXT, after);
        }
        if after != NIL {
            arena.set_word(after + PREV, before);
        }
        arena.set_word(block + FLAGS, 0);
        arena.set_word(block + OWNER, 0);

        let available = arena.available() + block_size + META;
        arena.set_available(available);

        self.log
            .memory_map("deallocate", || blocks_info(&arena))
            .information(format_args!("deallocate : available size is {} bytes.", available))
            .trace(format_args!("deallocate : finished."));

        Ok(())
    }
}

impl ArenaAllocator for BoundaryTags {
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
