//! Strategy-independent views of an arena's block layout.

use alloc::string::String;
use core::fmt::{self, Write};

/// One entry of an arena's left-to-right block listing.
///
/// `size` always includes the block's own header, so the sizes of a full
/// listing add up to the arena's data capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub size: usize,
    pub occupied: bool,
}

impl BlockInfo {
    pub const fn free(size: usize) -> Self {
        BlockInfo {
            size,
            occupied: false,
        }
    }

    pub const fn occupied(size: usize) -> Self {
        BlockInfo {
            size,
            occupied: true,
        }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.occupied { "occup" } else { "avail" };
        write!(f, "{} {}", state, self.size)
    }
}

/// Render a listing as `| occup 48 | avail 4048 |`, used in debug narration.
pub fn memory_map(blocks: &[BlockInfo]) -> String {
    let mut out = String::from("|");
    for block in blocks {
        let _ = write!(out, " {} |", block);
    }
    out
}

/// Which free blocks are expected to have been merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coalescing {
    /// No two address-adjacent blocks may both be free.
    Adjacent,
    /// Every block is a power of two, and no two free buddies of equal size
    /// may remain unmerged.
    Buddy,
}

/// Validity contains a representation of all invalid states found in a block
/// listing.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Free blocks that should have been merged with their neighbour (or
    /// buddy).
    pub adjacents: usize,
    /// Blocks of size zero. These indicate corruption.
    pub empties: usize,
    /// Buddy blocks whose size is not a power of two, or which are not
    /// aligned to their own size.
    pub misshapen: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.adjacents == 0 && self.empties == 0 && self.misshapen == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks in the listing.
    pub length: usize,
    pub occupied_count: usize,
    /// Bytes held by occupied blocks, headers included.
    pub occupied_size: usize,
    pub free_size: usize,
}

impl Stats {
    pub fn total(&self) -> usize {
        self.occupied_size + self.free_size
    }
}

/// Check a listing against a coalescing rule, and total it up.
pub fn check(blocks: &[BlockInfo], rule: Coalescing) -> (Validity, Stats) {
    let mut validity = Validity::default();
    let mut stats = Stats::default();

    let mut offset = 0;
    let mut previous: Option<&BlockInfo> = None;
    for block in blocks {
        if block.size == 0 {
            validity.empties += 1;
        }

        if rule == Coalescing::Buddy
            && (!block.size.is_power_of_two() || offset % block.size.max(1) != 0)
        {
            validity.misshapen += 1;
        }

        if let Some(prev) = previous {
            let unmerged = !prev.occupied
                && !block.occupied
                && match rule {
                    Coalescing::Adjacent => true,
                    // The pair are buddies when they are the two halves of
                    // one block twice their size.
                    Coalescing::Buddy => {
                        prev.size == block.size && (offset - prev.size) % (2 * prev.size) == 0
                    }
                };
            if unmerged {
                validity.adjacents += 1;
            }
        }

        stats.length += 1;
        if block.occupied {
            stats.occupied_count += 1;
            stats.occupied_size += block.size;
        } else {
            stats.free_size += block.size;
        }

        offset += block.size;
        previous = Some(block);
    }

    (validity, stats)
}
