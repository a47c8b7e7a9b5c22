//! An arena allocator indexing free blocks by size in a red-black tree.
//!
//! Every block, free or occupied, sits in one doubly linked list in address
//! order, which makes merging with neighbours constant time. Free blocks are
//! also nodes of a red-black tree keyed by block size (duplicates go right),
//! so a fitting block is found in logarithmic time.
//!
//! ```text
//! occupied: | size | flags | prev | next | owner | payload ...
//! free:     | size | flags | prev | next |   -   | parent | left | right | ...
//! ```
//!
//! `size` covers the whole block, header included. `flags` holds the
//! occupied bit and the node colour. The tree links overlap the payload, so
//! every block is at least `FREE_META` bytes and small requests are enlarged
//! to that.
//!
//! The tree uses `NIL` (offset 0) as its leaves. Nothing is ever written at
//! `NIL`: deletion carries the parent of the replacement node explicitly
//! instead of parking it on a sentinel.

use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::const_assert;

use crate::allocator::{Allocator, ArenaAllocator};
use crate::arena::{requested_size, Arena, ArenaConfig, NIL, WORD};
use crate::blocks::BlockInfo;
use crate::error::{Error, Result};
use crate::fit::FitMode;
use crate::logging::Narrator;

const SIZE: usize = 0;
const FLAGS: usize = WORD;
const PREV: usize = 2 * WORD;
const NEXT: usize = 3 * WORD;
const OWNER: usize = 4 * WORD;
const PARENT: usize = 5 * WORD;
const LEFT: usize = 6 * WORD;
const RIGHT: usize = 7 * WORD;

/// Header of an occupied block.
const META: usize = 5 * WORD;
/// Header of a free block, and so the smallest block there can be.
const FREE_META: usize = 8 * WORD;

const OCCUPIED: usize = 1;
const RED: usize = 2;

const_assert!(FREE_META > META);
const_assert!(FREE_META % WORD == 0);

fn size(arena: &Arena, block: usize) -> usize {
    arena.word(block + SIZE)
}

fn flags(arena: &Arena, block: usize) -> usize {
    arena.word(block + FLAGS)
}

fn is_occupied(arena: &Arena, block: usize) -> bool {
    flags(arena, block) & OCCUPIED != 0
}

fn prev(arena: &Arena, block: usize) -> usize {
    arena.word(block + PREV)
}

fn next(arena: &Arena, block: usize) -> usize {
    arena.word(block + NEXT)
}

fn parent(arena: &Arena, node: usize) -> usize {
    arena.word(node + PARENT)
}

fn left(arena: &Arena, node: usize) -> usize {
    arena.word(node + LEFT)
}

fn right(arena: &Arena, node: usize) -> usize {
    arena.word(node + RIGHT)
}

fn is_red(arena: &Arena, node: usize) -> bool {
    node != NIL && flags(arena, node) & RED != 0
}

fn set_red(arena: &mut Arena, node: usize, red: bool) {
    if node == NIL {
        debug_assert!(!red, "nil leaves are black");
        return;
    }
    let flags = flags(arena, node);
    let flags = if red { flags | RED } else { flags & !RED };
    arena.set_word(node + FLAGS, flags);
}

/// Make `next` follow `block` in the address list.
fn link(arena: &mut Arena, block: usize, next: usize) {
    arena.set_word(block + NEXT, next);
    if next != NIL {
        arena.set_word(next + PREV, block);
    }
}

fn blocks_info(arena: &Arena) -> Vec<BlockInfo> {
    let mut blocks = Vec::new();
    let mut block = arena.data_start();
    while block != NIL {
        blocks.push(BlockInfo {
            size: size(arena, block),
            occupied: is_occupied(arena, block),
        });
        block = next(arena, block);
    }
    blocks
}

// Tree maintenance, after Cormen et al.

fn replace_child(arena: &mut Arena, parent: usize, old: usize, new: usize) {
    if parent == NIL {
        arena.set_root(new);
    } else if left(arena, parent) == old {
        arena.set_word(parent + LEFT, new);
    } else {
        arena.set_word(parent + RIGHT, new);
    }
}

fn rotate_left(arena: &mut Arena, x: usize) {
    let y = right(arena, x);
    let middle = left(arena, y);
    arena.set_word(x + RIGHT, middle);
    if middle != NIL {
        arena.set_word(middle + PARENT, x);
    }
    let above = parent(arena, x);
    arena.set_word(y + PARENT, above);
    replace_child(arena, above, x, y);
    arena.set_word(y + LEFT, x);
    arena.set_word(x + PARENT, y);
}

fn rotate_right(arena: &mut Arena, x: usize) {
    let y = left(arena, x);
    let middle = right(arena, y);
    arena.set_word(x + LEFT, middle);
    if middle != NIL {
        arena.set_word(middle + PARENT, x);
    }
    let above = parent(arena, x);
    arena.set_word(y + PARENT, above);
    replace_child(arena, above, x, y);
    arena.set_word(y + RIGHT, x);
    arena.set_word(x + PARENT, y);
}

fn tree_insert(arena: &mut Arena, node: usize) {
    let key = size(arena, node);

    let mut above = NIL;
    let mut cursor = arena.root();
    while cursor != NIL {
        above = cursor;
        cursor = if key < size(arena, cursor) {
            left(arena, cursor)
        } else {
            right(arena, cursor)
        };
    }

    arena.set_word(node + PARENT, above);
    arena.set_word(node + LEFT, NIL);
    arena.set_word(node + RIGHT, NIL);
    if above == NIL {
        arena.set_root(node);
    } else if key < size(arena, above) {
        arena.set_word(above + LEFT, node);
    } else {
        arena.set_word(above + RIGHT, node);
    }
    set_red(arena, node, true);

    let mut z = node;
    while is_red(arena, parent(arena, z)) {
        // A red parent is never the root, so the grandparent exists.
        let p = parent(arena, z);
        let g = parent(arena, p);
        let p_is_left = p == left(arena, g);
        let uncle = if p_is_left {
            right(arena, g)
        } else {
            left(arena, g)
        };

        if is_red(arena, uncle) {
            set_red(arena, p, false);
            set_red(arena, uncle, false);
            set_red(arena, g, true);
            z = g;
            continue;
        }

        if p_is_left {
            if z == right(arena, p) {
                z = p;
                rotate_left(arena, z);
            }
            let p = parent(arena, z);
            let g = parent(arena, p);
            set_red(arena, p, false);
            set_red(arena, g, true);
            rotate_right(arena, g);
        } else {
            if z == left(arena, p) {
                z = p;
                rotate_right(arena, z);
            }
            let p = parent(arena, z);
            let g = parent(arena, p);
            set_red(arena, p, false);
            set_red(arena, g, true);
            rotate_left(arena, g);
        }
    }

    let root = arena.root();
    set_red(arena, root, false);
}

fn minimum(arena: &Arena, mut node: usize) -> usize {
    while left(arena, node) != NIL {
        node = left(arena, node);
    }
    node
}

/// Put `new` (possibly nil) where `old` hangs in the tree.
fn transplant(arena: &mut Arena, old: usize, new: usize) {
    let above = parent(arena, old);
    replace_child(arena, above, old, new);
    if new != NIL {
        arena.set_word(new + PARENT, above);
    }
}

fn tree_remove(arena: &mut Arena, node: usize) {
    let mut removed_red = is_red(arena, node);
    let x;
    let mut x_parent;

    if left(arena, node) == NIL {
        x = right(arena, node);
        x_parent = parent(arena, node);
        transplant(arena, node, x);
    } else if right(arena, node) == NIL {
        x = left(arena, node);
        x_parent = parent(arena, node);
        transplant(arena, node, x);
    } else {
        let successor = minimum(arena, right(arena, node));
        removed_red = is_red(arena, successor);
        x = right(arena, successor);
        if parent(arena, successor) == node {
            x_parent = successor;
        } else {
            x_parent = parent(arena, successor);
            transplant(arena, successor, x);
            let node_right = right(arena, node);
            arena.set_word(successor + RIGHT, node_right);
            arena.set_word(node_right + PARENT, successor);
        }
        transplant(arena, node, successor);
        let node_left = left(arena, node);
        arena.set_word(successor + LEFT, node_left);
        arena.set_word(node_left + PARENT, successor);
        let node_red = is_red(arena, node);
        set_red(arena, successor, node_red);
    }

    if removed_red {
        return;
    }

    // `x` carries an extra black.
    let mut x = x;
    while x != arena.root() && !is_red(arena, x) {
        if x == left(arena, x_parent) {
            let mut w = right(arena, x_parent);
            if is_red(arena, w) {
                set_red(arena, w, false);
                set_red(arena, x_parent, true);
                rotate_left(arena, x_parent);
                w = right(arena, x_parent);
            }
            if !is_red(arena, left(arena, w)) && !is_red(arena, right(arena, w)) {
                set_red(arena, w, true);
                x = x_parent;
                x_parent = parent(arena, x);
            } else {
                if !is_red(arena, right(arena, w)) {
                    let w_left = left(arena, w);
                    set_red(arena, w_left, false);
                    set_red(arena, w, true);
                    rotate_right(arena, w);
                    w = right(arena, x_parent);
                }
                let parent_red = is_red(arena, x_parent);
                set_red(arena, w, parent_red);
                set_red(arena, x_parent, false);
                let w_right = right(arena, w);
                set_red(arena, w_right, false);
                rotate_left(arena, x_parent);
                x = arena.root();
            }
        } else {
            let mut w = left(arena, x_parent);
            if is_red(arena, w) {
                set_red(arena, w, false);
                set_red(arena, x_parent, true);
                rotate_right(arena, x_parent);
                w = left(arena, x_parent);
            }
            if !is_red(arena, right(arena, w)) && !is_red(arena, left(arena, w)) {
                set_red(arena, w, true);
                x = x_parent;
                x_parent = parent(arena, x);
            } else {
                if !is_red(arena, left(arena, w)) {
                    let w_right = right(arena, w);
                    set_red(arena, w_right, false);
                    set_red(arena, w, true);
                    rotate_left(arena, w);
                    w = left(arena, x_parent);
                }
                let parent_red = is_red(arena, x_parent);
                set_red(arena, w, parent_red);
                set_red(arena, x_parent, false);
                let w_left = left(arena, w);
                set_red(arena, w_left, false);
                rotate_right(arena, x_parent);
                x = arena.root();
            }
        }
    }
    set_red(arena, x, false);
}

/// Find a free block of at least `needed` bytes.
fn search(arena: &Arena, mode: FitMode, needed: usize) -> usize {
    let mut node = arena.root();
    match mode {
        // The first node on the right spine that is large enough.
        FitMode::FirstFit => {
            while node != NIL && size(arena, node) < needed {
                node = right(arena, node);
            }
            node
        }
        // The lower bound of `needed`.
        FitMode::BestFit => {
            let mut best = NIL;
            while node != NIL {
                if size(arena, node) >= needed {
                    best = node;
                    node = left(arena, node);
                } else {
                    node = right(arena, node);
                }
            }
            best
        }
        FitMode::WorstFit => {
            if node == NIL {
                return NIL;
            }
            while right(arena, node) != NIL {
                node = right(arena, node);
            }
            if size(arena, node) >= needed {
                node
            } else {
                NIL
            }
        }
    }
}

/// An arena allocator that finds free blocks through a size-keyed
/// red-black tree.
pub struct RedBlackTree {
    arena: Mutex<Arena>,
    log: Narrator,
}

impl RedBlackTree {
    /// Per-block bookkeeping overhead of an occupied block, in bytes.
    pub const fn block_overhead() -> usize {
        META
    }

    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(capacity, ArenaConfig::default())
    }

    pub fn with_config(capacity: usize, config: ArenaConfig) -> Result<Self> {
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

        let mut arena = Arena::acquire(capacity, config.fit_mode, config.parent, log.clone())
            .map_err(|e| {
                log.error(format_args!("new({}) : cannot acquire arena: {}.", capacity, e));
                e
            })?;
        let first = arena.data_start();
        arena.set_word(first + SIZE, capacity);
        arena.set_word(first + FLAGS, 0);
        arena.set_word(first + PREV, NIL);
        arena.set_word(first + NEXT, NIL);
        tree_insert(&mut arena, first);

        log.trace(format_args!("new({}) : finished.", capacity));
        Ok(RedBlackTree {
            arena: Mutex::new(arena),
            log,
        })
    }

    fn is_issued(arena: &Arena, block: usize) -> bool {
        (block - arena.data_start()) % WORD == 0
            && is_occupied(arena, block)
            && arena.word(block + OWNER) == arena.owner()
            && size(arena, block) >= FREE_META
            && size(arena, block)
                .checked_add(block)
                .map_or(false, |end| end <= arena.data_end())
    }
}

impl Allocator for RedBlackTree {
    fn allocate(&self, value_size: usize, values_count: usize) -> Result<NonNull<u8>> {
        let mut arena = self.arena.lock();
        self.log
            .trace(format_args!("allocate : called."))
            .debug(format_args!(
                "allocate : value_size = {}, values_count = {}.",
                value_size, values_count
            ));

        let requested = requested_size(value_size, values_count)?;
        let needed = requested
            .checked_add(META)
            .ok_or(Error::OutOfMemory { requested })?
            .max(FREE_META);

        let block = search(&arena, arena.fit_mode(), needed);
        if block == NIL {
            self.log.error(format_args!(
                "allocate : no space to allocate requested {} bytes.",
                requested
            ));
            return Err(Error::OutOfMemory { requested });
        }
        tree_remove(&mut arena, block);

        let found = size(&arena, block);
        let leftover = found - needed;
        let granted = if leftover < FREE_META {
            found
        } else {
            let remainder = block + needed;
            let following = next(&arena, block);
            arena.set_word(remainder + SIZE, leftover);
            arena.set_word(remainder + FLAGS, 0);
            arena.set_word(remainder + PREV, block);
            link(&mut arena, remainder, following);
            link(&mut arena, block, remainder);
            arena.set_word(block + SIZE, needed);
            tree_insert(&mut arena, remainder);
            needed
        };
        if granted > requested + META {
            self.log.warning(format_args!(
                "allocate : request of {} bytes was enlarged to {} bytes.",
                requested,
                granted - META
            ));
        }

        let owner = arena.owner();
        arena.set_word(block + FLAGS, OCCUPIED);
        arena.set_word(block + OWNER, owner);

        let available = arena.available() - granted;
        arena.set_available(available);

        self.log
            .debug(format_args!(
                "allocate : allocated {}(+{}) bytes.",
                granted - META,
                META
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

        let mut block = match arena
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

        let released = size(&arena, block);
        self.log.released(
            "deallocate",
            released - META,
            META,
            arena.region(block + META, block + released),
        );

        arena.set_word(block + FLAGS, 0);
        arena.set_word(block + OWNER, 0);

        let following = next(&arena, block);
        if following != NIL && !is_occupied(&arena, following) {
            tree_remove(&mut arena, following);
            let merged = size(&arena, block) + size(&arena, following);
            arena.set_word(block + SIZE, merged);
            let after = next(&arena, following);
            link(&mut arena, block, after);
        }

        let preceding = prev(&arena, block);
        if preceding != NIL && !is_occupied(&arena, preceding) {
            tree_remove(&mut arena, preceding);
            let merged = size(&arena, preceding) + size(&arena, block);
            arena.set_word(preceding + SIZE, merged);
            let after = next(&arena, block);
            link(&mut arena, preceding, after);
            block = preceding;
        }

        tree_insert(&mut arena, block);

        let available = arena.available() + released;
        arena.set_available(available);

        self.log
            .memory_map("deallocate", || blocks_info(&arena))
            .information(format_args!("deallocate : available size is {} bytes.", available))
            .trace(format_args!("deallocate : finished."));

        Ok(())
    }
}

impl ArenaAllocator for RedBlackTree {
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

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::sync::Arc;
    use alloc::vec;
    use log::Level;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use test_log::test;

    use crate::arena::round_up;
    use crate::logging::tests::CapturingLogger;

    fn block(requested: usize) -> usize {
        (round_up(requested, WORD).unwrap() + META).max(FREE_META)
    }

    /// Walk the subtree at `node`, checking the red-black rules, parent
    /// links and key order. Returns the black height and the node count.
    fn check_subtree(arena: &Arena, node: usize, low: usize, high: usize) -> (usize, usize) {
        if node == NIL {
            return (1, 0);
        }
        let key = size(arena, node);
        assert!(!is_occupied(arena, node), "occupied block {} in tree", node);
        assert!(low <= key && key <= high, "key {} outside {}..={}", key, low, high);

        let (l, r) = (left(arena, node), right(arena, node));
        for child in [l, r] {
            if child != NIL {
                assert_eq!(parent(arena, child), node);
                assert!(
                    !(is_red(arena, node) && is_red(arena, child)),
                    "red node {} has a red child",
                    node
                );
            }
        }

        let (left_height, left_count) = check_subtree(arena, l, low, key);
        let (right_height, right_count) = check_subtree(arena, r, key, high);
        assert_eq!(left_height, right_height, "black heights differ under {}", node);

        let own = if is_red(arena, node) { 0 } else { 1 };
        (left_height + own, left_count + right_count + 1)
    }

    fn check_tree(allocator: &RedBlackTree) {
        let arena = allocator.arena.lock();
        let root = arena.root();
        assert!(!is_red(&arena, root));
        if root != NIL {
            assert_eq!(parent(&arena, root), NIL);
        }
        let (_, count) = check_subtree(&arena, root, 0, usize::MAX);
        let free = blocks_info(&arena).iter().filter(|b| !b.occupied).count();
        assert_eq!(count, free);
    }

    #[test]
    fn test_new_arena_is_one_free_block() {
        let allocator = RedBlackTree::new(1024).unwrap();
        assert_eq!(allocator.blocks_info(), vec![BlockInfo::free(1024)]);
        check_tree(&allocator);

        assert!(matches!(
            RedBlackTree::new(FREE_META - 1),
            Err(Error::TooSmall { .. })
        ));
    }

    #[test]
    fn test_split_and_merge() {
        let allocator = RedBlackTree::new(1024).unwrap();
        let a = allocator.allocate(100, 1).unwrap();
        let b = allocator.allocate(8, 3).unwrap();
        let c = allocator.allocate(1, 30).unwrap();
        check_tree(&allocator);

        let used = block(100) + block(24) + block(30);
        assert_eq!(
            allocator.blocks_info(),
            vec![
                BlockInfo::occupied(block(100)),
                BlockInfo::occupied(block(24)),
                BlockInfo::occupied(block(30)),
                BlockInfo::free(1024 - used),
            ]
        );
        assert_eq!(allocator.available_size(), 1024 - used);

        allocator.deallocate(a.as_ptr()).unwrap();
        allocator.deallocate(c.as_ptr()).unwrap();
        check_tree(&allocator);
        assert_eq!(
            allocator.blocks_info(),
            vec![
                BlockInfo::free(block(100)),
                BlockInfo::occupied(block(24)),
                BlockInfo::free(1024 - block(100) - block(24)),
            ]
        );

        // Merges on both sides at once.
        allocator.deallocate(b.as_ptr()).unwrap();
        check_tree(&allocator);
        assert_eq!(allocator.blocks_info(), vec![BlockInfo::free(1024)]);
        assert_eq!(allocator.available_size(), 1024);
    }

    #[test]
    fn test_small_requests_hold_tree_links() {
        let logger = Arc::new(CapturingLogger::default());
        let allocator =
            RedBlackTree::with_config(512, ArenaConfig::default().with_logger(logger.clone()))
                .unwrap();

        let p = allocator.allocate(0, 1).unwrap();
        assert_eq!(allocator.blocks_info()[0], BlockInfo::occupied(FREE_META));
        assert!(logger.contains(Level::Warn, "enlarged"));

        allocator.deallocate(p.as_ptr()).unwrap();
        check_tree(&allocator);
        assert_eq!(allocator.blocks_info(), vec![BlockInfo::free(512)]);
    }

    #[test]
    fn test_small_leftover_enlarges_request() {
        let capacity = block(64) + FREE_META - WORD;
        let allocator = RedBlackTree::new(capacity).unwrap();

        allocator.allocate(64, 1).unwrap();
        assert_eq!(allocator.blocks_info(), vec![BlockInfo::occupied(capacity)]);
        assert_eq!(allocator.available_size(), 0);
        assert_eq!(allocator.arena.lock().root(), NIL);
        assert!(matches!(
            allocator.allocate(0, 0),
            Err(Error::OutOfMemory { .. })
        ));
    }

    fn fragmented(mode: FitMode) -> (RedBlackTree, [NonNull<u8>; 3]) {
        let allocator =
            RedBlackTree::with_config(4096, ArenaConfig::default().with_fit_mode(mode)).unwrap();
        let small = allocator.allocate(48, 1).unwrap();
        allocator.allocate(8, 1).unwrap();
        let large = allocator.allocate(120, 1).unwrap();
        allocator.allocate(8, 1).unwrap();
        let medium = allocator.allocate(80, 1).unwrap();
        allocator.allocate(8, 1).unwrap();
        let rest = allocator.available_size() - META;
        allocator.allocate(rest, 1).unwrap();

        for p in [small, large, medium] {
            allocator.deallocate(p.as_ptr()).unwrap();
        }
        check_tree(&allocator);
        (allocator, [small, large, medium])
    }

    #[test]
    fn test_fit_modes() {
        // The free sizes are small < medium < large; medium ends up as
        // the root.
        let (allocator, [_, _, medium]) = fragmented(FitMode::FirstFit);
        assert_eq!(allocator.allocate(72, 1).unwrap(), medium);
        let (allocator, [_, _, medium]) = fragmented(FitMode::FirstFit);
        assert_eq!(allocator.allocate(40, 1).unwrap(), medium);

        let (allocator, [_, _, medium]) = fragmented(FitMode::BestFit);
        assert_eq!(allocator.allocate(72, 1).unwrap(), medium);
        let (allocator, [small, _, _]) = fragmented(FitMode::BestFit);
        assert_eq!(allocator.allocate(40, 1).unwrap(), small);

        let (allocator, [_, large, _]) = fragmented(FitMode::WorstFit);
        assert_eq!(allocator.allocate(40, 1).unwrap(), large);
        let (allocator, _) = fragmented(FitMode::WorstFit);
        assert!(matches!(
            allocator.allocate(200, 1),
            Err(Error::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_rejects_foreign_and_stale_pointers() {
        let one = RedBlackTree::new(1024).unwrap();
        let two = RedBlackTree::new(1024).unwrap();

        let p = one.allocate(32, 1).unwrap();
        assert!(matches!(
            two.deallocate(p.as_ptr()),
            Err(Error::ForeignPointer { .. })
        ));
        assert!(matches!(
            one.deallocate(p.as_ptr().wrapping_add(WORD)),
            Err(Error::ForeignPointer { .. })
        ));
        one.deallocate(p.as_ptr()).unwrap();
        assert!(matches!(
            one.deallocate(p.as_ptr()),
            Err(Error::ForeignPointer { .. })
        ));
        assert_eq!(one.deallocate(core::ptr::null_mut()), Ok(()));
    }

    #[test]
    fn test_tree_stays_balanced() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let allocator = RedBlackTree::new(1 << 16).unwrap();
        let mut live = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.55) {
                let size = rng.gen_range(0..512);
                if let Ok(p) = allocator.allocate(size, 1) {
                    live.push(p);
                }
            } else {
                let ix = rng.gen_range(0..live.len());
                let p: NonNull<u8> = live.swap_remove(ix);
                allocator.deallocate(p.as_ptr()).unwrap();
            }

            check_tree(&allocator);
            let (validity, stats) = allocator.stats();
            assert!(validity.is_valid(), "{:?}", validity);
            assert_eq!(stats.total(), 1 << 16);
            assert_eq!(stats.free_size, allocator.available_size());
        }

        for p in live {
            allocator.deallocate(p.as_ptr()).unwrap();
        }
        assert_eq!(allocator.blocks_info(), vec![BlockInfo::free(1 << 16)]);
    }
}
