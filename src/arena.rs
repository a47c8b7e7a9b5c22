//! The arena: one contiguous buffer, its header, and checked accessors.
//!
//! All bookkeeping lives inside the buffer. Fields are read and written
//! through fixed-offset accessors, and every link between blocks is an
//! offset from the start of the arena, never a pointer. Offset `0` is the
//! arena header itself, so it doubles as the nil link.
//!
//! Arena layout:
//!
//! ```text
//! +----------+-------+-----------+-----------+-------+-------------------+
//! | fit mode | total | available | free root | owner | data (total bytes) |
//! +----------+-------+-----------+-----------+-------+-------------------+
//!  one word each                                      ^ HEADER_SIZE
//! ```

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::const_assert;

use crate::allocator::Allocator;
use crate::error::{Error, Result};
use crate::fit::FitMode;
use crate::logging::{LoggerRef, Narrator};

/// Size of every header field.
pub(crate) const WORD: usize = core::mem::size_of::<usize>();

/// The nil offset.
pub(crate) const NIL: usize = 0;

/// Heap-sourced arenas are aligned to 16 bytes. Every header is a whole
/// number of words, so payloads come out word aligned.
pub(crate) const ARENA_ALIGN: usize = 16;

const FIT_MODE: usize = 0;
const TOTAL: usize = WORD;
const AVAILABLE: usize = 2 * WORD;
const FREE_ROOT: usize = 3 * WORD;
const OWNER: usize = 4 * WORD;

/// Size of the arena header; the data region starts here.
pub(crate) const HEADER_SIZE: usize = 5 * WORD;

const_assert!(HEADER_SIZE % WORD == 0);
const_assert!(ARENA_ALIGN % WORD == 0);

/// Source of process-unique owner ids. Zero is never issued, so a zeroed
/// block header never matches a live allocator.
static NEXT_OWNER: AtomicUsize = AtomicUsize::new(1);

/// Odd, so multiplying by it is a bijection on `usize`.
const OWNER_SCATTER: usize = 0x9e37_79b9_7f4a_7c15_u64 as usize;

const_assert!(OWNER_SCATTER % 2 == 1);

/// A fresh process-unique owner id.
///
/// Ids are scattered over the whole word so they do not look like the sizes
/// and offsets stored around them.
pub(crate) fn next_owner_id() -> usize {
    NEXT_OWNER
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_mul(OWNER_SCATTER)
}

/// The smallest multiple of `step` that is at least `value`, or `None` if
/// it does not fit in a `usize`.
pub(crate) fn round_up(value: usize, step: usize) -> Option<usize> {
    Some(value.checked_add(step - 1)? / step * step)
}

/// `value_size * values_count`, rounded up to a whole word.
///
/// Overflow is reported as exhaustion: no arena can hold such a request.
pub(crate) fn requested_size(value_size: usize, values_count: usize) -> Result<usize> {
    value_size
        .checked_mul(values_count)
        .and_then(|size| round_up(size, WORD))
        .ok_or(Error::OutOfMemory {
            requested: usize::MAX,
        })
}

/// Collaborators and initial policy for a new arena allocator.
#[derive(Clone, Default)]
pub struct ArenaConfig {
    pub(crate) parent: Option<Arc<dyn Allocator>>,
    pub(crate) logger: Option<LoggerRef>,
    pub(crate) fit_mode: FitMode,
}

impl fmt::Debug for ArenaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArenaConfig")
            .field("parent", &self.parent.is_some())
            .field("logger", &self.logger.is_some())
            .field("fit_mode", &self.fit_mode)
            .finish()
    }
}

impl ArenaConfig {
    /// Source the arena from `parent` instead of the process heap. The
    /// arena is handed back to `parent` when the allocator is dropped.
    pub fn with_parent(mut self, parent: Arc<dyn Allocator>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_logger(mut self, logger: LoggerRef) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_fit_mode(mut self, fit_mode: FitMode) -> Self {
        self.fit_mode = fit_mode;
        self
    }
}

enum Source {
    Heap(Layout),
    Parent(Arc<dyn Allocator>),
}

/// An exclusively owned, zero-initialised byte buffer with an arena header.
///
/// Payloads handed out to callers live inside the buffer and may be written
/// concurrently, so accessors only ever touch the bytes they name; nothing
/// borrows the buffer as a whole.
pub(crate) struct Arena {
    base: NonNull<u8>,
    len: usize,
    source: Source,
    log: Narrator,
}

// The arena exclusively owns its buffer; the parent (if any) is itself Send.
unsafe impl Send for Arena {}

impl Drop for Arena {
    fn drop(&mut self) {
        match &self.source {
            Source::Heap(layout) => unsafe { dealloc(self.base.as_ptr(), *layout) },
            Source::Parent(parent) => {
                if let Err(e) = parent.deallocate(self.base.as_ptr()) {
                    self.log.error(format_args!(
                        "drop : parent rejected the arena of {} bytes: {}.",
                        self.len, e
                    ));
                }
            }
        }
    }
}

impl Arena {
    /// Acquire a buffer for `capacity` bytes of data plus the header, and
    /// write the header.
    pub fn acquire(
        capacity: usize,
        fit_mode: FitMode,
        parent: Option<Arc<dyn Allocator>>,
        log: Narrator,
    ) -> Result<Arena> {
        let len = capacity
            .checked_add(HEADER_SIZE)
            .ok_or(Error::OutOfMemory {
                requested: capacity,
            })?;
        let out_of_memory = Error::OutOfMemory { requested: len };

        let mut arena = match parent {
            None => {
                let layout =
                    Layout::from_size_align(len, ARENA_ALIGN).map_err(|_| out_of_memory)?;
                let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(out_of_memory)?;
                Arena {
                    base,
                    len,
                    source: Source::Heap(layout),
                    log,
                }
            }
            Some(parent) => {
                let base = parent.allocate(len, 1)?;
                unsafe { core::ptr::write_bytes(base.as_ptr(), 0, len) };
                Arena {
                    base,
                    len,
                    source: Source::Parent(parent),
                    log,
                }
            }
        };

        arena.set_word(FIT_MODE, fit_mode.to_word());
        arena.set_word(TOTAL, capacity);
        arena.set_word(AVAILABLE, capacity);
        arena.set_word(FREE_ROOT, NIL);
        arena.set_word(OWNER, next_owner_id());
        Ok(arena)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Address of `len` bytes at `offset`, panicking if they leave the arena.
    fn at(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.len()),
            "{} bytes at offset {} outside arena",
            len,
            offset
        );
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// The bytes `start..end`, which must not belong to a live payload.
    pub fn region(&self, start: usize, end: usize) -> &[u8] {
        let len = end.saturating_sub(start);
        unsafe { core::slice::from_raw_parts(self.at(start, len), len) }
    }

    pub fn word(&self, offset: usize) -> usize {
        unsafe { self.at(offset, WORD).cast::<usize>().read_unaligned() }
    }

    pub fn set_word(&mut self, offset: usize, value: usize) {
        unsafe { self.at(offset, WORD).cast::<usize>().write_unaligned(value) }
    }

    pub fn byte(&self, offset: usize) -> u8 {
        unsafe { self.at(offset, 1).read() }
    }

    pub fn set_byte(&mut self, offset: usize, value: u8) {
        unsafe { self.at(offset, 1).write(value) }
    }

    /// The caller-facing address of the byte at `offset`. A zero-sized
    /// payload at the very end of the arena sits one past its last byte.
    pub fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len, "offset {} outside arena", offset);
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// The offset of the block whose header is `header_size` bytes before
    /// `payload`, if that whole header lies inside the data region.
    pub fn block_offset_of(&self, payload: *mut u8, header_size: usize) -> Option<usize> {
        let offset = (payload as usize)
            .checked_sub(self.base.as_ptr() as usize)?
            .checked_sub(header_size)?;
        (offset >= self.data_start() && offset + header_size <= self.data_end()).then_some(offset)
    }

    pub fn fit_mode(&self) -> FitMode {
        FitMode::from_word(self.word(FIT_MODE))
    }

    pub fn set_fit_mode(&mut self, mode: FitMode) {
        self.set_word(FIT_MODE, mode.to_word());
    }

    pub fn total(&self) -> usize {
        self.word(TOTAL)
    }

    pub fn available(&self) -> usize {
        self.word(AVAILABLE)
    }

    pub fn set_available(&mut self, value: usize) {
        debug_assert!(value <= self.total());
        self.set_word(AVAILABLE, value);
    }

    /// The strategy-specific head of free (or occupied) space.
    pub fn root(&self) -> usize {
        self.word(FREE_ROOT)
    }

    pub fn set_root(&mut self, offset: usize) {
        self.set_word(FREE_ROOT, offset);
    }

    /// The id stamped into every block this arena issues.
    pub fn owner(&self) -> usize {
        self.word(OWNER)
    }

    pub const fn data_start(&self) -> usize {
        HEADER_SIZE
    }

    pub fn data_end(&self) -> usize {
        HEADER_SIZE + self.total()
    }
}
