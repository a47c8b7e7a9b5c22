//! An allocator with no arena of its own, forwarding to the process heap.
//!
//! Every region carries a two-word prefix with its size and the issuing
//! allocator's id. Live regions are also registered, so a pointer can be
//! checked before anything behind it is read. This is the usual parent for a
//! tree of nested arena allocators.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use spin::Mutex;
use static_assertions::const_assert;

use crate::allocator::Allocator;
use crate::arena::{next_owner_id, requested_size, ARENA_ALIGN, WORD};
use crate::error::{Error, Result};
use crate::logging::{LoggerRef, Narrator};

const SIZE: usize = 0;
const OWNER: usize = WORD;
const PREFIX: usize = 2 * WORD;

const_assert!(PREFIX <= ARENA_ALIGN);

/// Forwards every request to the global allocator.
pub struct GlobalHeap {
    id: usize,
    // Payload address to payload size.
    live: Mutex<BTreeMap<usize, usize>>,
    log: Narrator,
}

impl Default for GlobalHeap {
    fn default() -> Self {
        GlobalHeap::new()
    }
}

impl GlobalHeap {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_logger(logger: LoggerRef) -> Self {
        Self::build(Some(logger))
    }

    fn build(logger: Option<LoggerRef>) -> Self {
        let log = Narrator::new(logger, module_path!());
        log.trace(format_args!("new : called."));
        let heap = GlobalHeap {
            id: next_owner_id(),
            live: Mutex::new(BTreeMap::new()),
            log,
        };
        heap.log.trace(format_args!("new : finished."));
        heap
    }

    /// Number of regions handed out and not yet returned.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size.checked_add(PREFIX)?, ARENA_ALIGN).ok()
    }

    /// Free the region whose payload is at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by `allocate` on this heap with
    /// `size` payload bytes, and must not be used afterwards.
    unsafe fn release(payload: usize, size: usize) {
        let base = (payload - PREFIX) as *mut u8;
        // The layout was valid when the region was allocated.
        if let Some(layout) = Self::layout(size) {
            dealloc(base, layout);
        }
    }
}

impl Drop for GlobalHeap {
    fn drop(&mut self) {
        let live = core::mem::take(self.live.get_mut());
        if !live.is_empty() {
            self.log.warning(format_args!(
                "drop : releasing {} regions that were never deallocated.",
                live.len()
            ));
        }
        for (payload, size) in live {
            unsafe { Self::release(payload, size) };
        }
    }
}

impl Allocator for GlobalHeap {
    fn allocate(&self, value_size: usize, values_count: usize) -> Result<NonNull<u8>> {
        self.log
            .trace(format_args!("allocate : called."))
            .debug(format_args!(
                "allocate : value_size = {}, values_count = {}.",
                value_size, values_count
            ));

        let size = requested_size(value_size, values_count)?;
        let layout = match Self::layout(size) {
            Some(layout) => layout,
            None => {
                self.log.error(format_args!(
                    "allocate : cannot describe a region of {} bytes.",
                    size
                ));
                return Err(Error::OutOfMemory { requested: size });
            }
        };

        let base = match NonNull::new(unsafe { alloc(layout) }) {
            Some(base) => base,
            None => {
                self.log.error(format_args!(
                    "allocate : bad alloc occurred while trying to allocate {} bytes.",
                    size
                ));
                return Err(Error::OutOfMemory { requested: size });
            }
        };

        unsafe {
            let prefix = base.as_ptr() as *mut usize;
            prefix.add(SIZE / WORD).write(size);
            prefix.add(OWNER / WORD).write(self.id);
        }
        let payload = unsafe { NonNull::new_unchecked(base.as_ptr().add(PREFIX)) };
        self.live.lock().insert(payload.as_ptr() as usize, size);

        self.log
            .debug(format_args!("allocate : allocated {}(+{}) bytes.", size, PREFIX))
            .trace(format_args!("allocate : finished."));
        Ok(payload)
    }

    fn deallocate(&self, at: *mut u8) -> Result<()> {
        self.log.trace(format_args!("deallocate : called."));

        if at.is_null() {
            return Ok(());
        }

        let size = match self.live.lock().remove(&(at as usize)) {
            Some(size) => size,
            None => {
                self.log.error(format_args!(
                    "deallocate : tried to deallocate non-related memory."
                ));
                return Err(Error::ForeignPointer {
                    address: at as usize,
                });
            }
        };

        unsafe {
            let prefix = at.sub(PREFIX) as *const usize;
            debug_assert_eq!(prefix.add(SIZE / WORD).read(), size);
            debug_assert_eq!(prefix.add(OWNER / WORD).read(), self.id);

            let data = core::slice::from_raw_parts(at as *const u8, size);
            self.log.released("deallocate", size, PREFIX, data);

            Self::release(at as usize, size);
        }

        self.log.trace(format_args!("deallocate : finished."));
        Ok(())
    }
}
