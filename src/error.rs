//! The error taxonomy shared by every allocator in this crate.
//!
//! Callers can stay strategy-agnostic: all strategies report the same three
//! kinds of failure through [`Error`].

/// Errors returned by allocator construction, allocation and deallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The requested arena capacity cannot hold even one block.
    ///
    /// Raised only at construction time.
    #[error("arena capacity of {requested} bytes is too small, minimum is {minimum} bytes")]
    TooSmall { requested: usize, minimum: usize },

    /// No free block satisfies the request under the active fit mode.
    ///
    /// This is an expected condition: the caller may retry with a different
    /// allocator or fail its own request.
    #[error("no free block can hold {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The region was not issued by this allocator, or was already released.
    ///
    /// This is a programming error in the caller.
    #[error("attempt to deallocate memory at {address:#x} not owned by this allocator")]
    ForeignPointer { address: usize },
}

impl Error {
    /// Whether the caller can reasonably recover from this error, e.g. by
    /// falling back to another allocator.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}

pub type Result<T> = core::result::Result<T, Error>;
