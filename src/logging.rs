//! Narration through an optional logger collaborator.
//!
//! Allocators never log through the global `log` macros: each instance holds
//! its own (optional) [`log::Log`] implementation, so nested allocators can
//! narrate to different sinks, and an allocator without a logger formats
//! nothing at all.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use log::{Level, Log, Metadata, Record};

use crate::blocks::{self, BlockInfo};

/// A shared handle to a logger collaborator.
pub type LoggerRef = Arc<dyn Log>;

/// Wraps an optional logger and tags every record with the allocator's name.
///
/// Every method returns `&Self`, so messages can be chained:
///
/// ```
/// # use arena_alloc::logging::Narrator;
/// let narrator = Narrator::new(None, "example");
/// narrator
///     .trace(format_args!("called"))
///     .debug(format_args!("nothing to do"));
/// ```
#[derive(Clone)]
pub struct Narrator {
    logger: Option<LoggerRef>,
    target: &'static str,
}

impl fmt::Debug for Narrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Narrator")
            .field("target", &self.target)
            .field("attached", &self.logger.is_some())
            .finish()
    }
}

impl Narrator {
    pub fn new(logger: Option<LoggerRef>, target: &'static str) -> Self {
        Narrator { logger, target }
    }

    /// Whether a message at `level` would reach the logger.
    pub fn enabled(&self, level: Level) -> bool {
        match &self.logger {
            None => false,
            Some(logger) => {
                let metadata = Metadata::builder().level(level).target(self.target).build();
                logger.enabled(&metadata)
            }
        }
    }

    fn emit(&self, level: Level, args: fmt::Arguments<'_>) -> &Self {
        if let Some(logger) = &self.logger {
            let record = Record::builder()
                .args(args)
                .level(level)
                .target(self.target)
                .build();
            if logger.enabled(record.metadata()) {
                logger.log(&record);
            }
        }
        self
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) -> &Self {
        self.emit(Level::Trace, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) -> &Self {
        self.emit(Level::Debug, args)
    }

    pub fn information(&self, args: fmt::Arguments<'_>) -> &Self {
        self.emit(Level::Info, args)
    }

    pub fn warning(&self, args: fmt::Arguments<'_>) -> &Self {
        self.emit(Level::Warn, args)
    }

    pub fn error(&self, args: fmt::Arguments<'_>) -> &Self {
        self.emit(Level::Error, args)
    }

    /// Log the arena's block layout at debug level. `blocks` only runs when
    /// the record would be kept.
    pub fn memory_map<F>(&self, context: &str, blocks: F) -> &Self
    where
        F: FnOnce() -> Vec<BlockInfo>,
    {
        if self.enabled(Level::Debug) {
            let map = blocks::memory_map(&blocks());
            self.debug(format_args!("{} : memory map: {}", context, map));
        }
        self
    }

    /// Log a released payload's contents at debug level.
    pub fn released(&self, context: &str, size: usize, overhead: usize, data: &[u8]) -> &Self {
        if self.enabled(Level::Debug) {
            let dump = block_dump(data);
            let with = if dump.is_empty() { "" } else { " with data:" };
            self.debug(format_args!(
                "{} : deallocated {}(+{}) bytes{}{}.",
                context, size, overhead, with, dump
            ));
        }
        self
    }
}

/// Render `data` as space-separated hex bytes, e.g. `" 0x00 0x2a"`.
pub fn block_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 5);
    for byte in data {
        // Writing to a String cannot fail.
        let _ = write!(out, " 0x{:02x}", byte);
    }
    out
}
