//! # Journal Configuration
//!
//! All numeric defaults live in [`constants`] with their interdependencies
//! documented there. [`JournalConfig`] bundles the per-instance options: the
//! journal directory plus the sizes, intervals and pacing knobs a deployment
//! may override before opening the journal.
//!
//! The intervals, urgency threshold, pacing bounds and the copier timestamp
//! limit can also be changed at runtime through the setters on
//! [`Journal`](crate::Journal); the sizes are fixed for the lifetime of the
//! instance.

pub mod constants;
pub use constants::*;

use std::path::PathBuf;

/// Options for one journal instance.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Directory holding the segment files. Created on open if absent.
    pub journal_path: PathBuf,
    /// Size at which the active segment rolls over.
    pub maximum_file_size: u64,
    /// Size of the mapped write window. Recovery maps read windows of the
    /// same size, so every record must fit in one window.
    pub write_buffer_size: usize,
    /// Initial capacity of the copy-back scratch buffer.
    pub read_buffer_size: usize,
    /// Millis between background forces of the write window.
    pub flush_interval_ms: u64,
    /// Millis between copy-back cycles.
    pub copier_interval_ms: u64,
    /// Urgency a copy-back cycle must exceed before it runs.
    pub minimum_urgency: i32,
    /// Clamp floor for the per-page copy-back sleep.
    pub io_rate_min: i32,
    /// Clamp ceiling for the per-page copy-back sleep.
    pub io_rate_max: i32,
    /// Scale factor converting the clamped rate into sleep millis.
    pub io_rate_sleep_multiplier: f32,
    /// Upper bound timestamp for copy-back candidates.
    pub copier_timestamp_limit: i64,
    /// Hard pause of the copy-back worker.
    pub suspend_copying: bool,
    /// Divisor applied to the page index size when computing urgency.
    pub page_index_size_base: usize,
}

impl JournalConfig {
    /// A configuration with every option at its default, rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            journal_path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            journal_path: PathBuf::new(),
            maximum_file_size: DEFAULT_SEGMENT_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            copier_interval_ms: DEFAULT_COPIER_INTERVAL_MS,
            minimum_urgency: DEFAULT_MINIMUM_URGENCY,
            io_rate_min: DEFAULT_IO_RATE_MIN,
            io_rate_max: DEFAULT_IO_RATE_MAX,
            io_rate_sleep_multiplier: DEFAULT_IO_RATE_SLEEP_MULTIPLIER,
            copier_timestamp_limit: i64::MAX,
            suspend_copying: false,
            page_index_size_base: DEFAULT_PAGE_INDEX_SIZE_BASE,
        }
    }
}
