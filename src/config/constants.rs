//! # Journal Configuration Constants
//!
//! This module centralizes the tuning constants for the journal, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! DEFAULT_WRITE_BUFFER_SIZE (4 MiB)
//!       │
//!       ├─> MINIMUM_SEGMENT_SIZE (must be >= one full write window, or the
//!       │     segment writer would roll over before mapping a single window)
//!       │
//!       └─> recovery read windows (recovery maps segments in windows no
//!             larger than the write window, so any record the writer could
//!             produce fits in one recovery window)
//!
//! MAXIMUM_PAGE_SIZE (64 KiB)
//!       │
//!       └─> largest valid PA record = MAXIMUM_PAGE_SIZE + PA overhead.
//!             Recovery rejects PA records claiming more than this.
//!
//! IO_RATE_INTERVAL_NANOS (100 ms)
//!       │
//!       ├─> IO_RATE_DECAY (0.66 per interval)
//!       │
//!       └─> IO_RATE_NORMALIZE (100/27): at a steady rate of N charges per
//!             second the decayed counter converges to 0.27 * N, so the
//!             normalized reading converges to N.
//! ```
//!
//! ## Copy-Back Pacing
//!
//! The copier sleeps `io_rate_sleep_multiplier * clamp(rate, min, max)`
//! milliseconds between pages. `DEFAULT_IO_RATE_MIN`/`MAX` bound that sleep
//! so an idle system still yields a little and a busy system never stalls a
//! page for more than ~50 ms with the default multiplier.

/// One gibibyte, the unit the segment size limits are expressed in.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Default size at which the active segment rolls over.
pub const DEFAULT_SEGMENT_SIZE: u64 = GIB;

/// Smallest supported rollover size.
pub const MINIMUM_SEGMENT_SIZE: u64 = GIB / 64;

/// Largest supported rollover size.
pub const MAXIMUM_SEGMENT_SIZE: u64 = GIB * 64;

/// Tail size above which an otherwise idle copier cycle retires the active
/// segment. Dropped to zero while the journal is closing so the final cycle
/// can reclaim everything.
pub const ROLLOVER_THRESHOLD: u64 = 1024 * 1024;

/// Default size of the mapped write window.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Default size of the copy-back scratch buffer.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Millis between background forces of the write window.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;

/// Millis between copy-back cycles.
pub const DEFAULT_COPIER_INTERVAL_MS: u64 = 1000;

/// Largest page image a volume may present to the journal. PA records
/// claiming more than this plus the record overhead are corrupt.
pub const MAXIMUM_PAGE_SIZE: usize = 64 * 1024;

/// Longest volume path or tree name an identification record may carry.
pub const MAXIMUM_NAME_LENGTH: usize = 2048;

/// Capacity bound on each direction of the handle registry. Reaching it
/// clears both maps of the affected kind so the next reference re-emits its
/// identification record.
pub const MAXIMUM_MAPPED_HANDLES: usize = 4096;

/// Divisor applied to the page index size when computing copy-back urgency.
pub const DEFAULT_PAGE_INDEX_SIZE_BASE: usize = 1000;

/// Urgency a copy-back cycle must exceed before it runs.
pub const DEFAULT_MINIMUM_URGENCY: i32 = 2;

/// Length of one I/O rate meter interval.
pub const IO_RATE_INTERVAL_NANOS: u64 = 100_000_000;

/// Decay applied to the raw I/O counter once per elapsed interval.
pub const IO_RATE_DECAY: f32 = 0.66;

/// Converts the decayed counter into an operations-per-second estimate.
pub const IO_RATE_NORMALIZE: f32 = 100.0 / 27.0;

/// Idle intervals after which the meter resets to zero instead of decaying.
pub const IO_RATE_IDLE_INTERVALS: u64 = 24;

/// Default clamp floor for the per-page copy-back sleep.
pub const DEFAULT_IO_RATE_MIN: i32 = 2;

/// Default clamp ceiling for the per-page copy-back sleep.
pub const DEFAULT_IO_RATE_MAX: i32 = 100;

/// Default scale factor converting the clamped rate into sleep millis.
pub const DEFAULT_IO_RATE_SLEEP_MULTIPLIER: f32 = 0.5;

/// Stem of every segment file name. Segments are `journal.<generation>`
/// with the generation zero-padded to [`GENERATION_DIGITS`] digits.
pub const SEGMENT_FILE_STEM: &str = "journal";

/// Width of the zero-padded generation suffix on segment file names.
pub const GENERATION_DIGITS: usize = 16;

const _: () = assert!(
    MINIMUM_SEGMENT_SIZE >= DEFAULT_WRITE_BUFFER_SIZE as u64,
    "a segment must hold at least one full write window"
);

const _: () = assert!(
    DEFAULT_WRITE_BUFFER_SIZE > MAXIMUM_PAGE_SIZE,
    "the write window must fit the largest possible page record"
);
