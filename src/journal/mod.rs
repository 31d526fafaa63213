//! # Write-Ahead Page Journal
//!
//! The durability and crash-recovery backbone of the engine: an
//! append-only, segmented on-disk log of modified page images plus the
//! catalog and checkpoint metadata needed to interpret them, together with
//! the machinery that later *copies back* those images into their home
//! volumes so segments can be reclaimed.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Journal (manager.rs)                     │
//! │   write_page / write_checkpoint / read_page / copy_back      │
//! ├──────────────┬──────────────┬────────────────┬───────────────┤
//! │ Record Codec │ Handle       │  Page Index    │ I/O Rate      │
//! │ (record.rs)  │ Registry     │ (page_index.rs)│ Meter         │
//! │              │ (handles.rs) │                │ (io_rate.rs)  │
//! ├──────────────┴──────────────┴────────────────┴───────────────┤
//! │               Segment Writer (segment.rs)                    │
//! │        mapped write window, rollover, truncation             │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Recovery Engine (recovery.rs)  │  Workers (copier, flusher) │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-Disk Layout
//!
//! One directory per journal, holding nothing but segment files named
//! `journal.<16-digit generation>`. Generations increase strictly; the file
//! name alone carries segment order. Each segment is a contiguous prefix of
//! records and is self-describing: every volume or tree handle a record
//! references was introduced by an IV or IT record earlier in the *same*
//! segment, which is what allows deleting older segments without
//! invalidating newer ones.
//!
//! ## Data Flow
//!
//! Mutators append PA records through the record codec into the segment
//! writer's mapped window and update the page index with the record's
//! address. The flush worker periodically forces the window; checkpoint
//! records force before and after themselves so a recovered checkpoint
//! implies durability of everything preceding it. The copy-back worker
//! drains index entries older than the last checkpoint to their home
//! volumes and deletes segments nothing references anymore. On startup the
//! recovery engine rebuilds all of this from the segment files alone.

mod copier;
mod flusher;
mod handles;
mod io_rate;
mod manager;
mod page_index;
mod record;
mod recovery;
mod segment;
mod types;

pub use manager::{Journal, PageImage};
pub use record::{
    CP_OVERHEAD, IT_MAX_LENGTH, IT_OVERHEAD, IV_MAX_LENGTH, IV_OVERHEAD, PA_OVERHEAD,
    RECORD_OVERHEAD, REC_CP, REC_IT, REC_IV, REC_PA, REC_RR, REC_TC, REC_TJ, REC_TS, REC_WR,
};
pub use types::{
    file_generation, list_segment_files, segment_file_name, segment_file_path, Checkpoint,
    FileAddress, TreeDescriptor, VolumeDescriptor, VolumePage,
};
