//! # Burrow Journal
//!
//! The write-ahead page journal of the Burrow embedded B-Tree storage
//! engine. The journal records images of modified database pages together
//! with catalog and checkpoint metadata in an append-only, segmented
//! on-disk log, recovers that state after a crash, and copies page images
//! back into their home volumes in the background so journal segments can
//! be reclaimed.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use burrow_journal::{Checkpoint, Journal, JournalConfig, PageImage};
//! use burrow_journal::volume::{Volume, VolumeRegistry};
//!
//! let volumes = Arc::new(VolumeRegistry::new());
//! let volume = Volume::create("./data/accounts.vol", 1, 16384)?;
//! volumes.register(volume.clone());
//!
//! let journal = Journal::open(JournalConfig::new("./journal"), volumes)?;
//! journal.recover()?;
//! journal.start_workers()?;
//!
//! journal.write_page_to_journal(&PageImage {
//!     volume: &volume,
//!     page_address: 7,
//!     timestamp: 42,
//!     transient: false,
//!     bytes: &page,
//!     left_size: 0,
//!     right_size: 0,
//! })?;
//! journal.write_checkpoint_to_journal(Checkpoint::new(43, now_millis))?;
//!
//! journal.close()?;
//! ```
//!
//! ## Crate Layout
//!
//! - [`journal`]: the journal manager and its parts (record codec, segment
//!   writer, handle registry, page index, recovery engine, background
//!   workers, I/O rate meter)
//! - [`volume`]: the narrow home-volume interface the copy-back worker and
//!   the engine share
//! - [`config`]: tuning constants and the per-instance [`JournalConfig`]
//! - [`JournalError`]: the root-cause error kinds
//!
//! ## Durability Model
//!
//! Appended records become durable when the mapped write window is forced.
//! A checkpoint record forces everything before it and then itself, so
//! recovery trusts exactly the page images covered by the newest recovered
//! checkpoint: anything journalled after it is discarded, and a torn tail
//! only marks the journal dirty from that point instead of failing
//! startup.

pub mod config;
mod error;
pub mod journal;
pub mod volume;

pub use config::JournalConfig;
pub use error::JournalError;
pub use journal::{Checkpoint, FileAddress, Journal, PageImage, TreeDescriptor, VolumePage};
