//! # Recovery Engine
//!
//! Rebuilds the journal's in-memory state from the segment files on disk.
//! Segments are scanned oldest first (the zero-padded generation suffix
//! makes name order generation order), each through read-only mapped
//! windows no larger than the write window, so every record the writer
//! could have produced fits in one window.
//!
//! ## Checkpoint Merge
//!
//! Page image locations are first collected per page in a reconstruction
//! map. Each CP record then *merges*: for every page, the newest location
//! at or before the checkpoint timestamp is installed in the page index and
//! all locations at or before it are discarded; newer locations wait for a
//! later checkpoint. Locations still in the reconstruction map when the
//! scan ends were never covered by a durable checkpoint and are dropped.
//!
//! ## Dirty Tails
//!
//! A header at the tail of a window whose record does not fit is not an
//! error; the next window is mapped starting at that record. A record that
//! does not fit in the remainder of the *file* is the torn tail of a crash:
//! the scan stops there, records the dirty address, and skips every later
//! segment file. Structural violations (impossible lengths, a handle with
//! no preceding identification record, reserved record kinds) end the scan
//! the same way rather than failing startup: everything merged before the
//! dirty point stays recovered.

use std::fs::File;
use std::path::Path;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use log::{debug, info, warn};
use memmap2::{Advice, MmapOptions};

use crate::config::MAXIMUM_PAGE_SIZE;
use crate::error::illegal_state;
use crate::journal::manager::JournalCore;
use crate::journal::record::{
    self, decode_cp, decode_it, decode_iv, is_reserved_kind, PageRecord, RecordHeader,
    CP_OVERHEAD, IT_MAX_LENGTH, IV_MAX_LENGTH, PA_OVERHEAD, RECORD_OVERHEAD,
};
use crate::journal::types::{
    file_generation, list_segment_files, Checkpoint, FileAddress, TreeDescriptor,
    VolumeDescriptor, VolumePage,
};

/// Locations collected per page before a checkpoint promotes them.
type ReconstructionMap = HashMap<VolumePage, Vec<FileAddress>>;

/// Outcome of scanning one record.
enum ScanStep {
    /// Record consumed; continue at this window offset.
    Advance(usize),
    /// The record does not fit the current window; re-map from its start.
    NeedNextWindow,
    /// The journal was not cleanly closed here; stop scanning all files.
    Dirty(FileAddress),
}

/// Rebuilds the page index, handle registry, generations and last valid
/// checkpoint from the segment files in the journal directory.
pub(crate) fn recover_core(core: &mut JournalCore) -> Result<()> {
    if core.recovered {
        return Err(illegal_state("recovery already completed"));
    }
    core.page_index.clear();
    core.dirty_recovery_address = None;

    let directory = core.directory.clone();
    let files = list_segment_files(&directory)?;
    let mut reconstruction = ReconstructionMap::new();
    let mut first_generation = u64::MAX;
    let mut current_generation: i64 = -1;

    for file in &files {
        if core.dirty_recovery_address.is_some() {
            info!("skipping journal segment {:?} after dirty record", file);
            continue;
        }
        // Each segment re-identifies every handle it uses.
        core.handles.clear();
        match scan_segment_file(core, file, &mut reconstruction) {
            Ok(None) => {}
            Ok(Some(dirty)) => {
                warn!("journal not cleanly closed at {}", dirty);
                core.dirty_recovery_address = Some(dirty);
            }
            Err(e) => {
                warn!("failed to scan journal segment {:?}: {:#}", file, e);
                core.dirty_recovery_address = Some(FileAddress::new(file.clone(), 0, 0));
            }
        }
        if let Some(generation) = file_generation(file) {
            current_generation = current_generation.max(generation as i64);
            first_generation = first_generation.min(generation);
        }
    }

    core.first_generation = if first_generation == u64::MAX {
        0
    } else {
        first_generation
    };
    core.writer.set_current_generation(current_generation);
    core.recovered = true;

    info!(
        "journal recovered: {} segment(s), {} page(s) in index, {}",
        files.len(),
        core.page_index.len(),
        core.last_valid_checkpoint
    );
    if !reconstruction.is_empty() {
        debug!(
            "{} page(s) journalled after the last checkpoint were discarded",
            reconstruction.len()
        );
    }
    Ok(())
}

/// Scans one segment through mapped windows. Returns the dirty address if
/// the segment ends in a torn or invalid record.
fn scan_segment_file(
    core: &mut JournalCore,
    file: &Path,
    reconstruction: &mut ReconstructionMap,
) -> Result<Option<FileAddress>> {
    let handle = File::open(file)
        .wrap_err_with(|| format!("failed to open journal segment {:?}", file))?;
    let size = handle
        .metadata()
        .wrap_err_with(|| format!("failed to stat journal segment {:?}", file))?
        .len();

    let window_size = core.write_buffer_size as u64;
    let mut base: u64 = 0;
    while base < size {
        let len = size.saturating_sub(base).min(window_size) as usize;

        // SAFETY: Mmap::map is unsafe because the file could be modified
        // externally while mapped. This is safe because segment files are
        // written only by this journal, which is not running while recovery
        // scans them.
        let window = unsafe {
            MmapOptions::new()
                .offset(base)
                .len(len)
                .map(&handle)
                .wrap_err_with(|| format!("failed to map journal segment {:?}", file))?
        };
        let _ = window.advise(Advice::Sequential);

        let mut pos = 0usize;
        loop {
            match scan_one_record(core, file, base, &window, pos, reconstruction) {
                ScanStep::Advance(next) => pos = next,
                ScanStep::NeedNextWindow => break,
                ScanStep::Dirty(address) => return Ok(Some(address)),
            }
        }

        if pos == 0 {
            // The record at the window start fits neither this window nor,
            // when the window already reaches it, the end of the file: a
            // torn tail.
            return Ok(Some(FileAddress::new(file.to_path_buf(), base, -1)));
        }
        base += pos as u64;
    }
    Ok(None)
}

fn scan_one_record(
    core: &mut JournalCore,
    file: &Path,
    base: u64,
    window: &[u8],
    pos: usize,
    reconstruction: &mut ReconstructionMap,
) -> ScanStep {
    let remaining = window.len() - pos;
    if remaining < RECORD_OVERHEAD {
        return ScanStep::NeedNextWindow;
    }
    let header = match RecordHeader::parse(&window[pos..]) {
        Ok(header) => header,
        Err(e) => {
            warn!("unreadable record header in {:?} at {}: {:#}", file, base + pos as u64, e);
            return ScanStep::Dirty(FileAddress::new(file.to_path_buf(), base + pos as u64, -1));
        }
    };
    let kind = header.kind();
    let record_size = header.length();
    let timestamp = header.timestamp();
    let address = FileAddress::new(file.to_path_buf(), base + pos as u64, timestamp);

    if record_size < RECORD_OVERHEAD {
        warn!("record at {} claims impossible length {}", address, record_size);
        return ScanStep::Dirty(address);
    }

    let max_length = match kind {
        record::REC_IV => IV_MAX_LENGTH,
        record::REC_IT => IT_MAX_LENGTH,
        record::REC_PA => MAXIMUM_PAGE_SIZE + PA_OVERHEAD,
        record::REC_CP => CP_OVERHEAD,
        _ => {
            // Reserved transaction kinds and unknown tags both mean the
            // journal was not cleanly closed by this implementation.
            if is_reserved_kind(kind) {
                warn!("unsupported record kind {} at {}", kind, address);
            } else {
                warn!("unknown record kind {} at {}", kind, address);
            }
            return ScanStep::Dirty(FileAddress::new(file.to_path_buf(), base + pos as u64, -1));
        }
    };
    if record_size > max_length {
        warn!(
            "record at {} is too long: {} bytes exceeds {}",
            address, record_size, max_length
        );
        return ScanStep::Dirty(address);
    }
    if record_size > remaining {
        return ScanStep::NeedNextWindow;
    }
    let bytes = &window[pos..pos + record_size];

    match kind {
        record::REC_IV => {
            let (handle, volume_id, path) = match decode_iv(bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("corrupt IV record at {}: {:#}", address, e);
                    return ScanStep::Dirty(address);
                }
            };
            core.handles
                .install_volume(VolumeDescriptor::new(path, volume_id), handle);
            debug!("recovered IV {} -> {} at {}", handle, path, address);
        }
        record::REC_IT => {
            let (handle, volume_handle, name) = match decode_it(bytes) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("corrupt IT record at {}: {:#}", address, e);
                    return ScanStep::Dirty(address);
                }
            };
            core.handles
                .install_tree(TreeDescriptor::new(volume_handle, name), handle);
            debug!("recovered IT {} -> {} at {}", handle, name, address);
        }
        record::REC_PA => {
            let pa = match PageRecord::parse(bytes) {
                Ok(pa) => pa,
                Err(e) => {
                    warn!("corrupt PA record at {}: {:#}", address, e);
                    return ScanStep::Dirty(address);
                }
            };
            let descriptor = match core.handles.volume_for_handle(pa.volume_handle) {
                Some(descriptor) => descriptor.clone(),
                None => {
                    warn!(
                        "PA record at {} references volume handle {} with no preceding IV record",
                        address, pa.volume_handle
                    );
                    return ScanStep::Dirty(address);
                }
            };
            // A negative timestamp marks a transient page image that must
            // not survive recovery.
            if timestamp >= 0 {
                reconstruction
                    .entry(VolumePage::new(descriptor, pa.page_address))
                    .or_default()
                    .push(address);
            }
        }
        record::REC_CP => {
            let checkpoint = match decode_cp(bytes) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!("corrupt CP record at {}: {:#}", address, e);
                    return ScanStep::Dirty(address);
                }
            };
            core.last_valid_checkpoint = checkpoint;
            merge_checkpoint(core, checkpoint, reconstruction);
            debug!(
                "recovered {} at {}; page index size {}",
                checkpoint,
                address,
                core.page_index.len()
            );
        }
        _ => unreachable!("filtered above"),
    }
    ScanStep::Advance(pos + record_size)
}

/// Promotes into the page index, for every page, the newest location at or
/// before the checkpoint timestamp, then drops every location the
/// checkpoint covered. Locations after the checkpoint stay behind for a
/// later merge.
fn merge_checkpoint(
    core: &mut JournalCore,
    checkpoint: Checkpoint,
    reconstruction: &mut ReconstructionMap,
) {
    reconstruction.retain(|page, addresses| {
        let latest = addresses
            .iter()
            .filter(|address| address.timestamp() <= checkpoint.timestamp)
            .max_by_key(|address| address.timestamp());
        if let Some(address) = latest {
            core.page_index.insert(page.clone(), address.clone());
        }
        addresses.retain(|address| address.timestamp() > checkpoint.timestamp);
        !addresses.is_empty()
    });
}
