//! # Copy-Back Worker
//!
//! Moves journalled page images to their home volumes so segments can be
//! reclaimed. Each cycle:
//!
//! 1. Under the monitor, snapshot the candidate entries into a sorted map.
//!    An entry qualifies when its timestamp is below both the last durable
//!    checkpoint and the copier timestamp limit, and it either lives in the
//!    oldest segment or the cycle is urgent. The smallest address skipped
//!    becomes `first_missed`, the reclamation fence.
//! 2. Without the monitor, write each candidate page to its home volume in
//!    `(volume path, page)` order, sleeping between pages according to the
//!    I/O rate meter, then sync every touched volume.
//! 3. Under the monitor again, remove each written entry from the page
//!    index only if its address is unchanged; an entry superseded by a
//!    concurrent append stays and joins the fence.
//! 4. Delete every segment before the fence (never the active one), retire
//!    the active segment when everything drained, and advance the first
//!    generation.
//!
//! A cycle started non-urgent abandons the write pass between pages when
//! the journal closes or copying is suspended; an urgent cycle runs to
//! completion so `copy_back()` callers always observe a finished pass.

use std::collections::BTreeMap;
use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use eyre::Result;
use log::{debug, error, info};

use crate::config::ROLLOVER_THRESHOLD;
use crate::error::corrupt;
use crate::journal::manager::JournalShared;
use crate::journal::types::{list_segment_files, FileAddress, VolumePage};
use crate::volume::Volume;

/// Body of the `journal-copier` thread.
pub(crate) fn copier_loop(shared: Arc<JournalShared>) {
    loop {
        let urgency;
        let minimum_urgency;
        {
            let mut core = shared.core.lock();
            if shared.closed.load(Ordering::Acquire) && !core.copy_fast {
                break;
            }
            let run_immediately =
                core.copy_fast && !shared.suspend_copying.load(Ordering::Acquire);
            if !run_immediately {
                let interval = Duration::from_millis(core.tunables.copier_interval_ms);
                let _ = shared.work_cv.wait_for(&mut core, interval);
            }
            if shared.closed.load(Ordering::Acquire) && !core.copy_fast {
                break;
            }
            urgency = core.urgency();
            minimum_urgency = core.tunables.minimum_urgency;
        }

        if urgency > minimum_urgency && !shared.suspend_copying.load(Ordering::Acquire) {
            shared.copying.store(true, Ordering::Release);
            let result = copier_cycle(&shared);
            shared.copying.store(false, Ordering::Release);
            if let Err(e) = result {
                error!("journal copy-back cycle failed: {:#}", e);
                let mut core = shared.core.lock();
                if core.copy_fast {
                    core.copy_fast = false;
                    shared.work_cv.notify_all();
                }
            }
        }

        if shared.closed.load(Ordering::Acquire) {
            break;
        }
    }
    debug!("journal copier stopped");
}

fn copier_cycle(shared: &JournalShared) -> Result<()> {
    let mut first_missed: Option<FileAddress> = None;
    let mut candidates: BTreeMap<VolumePage, FileAddress> = BTreeMap::new();
    let was_urgent;
    let current_generation;

    {
        let core = shared.core.lock();
        if !core.recovered {
            return Ok(());
        }
        was_urgent = core.copy_fast;
        current_generation = core.writer.current_generation().max(0) as u64;
        let timestamp_bound = core
            .last_valid_checkpoint
            .timestamp
            .min(core.tunables.copier_timestamp_limit);
        let generation_limit = core.first_generation + 1;
        for (page, address) in core.page_index.iter() {
            let in_oldest = address
                .generation()
                .map_or(false, |generation| generation < generation_limit);
            if address.timestamp() < timestamp_bound && (in_oldest || core.copy_fast) {
                candidates.insert(page.clone(), address.clone());
            } else {
                note_miss(&mut first_missed, address);
            }
        }
    }

    let mut touched: Vec<Arc<Volume>> = Vec::new();
    let mut written: Vec<(&VolumePage, &FileAddress)> = Vec::new();
    let mut buf: Vec<u8> = Vec::with_capacity(shared.read_buffer_size);

    for (page, address) in &candidates {
        if (shared.closed.load(Ordering::Acquire) && !was_urgent)
            || shared.suspend_copying.load(Ordering::Acquire)
        {
            // Abandon the pass; unreconciled entries are copied again on a
            // later cycle.
            return Ok(());
        }
        let descriptor = page.descriptor();
        let volume = match shared.volumes.get(descriptor.path()) {
            Some(volume) if !volume.is_closed() => volume,
            _ => {
                // The volume may be reopened later; keep its segments.
                note_miss(&mut first_missed, address);
                continue;
            }
        };
        if volume.id() != descriptor.id() {
            return Err(corrupt(format!(
                "{} does not identify a valid volume at {}",
                descriptor, address
            )));
        }

        let record_page = shared.read_page_buffer(address, &mut buf, false)?;
        if buf.len() != volume.page_size() {
            return Err(corrupt(format!(
                "{} buffer size {} does not match volume page size {} at {}",
                page,
                buf.len(),
                volume.page_size(),
                address
            )));
        }
        if record_page != page.page() {
            return Err(corrupt(format!(
                "{} does not match page address {} found at {}",
                page, record_page, address
            )));
        }

        volume.write_page(page.page(), &buf)?;
        if !touched.iter().any(|t| Arc::ptr_eq(t, &volume)) {
            touched.push(volume.clone());
        }
        written.push((page, address));

        let (rate, minimum, maximum, multiplier) = {
            let mut core = shared.core.lock();
            (
                core.io_rate.charge(0),
                core.tunables.io_rate_min,
                core.tunables.io_rate_max,
                core.tunables.io_rate_sleep_multiplier,
            )
        };
        let paced = if was_urgent {
            minimum
        } else {
            rate.clamp(minimum, maximum)
        };
        let delay = (multiplier * paced as f32) as u64;
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
    }

    for volume in &touched {
        volume.sync()?;
    }

    {
        let mut core = shared.core.lock();
        core.copy_back_count += written.len() as u64;
        for &(page, address) in &written {
            if !core.page_index.remove_if_matches(page, address) {
                // A newer image arrived during the write pass; it stays.
                note_miss(&mut first_missed, address);
            }
        }
    }

    let active = shared.core.lock().writer.file_path().cloned();
    let mut reclaimed = 0usize;
    for file in list_segment_files(&shared.directory)? {
        let before_fence = first_missed
            .as_ref()
            .map_or(true, |missed| file.as_path() < missed.file());
        if before_fence && Some(&file) != active.as_ref() {
            fs::remove_file(&file)?;
            reclaimed += 1;
        }
    }

    let mut retired = None;
    {
        let mut core = shared.core.lock();
        let threshold = if shared.closed.load(Ordering::Acquire) {
            0
        } else {
            ROLLOVER_THRESHOLD
        };
        if first_missed.is_none()
            && core.page_index.is_empty()
            && core.writer.has_window()
            && core.writer.tail() > threshold
        {
            retired = core.writer.file_path().cloned();
            core.rollover()?;
        }
        core.first_generation = match &first_missed {
            None => current_generation,
            Some(missed) => missed.generation().unwrap_or(current_generation),
        };
        if was_urgent {
            core.copy_fast = false;
            shared.work_cv.notify_all();
        }
    }
    if let Some(path) = retired {
        fs::remove_file(&path)?;
        reclaimed += 1;
    }

    if !written.is_empty() || reclaimed > 0 {
        info!(
            "copy-back cycle wrote {} page(s), reclaimed {} segment(s)",
            written.len(),
            reclaimed
        );
    }
    Ok(())
}

fn note_miss(first_missed: &mut Option<FileAddress>, address: &FileAddress) {
    if first_missed
        .as_ref()
        .map_or(true, |missed| address < missed)
    {
        *first_missed = Some(address.clone());
    }
}
