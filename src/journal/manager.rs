//! # Journal Manager
//!
//! The single front door to the journal: mutators record page images and
//! checkpoints through it, the engine's read path asks it for journalled
//! pages, and it owns the two background workers.
//!
//! ## The Monitor
//!
//! One mutex guards everything the workers and mutators share: the segment
//! writer (active file, mapped window, generations), the page index, the
//! handle registry, the read-channel cache, the recovered flag and the
//! runtime tunables. Mutating operations hold it end to end, including
//! their window writes and forces. The copy-back worker deliberately does
//! its home-volume I/O outside the monitor and only re-enters it to
//! snapshot candidates, charge the rate meter and reconcile.
//!
//! ## Lifecycle
//!
//! ```text
//! Journal::open(config, volumes)
//!       │
//!       ├─ recover()            rebuild state from segment files
//!       ├─ start_workers()      spawn journal-flusher + journal-copier
//!       │
//!       │  write_page_to_journal / write_checkpoint_to_journal /
//!       │  read_page_from_journal / handle_for_volume / handle_for_tree /
//!       │  copy_back
//!       │
//!       └─ close()              stop workers, drain the window,
//!                               drop caches, delete drained segments
//! ```
//!
//! `write_checkpoint_to_journal` is a no-op until `recover()` has run;
//! every other operation fails with an illegal-state error before recovery
//! or after close.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::config::JournalConfig;
use crate::error::{corrupt, illegal_state, JournalError};
use crate::journal::copier;
use crate::journal::flusher;
use crate::journal::handles::HandleRegistry;
use crate::journal::io_rate::IoRateMeter;
use crate::journal::page_index::PageIndex;
use crate::journal::record::{self, PageRecord, CP_OVERHEAD, PA_OVERHEAD};
use crate::journal::recovery;
use crate::journal::segment::SegmentWriter;
use crate::journal::types::{
    list_segment_files, Checkpoint, FileAddress, TreeDescriptor, VolumePage,
};
use crate::volume::{Volume, VolumeRegistry};

/// One page image presented for journalling. The live bytes are the
/// `left_size`-byte prefix and `right_size`-byte suffix of `bytes`; the gap
/// between them is known to be zero and is elided from the record. A
/// `left_size` of zero journals the whole buffer verbatim.
#[derive(Debug)]
pub struct PageImage<'a> {
    pub volume: &'a Volume,
    pub page_address: u64,
    pub timestamp: i64,
    /// Transient images are readable from the journal but discarded by
    /// recovery; their PA records carry a timestamp of -1.
    pub transient: bool,
    pub bytes: &'a [u8],
    pub left_size: usize,
    pub right_size: usize,
}

/// Runtime-settable knobs, all guarded by the monitor.
#[derive(Debug)]
pub(crate) struct Tunables {
    pub(crate) flush_interval_ms: u64,
    pub(crate) copier_interval_ms: u64,
    pub(crate) minimum_urgency: i32,
    pub(crate) io_rate_min: i32,
    pub(crate) io_rate_max: i32,
    pub(crate) io_rate_sleep_multiplier: f32,
    pub(crate) copier_timestamp_limit: i64,
    pub(crate) page_index_size_base: usize,
}

/// Everything the monitor guards.
pub(crate) struct JournalCore {
    pub(crate) directory: PathBuf,
    pub(crate) write_buffer_size: usize,
    pub(crate) writer: SegmentWriter,
    pub(crate) page_index: PageIndex,
    pub(crate) handles: HandleRegistry,
    pub(crate) read_files: HashMap<PathBuf, Arc<File>>,
    pub(crate) first_generation: u64,
    pub(crate) recovered: bool,
    pub(crate) last_valid_checkpoint: Checkpoint,
    pub(crate) dirty_recovery_address: Option<FileAddress>,
    pub(crate) io_rate: IoRateMeter,
    pub(crate) journaled_page_count: u64,
    pub(crate) copy_back_count: u64,
    pub(crate) copy_fast: bool,
    pub(crate) tunables: Tunables,
}

impl JournalCore {
    /// Reserves window space, clearing the handle registry if the
    /// reservation rolled the segment over.
    pub(crate) fn reserve(&mut self, size: usize) -> Result<bool> {
        let rolled = self.writer.reserve(size)?;
        if rolled {
            self.handles.clear();
        }
        Ok(rolled)
    }

    /// Rolls the segment over and clears the handle registry so the new
    /// segment re-identifies everything it uses.
    pub(crate) fn rollover(&mut self) -> Result<()> {
        self.writer.rollover()?;
        self.handles.clear();
        Ok(())
    }

    /// Copy-back pressure on a 0 to 10 scale. Urgent demand pins it at 10,
    /// and the lower bound keeps the copier running on every tick.
    pub(crate) fn urgency(&self) -> i32 {
        if self.copy_fast {
            return 10;
        }
        let mut urgency = (self.page_index.len() / self.tunables.page_index_size_base) as i32;
        let current = self.writer.current_generation().max(0) as u64;
        let file_count = current.saturating_sub(self.first_generation) as i32;
        if file_count > 1 {
            urgency += file_count - 1;
        }
        urgency.max(10)
    }

    fn active_file(&self) -> Result<PathBuf> {
        self.writer
            .file_path()
            .cloned()
            .ok_or_else(|| eyre!("no active journal segment after reservation"))
    }
}

/// State shared between the public handle and the worker threads.
pub(crate) struct JournalShared {
    pub(crate) core: Mutex<JournalCore>,
    pub(crate) work_cv: Condvar,
    pub(crate) closed: AtomicBool,
    pub(crate) copying: AtomicBool,
    pub(crate) flushing: AtomicBool,
    pub(crate) suspend_copying: AtomicBool,
    pub(crate) volumes: Arc<VolumeRegistry>,
    pub(crate) directory: PathBuf,
    pub(crate) read_buffer_size: usize,
}

impl JournalShared {
    /// The cached read handle for a segment, opened lazily.
    fn read_channel(&self, path: &Path) -> Result<Arc<File>> {
        let mut core = self.core.lock();
        if let Some(file) = core.read_files.get(path) {
            return Ok(file.clone());
        }
        let file = Arc::new(
            File::open(path)
                .wrap_err_with(|| format!("failed to open journal segment {:?} for read", path))?,
        );
        core.read_files.insert(path.to_path_buf(), file.clone());
        Ok(file)
    }

    /// Reads the PA record at `address` and reassembles the full page image
    /// into `buf`: left portion at offset zero, right portion at the tail,
    /// zeros in between. Returns the page address the record carries.
    pub(crate) fn read_page_buffer(
        &self,
        address: &FileAddress,
        buf: &mut Vec<u8>,
        charge_io: bool,
    ) -> Result<u64> {
        let file = self.read_channel(address.file())?;

        let mut overhead = [0u8; PA_OVERHEAD];
        read_fully(&file, address.offset(), &mut overhead, address)?;
        let pa = PageRecord::parse(&overhead)?;

        let payload = pa.payload_size();
        buf.clear();
        buf.resize(pa.buffer_size, 0);
        read_fully(
            &file,
            address.offset() + PA_OVERHEAD as u64,
            &mut buf[..payload],
            address,
        )?;

        if pa.left_size > 0 {
            let right = pa.right_size();
            buf.copy_within(pa.left_size..payload, pa.buffer_size - right);
            buf[pa.left_size..pa.buffer_size - right].fill(0);
        }

        if charge_io {
            self.core.lock().io_rate.charge(1);
        }
        Ok(pa.page_address)
    }
}

fn read_fully(file: &File, offset: u64, buf: &mut [u8], address: &FileAddress) -> Result<()> {
    file.read_exact_at(buf, offset).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            corrupt(format!("record at {} is incomplete", address))
        } else {
            eyre::Report::new(JournalError::Io(e))
        }
    })
}

/// The journal manager. See the module documentation for the lifecycle.
pub struct Journal {
    shared: Arc<JournalShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Journal {
    /// Opens a journal rooted at the configured directory, creating the
    /// directory if needed. The journal is not usable for writes until
    /// [`recover`](Self::recover) has run.
    pub fn open(config: JournalConfig, volumes: Arc<VolumeRegistry>) -> Result<Journal> {
        ensure!(
            config.write_buffer_size as u64 <= config.maximum_file_size,
            "write buffer of {} bytes cannot exceed the maximum segment size {}",
            config.write_buffer_size,
            config.maximum_file_size
        );
        ensure!(
            config.write_buffer_size >= CP_OVERHEAD,
            "write buffer of {} bytes cannot hold a single record",
            config.write_buffer_size
        );
        let directory = config.journal_path.clone();
        fs::create_dir_all(&directory)
            .wrap_err_with(|| format!("failed to create journal directory {:?}", directory))?;

        let core = JournalCore {
            directory: directory.clone(),
            write_buffer_size: config.write_buffer_size,
            writer: SegmentWriter::new(
                &directory,
                config.maximum_file_size,
                config.write_buffer_size,
            ),
            page_index: PageIndex::new(),
            handles: HandleRegistry::new(),
            read_files: HashMap::new(),
            first_generation: 0,
            recovered: false,
            last_valid_checkpoint: Checkpoint::default(),
            dirty_recovery_address: None,
            io_rate: IoRateMeter::new(),
            journaled_page_count: 0,
            copy_back_count: 0,
            copy_fast: false,
            tunables: Tunables {
                flush_interval_ms: config.flush_interval_ms,
                copier_interval_ms: config.copier_interval_ms,
                minimum_urgency: config.minimum_urgency,
                io_rate_min: config.io_rate_min,
                io_rate_max: config.io_rate_max,
                io_rate_sleep_multiplier: config.io_rate_sleep_multiplier,
                copier_timestamp_limit: config.copier_timestamp_limit,
                page_index_size_base: config.page_index_size_base.max(1),
            },
        };

        Ok(Journal {
            shared: Arc::new(JournalShared {
                core: Mutex::new(core),
                work_cv: Condvar::new(),
                closed: AtomicBool::new(false),
                copying: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                suspend_copying: AtomicBool::new(config.suspend_copying),
                volumes,
                directory,
                read_buffer_size: config.read_buffer_size,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Rebuilds the page index, handle registry and checkpoint state from
    /// the segment files on disk. Must run exactly once per instance.
    pub fn recover(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        self.check_open()?;
        recovery::recover_core(&mut core)
    }

    /// Spawns the flush and copy-back workers. Idempotent.
    pub fn start_workers(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        self.check_open()?;

        let shared = self.shared.clone();
        workers.push(
            thread::Builder::new()
                .name("journal-copier".into())
                .spawn(move || copier::copier_loop(shared))
                .wrap_err("failed to spawn journal copier")?,
        );
        let shared = self.shared.clone();
        workers.push(
            thread::Builder::new()
                .name("journal-flusher".into())
                .spawn(move || flusher::flusher_loop(shared))
                .wrap_err("failed to spawn journal flusher")?,
        );
        Ok(())
    }

    /// Records one page image. On success the page index points at the new
    /// record as the latest location of the page.
    pub fn write_page_to_journal(&self, image: &PageImage<'_>) -> Result<()> {
        ensure!(
            image.bytes.len() == image.volume.page_size(),
            "page image of {} bytes does not match volume page size {}",
            image.bytes.len(),
            image.volume.page_size()
        );
        ensure!(
            image.left_size + image.right_size <= image.bytes.len(),
            "live portions of {}+{} bytes exceed the {} byte buffer",
            image.left_size,
            image.right_size,
            image.bytes.len()
        );
        ensure!(
            image.left_size > 0 || image.right_size == 0,
            "a right portion requires a non-empty left portion"
        );

        let payload = if image.left_size == 0 {
            image.bytes.len()
        } else {
            image.left_size + image.right_size
        };
        let record_size = PA_OVERHEAD + payload;

        let mut core = self.shared.core.lock();
        self.check_ready(&core)?;

        let descriptor = image.volume.descriptor();
        let mut handle = handle_for_volume_locked(&mut core, image.volume)?;
        let mut attempts = 0;
        while core.reserve(record_size)? {
            // The rollover cleared the registry; re-identify the volume in
            // the new segment, then re-reserve because the identification
            // record consumed part of the fresh window.
            ensure!(
                attempts < 2,
                "write window of {} bytes cannot hold an identification record and a {} byte page record together",
                core.write_buffer_size,
                record_size
            );
            attempts += 1;
            handle = handle_for_volume_locked(&mut core, image.volume)?;
        }
        let file = core.active_file()?;
        let offset = core.writer.tail();

        let record_timestamp = if image.transient { -1 } else { image.timestamp };
        let header = record::encode_pa_header(
            record_size,
            record_timestamp,
            handle,
            image.bytes.len(),
            image.left_size,
            image.page_address,
        );
        core.writer.append(&header)?;
        if image.left_size > 0 {
            core.writer.append(&image.bytes[..image.left_size])?;
            core.writer
                .append(&image.bytes[image.bytes.len() - image.right_size..])?;
        } else {
            core.writer.append(image.bytes)?;
        }

        core.page_index.insert(
            VolumePage::new(descriptor, image.page_address),
            FileAddress::new(file, offset, image.timestamp),
        );
        core.journaled_page_count += 1;
        core.io_rate.charge(1);
        Ok(())
    }

    /// Records a checkpoint. All prior records are forced before the CP
    /// record is written and the CP record itself is forced before this
    /// returns, so a recovered checkpoint implies durability of everything
    /// before it. Does nothing until recovery has completed.
    pub fn write_checkpoint_to_journal(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut core = self.shared.core.lock();
        self.check_open()?;
        if !core.recovered {
            return Ok(());
        }

        core.writer.force()?;
        core.reserve(CP_OVERHEAD)?;
        let file = core.active_file()?;
        let offset = core.writer.tail();
        core.writer.append(&record::encode_cp(checkpoint))?;
        core.writer.force()?;

        core.last_valid_checkpoint = checkpoint;
        core.io_rate.charge(1);
        debug!(
            "{} written at {}",
            checkpoint,
            FileAddress::new(file, offset, checkpoint.timestamp)
        );
        Ok(())
    }

    /// Reads the newest journalled image of a page into `buf`. Returns
    /// `false`, without touching any segment file, when the journal holds
    /// no image for the page; the caller then reads the home volume.
    pub fn read_page_from_journal(
        &self,
        volume: &Volume,
        page_address: u64,
        buf: &mut Vec<u8>,
    ) -> Result<bool> {
        let page = VolumePage::new(volume.descriptor(), page_address);
        let address = {
            let core = self.shared.core.lock();
            self.check_ready(&core)?;
            match core.page_index.get(&page) {
                None => return Ok(false),
                Some(address) => address.clone(),
            }
        };

        let record_page = self.shared.read_page_buffer(&address, buf, true)?;
        if record_page != page_address {
            return Err(corrupt(format!(
                "record at {} is not volume/page {}",
                address, page
            )));
        }
        if buf.len() != volume.page_size() {
            return Err(corrupt(format!(
                "record at {} is wrong size: expected/actual={}/{}",
                address,
                volume.page_size(),
                buf.len()
            )));
        }
        Ok(true)
    }

    /// The handle identifying `volume` in the active segment, emitting an
    /// IV record on first reference.
    pub fn handle_for_volume(&self, volume: &Volume) -> Result<u32> {
        let mut core = self.shared.core.lock();
        self.check_ready(&core)?;
        handle_for_volume_locked(&mut core, volume)
    }

    /// The handle identifying `tree` in the active segment, emitting an IT
    /// record on first reference.
    pub fn handle_for_tree(&self, tree: &TreeDescriptor) -> Result<u32> {
        let mut core = self.shared.core.lock();
        self.check_ready(&core)?;
        if let Some(handle) = core.handles.tree_handle(tree) {
            return Ok(handle);
        }
        let handle = core.handles.next_handle();
        let bytes = record::encode_it(handle, tree.volume_handle(), tree.name())?;
        core.reserve(bytes.len())?;
        core.writer.append(&bytes)?;
        core.handles.install_tree(tree.clone(), handle);
        Ok(handle)
    }

    /// Requests an urgent copy-back pass bounded by `to_timestamp` and
    /// blocks until the cycle completes. Requires started workers.
    pub fn copy_back(&self, to_timestamp: i64) -> Result<()> {
        if self.workers.lock().is_empty() {
            return Err(illegal_state("copy-back requires running background workers"));
        }
        let mut core = self.shared.core.lock();
        self.check_ready(&core)?;
        core.tunables.copier_timestamp_limit = to_timestamp;
        core.copy_fast = true;
        self.shared.work_cv.notify_all();
        while core.copy_fast {
            if self.shared.closed.load(Ordering::Acquire) {
                break;
            }
            let _ = self
                .shared
                .work_cv
                .wait_for(&mut core, Duration::from_millis(100));
        }
        Ok(())
    }

    /// Stops the workers, drains and truncates the write window, closes
    /// every cached read channel and clears the in-memory maps. When the
    /// page index drained completely, the segment files hold nothing worth
    /// keeping and are all deleted.
    pub fn close(&self) -> Result<()> {
        {
            let _core = self.shared.core.lock();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            self.shared.work_cv.notify_all();
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }

        let mut core = self.shared.core.lock();
        let remaining = core.page_index.len();
        core.writer.close()?;
        core.read_files.clear();
        core.handles.clear();
        core.page_index.clear();
        core.recovered = false;

        if remaining == 0 {
            for file in list_segment_files(&core.directory)? {
                fs::remove_file(&file)
                    .wrap_err_with(|| format!("failed to delete journal segment {:?}", file))?;
            }
            info!("journal closed with an empty page index; segments deleted");
        } else {
            info!(
                "journal closed; {} page(s) await copy-back on next start",
                remaining
            );
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(illegal_state("journal is closed"));
        }
        Ok(())
    }

    fn check_ready(&self, core: &JournalCore) -> Result<()> {
        self.check_open()?;
        if !core.recovered {
            return Err(illegal_state("journal has not been recovered"));
        }
        Ok(())
    }

    // ---- introspection ----

    pub fn directory(&self) -> &Path {
        &self.shared.directory
    }

    pub fn page_index_size(&self) -> usize {
        self.shared.core.lock().page_index.len()
    }

    /// A sorted snapshot of the page index, for diagnostics.
    pub fn page_index_snapshot(&self) -> BTreeMap<VolumePage, FileAddress> {
        self.shared.core.lock().page_index.sorted()
    }

    pub fn first_generation(&self) -> u64 {
        self.shared.core.lock().first_generation
    }

    pub fn current_generation(&self) -> u64 {
        self.shared.core.lock().writer.current_generation().max(0) as u64
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.shared.core.lock().writer.file_path().cloned()
    }

    pub fn dirty_recovery_file_address(&self) -> Option<FileAddress> {
        self.shared.core.lock().dirty_recovery_address.clone()
    }

    pub fn last_valid_checkpoint(&self) -> Checkpoint {
        self.shared.core.lock().last_valid_checkpoint
    }

    pub fn is_recovered(&self) -> bool {
        self.shared.core.lock().recovered
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn is_copying(&self) -> bool {
        self.shared.copying.load(Ordering::Acquire)
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.flushing.load(Ordering::Acquire)
    }

    pub fn is_copying_suspended(&self) -> bool {
        self.shared.suspend_copying.load(Ordering::Acquire)
    }

    pub fn is_urgent_demand(&self) -> bool {
        self.shared.core.lock().copy_fast
    }

    /// The copy-back pressure score the next copier tick will observe.
    pub fn urgency(&self) -> i32 {
        self.shared.core.lock().urgency()
    }

    /// Normalized page-I/O rate estimate in operations per second.
    pub fn io_rate(&self) -> i32 {
        self.shared.core.lock().io_rate.charge(0)
    }

    pub fn journaled_page_count(&self) -> u64 {
        self.shared.core.lock().journaled_page_count
    }

    pub fn copy_back_count(&self) -> u64 {
        self.shared.core.lock().copy_back_count
    }

    // ---- runtime tunables ----

    pub fn set_flush_interval(&self, millis: u64) {
        self.shared.core.lock().tunables.flush_interval_ms = millis;
    }

    pub fn set_copier_interval(&self, millis: u64) {
        self.shared.core.lock().tunables.copier_interval_ms = millis;
    }

    pub fn set_minimum_urgency(&self, urgency: i32) {
        self.shared.core.lock().tunables.minimum_urgency = urgency;
    }

    pub fn set_io_rate_min(&self, min: i32) {
        self.shared.core.lock().tunables.io_rate_min = min;
    }

    pub fn set_io_rate_max(&self, max: i32) {
        self.shared.core.lock().tunables.io_rate_max = max;
    }

    pub fn set_io_rate_sleep_multiplier(&self, multiplier: f32) {
        self.shared.core.lock().tunables.io_rate_sleep_multiplier = multiplier;
    }

    pub fn set_copier_timestamp_limit(&self, limit: i64) {
        self.shared.core.lock().tunables.copier_timestamp_limit = limit;
    }

    /// Hard pause of the copy-back worker. Suspension also aborts a
    /// non-urgent cycle between pages.
    pub fn set_copying_suspended(&self, suspended: bool) {
        self.shared
            .suspend_copying
            .store(suspended, Ordering::Release);
    }

    pub fn set_urgent_demand(&self, urgent: bool) {
        let mut core = self.shared.core.lock();
        core.copy_fast = urgent;
        if urgent {
            self.shared.work_cv.notify_all();
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        if !self.shared.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

/// Resolves or allocates the volume's handle in the active segment. The
/// handle is issued before the IV record reserves window space: if the
/// reservation rolls the segment over the registry is cleared, the IV
/// record lands in the new segment, and the pre-issued handle is installed
/// into the fresh registry, so the segment stays self-describing.
fn handle_for_volume_locked(core: &mut JournalCore, volume: &Volume) -> Result<u32> {
    let descriptor = volume.descriptor();
    if let Some(handle) = core.handles.volume_handle(&descriptor) {
        return Ok(handle);
    }
    let handle = core.handles.next_handle();
    let bytes = record::encode_iv(handle, descriptor.id(), descriptor.path())?;
    core.reserve(bytes.len())?;
    core.writer.append(&bytes)?;
    core.handles.install_volume(descriptor, handle);
    Ok(handle)
}
