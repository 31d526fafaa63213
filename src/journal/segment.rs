//! # Segment Writer
//!
//! Append-only writer for the active journal segment. Appends go through a
//! mapped write window: a `memmap2::MmapMut` over a window-sized span of
//! the segment file starting at `window_base`. The file is extended to a
//! whole number of windows while the segment is active and truncated back
//! to its logical tail when the segment is closed or rolled over, so a
//! recovered segment never ends in unwritten window padding.
//!
//! ## Reservation Contract
//!
//! Callers reserve the full size of a record before appending it, and every
//! record is written inside a single window: if the current window cannot
//! hold the reservation it is forced and discarded, and if the segment
//! cannot hold another full window the segment rolls over. A record
//! therefore never spans a window or a segment boundary, which is what lets
//! recovery re-map a window at any record start.
//!
//! ## Rollover
//!
//! `rollover()` truncates, forces and closes the current segment (deleting
//! it when empty), creates the successor generation and maps a fresh window
//! at offset zero. The caller owns the handle registry and must clear it at
//! the same time so the new segment re-identifies every volume and tree it
//! touches.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

use crate::error::illegal_state;
use crate::journal::types::segment_file_path;

#[derive(Debug)]
pub struct SegmentWriter {
    directory: PathBuf,
    maximum_file_size: u64,
    window_size: usize,
    file: Option<File>,
    file_path: Option<PathBuf>,
    window: Option<MmapMut>,
    window_base: u64,
    window_pos: usize,
    current_generation: i64,
}

impl SegmentWriter {
    /// A writer with no active segment. The first reservation rolls over
    /// to generation `current_generation + 1`; a fresh journal starts at
    /// generation zero.
    pub fn new(directory: &Path, maximum_file_size: u64, window_size: usize) -> Self {
        Self {
            directory: directory.to_path_buf(),
            maximum_file_size,
            window_size,
            file: None,
            file_path: None,
            window: None,
            window_base: 0,
            window_pos: 0,
            current_generation: -1,
        }
    }

    pub fn current_generation(&self) -> i64 {
        self.current_generation
    }

    /// Installs the highest generation recovery observed so the next
    /// rollover continues the sequence.
    pub fn set_current_generation(&mut self, generation: i64) {
        self.current_generation = generation;
    }

    pub fn file_path(&self) -> Option<&PathBuf> {
        self.file_path.as_ref()
    }

    /// Logical tail of the active segment: base offset of the window plus
    /// the bytes appended into it.
    pub fn tail(&self) -> u64 {
        self.window_base + self.window_pos as u64
    }

    pub fn has_window(&self) -> bool {
        self.window.is_some()
    }

    /// Guarantees that the next `size` bytes can be appended contiguously.
    /// Returns `true` when satisfying the reservation rolled the segment
    /// over, in which case the caller must re-emit identification records.
    pub fn reserve(&mut self, size: usize) -> Result<bool> {
        ensure!(
            size <= self.window_size,
            "record of {} bytes cannot fit a {} byte write window",
            size,
            self.window_size
        );
        if self.window.is_some() {
            if self.window_size - self.window_pos >= size {
                return Ok(false);
            }
            self.detach_window()?;
        }
        if self.file.is_none()
            || self.window_base + self.window_size as u64 > self.maximum_file_size
        {
            self.rollover()?;
            return Ok(true);
        }
        self.map_window()?;
        Ok(false)
    }

    /// Appends into the mapped window. The bytes must have been reserved.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let window = self
            .window
            .as_mut()
            .ok_or_else(|| illegal_state("append without a reserved write window"))?;
        ensure!(
            self.window_pos + bytes.len() <= window.len(),
            "append of {} bytes overruns the write window at {}",
            bytes.len(),
            self.window_pos
        );
        window[self.window_pos..self.window_pos + bytes.len()].copy_from_slice(bytes);
        self.window_pos += bytes.len();
        Ok(())
    }

    /// Forces the mapped window to stable storage.
    pub fn force(&mut self) -> Result<()> {
        if let Some(window) = &self.window {
            window
                .flush()
                .wrap_err("failed to force journal write window")?;
        }
        Ok(())
    }

    /// Closes the current segment and opens its successor with a fresh
    /// window at offset zero.
    pub fn rollover(&mut self) -> Result<()> {
        self.close_current()?;
        self.current_generation += 1;
        let path = segment_file_path(&self.directory, self.current_generation as u64);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create journal segment at {:?}", path))?;
        self.file = Some(file);
        self.file_path = Some(path);
        self.window_base = 0;
        self.map_window()?;
        Ok(())
    }

    /// Drains and closes the active segment: forces the window, truncates
    /// the file to its logical tail, and deletes the file when nothing was
    /// ever appended.
    pub fn close(&mut self) -> Result<()> {
        self.close_current()?;
        self.window_base = 0;
        Ok(())
    }

    fn close_current(&mut self) -> Result<()> {
        self.detach_window()?;
        if let Some(file) = self.file.take() {
            file.set_len(self.window_base)
                .wrap_err("failed to truncate journal segment to its tail")?;
            file.sync_all()
                .wrap_err("failed to sync journal segment on close")?;
            drop(file);
            if let Some(path) = self.file_path.take() {
                if self.window_base == 0 {
                    fs::remove_file(&path).wrap_err_with(|| {
                        format!("failed to delete empty journal segment {:?}", path)
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Forces and unmaps the current window, folding its bytes into the
    /// logical tail.
    fn detach_window(&mut self) -> Result<()> {
        if let Some(window) = self.window.take() {
            window
                .flush()
                .wrap_err("failed to force journal write window")?;
            drop(window);
            self.window_base += self.window_pos as u64;
            self.window_pos = 0;
        }
        Ok(())
    }

    fn map_window(&mut self) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| illegal_state("cannot map a write window without a segment"))?;
        file.set_len(self.window_base + self.window_size as u64)
            .wrap_err("failed to extend journal segment for the write window")?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally, leading to undefined behavior. This is
        // safe because:
        // 1. Segment files are created and written only by this journal;
        //    no other process touches them.
        // 2. The file was just extended to cover the mapped span, so the
        //    window never extends past end of file.
        // 3. The mmap is dropped (in detach_window) before the file is
        //    truncated or closed, preventing use-after-unmap.
        let window = unsafe {
            MmapOptions::new()
                .offset(self.window_base)
                .len(self.window_size)
                .map_mut(file)
                .wrap_err("failed to map journal write window")?
        };
        self.window = Some(window);
        self.window_pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::types::{file_generation, list_segment_files};
    use tempfile::tempdir;

    #[test]
    fn first_reservation_creates_generation_zero() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), 1024 * 1024, 4096);

        let rolled = writer.reserve(64).unwrap();

        assert!(rolled);
        assert_eq!(writer.current_generation(), 0);
        assert_eq!(
            file_generation(writer.file_path().unwrap()),
            Some(0),
            "the first segment SHOULD be generation zero"
        );
    }

    #[test]
    fn appends_advance_the_logical_tail() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), 1024 * 1024, 4096);
        writer.reserve(64).unwrap();
        writer.append(&[7u8; 64]).unwrap();

        assert_eq!(writer.tail(), 64);
    }

    #[test]
    fn close_truncates_to_the_tail() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), 1024 * 1024, 4096);
        writer.reserve(100).unwrap();
        writer.append(&[1u8; 100]).unwrap();
        let path = writer.file_path().unwrap().clone();

        writer.close().unwrap();

        assert_eq!(fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn closing_an_untouched_segment_deletes_it() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), 1024 * 1024, 4096);
        writer.reserve(64).unwrap();

        writer.close().unwrap();

        assert!(list_segment_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn exhausted_window_triggers_rollover_when_segment_is_full() {
        let dir = tempdir().unwrap();
        // One window per segment: the second window cannot fit.
        let mut writer = SegmentWriter::new(dir.path(), 600, 512);

        assert!(writer.reserve(400).unwrap());
        writer.append(&[2u8; 400]).unwrap();

        let rolled = writer.reserve(400).unwrap();
        assert!(rolled, "a full segment SHOULD roll over");
        assert_eq!(writer.current_generation(), 1);
        assert_eq!(writer.tail(), 0);

        writer.append(&[3u8; 400]).unwrap();
        writer.close().unwrap();

        let files = list_segment_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(fs::metadata(&files[0]).unwrap().len(), 400);
        assert_eq!(fs::metadata(&files[1]).unwrap().len(), 400);
    }

    #[test]
    fn reservation_larger_than_the_window_is_rejected() {
        let dir = tempdir().unwrap();
        let mut writer = SegmentWriter::new(dir.path(), 1024 * 1024, 512);

        assert!(writer.reserve(513).is_err());
    }
}
