//! # Home Volumes
//!
//! The journal's view of a data volume is deliberately narrow: a page-sized
//! positional read and write, a durability sync, and the identity fields
//! recorded in IV records (path and creation id). The engine's own volume
//! machinery (file headers, allocation, the B-Tree) lives elsewhere; the
//! journal only ever copies whole page images in and out.
//!
//! [`VolumeRegistry`] resolves live volumes by path during copy-back. A
//! volume missing from the registry, or one that was closed, is not an
//! error: the copier skips its pages and keeps the segments holding them
//! until the volume comes back.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::journal::VolumeDescriptor;

#[derive(Debug)]
pub struct Volume {
    path: PathBuf,
    id: u64,
    page_size: usize,
    file: std::fs::File,
    closed: AtomicBool,
}

impl Volume {
    /// Creates a new volume file, truncating any existing file at `path`.
    pub fn create(path: impl AsRef<Path>, id: u64, page_size: usize) -> Result<Arc<Self>> {
        let path = path.as_ref();
        ensure!(page_size > 0, "volume page size must be non-zero");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create volume file at {:?}", path))?;
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            id,
            page_size,
            file,
            closed: AtomicBool::new(false),
        }))
    }

    /// Opens an existing volume file.
    pub fn open(path: impl AsRef<Path>, id: u64, page_size: usize) -> Result<Arc<Self>> {
        let path = path.as_ref();
        ensure!(page_size > 0, "volume page size must be non-zero");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open volume file at {:?}", path))?;
        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat volume file at {:?}", path))?
            .len();
        ensure!(
            len % page_size as u64 == 0,
            "volume file {:?} size {} is not a multiple of page size {}",
            path,
            len,
            page_size
        );
        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            id,
            page_size,
            file,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the volume closed. Later page I/O through the journal fails
    /// and copy-back skips its pages.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// The identity recorded for this volume in IV records.
    pub fn descriptor(&self) -> VolumeDescriptor {
        VolumeDescriptor::new(self.path.to_string_lossy().into_owned(), self.id)
    }

    /// Writes one full page image at its home address, extending the file
    /// if the page lies past the current end.
    pub fn write_page(&self, page: u64, bytes: &[u8]) -> Result<()> {
        ensure!(!self.is_closed(), "volume {:?} is closed", self.path);
        ensure!(
            bytes.len() == self.page_size,
            "page image of {} bytes does not match volume page size {}",
            bytes.len(),
            self.page_size
        );
        self.file
            .write_all_at(bytes, page * self.page_size as u64)
            .wrap_err_with(|| format!("failed to write page {} of volume {:?}", page, self.path))
    }

    /// Reads one full page image from its home address.
    pub fn read_page(&self, page: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(!self.is_closed(), "volume {:?} is closed", self.path);
        ensure!(
            buf.len() == self.page_size,
            "page buffer of {} bytes does not match volume page size {}",
            buf.len(),
            self.page_size
        );
        self.file
            .read_exact_at(buf, page * self.page_size as u64)
            .wrap_err_with(|| format!("failed to read page {} of volume {:?}", page, self.path))
    }

    /// Forces all written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync volume {:?}", self.path))
    }
}

/// Live volumes by path, shared between the engine and the journal's
/// copy-back worker.
#[derive(Debug, Default)]
pub struct VolumeRegistry {
    volumes: RwLock<HashMap<String, Arc<Volume>>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, volume: Arc<Volume>) {
        let key = volume.path().to_string_lossy().into_owned();
        self.volumes.write().insert(key, volume);
    }

    pub fn get(&self, path: &str) -> Option<Arc<Volume>> {
        self.volumes.read().get(path).cloned()
    }

    pub fn remove(&self, path: &str) -> Option<Arc<Volume>> {
        self.volumes.write().remove(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pages_round_trip_through_a_volume() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path().join("a.vol"), 1, 128).unwrap();

        let image = vec![0xA5u8; 128];
        volume.write_page(3, &image).unwrap();

        let mut read = vec![0u8; 128];
        volume.read_page(3, &mut read).unwrap();
        assert_eq!(read, image);
    }

    #[test]
    fn closed_volumes_refuse_page_io() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path().join("a.vol"), 1, 128).unwrap();
        volume.close();

        assert!(volume.write_page(0, &vec![0u8; 128]).is_err());
    }

    #[test]
    fn registry_resolves_by_path() {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path().join("a.vol"), 7, 128).unwrap();
        let key = volume.path().to_string_lossy().into_owned();

        let registry = VolumeRegistry::new();
        registry.register(volume.clone());

        let found = registry.get(&key).unwrap();
        assert_eq!(found.id(), 7);
        assert!(registry.get("/nowhere").is_none());
    }
}
