//! Identity and addressing types shared across the journal: volume and tree
//! descriptors, the page index key, journal file addresses, checkpoints and
//! the segment file naming scheme.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::config::{GENERATION_DIGITS, SEGMENT_FILE_STEM};

/// Identity of a data volume as recorded in the journal: the volume's path
/// and its creation id. Both must match for two descriptors to name the
/// same volume; the path alone drives iteration order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeDescriptor {
    path: String,
    id: u64,
}

impl VolumeDescriptor {
    pub fn new(path: impl Into<String>, id: u64) -> Self {
        Self {
            path: path.into(),
            id,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Ord for VolumeDescriptor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path
            .cmp(&other.path)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for VolumeDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VolumeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Identity of a tree within a volume. The volume is named by its handle in
/// the current segment, so tree descriptors are only meaningful alongside
/// the segment's handle registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeDescriptor {
    volume_handle: u32,
    name: String,
}

impl TreeDescriptor {
    pub fn new(volume_handle: u32, name: impl Into<String>) -> Self {
        Self {
            volume_handle,
            name: name.into(),
        }
    }

    pub fn volume_handle(&self) -> u32 {
        self.volume_handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Key of the page index: one page of one volume. Ordered by
/// `(volume path, page number)` so copy-back and the diagnostic dump walk
/// pages in sequential volume order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumePage {
    descriptor: VolumeDescriptor,
    page: u64,
}

impl VolumePage {
    pub fn new(descriptor: VolumeDescriptor, page: u64) -> Self {
        Self { descriptor, page }
    }

    pub fn descriptor(&self) -> &VolumeDescriptor {
        &self.descriptor
    }

    pub fn page(&self) -> u64 {
        self.page
    }
}

impl Ord for VolumePage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.descriptor
            .cmp(&other.descriptor)
            .then_with(|| self.page.cmp(&other.page))
    }
}

impl PartialOrd for VolumePage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VolumePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.descriptor, self.page)
    }
}

/// Location of one record in the journal: segment file, byte offset within
/// it, and the timestamp the record carried.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileAddress {
    file: PathBuf,
    offset: u64,
    timestamp: i64,
}

impl FileAddress {
    pub fn new(file: PathBuf, offset: u64, timestamp: i64) -> Self {
        Self {
            file,
            offset,
            timestamp,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Generation of the segment this address points into, parsed from the
    /// file name. `None` for files outside the segment naming scheme.
    pub fn generation(&self) -> Option<u64> {
        file_generation(&self.file)
    }
}

impl Ord for FileAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file
            .cmp(&other.file)
            .then_with(|| self.offset.cmp(&other.offset))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}

impl PartialOrd for FileAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{{{}}}",
            self.file.display(),
            self.offset,
            self.timestamp
        )
    }
}

/// A durability boundary: everything journalled at or before `timestamp`
/// was on stable storage when the checkpoint record was written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub timestamp: i64,
    pub system_time_millis: i64,
}

impl Checkpoint {
    pub fn new(timestamp: i64, system_time_millis: i64) -> Self {
        Self {
            timestamp,
            system_time_millis,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "checkpoint(timestamp={}, wall={})",
            self.timestamp, self.system_time_millis
        )
    }
}

/// File name of the segment with the given generation.
pub fn segment_file_name(generation: u64) -> String {
    format!(
        "{}.{:0width$}",
        SEGMENT_FILE_STEM,
        generation,
        width = GENERATION_DIGITS
    )
}

/// Path of the segment with the given generation inside `directory`.
pub fn segment_file_path(directory: &Path, generation: u64) -> PathBuf {
    directory.join(segment_file_name(generation))
}

/// Generation encoded in a segment file name, or `None` if the name does
/// not match the `journal.<16 digits>` scheme.
pub fn file_generation(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let suffix = name
        .strip_prefix(SEGMENT_FILE_STEM)?
        .strip_prefix('.')?;
    if suffix.len() != GENERATION_DIGITS || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Every segment file in `directory`, sorted by name. The zero-padded
/// generation suffix makes name order equal generation order.
pub fn list_segment_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(directory)
        .wrap_err_with(|| format!("failed to read journal directory {:?}", directory))?;
    for entry in entries {
        let entry = entry.wrap_err("failed to read journal directory entry")?;
        let path = entry.path();
        if file_generation(&path).is_some() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_pages_order_by_path_then_page() {
        let a = VolumePage::new(VolumeDescriptor::new("/data/a", 1), 9);
        let b = VolumePage::new(VolumeDescriptor::new("/data/a", 1), 10);
        let c = VolumePage::new(VolumeDescriptor::new("/data/b", 1), 0);

        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn descriptors_with_same_path_differ_by_id() {
        let a = VolumeDescriptor::new("/data/a", 1);
        let b = VolumeDescriptor::new("/data/a", 2);

        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn file_addresses_order_by_file_then_offset() {
        let older = FileAddress::new(PathBuf::from(segment_file_name(3)), 100, 7);
        let newer = FileAddress::new(PathBuf::from(segment_file_name(4)), 0, 8);

        assert!(older < newer);
        assert!(older < FileAddress::new(PathBuf::from(segment_file_name(3)), 200, 7));
    }

    #[test]
    fn generation_parses_from_segment_names() {
        let path = PathBuf::from("/j").join(segment_file_name(42));
        assert_eq!(file_generation(&path), Some(42));

        assert_eq!(file_generation(Path::new("/j/journal.123")), None);
        assert_eq!(file_generation(Path::new("/j/journal.00000000000000ab")), None);
        assert_eq!(file_generation(Path::new("/j/other.0000000000000001")), None);
    }
}
