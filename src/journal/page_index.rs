//! # Page Index
//!
//! The in-memory map from `(volume, page)` to the latest journal location
//! of that page's image. Every successful page append replaces the entry,
//! so the value always points at the newest image; copy-back removes an
//! entry only when the location it wrote from is still the one recorded,
//! which is how a concurrent append during a copy pass wins.
//!
//! The index itself is unordered; the copier and the diagnostic dump take
//! sorted snapshots so pages are visited in `(volume path, page)` order.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::journal::types::{FileAddress, VolumePage};

#[derive(Debug, Default)]
pub struct PageIndex {
    map: HashMap<VolumePage, FileAddress>,
}

impl PageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `address` as the latest location of `page`, replacing any
    /// earlier entry.
    pub fn insert(&mut self, page: VolumePage, address: FileAddress) {
        self.map.insert(page, address);
    }

    pub fn get(&self, page: &VolumePage) -> Option<&FileAddress> {
        self.map.get(page)
    }

    /// Removes the entry for `page` only if it still records `address`.
    /// Returns whether the entry was removed.
    pub fn remove_if_matches(&mut self, page: &VolumePage, address: &FileAddress) -> bool {
        match self.map.get(page) {
            Some(current) if current == address => {
                self.map.remove(page);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VolumePage, &FileAddress)> {
        self.map.iter()
    }

    /// A sorted snapshot of the whole index.
    pub fn sorted(&self) -> BTreeMap<VolumePage, FileAddress> {
        self.map
            .iter()
            .map(|(page, address)| (page.clone(), address.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::types::{segment_file_name, VolumeDescriptor};
    use std::path::PathBuf;

    fn page(path: &str, page: u64) -> VolumePage {
        VolumePage::new(VolumeDescriptor::new(path, 1), page)
    }

    fn address(generation: u64, offset: u64, timestamp: i64) -> FileAddress {
        FileAddress::new(
            PathBuf::from(segment_file_name(generation)),
            offset,
            timestamp,
        )
    }

    #[test]
    fn newer_insert_replaces_older_entry() {
        let mut index = PageIndex::new();
        let key = page("/data/a.vol", 7);
        index.insert(key.clone(), address(0, 100, 1));
        index.insert(key.clone(), address(0, 400, 2));

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&key).unwrap().timestamp(), 2);
    }

    #[test]
    fn conditional_removal_spares_superseded_entries() {
        let mut index = PageIndex::new();
        let key = page("/data/a.vol", 7);
        let old = address(0, 100, 1);
        index.insert(key.clone(), old.clone());
        index.insert(key.clone(), address(0, 400, 2));

        assert!(!index.remove_if_matches(&key, &old));
        assert_eq!(index.len(), 1);

        let current = index.get(&key).unwrap().clone();
        assert!(index.remove_if_matches(&key, &current));
        assert!(index.is_empty());
    }

    #[test]
    fn sorted_snapshot_orders_by_volume_then_page() {
        let mut index = PageIndex::new();
        index.insert(page("/data/b.vol", 1), address(0, 0, 1));
        index.insert(page("/data/a.vol", 9), address(0, 64, 1));
        index.insert(page("/data/a.vol", 2), address(0, 128, 1));

        let keys: Vec<String> = index.sorted().keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["/data/a.vol:2", "/data/a.vol:9", "/data/b.vol:1"]);
    }
}
