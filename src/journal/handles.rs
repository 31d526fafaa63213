//! # Handle Registry
//!
//! Volumes and trees are referenced inside PA and IT records by small
//! integer handles rather than full identities. This registry keeps the two
//! directions of each mapping in lockstep and issues new handles from a
//! monotonically increasing counter.
//!
//! Handles are process-local and scoped to a single segment: a rollover
//! clears the registry so the next segment re-emits an IV or IT record for
//! every handle it uses. That duplication is what makes each segment
//! self-describing, which in turn is what lets recovery skip reclaimed
//! segments entirely. When either mapping of a kind reaches
//! [`MAXIMUM_MAPPED_HANDLES`] both directions of that kind are cleared and
//! identities get re-emitted on next use; the counter is never reset, so a
//! handle value is never reused within a journal lifetime.

use hashbrown::HashMap;

use crate::config::MAXIMUM_MAPPED_HANDLES;
use crate::journal::types::{TreeDescriptor, VolumeDescriptor};

#[derive(Debug, Default)]
pub struct HandleRegistry {
    volume_to_handle: HashMap<VolumeDescriptor, u32>,
    handle_to_volume: HashMap<u32, VolumeDescriptor>,
    tree_to_handle: HashMap<TreeDescriptor, u32>,
    handle_to_tree: HashMap<u32, TreeDescriptor>,
    counter: u32,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next handle.
    pub fn next_handle(&mut self) -> u32 {
        self.counter += 1;
        self.counter
    }

    pub fn volume_handle(&self, descriptor: &VolumeDescriptor) -> Option<u32> {
        self.volume_to_handle.get(descriptor).copied()
    }

    pub fn volume_for_handle(&self, handle: u32) -> Option<&VolumeDescriptor> {
        self.handle_to_volume.get(&handle)
    }

    pub fn tree_handle(&self, descriptor: &TreeDescriptor) -> Option<u32> {
        self.tree_to_handle.get(descriptor).copied()
    }

    pub fn tree_for_handle(&self, handle: u32) -> Option<&TreeDescriptor> {
        self.handle_to_tree.get(&handle)
    }

    /// Installs a volume mapping in both directions, clearing the volume
    /// maps first if they are at capacity.
    pub fn install_volume(&mut self, descriptor: VolumeDescriptor, handle: u32) {
        if self.volume_to_handle.len() >= MAXIMUM_MAPPED_HANDLES {
            self.volume_to_handle.clear();
            self.handle_to_volume.clear();
        }
        self.volume_to_handle.insert(descriptor.clone(), handle);
        self.handle_to_volume.insert(handle, descriptor);
    }

    /// Installs a tree mapping in both directions, clearing the tree maps
    /// first if they are at capacity.
    pub fn install_tree(&mut self, descriptor: TreeDescriptor, handle: u32) {
        if self.tree_to_handle.len() >= MAXIMUM_MAPPED_HANDLES {
            self.tree_to_handle.clear();
            self.handle_to_tree.clear();
        }
        self.tree_to_handle.insert(descriptor.clone(), handle);
        self.handle_to_tree.insert(handle, descriptor);
    }

    /// Clears every mapping. The counter keeps its value.
    pub fn clear(&mut self) {
        self.volume_to_handle.clear();
        self.handle_to_volume.clear();
        self.tree_to_handle.clear();
        self.handle_to_tree.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_monotonic_across_clears() {
        let mut registry = HandleRegistry::new();
        let first = registry.next_handle();
        registry.clear();
        let second = registry.next_handle();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[test]
    fn volume_maps_stay_in_lockstep() {
        let mut registry = HandleRegistry::new();
        let vd = VolumeDescriptor::new("/data/a.vol", 11);
        let handle = registry.next_handle();
        registry.install_volume(vd.clone(), handle);

        assert_eq!(registry.volume_handle(&vd), Some(handle));
        assert_eq!(registry.volume_for_handle(handle), Some(&vd));

        registry.clear();
        assert_eq!(registry.volume_handle(&vd), None);
        assert_eq!(registry.volume_for_handle(handle), None);
    }

    #[test]
    fn capacity_overflow_clears_both_volume_directions() {
        let mut registry = HandleRegistry::new();
        for i in 0..MAXIMUM_MAPPED_HANDLES {
            let vd = VolumeDescriptor::new(format!("/data/{}.vol", i), i as u64);
            let handle = registry.next_handle();
            registry.install_volume(vd, handle);
        }

        let vd = VolumeDescriptor::new("/data/overflow.vol", 1);
        let handle = registry.next_handle();
        registry.install_volume(vd.clone(), handle);

        assert_eq!(registry.volume_handle(&vd), Some(handle));
        assert_eq!(
            registry.volume_for_handle(1),
            None,
            "old mappings SHOULD be gone after the capacity clear"
        );
    }

    #[test]
    fn tree_maps_are_independent_of_volume_maps() {
        let mut registry = HandleRegistry::new();
        let vh = registry.next_handle();
        registry.install_volume(VolumeDescriptor::new("/data/a.vol", 1), vh);

        let td = TreeDescriptor::new(vh, "customers");
        let th = registry.next_handle();
        registry.install_tree(td.clone(), th);

        assert_eq!(registry.tree_handle(&td), Some(th));
        assert_eq!(registry.tree_for_handle(th), Some(&td));
        assert_ne!(vh, th);
    }
}
