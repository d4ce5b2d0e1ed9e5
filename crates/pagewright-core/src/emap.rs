//! Address index: page address -> owning extent record.
//!
//! Boundary pages (first and last) of every registered extent are always
//! mapped; slab extents additionally map their interior pages so any address
//! inside them resolves. The map is sharded by page number; a shard lock is
//! only held for a copy-out lookup or a write, never while a record lock is
//! being acquired.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::extent::{Extent, ExtentId};
use crate::record_cache::{RecordCache, RecordGuard};
use crate::sz::{LG_PAGE, PAGE};

const NUM_SHARDS: usize = 64;

/// Index entry for one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub extent: ExtentId,
    pub szind: Option<u32>,
    pub slab: bool,
}

/// Sharded page-granular address index.
#[derive(Debug)]
pub struct AddressIndex {
    shards: Box<[RwLock<HashMap<usize, LeafEntry>>]>,
}

impl Default for AddressIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn page_of(addr: usize) -> usize {
    addr >> LG_PAGE
}

impl AddressIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    #[inline]
    fn shard_for(&self, page: usize) -> &RwLock<HashMap<usize, LeafEntry>> {
        &self.shards[page % NUM_SHARDS]
    }

    /// Entry covering the page containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<LeafEntry> {
        let page = page_of(addr);
        self.shard_for(page).read().get(&page).copied()
    }

    pub fn write(&self, addr: usize, entry: LeafEntry) {
        let page = page_of(addr);
        self.shard_for(page).write().insert(page, entry);
    }

    pub fn clear(&self, addr: usize) {
        let page = page_of(addr);
        self.shard_for(page).write().remove(&page);
    }

    fn entry_for(id: ExtentId, extent: &Extent) -> LeafEntry {
        LeafEntry {
            extent: id,
            szind: extent.szind,
            slab: extent.slab,
        }
    }

    /// Maps the first and last page of `extent`.
    pub fn register_boundary(&self, id: ExtentId, extent: &Extent) {
        let entry = Self::entry_for(id, extent);
        self.write(extent.base, entry);
        self.write(extent.last(), entry);
    }

    /// Maps every interior page of a slab extent.
    pub fn register_interior(&self, id: ExtentId, extent: &Extent) {
        let entry = Self::entry_for(id, extent);
        let mut addr = extent.base + PAGE;
        while addr < extent.last() {
            self.write(addr, entry);
            addr += PAGE;
        }
    }

    /// Unmaps the first and last page of `extent`.
    pub fn deregister_boundary(&self, extent: &Extent) {
        self.clear(extent.base);
        self.clear(extent.last());
    }

    pub fn deregister_interior(&self, extent: &Extent) {
        let mut addr = extent.base + PAGE;
        while addr < extent.last() {
            self.clear(addr);
            addr += PAGE;
        }
    }

    /// Rewrites the boundaries of both halves after a split.
    pub fn split_commit(&self, lead_id: ExtentId, lead: &Extent, trail_id: ExtentId, trail: &Extent) {
        self.register_boundary(lead_id, lead);
        self.register_boundary(trail_id, trail);
    }

    /// Rewrites the index after `merged` absorbed its trailing neighbor.
    /// `inner_last` and `inner_first` are the old last page of the lead and
    /// the old first page of the trail.
    pub fn merge_commit(&self, id: ExtentId, merged: &Extent, inner_last: usize, inner_first: usize) {
        self.clear(inner_last);
        self.clear(inner_first);
        self.register_boundary(id, merged);
    }

    /// Looks up the extent mapped at `addr` and locks its record, retrying
    /// until the index still names the locked record afterwards. Slab
    /// extents are skipped when `inactive_only` is set.
    pub fn lock_extent_from_addr<'a>(
        &self,
        records: &'a RecordCache,
        addr: usize,
        inactive_only: bool,
    ) -> Option<(ExtentId, RecordGuard<'a>)> {
        loop {
            let entry = self.lookup(addr)?;
            if inactive_only && entry.slab {
                return None;
            }
            match records.lock(entry.extent) {
                Some(guard) => {
                    if self.lookup(addr).map(|e| e.extent) == Some(entry.extent) {
                        return Some((entry.extent, guard));
                    }
                }
                None => {
                    if self.lookup(addr) == Some(entry) {
                        return None;
                    }
                }
            }
        }
    }

    /// Number of mapped pages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(base: usize, pages: usize) -> Extent {
        Extent {
            base,
            size: pages * PAGE,
            ..Extent::default()
        }
    }

    #[test]
    fn test_boundary_registration() {
        let records = RecordCache::new(None);
        let index = AddressIndex::new();
        let e = extent(16 * PAGE, 4);
        let id = records.get(e.clone()).expect("record");
        index.register_boundary(id, &e);
        assert_eq!(index.lookup(16 * PAGE + 7).map(|l| l.extent), Some(id));
        assert_eq!(index.lookup(19 * PAGE).map(|l| l.extent), Some(id));
        assert!(index.lookup(17 * PAGE).is_none());
        assert_eq!(index.len(), 2);
        index.deregister_boundary(&e);
        assert!(index.is_empty());
    }

    #[test]
    fn test_single_page_extent_uses_one_entry() {
        let index = AddressIndex::new();
        let id = ExtentId {
            index: 0,
            generation: 0,
        };
        index.register_boundary(id, &extent(0, 1));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_slab_interior_is_skipped_for_inactive_lookups() {
        let records = RecordCache::new(None);
        let index = AddressIndex::new();
        let mut e = extent(0, 8);
        e.slab = true;
        e.szind = Some(3);
        let id = records.get(e.clone()).expect("record");
        index.register_boundary(id, &e);
        index.register_interior(id, &e);
        assert_eq!(index.len(), 8);
        assert_eq!(index.lookup(5 * PAGE).and_then(|l| l.szind), Some(3));
        assert!(index.lock_extent_from_addr(&records, 5 * PAGE, true).is_none());
        assert!(index.lock_extent_from_addr(&records, 5 * PAGE, false).is_some());
    }

    #[test]
    fn test_lock_from_addr_rejects_stale_entry() {
        let records = RecordCache::new(None);
        let index = AddressIndex::new();
        let e = extent(0, 2);
        let id = records.get(e.clone()).expect("record");
        index.register_boundary(id, &e);
        records.put(id);
        assert!(index.lock_extent_from_addr(&records, 0, false).is_none());
    }

    #[test]
    fn test_merge_commit_clears_inner_boundaries() {
        let index = AddressIndex::new();
        let a = ExtentId {
            index: 1,
            generation: 0,
        };
        let b = ExtentId {
            index: 2,
            generation: 0,
        };
        let lead = extent(0, 2);
        let trail = extent(2 * PAGE, 2);
        index.split_commit(a, &lead, b, &trail);
        assert_eq!(index.len(), 4);
        index.merge_commit(a, &extent(0, 4), lead.last(), trail.base);
        assert_eq!(index.len(), 2);
        assert_eq!(index.lookup(3 * PAGE).map(|l| l.extent), Some(a));
    }
}
