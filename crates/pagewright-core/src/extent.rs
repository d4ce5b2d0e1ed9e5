//! Extent records: the metadata unit describing one virtual-memory region.

use serde::Serialize;

use crate::bitmap::FlatBitmap;
use crate::sz::PAGE;

/// Free-state gradation of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtentState {
    /// Handed to a caller, or mid-transition.
    Active,
    /// Free, pages untouched since release.
    Dirty,
    /// Free, lazily purged.
    Muzzy,
    /// Free, decommitted or force-purged; preferred before growing.
    Retained,
}

impl ExtentState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Dirty => "dirty",
            Self::Muzzy => "muzzy",
            Self::Retained => "retained",
        }
    }
}

/// Page allocator owning an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageAllocator {
    /// Classic extent engine.
    Extent,
    /// Hugepage tier.
    Hpa,
}

/// Generational handle into the record cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ExtentId {
    pub index: u32,
    pub generation: u32,
}

/// Page-occupancy data carried by a pageslab record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageslabData {
    /// Set bit = page handed out.
    pub bitmap: FlatBitmap,
    /// Longest run of free pages. Equals `bitmap.longest_unset_run()`.
    pub longest_free_range: usize,
}

impl PageslabData {
    #[must_use]
    pub fn new(npages: usize) -> Self {
        Self {
            bitmap: FlatBitmap::new(npages),
            longest_free_range: npages,
        }
    }

    #[must_use]
    pub fn npages(&self) -> usize {
        self.bitmap.len()
    }
}

/// Metadata for one virtual-memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    pub arena_ind: u32,
    pub base: usize,
    pub size: usize,
    pub state: ExtentState,
    pub committed: bool,
    pub zeroed: bool,
    /// First extent of one mapping unit.
    pub is_head: bool,
    pub dumpable: bool,
    pub sn: u64,
    /// Size-class index when the region backs an object-level class.
    pub szind: Option<u32>,
    pub slab: bool,
    pub pai: PageAllocator,
    /// Parent pageslab of a pageslab sub-allocation.
    pub ps: Option<ExtentId>,
    /// Occupancy of a pageslab.
    pub slab_data: Option<Box<PageslabData>>,
}

impl Default for Extent {
    fn default() -> Self {
        Self {
            arena_ind: 0,
            base: 0,
            size: 0,
            state: ExtentState::Active,
            committed: false,
            zeroed: false,
            is_head: false,
            dumpable: true,
            sn: 0,
            szind: None,
            slab: false,
            pai: PageAllocator::Extent,
            ps: None,
            slab_data: None,
        }
    }
}

impl Extent {
    /// Record for a freshly mapped or split region.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        arena_ind: u32,
        base: usize,
        size: usize,
        sn: u64,
        state: ExtentState,
        zeroed: bool,
        committed: bool,
        pai: PageAllocator,
        is_head: bool,
    ) -> Self {
        Self {
            arena_ind,
            base,
            size,
            state,
            committed,
            zeroed,
            is_head,
            sn,
            pai,
            ..Self::default()
        }
    }

    /// One past the last byte.
    #[inline]
    #[must_use]
    pub fn past(&self) -> usize {
        self.base + self.size
    }

    /// Base of the last page.
    #[inline]
    #[must_use]
    pub fn last(&self) -> usize {
        self.base + self.size - PAGE
    }

    /// Base of the page before this extent, if any.
    #[inline]
    #[must_use]
    pub fn before(&self) -> Option<usize> {
        self.base.checked_sub(PAGE)
    }

    #[inline]
    #[must_use]
    pub fn npages(&self) -> usize {
        self.size / PAGE
    }

    /// Ordering key inside a free-set bucket: address, then serial.
    #[inline]
    #[must_use]
    pub fn bucket_key(&self) -> (usize, u64) {
        (self.base, self.sn)
    }

    /// Copy of the caller-visible fields.
    #[must_use]
    pub fn snapshot(&self, id: ExtentId) -> ExtentSnapshot {
        ExtentSnapshot {
            id,
            base: self.base,
            size: self.size,
            state: self.state,
            committed: self.committed,
            zeroed: self.zeroed,
            is_head: self.is_head,
            sn: self.sn,
            pai: self.pai,
            longest_free_range: self.slab_data.as_ref().map(|d| d.longest_free_range),
        }
    }
}

/// Point-in-time view of a record, detached from its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentSnapshot {
    pub id: ExtentId,
    pub base: usize,
    pub size: usize,
    pub state: ExtentState,
    pub committed: bool,
    pub zeroed: bool,
    pub is_head: bool,
    pub sn: u64,
    pub pai: PageAllocator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longest_free_range: Option<usize>,
}

impl ExtentSnapshot {
    #[must_use]
    pub fn past(&self) -> usize {
        self.base + self.size
    }
}

/// Region handed to an object-level caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    pub id: ExtentId,
    pub base: usize,
    pub size: usize,
    pub zeroed: bool,
    pub committed: bool,
}
