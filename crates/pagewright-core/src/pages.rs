//! Raw page primitives.
//!
//! [`OsPages`] drives the mmap family directly. [`SimulatedPages`] keeps a
//! logical address space (ranges only, no backing memory) so the engine can
//! be exercised deterministically, with injectable mapping failures.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::sz::{self, PAGE};

/// OS-level page operations. Fallible operations return `true` on success.
pub trait PagePrimitives: Send + Sync + Debug {
    /// Maps `size` bytes aligned to `alignment`, at `addr_hint` when given.
    /// Fresh mappings are zeroed and committed.
    fn map(&self, addr_hint: Option<usize>, size: usize, alignment: usize) -> Option<usize>;
    fn unmap(&self, addr: usize, size: usize) -> bool;
    fn commit(&self, addr: usize, size: usize) -> bool;
    fn decommit(&self, addr: usize, size: usize) -> bool;
    /// Allows the OS to reclaim pages lazily. Contents become undefined.
    fn purge_lazy(&self, addr: usize, size: usize) -> bool;
    /// Discards pages now. Reads return zeroes afterwards.
    fn purge_forced(&self, addr: usize, size: usize) -> bool;
    fn mark_huge(&self, addr: usize, size: usize) -> bool;
    /// Fills a committed range with zeroes.
    fn zero(&self, addr: usize, size: usize) -> bool;
}

/// Page primitives backed by `mmap`, `munmap`, `mprotect` and `madvise`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPages;

const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

impl OsPages {
    fn mmap_raw(addr_hint: Option<usize>, size: usize) -> Option<usize> {
        let hint = addr_hint.unwrap_or(0) as *mut libc::c_void;
        // SAFETY: anonymous private mapping with no fd; the kernel picks the
        // address unless the hint range happens to be free.
        let ptr = unsafe {
            libc::mmap(
                hint,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return None;
        }
        let addr = ptr as usize;
        if addr_hint.is_some_and(|h| h != addr) {
            // SAFETY: `addr` was mapped above with exactly `size` bytes.
            unsafe { libc::munmap(ptr, size) };
            return None;
        }
        Some(addr)
    }

    fn madvise(addr: usize, size: usize, advice: libc::c_int) -> bool {
        // SAFETY: callers only pass ranges the engine mapped and still owns.
        unsafe { libc::madvise(addr as *mut libc::c_void, size, advice) == 0 }
    }
}

impl PagePrimitives for OsPages {
    fn map(&self, addr_hint: Option<usize>, size: usize, alignment: usize) -> Option<usize> {
        let addr = Self::mmap_raw(addr_hint, size)?;
        if addr & (alignment - 1) == 0 {
            return Some(addr);
        }
        self.unmap(addr, size);
        if addr_hint.is_some() {
            return None;
        }
        // Over-map, then trim to the aligned window.
        let alloc_size = size.checked_add(alignment)?.checked_sub(PAGE)?;
        let raw = Self::mmap_raw(None, alloc_size)?;
        let aligned = sz::align_ceil(raw, alignment)?;
        let lead = aligned - raw;
        let trail = alloc_size - lead - size;
        if lead != 0 {
            self.unmap(raw, lead);
        }
        if trail != 0 {
            self.unmap(aligned + size, trail);
        }
        Some(aligned)
    }

    fn unmap(&self, addr: usize, size: usize) -> bool {
        // SAFETY: the range was produced by `map` and is no longer referenced
        // by any live extent.
        unsafe { libc::munmap(addr as *mut libc::c_void, size) == 0 }
    }

    fn commit(&self, addr: usize, size: usize) -> bool {
        // SAFETY: restores access on a range this allocator mapped.
        unsafe {
            libc::mprotect(
                addr as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) == 0
        }
    }

    fn decommit(&self, addr: usize, size: usize) -> bool {
        // SAFETY: replaces an owned range with a fresh inaccessible mapping.
        let ptr = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                size,
                libc::PROT_NONE,
                MAP_FLAGS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        ptr != libc::MAP_FAILED
    }

    #[cfg(target_os = "linux")]
    fn purge_lazy(&self, addr: usize, size: usize) -> bool {
        Self::madvise(addr, size, libc::MADV_FREE)
    }

    #[cfg(not(target_os = "linux"))]
    fn purge_lazy(&self, _addr: usize, _size: usize) -> bool {
        false
    }

    fn purge_forced(&self, addr: usize, size: usize) -> bool {
        Self::madvise(addr, size, libc::MADV_DONTNEED)
    }

    #[cfg(target_os = "linux")]
    fn mark_huge(&self, addr: usize, size: usize) -> bool {
        Self::madvise(addr, size, libc::MADV_HUGEPAGE)
    }

    #[cfg(not(target_os = "linux"))]
    fn mark_huge(&self, _addr: usize, _size: usize) -> bool {
        false
    }

    fn zero(&self, addr: usize, size: usize) -> bool {
        // SAFETY: the range is committed, writable and owned by the caller.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
        true
    }
}

/// Call counters kept by [`SimulatedPages`].
#[derive(Debug, Default)]
pub struct PageCounters {
    pub maps: AtomicU64,
    pub unmaps: AtomicU64,
    pub commits: AtomicU64,
    pub decommits: AtomicU64,
    pub purges_lazy: AtomicU64,
    pub purges_forced: AtomicU64,
    pub huge: AtomicU64,
    pub zeroes: AtomicU64,
}

#[derive(Debug)]
struct SimSpace {
    cursor: usize,
    /// Mapped ranges, start -> end.
    mapped: BTreeMap<usize, usize>,
    mapped_bytes: usize,
    /// Remaining bytes that `map` may hand out.
    budget: Option<usize>,
}

/// Logical address space. Mapping bumps a cursor; nothing is touched.
#[derive(Debug)]
pub struct SimulatedPages {
    space: Mutex<SimSpace>,
    pub counters: PageCounters,
    refuse_purge: bool,
}

/// Default base of the simulated address space.
pub const SIM_BASE: usize = 0x1000_0000_0000;

impl Default for SimulatedPages {
    fn default() -> Self {
        Self::new(SIM_BASE)
    }
}

impl SimulatedPages {
    #[must_use]
    pub fn new(base: usize) -> Self {
        Self {
            space: Mutex::new(SimSpace {
                cursor: base,
                mapped: BTreeMap::new(),
                mapped_bytes: 0,
                budget: None,
            }),
            counters: PageCounters::default(),
            refuse_purge: false,
        }
    }

    /// Limits the bytes later `map` calls may obtain in total.
    #[must_use]
    pub fn with_map_budget(self, bytes: usize) -> Self {
        self.space.lock().budget = Some(bytes);
        self
    }

    /// Makes both purge primitives fail.
    #[must_use]
    pub fn refusing_purge(mut self) -> Self {
        self.refuse_purge = true;
        self
    }

    /// Bytes currently mapped.
    #[must_use]
    pub fn mapped_bytes(&self) -> usize {
        self.space.lock().mapped_bytes
    }

    /// True when `[addr, addr + size)` is entirely mapped.
    #[must_use]
    pub fn is_mapped(&self, addr: usize, size: usize) -> bool {
        Self::covered(&self.space.lock(), addr, size)
    }

    fn covered(space: &SimSpace, addr: usize, size: usize) -> bool {
        let mut cursor = addr;
        let end = addr + size;
        while cursor < end {
            match space.mapped.range(..=cursor).next_back() {
                Some((_, &range_end)) if range_end > cursor => cursor = range_end,
                _ => return false,
            }
        }
        true
    }

    fn overlaps(space: &SimSpace, addr: usize, end: usize) -> bool {
        if let Some((_, &prev_end)) = space.mapped.range(..=addr).next_back() {
            if prev_end > addr {
                return true;
            }
        }
        space.mapped.range(addr..end).next().is_some()
    }
}

impl PagePrimitives for SimulatedPages {
    fn map(&self, addr_hint: Option<usize>, size: usize, alignment: usize) -> Option<usize> {
        let mut space = self.space.lock();
        if space.budget.is_some_and(|b| b < size) {
            return None;
        }
        let addr = match addr_hint {
            Some(hint) => {
                let end = hint.checked_add(size)?;
                if hint & (alignment - 1) != 0 || Self::overlaps(&space, hint, end) {
                    return None;
                }
                space.cursor = space.cursor.max(end.checked_add(PAGE)?);
                hint
            }
            None => {
                let addr = sz::align_ceil(space.cursor, alignment)?;
                // Leave a guard page so consecutive mappings are never adjacent.
                space.cursor = addr.checked_add(size)?.checked_add(PAGE)?;
                addr
            }
        };
        space.mapped.insert(addr, addr + size);
        space.mapped_bytes += size;
        if let Some(budget) = space.budget.as_mut() {
            *budget -= size;
        }
        self.counters.maps.fetch_add(1, Ordering::Relaxed);
        Some(addr)
    }

    fn unmap(&self, addr: usize, size: usize) -> bool {
        let end = addr + size;
        let mut space = self.space.lock();
        if !Self::covered(&space, addr, size) {
            return false;
        }
        let first = space
            .mapped
            .range(..=addr)
            .next_back()
            .map_or(addr, |(&start, _)| start);
        let hit: Vec<(usize, usize)> = space
            .mapped
            .range(first..end)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (start, range_end) in hit {
            space.mapped.remove(&start);
            if start < addr {
                space.mapped.insert(start, addr);
            }
            if end < range_end {
                space.mapped.insert(end, range_end);
            }
        }
        space.mapped_bytes -= size;
        self.counters.unmaps.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn commit(&self, _addr: usize, _size: usize) -> bool {
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn decommit(&self, _addr: usize, _size: usize) -> bool {
        self.counters.decommits.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn purge_lazy(&self, _addr: usize, _size: usize) -> bool {
        if self.refuse_purge {
            return false;
        }
        self.counters.purges_lazy.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn purge_forced(&self, _addr: usize, _size: usize) -> bool {
        if self.refuse_purge {
            return false;
        }
        self.counters.purges_forced.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn mark_huge(&self, _addr: usize, _size: usize) -> bool {
        self.counters.huge.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn zero(&self, _addr: usize, _size: usize) -> bool {
        self.counters.zeroes.fetch_add(1, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_map_respects_alignment_and_budget() {
        let pages = SimulatedPages::new(SIM_BASE + PAGE).with_map_budget(6 << 20);
        let a = pages.map(None, 2 << 20, 2 << 20).expect("first map");
        assert_eq!(a % (2 << 20), 0);
        let b = pages.map(None, 4 << 20, PAGE).expect("second map");
        assert!(b >= a + (2 << 20) + PAGE);
        assert!(pages.map(None, PAGE, PAGE).is_none(), "budget exhausted");
        assert_eq!(pages.mapped_bytes(), 6 << 20);
    }

    #[test]
    fn test_sim_partial_unmap_splits_range() {
        let pages = SimulatedPages::default();
        let a = pages.map(None, 8 * PAGE, PAGE).expect("map");
        assert!(pages.unmap(a + 2 * PAGE, 2 * PAGE));
        assert!(pages.is_mapped(a, 2 * PAGE));
        assert!(!pages.is_mapped(a + 2 * PAGE, PAGE));
        assert!(pages.is_mapped(a + 4 * PAGE, 4 * PAGE));
        assert!(!pages.unmap(a + 2 * PAGE, PAGE), "double unmap");
        assert_eq!(pages.mapped_bytes(), 6 * PAGE);
    }

    #[test]
    fn test_sim_unmap_spans_adjacent_mappings() {
        let pages = SimulatedPages::default();
        let a = pages.map(None, 2 * PAGE, PAGE).expect("map");
        let b = pages.map(Some(a + 2 * PAGE), 2 * PAGE, PAGE).expect("adjacent map");
        assert_eq!(b, a + 2 * PAGE);
        assert!(pages.unmap(a + PAGE, 2 * PAGE));
        assert!(pages.is_mapped(a, PAGE));
        assert!(pages.is_mapped(b + PAGE, PAGE));
        assert_eq!(pages.mapped_bytes(), 2 * PAGE);
    }

    #[test]
    fn test_sim_hint_must_be_free() {
        let pages = SimulatedPages::default();
        let a = pages.map(None, 4 * PAGE, PAGE).expect("map");
        assert!(pages.map(Some(a + PAGE), PAGE, PAGE).is_none());
        let past = a + 4 * PAGE;
        assert_eq!(pages.map(Some(past), PAGE, PAGE), Some(past));
    }

    #[test]
    fn test_os_pages_map_aligned_roundtrip() {
        let os = OsPages;
        let align = 64 * PAGE;
        let addr = os.map(None, 4 * PAGE, align).expect("mmap should succeed");
        assert_eq!(addr % align, 0);
        assert!(os.purge_forced(addr, 4 * PAGE));
        assert!(os.decommit(addr, 4 * PAGE));
        assert!(os.commit(addr, 4 * PAGE));
        assert!(os.unmap(addr, 4 * PAGE));
    }
}
