//! Extent engine.
//!
//! Serves page-granular regions from three free sets (dirty, muzzy,
//! retained), splitting candidates on the way out and coalescing with
//! address-adjacent neighbors on the way in. Misses grow virtual memory along
//! a geometric series of page-size classes and park the unused remainder in
//! the retained set.
//!
//! Lock order: grow -> free set -> record -> index shard. Free-set locks are
//! released around merges, and hooks are never called with a free-set lock or
//! a record lock held.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::emap::AddressIndex;
use crate::error::{ExtentError, Result};
use crate::eset::{Eset, FitPolicy};
use crate::extent::{Extent, ExtentId, ExtentSnapshot, ExtentState, PageAllocator, Region};
use crate::geom_grow::GeomGrow;
use crate::hooks::{AllocRequest, HookSlot, Hooks};
use crate::log::{EngineLogLevel, EngineLogRecord, LifecycleLog, LogEvent};
use crate::pages::PagePrimitives;
use crate::record_cache::RecordCache;
use crate::reentrancy;
use crate::sz::{self, PAGE};

/// Validates a caller request and rounds it to pages.
pub(crate) fn normalize_request(size: usize, alignment: usize) -> Result<(usize, usize)> {
    if size == 0 || size > sz::MAX_PSZ || !alignment.is_power_of_two() {
        return Err(ExtentError::InvalidRequest { size, alignment });
    }
    Ok((sz::page_ceil(size), alignment.max(PAGE)))
}

enum SplitInterior {
    Ok {
        lead: Option<ExtentId>,
        extent: ExtentId,
        trail: Option<ExtentId>,
    },
    CantAlloc,
    Error {
        to_leak: Option<ExtentId>,
        to_salvage: Option<ExtentId>,
    },
}

#[derive(Debug, Default)]
struct Counters {
    grows: AtomicU64,
    mapped_bytes: AtomicU64,
    abandoned_bytes: AtomicU64,
    purged_pages: AtomicU64,
    split_failures: AtomicU64,
    merge_failures: AtomicU64,
    fallback_allocs: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub grows: u64,
    pub mapped_bytes: u64,
    pub abandoned_bytes: u64,
    pub purged_pages: u64,
    pub split_failures: u64,
    pub merge_failures: u64,
    pub fallback_allocs: u64,
    pub dirty_pages: usize,
    pub muzzy_pages: usize,
    pub retained_pages: usize,
    pub grow_next: usize,
}

/// Page allocator over dirty, muzzy and retained free sets.
#[derive(Debug)]
pub struct ExtentEngine {
    ind: u32,
    config: EngineConfig,
    hooks: Hooks,
    emap: Arc<AddressIndex>,
    records: Arc<RecordCache>,
    dirty: Mutex<Eset>,
    muzzy: Mutex<Eset>,
    retained: Mutex<Eset>,
    grow: Mutex<GeomGrow>,
    sn_next: AtomicU64,
    forked: AtomicBool,
    counters: Counters,
    log: LifecycleLog,
}

impl ExtentEngine {
    /// Engine `ind` sharing `emap` and `records` with other page allocators.
    pub fn new(
        ind: u32,
        config: EngineConfig,
        hooks: Hooks,
        emap: Arc<AddressIndex>,
        records: Arc<RecordCache>,
    ) -> Result<Self> {
        config.validate()?;
        let grow = GeomGrow::new(config.grow_start_pind(), config.grow_limit_pind());
        Ok(Self {
            ind,
            hooks,
            emap,
            records,
            dirty: Mutex::new(Eset::new(ExtentState::Dirty, true)),
            muzzy: Mutex::new(Eset::new(ExtentState::Muzzy, false)),
            retained: Mutex::new(Eset::new(ExtentState::Retained, false)),
            grow: Mutex::new(grow),
            sn_next: AtomicU64::new(0),
            forked: AtomicBool::new(false),
            counters: Counters::default(),
            log: LifecycleLog::new("engine", config.log_capacity),
            config,
        })
    }

    /// Standalone engine with default hooks over `pages`.
    pub fn with_pages(config: EngineConfig, pages: Arc<dyn PagePrimitives>) -> Result<Self> {
        let hooks = Hooks::new(Default::default(), pages, &config);
        let records = Arc::new(RecordCache::new(config.record_capacity));
        Self::new(0, config, hooks, Arc::new(AddressIndex::new()), records)
    }

    #[must_use]
    pub fn ind(&self) -> u32 {
        self.ind
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    #[must_use]
    pub fn index(&self) -> &Arc<AddressIndex> {
        &self.emap
    }

    #[must_use]
    pub fn records(&self) -> &Arc<RecordCache> {
        &self.records
    }

    fn eset(&self, state: ExtentState) -> &Mutex<Eset> {
        debug_assert_ne!(state, ExtentState::Active);
        match state {
            ExtentState::Dirty => &self.dirty,
            ExtentState::Muzzy => &self.muzzy,
            ExtentState::Active | ExtentState::Retained => &self.retained,
        }
    }

    fn fit_policy(&self) -> FitPolicy {
        FitPolicy {
            exact_only: !self.config.maps_coalesce && !self.config.retain,
            lg_max_fit: Some(self.config.lg_extent_max_active_fit),
        }
    }

    fn next_sn(&self) -> u64 {
        self.sn_next.fetch_add(1, Ordering::Relaxed)
    }

    /// Failure for a request that every allocation path declined.
    fn exhaustion(&self, new_addr: Option<usize>) -> ExtentError {
        match self.records.capacity() {
            Some(cap) if self.records.live() >= cap => return ExtentError::oom("record"),
            _ => {}
        }
        if let Some(addr) = new_addr {
            return ExtentError::AddressUnavailable { addr };
        }
        if matches!(self.hooks.table().alloc, HookSlot::Null) {
            return ExtentError::HookRejected { op: "alloc" };
        }
        ExtentError::oom("mapping")
    }

    fn region(&self, id: ExtentId) -> Result<Region> {
        self.records
            .with(id, |e| Region {
                id,
                base: e.base,
                size: e.size,
                zeroed: e.zeroed,
                committed: e.committed,
            })
            .ok_or(ExtentError::StaleHandle)
    }

    /// Owned active extent of this engine, or `None`.
    fn active(&self, id: ExtentId) -> Option<Extent> {
        self.records
            .read(id)
            .filter(|e| e.state == ExtentState::Active && e.pai == PageAllocator::Extent)
            .filter(|e| e.arena_ind == self.ind)
    }

    // ------------------------------------------------------------------
    // Caller-facing operations
    // ------------------------------------------------------------------

    /// Allocates `size` bytes (rounded up to pages) at `alignment`.
    pub fn alloc(&self, size: usize, alignment: usize, zero: bool) -> Result<Region> {
        self.alloc_inner(size, alignment, zero, None)
    }

    /// Allocates exactly `[new_addr, new_addr + size)` from free memory, or
    /// maps it there when nothing is retained.
    pub fn alloc_at(&self, new_addr: usize, size: usize, zero: bool) -> Result<Region> {
        let (size, _) = normalize_request(size, PAGE)?;
        if new_addr & sz::PAGE_MASK != 0 {
            return Err(ExtentError::InvalidRequest {
                size,
                alignment: PAGE,
            });
        }
        if reentrancy::is_reentrant() {
            return Err(ExtentError::Unsupported { op: "alloc_at" });
        }
        let addr = Some(new_addr);
        let id = self
            .recycle(ExtentState::Dirty, addr, size, PAGE, zero, true)
            .or_else(|| self.recycle(ExtentState::Muzzy, addr, size, PAGE, zero, true))
            .or_else(|| self.alloc_grow(addr, size, PAGE, zero, true))
            .ok_or_else(|| self.exhaustion(addr))?;
        self.region(id)
    }

    /// Allocates a slab for size class `szind`. Every page of the slab
    /// resolves through [`ExtentEngine::lookup`].
    pub fn alloc_slab(&self, size: usize, szind: u32, zero: bool) -> Result<Region> {
        self.alloc_inner(size, PAGE, zero, Some(szind))
    }

    fn alloc_inner(
        &self,
        size: usize,
        alignment: usize,
        zero: bool,
        szind: Option<u32>,
    ) -> Result<Region> {
        let (size, alignment) = normalize_request(size, alignment)?;
        let id = if reentrancy::is_reentrant() {
            self.alloc_fallback(size, alignment, zero)
        } else {
            self.recycle(ExtentState::Dirty, None, size, alignment, zero, true)
                .or_else(|| self.recycle(ExtentState::Muzzy, None, size, alignment, zero, true))
                .or_else(|| self.alloc_grow(None, size, alignment, zero, true))
        };
        let id = id.ok_or_else(|| self.exhaustion(None))?;
        if let Some(szind) = szind {
            self.records.with(id, |e| {
                e.slab = true;
                e.szind = Some(szind);
                self.emap.register_boundary(id, e);
                self.emap.register_interior(id, e);
            });
        }
        self.region(id)
    }

    /// Returns a region to the dirty set.
    pub fn dalloc(&self, id: ExtentId) -> Result<()> {
        let released = self.records.with(id, |e| {
            let owned = e.state == ExtentState::Active
                && e.pai == PageAllocator::Extent
                && e.arena_ind == self.ind;
            if owned {
                e.zeroed = false;
            }
            (owned, e.base, e.size)
        });
        match released {
            Some((true, _, _)) => {
                self.record(ExtentState::Dirty, id);
                Ok(())
            }
            Some((false, base, size)) => {
                self.log.record(
                    LogEvent::new(
                        EngineLogLevel::Error,
                        "dalloc",
                        "invariant_double_free",
                        "refused",
                    )
                    .with_range(base, size),
                );
                Err(ExtentError::StaleHandle)
            }
            None => Err(ExtentError::StaleHandle),
        }
    }

    /// Grows a region in place by recycling the free extent right after it.
    pub fn expand(&self, id: ExtentId, old_size: usize, new_size: usize, zero: bool) -> Result<()> {
        let extent = self.active(id).ok_or(ExtentError::StaleHandle)?;
        if extent.size != old_size || new_size <= old_size || !sz::is_page_multiple(new_size) {
            return Err(ExtentError::InvalidRequest {
                size: new_size,
                alignment: PAGE,
            });
        }
        let amount = new_size - old_size;
        let next = extent.past();
        // A head never merges into the mapping before it.
        let next_is_head = self
            .emap
            .lookup(next)
            .and_then(|entry| self.records.with(entry.extent, |e| e.is_head && e.base == next))
            .unwrap_or(false);
        if next_is_head {
            return Err(ExtentError::AddressUnavailable { addr: next });
        }
        let past = Some(next);
        let trail = self
            .recycle(ExtentState::Dirty, past, amount, PAGE, zero, true)
            .or_else(|| self.recycle(ExtentState::Muzzy, past, amount, PAGE, zero, true))
            .or_else(|| self.alloc_grow(past, amount, PAGE, zero, true))
            .ok_or_else(|| self.exhaustion(past))?;
        if !self.merge_impl(id, trail) {
            self.dalloc_wrapper(trail);
            return Err(ExtentError::HookRejected { op: "merge" });
        }
        Ok(())
    }

    /// Shrinks a region in place, freeing its tail to the dirty set.
    pub fn shrink(&self, id: ExtentId, old_size: usize, new_size: usize) -> Result<()> {
        let extent = self.active(id).ok_or(ExtentError::StaleHandle)?;
        if extent.size != old_size || new_size >= old_size || !sz::is_page_multiple(new_size) {
            return Err(ExtentError::InvalidRequest {
                size: new_size,
                alignment: PAGE,
            });
        }
        if self.hooks.split_will_fail() {
            return Err(ExtentError::HookRejected { op: "split" });
        }
        let trail = self
            .split_impl(id, new_size, old_size - new_size)
            .ok_or(ExtentError::HookRejected { op: "split" })?;
        self.records.with(trail, |e| e.zeroed = false);
        self.record(ExtentState::Dirty, trail);
        Ok(())
    }

    /// Commits `[offset, offset + length)` of an active region.
    pub fn commit(&self, id: ExtentId, offset: usize, length: usize) -> Result<()> {
        let extent = self.active(id).ok_or(ExtentError::StaleHandle)?;
        check_range(&extent, offset, length)?;
        if self.commit_impl(id, offset, length) {
            Ok(())
        } else {
            Err(ExtentError::HookRejected { op: "commit" })
        }
    }

    /// Decommits `[offset, offset + length)` of an active region.
    pub fn decommit(&self, id: ExtentId, offset: usize, length: usize) -> Result<()> {
        let extent = self.active(id).ok_or(ExtentError::StaleHandle)?;
        check_range(&extent, offset, length)?;
        if self.decommit_impl(id, offset, length) {
            Ok(())
        } else {
            Err(ExtentError::HookRejected { op: "decommit" })
        }
    }

    /// Moves free pages of `state` down the purge path until at most
    /// `npages_min` remain: dirty pages are lazily purged into the muzzy set
    /// (or fully released when lazy purging is refused), muzzy pages are
    /// released to the retained set. Returns the pages processed.
    pub fn purge(&self, state: ExtentState, npages_min: usize) -> usize {
        let mut purged = 0;
        match state {
            ExtentState::Dirty => {
                while let Some(id) = self.evict(ExtentState::Dirty, npages_min) {
                    let Some(size) = self.records.with(id, |e| e.size) else {
                        break;
                    };
                    purged += size / PAGE;
                    if self.purge_lazy_impl(id, 0, size) {
                        self.record(ExtentState::Muzzy, id);
                    } else {
                        self.dalloc_wrapper(id);
                    }
                }
            }
            ExtentState::Muzzy => {
                while let Some(id) = self.evict(ExtentState::Muzzy, npages_min) {
                    purged += self.records.with(id, |e| e.npages()).unwrap_or(0);
                    self.dalloc_wrapper(id);
                }
            }
            ExtentState::Active | ExtentState::Retained => {}
        }
        self.counters
            .purged_pages
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Evicts every retained extent and destroys it through the hooks.
    pub fn destroy_retained(&self) -> usize {
        let mut destroyed = 0;
        while let Some(id) = self.evict(ExtentState::Retained, 0) {
            destroyed += 1;
            self.destroy_wrapper(id);
        }
        destroyed
    }

    // ------------------------------------------------------------------
    // Allocation paths
    // ------------------------------------------------------------------

    fn recycle(
        &self,
        state: ExtentState,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
        zero: bool,
        commit: bool,
    ) -> Option<ExtentId> {
        let id = self.recycle_extract(state, new_addr, size, alignment)?;
        let id = self.recycle_split(state, new_addr, size, alignment, id)?;
        self.finish_alloc(state, id, zero, commit)
    }

    fn recycle_extract(
        &self,
        state: ExtentState,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
    ) -> Option<ExtentId> {
        let mut set = self.eset(state).lock();
        let id = match new_addr {
            Some(addr) => {
                let (id, extent) =
                    self.emap
                        .lock_extent_from_addr(&self.records, addr, false)?;
                if extent.base != addr
                    || extent.arena_ind != self.ind
                    || extent.pai != PageAllocator::Extent
                    || extent.size < size
                    || extent.state != set.state()
                {
                    return None;
                }
                id
            }
            None => set.fit(size, alignment, self.fit_policy())?,
        };
        let removed = set.remove(id);
        debug_assert!(removed);
        self.records.with(id, |e| e.state = ExtentState::Active);
        Some(id)
    }

    fn recycle_split(
        &self,
        state: ExtentState,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
        id: ExtentId,
    ) -> Option<ExtentId> {
        match self.split_interior(id, new_addr, size, alignment) {
            SplitInterior::Ok { lead, extent, trail } => {
                if let Some(lead) = lead {
                    self.deactivate(state, lead);
                }
                if let Some(trail) = trail {
                    self.deactivate(state, trail);
                }
                Some(extent)
            }
            SplitInterior::CantAlloc => {
                self.deactivate(state, id);
                None
            }
            SplitInterior::Error {
                to_leak,
                to_salvage,
            } => {
                if let Some(salvage) = to_salvage {
                    self.deactivate(state, salvage);
                }
                if let Some(leak) = to_leak {
                    if self.hooks.split_will_fail() {
                        self.deactivate(state, leak);
                    } else {
                        self.deregister(leak);
                        self.abandon_vm(state, leak);
                    }
                }
                None
            }
        }
    }

    /// Commits and zeroes a freshly extracted extent as requested. On failure
    /// the extent goes back to `state`.
    fn finish_alloc(
        &self,
        state: ExtentState,
        id: ExtentId,
        zero: bool,
        commit: bool,
    ) -> Option<ExtentId> {
        let extent = self.records.read(id)?;
        if commit && !extent.committed && !self.commit_impl(id, 0, extent.size) {
            self.record(state, id);
            return None;
        }
        let zeroed = self.records.with(id, |e| e.zeroed).unwrap_or(false);
        if zero && !zeroed {
            if !self.hooks.zero(extent.base, extent.size) {
                self.record(state, id);
                return None;
            }
            self.records.with(id, |e| e.zeroed = true);
        }
        Some(id)
    }

    fn split_interior(
        &self,
        id: ExtentId,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
    ) -> SplitInterior {
        let Some((base, esize)) = self.records.with(id, |e| (e.base, e.size)) else {
            return SplitInterior::CantAlloc;
        };
        let Some(aligned) = sz::align_ceil(base, sz::page_ceil(alignment)) else {
            return SplitInterior::CantAlloc;
        };
        let leadsize = aligned - base;
        debug_assert!(new_addr.is_none() || leadsize == 0);
        if leadsize.checked_add(size).is_none_or(|need| need > esize) {
            return SplitInterior::CantAlloc;
        }
        let trailsize = esize - leadsize - size;

        let mut lead = None;
        let mut extent = id;
        if leadsize != 0 {
            match self.split_impl(id, leadsize, size + trailsize) {
                Some(rest) => {
                    lead = Some(id);
                    extent = rest;
                }
                None => {
                    return SplitInterior::Error {
                        to_leak: Some(id),
                        to_salvage: None,
                    };
                }
            }
        }
        let mut trail = None;
        if trailsize != 0 {
            match self.split_impl(extent, size, trailsize) {
                Some(t) => trail = Some(t),
                None => {
                    return SplitInterior::Error {
                        to_leak: Some(extent),
                        to_salvage: lead,
                    };
                }
            }
        }
        SplitInterior::Ok {
            lead,
            extent,
            trail,
        }
    }

    fn alloc_grow(
        &self,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
        zero: bool,
        commit: bool,
    ) -> Option<ExtentId> {
        if let Some(id) = self.alloc_retained(new_addr, size, alignment, zero, commit) {
            return Some(id);
        }
        if self.config.retain && new_addr.is_some() {
            return None;
        }
        self.alloc_wrapper_hard(new_addr, size, alignment, zero, commit)
    }

    fn alloc_retained(
        &self,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
        zero: bool,
        commit: bool,
    ) -> Option<ExtentId> {
        let mut grow = self.grow.lock();
        if let Some(id) = self.recycle(ExtentState::Retained, new_addr, size, alignment, zero, commit)
        {
            return Some(id);
        }
        if !self.config.retain || new_addr.is_some() {
            return None;
        }
        let id = self.grow_retained(&mut grow, size, alignment)?;
        drop(grow);
        self.finish_alloc(ExtentState::Retained, id, zero, commit)
    }

    /// Maps the next growth class, carves the request out of it and parks
    /// the remainder in the retained set. Called with the grow lock held.
    fn grow_retained(&self, grow: &mut GeomGrow, size: usize, alignment: usize) -> Option<ExtentId> {
        let alloc_size_min = size.checked_add(sz::page_ceil(alignment))? - PAGE;
        let Some((alloc_size, skip)) = grow.size_prepare(alloc_size_min) else {
            self.log.record(
                LogEvent::new(EngineLogLevel::Warn, "grow_retained", "grow", "series_exhausted")
                    .with_range(0, alloc_size_min),
            );
            return None;
        };
        let request = AllocRequest {
            addr_hint: None,
            size: alloc_size,
            alignment: PAGE,
            zero: false,
            commit: false,
        };
        let Some(grant) = self.hooks.alloc(&request) else {
            self.log.record(
                LogEvent::new(EngineLogLevel::Warn, "grow_retained", "grow", "map_failed")
                    .with_range(0, alloc_size),
            );
            return None;
        };
        let extent = Extent::new(
            self.ind,
            grant.addr,
            alloc_size,
            self.next_sn(),
            ExtentState::Active,
            grant.zeroed,
            grant.committed,
            PageAllocator::Extent,
            true,
        );
        let id = match self.records.get(extent.clone()) {
            Ok(id) => id,
            Err(_) => {
                self.hooks.dalloc(grant.addr, alloc_size, grant.committed);
                return None;
            }
        };
        self.emap.register_boundary(id, &extent);
        self.counters.grows.fetch_add(1, Ordering::Relaxed);
        self.counters
            .mapped_bytes
            .fetch_add(alloc_size as u64, Ordering::Relaxed);
        self.log.record(
            LogEvent::new(EngineLogLevel::Info, "grow_retained", "grow", "mapped")
                .with_range(grant.addr, alloc_size)
                .with_details(&format!("pind={} skip={skip}", grow.next())),
        );

        let id = match self.split_interior(id, None, size, alignment) {
            SplitInterior::Ok { lead, extent, trail } => {
                if let Some(lead) = lead {
                    self.record(ExtentState::Retained, lead);
                }
                if let Some(trail) = trail {
                    self.record(ExtentState::Retained, trail);
                }
                extent
            }
            SplitInterior::CantAlloc => {
                self.record(ExtentState::Retained, id);
                return None;
            }
            SplitInterior::Error {
                to_leak,
                to_salvage,
            } => {
                if let Some(salvage) = to_salvage {
                    self.record(ExtentState::Retained, salvage);
                }
                if let Some(leak) = to_leak {
                    self.deregister(leak);
                    self.abandon_vm(ExtentState::Retained, leak);
                }
                return None;
            }
        };
        grow.size_commit(skip);
        Some(id)
    }

    /// Maps exactly the request, bypassing the retained set.
    fn alloc_wrapper_hard(
        &self,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
        zero: bool,
        commit: bool,
    ) -> Option<ExtentId> {
        let request = AllocRequest {
            addr_hint: new_addr,
            size,
            alignment,
            zero,
            commit,
        };
        let grant = self.hooks.alloc(&request)?;
        let id = self.adopt_mapping(grant.addr, size, grant.zeroed, grant.committed, self.config.retain)?;
        self.finish_alloc(ExtentState::Retained, id, zero, commit)
    }

    /// Serves an allocation issued from inside a custom hook. Maps through the
    /// default primitives and touches no free set or grow lock.
    fn alloc_fallback(&self, size: usize, alignment: usize, zero: bool) -> Option<ExtentId> {
        let request = AllocRequest {
            addr_hint: None,
            size,
            alignment,
            zero,
            commit: true,
        };
        let grant = self.hooks.alloc_fallback(&request)?;
        self.counters.fallback_allocs.fetch_add(1, Ordering::Relaxed);
        self.adopt_mapping(grant.addr, size, grant.zeroed, grant.committed, true)
    }

    fn adopt_mapping(
        &self,
        addr: usize,
        size: usize,
        zeroed: bool,
        committed: bool,
        is_head: bool,
    ) -> Option<ExtentId> {
        let extent = Extent::new(
            self.ind,
            addr,
            size,
            self.next_sn(),
            ExtentState::Active,
            zeroed,
            committed,
            PageAllocator::Extent,
            is_head,
        );
        let id = match self.records.get(extent.clone()) {
            Ok(id) => id,
            Err(_) => {
                self.hooks.unmap_fallback(addr, size);
                return None;
            }
        };
        self.emap.register_boundary(id, &extent);
        self.counters
            .mapped_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        Some(id)
    }

    // ------------------------------------------------------------------
    // Split and merge
    // ------------------------------------------------------------------

    /// Splits active extent `id` into `[size_a | size_b]` and returns the
    /// trail. On failure `id` and the index are untouched.
    fn split_impl(&self, id: ExtentId, size_a: usize, size_b: usize) -> Option<ExtentId> {
        if self.hooks.split_will_fail() {
            return None;
        }
        let original = self.records.read(id)?;
        debug_assert_eq!(original.size, size_a + size_b);
        let mut trail = Extent::new(
            original.arena_ind,
            original.base + size_a,
            size_b,
            original.sn,
            original.state,
            original.zeroed,
            original.committed,
            original.pai,
            false,
        );
        trail.dumpable = original.dumpable;
        let Ok(trail_id) = self.records.get(trail) else {
            self.counters.split_failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if !self.hooks.split(
            original.base,
            original.size,
            size_a,
            size_b,
            original.committed,
        ) {
            self.records.put(trail_id);
            self.counters.split_failures.fetch_add(1, Ordering::Relaxed);
            self.log.record(
                LogEvent::new(EngineLogLevel::Debug, "split", "hook_rejected", "refused")
                    .with_range(original.base, original.size),
            );
            return None;
        }
        let Some((mut lead, trail)) = self.records.lock2(id, trail_id) else {
            self.records.put(trail_id);
            return None;
        };
        lead.size = size_a;
        if lead.slab {
            self.emap.deregister_interior(&original);
            self.emap.register_interior(id, &lead);
        }
        self.emap.split_commit(id, &lead, trail_id, &trail);
        Some(trail_id)
    }

    /// Merges active extent `b` into active extent `a`, which must end where
    /// `b` begins. `b`'s record is released on success.
    fn merge_impl(&self, a: ExtentId, b: ExtentId) -> bool {
        if self.hooks.merge_will_fail() {
            return false;
        }
        let (Some(lead), Some(trail)) = (self.records.read(a), self.records.read(b)) else {
            return false;
        };
        if lead.past() != trail.base || trail.is_head {
            return false;
        }
        if !self
            .hooks
            .merge(lead.base, lead.size, trail.base, trail.size, lead.committed)
        {
            self.counters.merge_failures.fetch_add(1, Ordering::Relaxed);
            self.log.record(
                LogEvent::new(EngineLogLevel::Debug, "merge", "hook_rejected", "refused")
                    .with_range(lead.base, lead.size + trail.size),
            );
            return false;
        }
        {
            let Some((mut lead, trail)) = self.records.lock2(a, b) else {
                return false;
            };
            let inner_last = lead.last();
            let inner_first = trail.base;
            lead.size += trail.size;
            lead.sn = lead.sn.min(trail.sn);
            lead.zeroed &= trail.zeroed;
            self.emap.merge_commit(a, &lead, inner_last, inner_first);
        }
        self.records.put(b);
        true
    }

    // ------------------------------------------------------------------
    // Coalescing and free-set insertion
    // ------------------------------------------------------------------

    fn can_coalesce(&self, set_state: ExtentState, inner: &Extent, outer: &Extent, forward: bool) -> bool {
        if outer.arena_ind != self.ind || outer.pai != PageAllocator::Extent {
            return false;
        }
        if outer.state != set_state || outer.committed != inner.committed {
            return false;
        }
        let trail_is_head = if forward { outer.is_head } else { inner.is_head };
        !trail_is_head
    }

    /// Removes the mergeable neighbor at `addr` from `set` and activates it.
    fn take_neighbor(
        &self,
        set: &mut Eset,
        inner: &Extent,
        addr: usize,
        forward: bool,
        inactive_only: bool,
    ) -> Option<ExtentId> {
        let (id, mut neighbor) = self
            .emap
            .lock_extent_from_addr(&self.records, addr, inactive_only)?;
        let adjacent = if forward {
            neighbor.base == inner.past()
        } else {
            neighbor.past() == inner.base
        };
        if !adjacent || !self.can_coalesce(set.state(), inner, &neighbor, forward) {
            return None;
        }
        if !set.remove(id) {
            return None;
        }
        neighbor.state = ExtentState::Active;
        Some(id)
    }

    fn reinsert(&self, set: &mut Eset, id: ExtentId) {
        let state = set.state();
        self.records.with(id, |e| {
            e.state = state;
            set.insert(id, e);
        });
    }

    fn deactivate(&self, state: ExtentState, id: ExtentId) {
        let mut set = self.eset(state).lock();
        self.reinsert(&mut set, id);
    }

    /// Merges active extent `id` with free neighbors of `set`. Eager mode
    /// repeats until nothing merges; delayed mode makes a single pass.
    /// Returns the surviving handle and whether anything merged.
    fn try_coalesce(
        &self,
        set: &mut MutexGuard<'_, Eset>,
        mut id: ExtentId,
        inactive_only: bool,
        delayed: bool,
    ) -> (ExtentId, bool) {
        let mut coalesced = false;
        loop {
            let mut merged = false;
            let Some(inner) = self.records.read(id) else {
                break;
            };
            if let Some(next) = self.take_neighbor(set, &inner, inner.past(), true, inactive_only) {
                if MutexGuard::unlocked(set, || self.merge_impl(id, next)) {
                    merged = true;
                } else {
                    self.reinsert(set, next);
                }
            }
            let Some(inner) = self.records.read(id) else {
                break;
            };
            if let Some(before) = inner.before() {
                if let Some(prev) = self.take_neighbor(set, &inner, before, false, inactive_only) {
                    if MutexGuard::unlocked(set, || self.merge_impl(prev, id)) {
                        id = prev;
                        merged = true;
                    } else {
                        self.reinsert(set, prev);
                    }
                }
            }
            coalesced |= merged;
            if !merged || delayed {
                break;
            }
        }
        (id, coalesced)
    }

    /// Inserts active extent `id` into the `state` set, coalescing first.
    fn record(&self, state: ExtentState, id: ExtentId) {
        let Some(size) = self.records.with(id, |e| {
            if e.slab {
                self.emap.deregister_interior(e);
                e.slab = false;
            }
            if e.szind.take().is_some() {
                self.emap.register_boundary(id, e);
            }
            e.size
        }) else {
            return;
        };

        let mut set = self.eset(state).lock();
        let mut id = id;
        if !set.delay_coalesce() {
            id = self.try_coalesce(&mut set, id, false, false).0;
        } else if size >= self.config.large_coalesce_threshold {
            loop {
                let (next, coalesced) = self.try_coalesce(&mut set, id, true, true);
                id = next;
                if !coalesced {
                    break;
                }
            }
            let merged_size = self.records.with(id, |e| e.size).unwrap_or(0);
            if state == ExtentState::Dirty && merged_size >= self.config.oversize_threshold {
                drop(set);
                self.dalloc_wrapper(id);
                return;
            }
        } else {
            id = self.try_coalesce(&mut set, id, false, true).0;
        }
        self.reinsert(&mut set, id);
    }

    /// Takes the least recently freed extent of `state`, provided at least
    /// `npages_min` free pages remain. Delayed sets coalesce the victim and
    /// retry until it is stable. Retained victims leave the index.
    fn evict(&self, state: ExtentState, npages_min: usize) -> Option<ExtentId> {
        let mut set = self.eset(state).lock();
        let id = loop {
            let id = set.first_lru()?;
            let npages = self.records.with(id, |e| e.npages())?;
            if set.npages().saturating_sub(npages) < npages_min {
                return None;
            }
            set.remove(id);
            self.records.with(id, |e| e.state = ExtentState::Active);
            if !set.delay_coalesce() {
                break id;
            }
            let (merged, coalesced) = self.try_coalesce(&mut set, id, true, true);
            if !coalesced {
                break merged;
            }
            self.reinsert(&mut set, merged);
        };
        drop(set);
        if state == ExtentState::Retained {
            self.deregister(id);
        }
        if let Some((base, size)) = self.records.with(id, |e| (e.base, e.size)) {
            self.log.record(
                LogEvent::new(EngineLogLevel::Debug, "evict", "evict", "evicted")
                    .with_range(base, size)
                    .with_details(state.as_str()),
            );
        }
        Some(id)
    }

    // ------------------------------------------------------------------
    // Release paths
    // ------------------------------------------------------------------

    fn deregister(&self, id: ExtentId) {
        self.records.with(id, |e| {
            self.emap.deregister_boundary(e);
            if e.slab {
                self.emap.deregister_interior(e);
            }
        });
    }

    /// Drops an extent whose split failed midway: purge it when dirty and
    /// forget the record. The address range stays mapped but unused.
    fn abandon_vm(&self, state: ExtentState, id: ExtentId) {
        let Some(extent) = self.records.read(id) else {
            return;
        };
        if state == ExtentState::Dirty
            && !self.hooks.purge_lazy(extent.base, extent.size, 0, extent.size)
        {
            self.hooks
                .purge_forced(extent.base, extent.size, 0, extent.size);
        }
        self.records.put(id);
        self.counters
            .abandoned_bytes
            .fetch_add(extent.size as u64, Ordering::Relaxed);
        self.log.record(
            LogEvent::new(EngineLogLevel::Warn, "abandon_vm", "leak", "abandoned")
                .with_range(extent.base, extent.size)
                .with_details(state.as_str()),
        );
    }

    /// Releases an active extent: unmap it when the dalloc hook agrees,
    /// otherwise decommit or purge it and park it in the retained set.
    fn dalloc_wrapper(&self, id: ExtentId) {
        let Some(extent) = self.records.read(id) else {
            return;
        };
        if !self.hooks.dalloc_will_fail() {
            self.deregister(id);
            if self
                .hooks
                .dalloc(extent.base, extent.size, extent.committed)
            {
                self.records.put(id);
                self.counters
                    .mapped_bytes
                    .fetch_sub(extent.size as u64, Ordering::Relaxed);
                return;
            }
            self.emap.register_boundary(id, &extent);
        }
        let zeroed = if !extent.committed || self.decommit_impl(id, 0, extent.size) {
            true
        } else if self.purge_forced_impl(id, 0, extent.size) {
            true
        } else {
            self.purge_lazy_impl(id, 0, extent.size);
            false
        };
        self.records.with(id, |e| e.zeroed = zeroed);
        self.record(ExtentState::Retained, id);
    }

    fn destroy_wrapper(&self, id: ExtentId) {
        let Some(extent) = self.records.read(id) else {
            return;
        };
        self.hooks
            .destroy(extent.base, extent.size, extent.committed);
        self.records.put(id);
        self.counters
            .mapped_bytes
            .fetch_sub(extent.size as u64, Ordering::Relaxed);
    }

    fn commit_impl(&self, id: ExtentId, offset: usize, length: usize) -> bool {
        let Some((base, size)) = self.records.with(id, |e| (e.base, e.size)) else {
            return false;
        };
        let ok = self.hooks.commit(base, size, offset, length);
        if ok {
            self.records.with(id, |e| e.committed = true);
        }
        ok
    }

    fn decommit_impl(&self, id: ExtentId, offset: usize, length: usize) -> bool {
        let Some((base, size)) = self.records.with(id, |e| (e.base, e.size)) else {
            return false;
        };
        let ok = self.hooks.decommit(base, size, offset, length);
        if ok {
            self.records.with(id, |e| e.committed = false);
        }
        ok
    }

    fn purge_lazy_impl(&self, id: ExtentId, offset: usize, length: usize) -> bool {
        self.records
            .with(id, |e| (e.base, e.size))
            .is_some_and(|(base, size)| self.hooks.purge_lazy(base, size, offset, length))
    }

    fn purge_forced_impl(&self, id: ExtentId, offset: usize, length: usize) -> bool {
        self.records
            .with(id, |e| (e.base, e.size))
            .is_some_and(|(base, size)| self.hooks.purge_forced(base, size, offset, length))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn extent(&self, id: ExtentId) -> Option<ExtentSnapshot> {
        self.records.with(id, |e| e.snapshot(id))
    }

    /// Extent whose index entry covers `addr`, with its size class.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<(ExtentSnapshot, Option<u32>)> {
        let entry = self.emap.lookup(addr)?;
        let snapshot = self.extent(entry.extent)?;
        Some((snapshot, entry.szind))
    }

    /// Free extents of `state`, ascending by address.
    #[must_use]
    pub fn free_extents(&self, state: ExtentState) -> Vec<ExtentSnapshot> {
        let set = self.eset(state).lock();
        set.members_by_addr()
            .into_iter()
            .filter_map(|(id, _, _)| self.extent(id))
            .collect()
    }

    #[must_use]
    pub fn free_pages(&self, state: ExtentState) -> usize {
        self.eset(state).lock().npages()
    }

    #[must_use]
    pub fn free_extent_count(&self, state: ExtentState) -> usize {
        self.eset(state).lock().nextents()
    }

    /// Current class index of the growth series.
    #[must_use]
    pub fn grow_next(&self) -> usize {
        self.grow.lock().next()
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            grows: self.counters.grows.load(Ordering::Relaxed),
            mapped_bytes: self.counters.mapped_bytes.load(Ordering::Relaxed),
            abandoned_bytes: self.counters.abandoned_bytes.load(Ordering::Relaxed),
            purged_pages: self.counters.purged_pages.load(Ordering::Relaxed),
            split_failures: self.counters.split_failures.load(Ordering::Relaxed),
            merge_failures: self.counters.merge_failures.load(Ordering::Relaxed),
            fallback_allocs: self.counters.fallback_allocs.load(Ordering::Relaxed),
            dirty_pages: self.free_pages(ExtentState::Dirty),
            muzzy_pages: self.free_pages(ExtentState::Muzzy),
            retained_pages: self.free_pages(ExtentState::Retained),
            grow_next: self.grow_next(),
        }
    }

    /// Drains the lifecycle log.
    pub fn drain_logs(&self) -> Vec<EngineLogRecord> {
        self.log.drain()
    }

    // ------------------------------------------------------------------
    // Fork handling
    // ------------------------------------------------------------------

    /// Acquires every engine lock ahead of `fork`.
    pub fn prefork(&self) {
        std::mem::forget(self.grow.lock());
        std::mem::forget(self.dirty.lock());
        std::mem::forget(self.muzzy.lock());
        std::mem::forget(self.retained.lock());
        self.forked.store(true, Ordering::Release);
    }

    pub fn postfork_parent(&self) {
        self.release_fork_locks();
    }

    /// Releases the locks in the child without re-acquiring them.
    pub fn postfork_child(&self) {
        self.release_fork_locks();
    }

    #[allow(unsafe_code)]
    fn release_fork_locks(&self) {
        if !self.forked.swap(false, Ordering::AcqRel) {
            return;
        }
        // SAFETY: `prefork` leaked exactly one guard for each of these
        // mutexes and nothing has released them since.
        unsafe {
            self.retained.force_unlock();
            self.muzzy.force_unlock();
            self.dirty.force_unlock();
            self.grow.force_unlock();
        }
    }
}

fn check_range(extent: &Extent, offset: usize, length: usize) -> Result<()> {
    let in_bounds = offset
        .checked_add(length)
        .is_some_and(|end| end <= extent.size);
    if !in_bounds || offset & sz::PAGE_MASK != 0 || !sz::is_page_multiple(length) {
        return Err(ExtentError::InvalidRequest {
            size: length,
            alignment: PAGE,
        });
    }
    Ok(())
}
