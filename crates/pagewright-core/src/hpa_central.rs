//! HPA Central: the shared manager of hugepage-aligned regions.
//!
//! Shards carve pageslabs and oversized requests out of one free set of
//! hugepage-tier extents. The free set and every inactive hugepage-tier
//! record are guarded by the central mutex. Growth maps hugepage-aligned
//! regions under a separate grow mutex with double-checked reuse, so other
//! shards keep allocating from the free set while a mapping is in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::emap::AddressIndex;
use crate::error::{ExtentError, Result};
use crate::eset::{Eset, FitPolicy};
use crate::extent::{Extent, ExtentId, ExtentSnapshot, ExtentState, PageAllocator};
use crate::geom_grow::GeomGrow;
use crate::log::{EngineLogLevel, EngineLogRecord, LifecycleLog, LogEvent};
use crate::pages::PagePrimitives;
use crate::record_cache::RecordCache;
use crate::sz::{self, PAGE};

#[derive(Debug)]
pub struct HpaCentral {
    ind: u32,
    hugepage: usize,
    pages: Arc<dyn PagePrimitives>,
    emap: Arc<AddressIndex>,
    records: Arc<RecordCache>,
    grow: Mutex<GeomGrow>,
    eset: Mutex<Eset>,
    sn_next: AtomicU64,
    mapped_bytes: AtomicU64,
    forked: AtomicBool,
    log: LifecycleLog,
}

impl HpaCentral {
    pub fn new(
        ind: u32,
        config: &EngineConfig,
        pages: Arc<dyn PagePrimitives>,
        emap: Arc<AddressIndex>,
        records: Arc<RecordCache>,
    ) -> Result<Self> {
        config.validate()?;
        let start = sz::psz2ind(config.hugepage);
        let limit = config.grow_limit_pind().max(start);
        Ok(Self {
            ind,
            hugepage: config.hugepage,
            pages,
            emap,
            records,
            grow: Mutex::new(GeomGrow::new(start, limit)),
            eset: Mutex::new(Eset::new(ExtentState::Dirty, false)),
            sn_next: AtomicU64::new(0),
            mapped_bytes: AtomicU64::new(0),
            forked: AtomicBool::new(false),
            log: LifecycleLog::new("hpa_central", config.log_capacity),
        })
    }

    #[must_use]
    pub fn ind(&self) -> u32 {
        self.ind
    }

    #[must_use]
    pub fn index(&self) -> &Arc<AddressIndex> {
        &self.emap
    }

    #[must_use]
    pub fn records(&self) -> &Arc<RecordCache> {
        &self.records
    }

    #[must_use]
    pub fn hugepage(&self) -> usize {
        self.hugepage
    }

    /// Splits `size` bytes off the front of `id`, returning the trail. The
    /// trail inherits state and serial; it is never a head.
    fn split(&self, id: ExtentId, size: usize) -> Option<ExtentId> {
        let original = self.records.read(id)?;
        let trail = Extent::new(
            original.arena_ind,
            original.base + size,
            original.size - size,
            original.sn,
            original.state,
            original.zeroed,
            original.committed,
            PageAllocator::Hpa,
            false,
        );
        let trail_id = self.records.get(trail).ok()?;
        let Some((mut lead, trail)) = self.records.lock2(id, trail_id) else {
            self.records.put(trail_id);
            return None;
        };
        lead.size = size;
        self.emap.split_commit(id, &lead, trail_id, &trail);
        Some(trail_id)
    }

    /// Takes a free extent of at least `size_min` bytes, trimmed to
    /// `size_goal` when larger. Call with the central mutex held.
    fn alloc_reuse_locked(&self, eset: &mut Eset, size_min: usize, size_goal: usize) -> Option<ExtentId> {
        let policy = FitPolicy {
            exact_only: false,
            lg_max_fit: None,
        };
        let id = eset.fit(size_min, PAGE, policy)?;
        eset.remove(id);
        let size = self.records.with(id, |e| e.size)?;
        if size > size_goal {
            match self.split(id, size_goal) {
                Some(trail) => {
                    self.records.with(trail, |e| eset.insert(trail, e));
                }
                None => {
                    self.records.with(id, |e| eset.insert(id, e));
                    return None;
                }
            }
        }
        self.records.with(id, |e| e.state = ExtentState::Active);
        Some(id)
    }

    pub fn alloc_reuse(&self, size_min: usize, size_goal: usize) -> Option<ExtentId> {
        let mut eset = self.eset.lock();
        self.alloc_reuse_locked(&mut eset, size_min, size_goal)
    }

    /// Adopts the freshly mapped head extent `id` and splits `size` bytes off
    /// it, parking the trail in the free set. On failure nothing stays
    /// registered.
    pub fn alloc_grow(&self, size: usize, id: ExtentId) -> bool {
        let mut eset = self.eset.lock();
        let Some(extent) = self.records.read(id) else {
            return false;
        };
        debug_assert!(extent.is_head && extent.state == ExtentState::Active);
        debug_assert!(extent.size >= size);
        debug_assert!(self.emap.lookup(extent.base).is_none());
        self.emap.register_boundary(id, &extent);
        let sn = self.sn_next.fetch_add(1, Ordering::Relaxed);
        self.records.with(id, |e| e.sn = sn);
        if extent.size == size {
            return true;
        }
        let Some(trail) = self.split(id, size) else {
            self.emap.deregister_boundary(&extent);
            return false;
        };
        self.records.with(trail, |e| {
            e.sn = sn;
            e.state = ExtentState::Dirty;
            eset.insert(trail, e);
        });
        true
    }

    /// Serves at least `size_min` bytes, trimmed to `size_goal`, growing by
    /// a hugepage-aligned mapping when the free set cannot.
    pub fn alloc(&self, size_min: usize, size_goal: usize) -> Result<ExtentId> {
        debug_assert!(sz::is_page_multiple(size_min) && sz::is_page_multiple(size_goal));
        if let Some(id) = self.alloc_reuse(size_min, size_goal) {
            return Ok(id);
        }
        let mut grow = self.grow.lock();
        if let Some(id) = self.alloc_reuse(size_min, size_goal) {
            return Ok(id);
        }

        let goal_min = sz::align_ceil(size_goal, self.hugepage).ok_or(ExtentError::oom("growth"))?;
        let Some((class_size, skip)) = grow.size_prepare(goal_min) else {
            self.log.record(
                LogEvent::new(EngineLogLevel::Warn, "central_grow", "grow", "series_exhausted")
                    .with_range(0, goal_min),
            );
            return Err(ExtentError::oom("growth"));
        };
        let alloc_size = sz::align_ceil(class_size, self.hugepage).ok_or(ExtentError::oom("growth"))?;
        let Some(addr) = self.pages.map(None, alloc_size, self.hugepage) else {
            self.log.record(
                LogEvent::new(EngineLogLevel::Warn, "central_grow", "grow", "map_failed")
                    .with_range(0, alloc_size),
            );
            return Err(ExtentError::oom("mapping"));
        };
        self.pages.mark_huge(addr, alloc_size);

        let extent = Extent::new(
            self.ind,
            addr,
            alloc_size,
            0,
            ExtentState::Active,
            true,
            true,
            PageAllocator::Hpa,
            true,
        );
        let id = match self.records.get(extent) {
            Ok(id) => id,
            Err(err) => {
                self.pages.unmap(addr, alloc_size);
                return Err(err);
            }
        };
        if !self.alloc_grow(size_goal, id) {
            self.records.put(id);
            self.pages.unmap(addr, alloc_size);
            return Err(ExtentError::oom("record"));
        }
        grow.size_commit(skip);
        drop(grow);

        self.mapped_bytes
            .fetch_add(alloc_size as u64, Ordering::Relaxed);
        self.log.record(
            LogEvent::new(EngineLogLevel::Info, "central_grow", "grow", "mapped")
                .with_range(addr, alloc_size)
                .with_details(&format!("skip={skip}")),
        );
        Ok(id)
    }

    /// Free hugepage-tier neighbor at `addr`, if any.
    fn merge_candidate(&self, addr: usize) -> Option<ExtentId> {
        let (id, guard) = self
            .emap
            .lock_extent_from_addr(&self.records, addr, true)?;
        let eligible = guard.pai == PageAllocator::Hpa && guard.state != ExtentState::Active;
        eligible.then_some(id)
    }

    /// Merges `b` into `a`, releasing `b`'s record.
    fn merge(&self, a: ExtentId, b: ExtentId) -> bool {
        {
            let Some((mut lead, trail)) = self.records.lock2(a, b) else {
                return false;
            };
            if lead.past() != trail.base {
                return false;
            }
            let inner_last = lead.last();
            let inner_first = trail.base;
            lead.size += trail.size;
            self.emap.merge_commit(a, &lead, inner_last, inner_first);
        }
        self.records.put(b);
        true
    }

    /// Returns an active hugepage-tier extent to the free set, merging with
    /// free neighbors that do not cross a head boundary.
    pub fn dalloc(&self, id: ExtentId) -> Result<()> {
        let mut eset = self.eset.lock();
        let extent = self
            .records
            .with(id, |e| {
                let owned = e.state == ExtentState::Active && e.pai == PageAllocator::Hpa && e.ps.is_none();
                if owned {
                    e.zeroed = false;
                    e.arena_ind = self.ind;
                }
                owned.then(|| e.clone())
            })
            .flatten()
            .ok_or(ExtentError::StaleHandle)?;

        let mut id = id;
        if !extent.is_head {
            if let Some(lead) = extent.before().and_then(|addr| self.merge_candidate(addr)) {
                if eset.remove(lead) {
                    if self.merge(lead, id) {
                        id = lead;
                    } else {
                        self.records.with(lead, |e| eset.insert(lead, e));
                    }
                }
            }
        }
        if let Some(trail) = self.merge_candidate(extent.past()) {
            let trail_is_head = self.records.with(trail, |e| e.is_head).unwrap_or(true);
            if !trail_is_head && eset.remove(trail) && !self.merge(id, trail) {
                self.records.with(trail, |e| eset.insert(trail, e));
            }
        }
        self.records.with(id, |e| {
            e.state = ExtentState::Dirty;
            eset.insert(id, e);
        });
        Ok(())
    }

    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.eset.lock().npages()
    }

    /// Free extents, ascending by address.
    #[must_use]
    pub fn free_extents(&self) -> Vec<ExtentSnapshot> {
        let eset = self.eset.lock();
        eset.members_by_addr()
            .into_iter()
            .filter_map(|(id, _, _)| self.records.with(id, |e| e.snapshot(id)))
            .collect()
    }

    #[must_use]
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn grow_next(&self) -> usize {
        self.grow.lock().next()
    }

    pub fn drain_logs(&self) -> Vec<EngineLogRecord> {
        self.log.drain()
    }

    pub fn prefork(&self) {
        std::mem::forget(self.grow.lock());
        std::mem::forget(self.eset.lock());
        self.forked.store(true, Ordering::Release);
    }

    pub fn postfork_parent(&self) {
        self.release_fork_locks();
    }

    pub fn postfork_child(&self) {
        self.release_fork_locks();
    }

    #[allow(unsafe_code)]
    fn release_fork_locks(&self) {
        if !self.forked.swap(false, Ordering::AcqRel) {
            return;
        }
        // SAFETY: `prefork` leaked one guard for each mutex and nothing has
        // released them since.
        unsafe {
            self.eset.force_unlock();
            self.grow.force_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::SimulatedPages;

    const HUGE: usize = 2 << 20;

    fn central() -> (HpaCentral, Arc<SimulatedPages>) {
        let pages = Arc::new(SimulatedPages::new(0));
        let central = HpaCentral::new(
            7,
            &EngineConfig::default(),
            pages.clone(),
            Arc::new(AddressIndex::new()),
            Arc::new(RecordCache::new(None)),
        )
        .expect("central");
        (central, pages)
    }

    #[test]
    fn test_grow_maps_hugepage_aligned_and_parks_trail() {
        let (central, pages) = central();
        let id = central.alloc(8 * PAGE, HUGE / 2).expect("grow");
        let extent = central.records().read(id).expect("live");
        assert_eq!(extent.base % HUGE, 0);
        assert_eq!(extent.size, HUGE / 2);
        assert!(extent.is_head);
        assert_eq!(extent.pai, PageAllocator::Hpa);
        assert_eq!(central.free_pages(), HUGE / 2 / PAGE);
        assert_eq!(pages.counters.huge.load(Ordering::Relaxed), 1);
        assert!(central.grow_next() > sz::psz2ind(HUGE));
    }

    #[test]
    fn test_reuse_before_grow_and_trim_to_goal() {
        let (central, pages) = central();
        let a = central.alloc(PAGE, HUGE / 2).expect("grow");
        let b = central.alloc(PAGE, 4 * PAGE).expect("reuse");
        let eb = central.records().read(b).expect("b");
        let ea = central.records().read(a).expect("a");
        assert_eq!(eb.base, ea.past());
        assert_eq!(eb.size, 4 * PAGE);
        assert!(!eb.is_head);
        assert_eq!(pages.counters.maps.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dalloc_merges_free_neighbors_back_into_one_region() {
        let (central, _) = central();
        let a = central.alloc(PAGE, HUGE / 4).expect("a");
        let b = central.alloc(PAGE, HUGE / 4).expect("b");
        central.dalloc(b).expect("free b");
        central.dalloc(a).expect("free a");
        let free = central.free_extents();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, HUGE);
        assert!(free[0].is_head);
        assert_eq!(central.records().live(), 1);
        assert_eq!(central.dalloc(a), Err(ExtentError::StaleHandle));
    }

    #[test]
    fn test_exact_goal_takes_whole_mapping() {
        let (central, pages) = central();
        let a = central.alloc(HUGE, HUGE).expect("a");
        assert_eq!(central.free_pages(), 0);
        let b = central.alloc(HUGE, HUGE).expect("b");
        // The series moved on, so the second mapping is larger.
        assert!(pages.mapped_bytes() > 2 * HUGE);
        central.dalloc(a).expect("free a");
        central.dalloc(b).expect("free b");
        let free = central.free_extents();
        assert_eq!(free.len(), 2);
        assert!(free.iter().all(|e| e.is_head));
    }

    #[test]
    fn test_prefork_blocks_until_postfork() {
        let (central, _) = central();
        central.prefork();
        assert!(central.eset.is_locked());
        central.postfork_parent();
        assert!(!central.grow.is_locked());
        assert!(central.alloc(PAGE, PAGE).is_ok());
    }
}
