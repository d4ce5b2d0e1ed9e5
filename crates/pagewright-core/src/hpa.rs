//! HPA shard: per-shard front end of the hugepage tier.
//!
//! Small requests are carved out of pageslabs held in the shard's psset;
//! larger ones go straight to [`HpaCentral`]. Expand and shrink are never
//! supported, and neither are aligned or zeroed requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::engine::normalize_request;
use crate::error::{ExtentError, Result};
use crate::extent::{Extent, ExtentId, ExtentSnapshot, ExtentState, PageAllocator, Region};
use crate::hpa_central::HpaCentral;
use crate::log::{EngineLogLevel, EngineLogRecord, LifecycleLog, LogEvent};
use crate::psset::Psset;
use crate::sz::PAGE;

#[derive(Debug)]
pub struct HpaShard {
    ind: u32,
    central: Arc<HpaCentral>,
    ps_goal: usize,
    ps_alloc_max: usize,
    grow: Mutex<()>,
    psset: Mutex<Psset>,
    forked: AtomicBool,
    log: LifecycleLog,
}

impl HpaShard {
    pub fn new(ind: u32, central: Arc<HpaCentral>, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ind,
            central,
            ps_goal: config.ps_goal,
            ps_alloc_max: config.ps_alloc_max,
            grow: Mutex::new(()),
            psset: Mutex::new(Psset::new()),
            forked: AtomicBool::new(false),
            log: LifecycleLog::new("hpa_shard", config.log_capacity),
        })
    }

    #[must_use]
    pub fn ind(&self) -> u32 {
        self.ind
    }

    #[must_use]
    pub fn central(&self) -> &Arc<HpaCentral> {
        &self.central
    }

    pub fn alloc(&self, size: usize, alignment: usize, zero: bool) -> Result<Region> {
        let (size, alignment) = normalize_request(size, alignment)?;
        if alignment > PAGE {
            return Err(ExtentError::Unsupported { op: "aligned alloc" });
        }
        if zero {
            return Err(ExtentError::Unsupported { op: "zeroed alloc" });
        }
        let id = if size <= self.ps_alloc_max {
            self.alloc_psset(size)?
        } else {
            let id = self.central.alloc(size, size)?;
            self.central.records().with(id, |e| e.arena_ind = self.ind);
            id
        };
        self.central
            .records()
            .with(id, |e| Region {
                id,
                base: e.base,
                size: e.size,
                zeroed: e.zeroed,
                committed: e.committed,
            })
            .ok_or(ExtentError::StaleHandle)
    }

    fn alloc_psset(&self, size: usize) -> Result<ExtentId> {
        let records = self.central.records();
        let npages = size / PAGE;
        let placeholder = Extent::new(
            self.ind,
            0,
            size,
            0,
            ExtentState::Active,
            false,
            true,
            PageAllocator::Hpa,
            false,
        );
        let id = records.get(placeholder)?;

        let mut placed = self.psset.lock().alloc_reuse(records, npages);
        if placed.is_none() {
            let _grow = self.grow.lock();
            placed = self.psset.lock().alloc_reuse(records, npages);
            if placed.is_none() {
                let slab = match self.central.alloc(size, self.ps_goal) {
                    Ok(slab) => slab,
                    Err(err) => {
                        records.put(id);
                        return Err(err);
                    }
                };
                records.with(slab, |e| {
                    e.arena_ind = self.ind;
                    e.slab = true;
                });
                placed = self
                    .psset
                    .lock()
                    .alloc_new(records, slab, npages)
                    .map(|begin| (slab, begin));
            }
        }
        let Some((ps, begin)) = placed else {
            records.put(id);
            return Err(ExtentError::oom("pageslab"));
        };

        let (slab_base, sn) = records
            .with(ps, |e| (e.base, e.sn))
            .ok_or(ExtentError::StaleHandle)?;
        records.with(id, |e| {
            e.base = slab_base + begin * PAGE;
            e.sn = sn;
            e.ps = Some(ps);
            self.central.index().register_boundary(id, e);
        });
        Ok(id)
    }

    pub fn dalloc(&self, id: ExtentId) -> Result<()> {
        let records = self.central.records();
        let extent = records
            .with(id, |e| {
                let owned = e.state == ExtentState::Active
                    && e.pai == PageAllocator::Hpa
                    && e.arena_ind == self.ind;
                if owned {
                    e.zeroed = false;
                }
                owned.then(|| e.clone())
            })
            .flatten();
        let Some(extent) = extent else {
            self.log.record(LogEvent::new(
                EngineLogLevel::Error,
                "dalloc",
                "invariant_double_free",
                "refused",
            ));
            return Err(ExtentError::StaleHandle);
        };

        let Some(ps) = extent.ps else {
            return self.central.dalloc(id);
        };
        self.central.index().deregister_boundary(&extent);
        let evicted = self
            .psset
            .lock()
            .dalloc(records, ps, extent.base, extent.size);
        records.put(id);
        if let Some(slab) = evicted {
            records.with(slab, |e| {
                e.slab = false;
                e.slab_data = None;
                self.central.index().register_boundary(slab, e);
            });
            self.central.dalloc(slab)?;
        }
        Ok(())
    }

    pub fn expand(&self, _id: ExtentId, _old_size: usize, _new_size: usize, _zero: bool) -> Result<()> {
        Err(ExtentError::Unsupported { op: "expand" })
    }

    pub fn shrink(&self, _id: ExtentId, _old_size: usize, _new_size: usize) -> Result<()> {
        Err(ExtentError::Unsupported { op: "shrink" })
    }

    /// Checks that every pageslab has been returned to central.
    pub fn destroy(&self) -> Result<()> {
        let pageslabs = self.psset.lock().npageslabs();
        if pageslabs > 0 {
            self.log.record(
                LogEvent::new(EngineLogLevel::Error, "destroy", "shard_destroy", "not_empty")
                    .with_details(&format!("pageslabs={pageslabs}")),
            );
            return Err(ExtentError::NotEmpty { pageslabs });
        }
        self.log.record(LogEvent::new(
            EngineLogLevel::Info,
            "destroy",
            "shard_destroy",
            "ok",
        ));
        Ok(())
    }

    #[must_use]
    pub fn extent(&self, id: ExtentId) -> Option<ExtentSnapshot> {
        self.central.records().with(id, |e| e.snapshot(id))
    }

    #[must_use]
    pub fn npageslabs(&self) -> usize {
        self.psset.lock().npageslabs()
    }

    /// Pageslabs the shard currently owns, full ones included.
    #[must_use]
    pub fn pageslabs(&self) -> Vec<ExtentSnapshot> {
        let ids = self.psset.lock().pageslabs();
        ids.into_iter()
            .filter_map(|id| self.central.records().with(id, |e| e.snapshot(id)))
            .collect()
    }

    /// Pages handed out from pageslabs.
    #[must_use]
    pub fn nactive(&self) -> usize {
        self.psset.lock().nactive()
    }

    pub fn drain_logs(&self) -> Vec<EngineLogRecord> {
        self.log.drain()
    }

    pub fn prefork(&self) {
        std::mem::forget(self.grow.lock());
        std::mem::forget(self.psset.lock());
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
            self.psset.force_unlock();
            self.grow.force_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emap::AddressIndex;
    use crate::pages::SimulatedPages;
    use crate::record_cache::RecordCache;

    const HUGE: usize = 2 << 20;

    fn shard() -> HpaShard {
        let config = EngineConfig::default();
        let central = HpaCentral::new(
            u32::MAX,
            &config,
            Arc::new(SimulatedPages::new(0)),
            Arc::new(AddressIndex::new()),
            Arc::new(RecordCache::new(None)),
        )
        .expect("central");
        HpaShard::new(3, Arc::new(central), &config).expect("shard")
    }

    #[test]
    fn test_small_requests_share_one_pageslab() {
        let shard = shard();
        let a = shard.alloc(4 * PAGE, PAGE, false).expect("a");
        let b = shard.alloc(4 * PAGE, PAGE, false).expect("b");
        assert_eq!(b.base, a.base + 4 * PAGE);
        assert_eq!(shard.npageslabs(), 1);
        assert_eq!(shard.nactive(), 8);
        let ea = shard.extent(a.id).expect("a");
        assert_eq!(ea.pai, PageAllocator::Hpa);
        let entry = shard.central().index().lookup(b.base);
        assert_eq!(entry.map(|e| e.extent), Some(b.id));
    }

    #[test]
    fn test_emptied_pageslab_returns_to_central() {
        let shard = shard();
        let a = shard.alloc(4 * PAGE, PAGE, false).expect("a");
        let b = shard.alloc(PAGE, PAGE, false).expect("b");
        shard.dalloc(a.id).expect("free a");
        assert_eq!(shard.npageslabs(), 1);
        shard.dalloc(b.id).expect("free b");
        assert_eq!(shard.npageslabs(), 0);
        let free = shard.central().free_extents();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].size, HUGE);
        shard.destroy().expect("empty shard");
    }

    #[test]
    fn test_large_requests_bypass_pageslabs() {
        let shard = shard();
        let r = shard.alloc(1 << 20, PAGE, false).expect("large");
        assert_eq!(r.size, 1 << 20);
        assert_eq!(shard.npageslabs(), 0);
        assert!(shard.extent(r.id).is_some_and(|e| e.state == ExtentState::Active));
        shard.dalloc(r.id).expect("free");
        assert_eq!(shard.dalloc(r.id), Err(ExtentError::StaleHandle));
    }

    #[test]
    fn test_unsupported_operations() {
        let shard = shard();
        assert_eq!(
            shard.alloc(PAGE, 2 * PAGE, false),
            Err(ExtentError::Unsupported { op: "aligned alloc" })
        );
        assert_eq!(
            shard.alloc(PAGE, PAGE, true),
            Err(ExtentError::Unsupported { op: "zeroed alloc" })
        );
        let r = shard.alloc(PAGE, PAGE, false).expect("alloc");
        assert!(shard.expand(r.id, PAGE, 2 * PAGE, false).is_err());
        assert!(shard.shrink(r.id, PAGE, PAGE / 2).is_err());
    }

    #[test]
    fn test_destroy_refuses_live_pageslabs() {
        let shard = shard();
        let _r = shard.alloc(PAGE, PAGE, false).expect("alloc");
        assert_eq!(shard.destroy(), Err(ExtentError::NotEmpty { pageslabs: 1 }));
        let logs = shard.drain_logs();
        assert!(logs.iter().any(|l| l.outcome == "not_empty"));
    }
}
