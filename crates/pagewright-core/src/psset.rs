//! Pageslab set.
//!
//! A pageslab is a hugepage-tier extent carved into page runs. Its occupancy
//! bitmap and cached longest free run live in the slab's record. Resident
//! slabs are bucketed by the floor page-size class of that run, ordered by
//! `(base, sn)` inside a bucket; full slabs stay owned but sit in no bucket.
//! The owning shard supplies the mutex.

use std::collections::{BTreeSet, HashMap};

use crate::bitmap::FlatBitmap;
use crate::extent::{ExtentId, PageslabData};
use crate::record_cache::RecordCache;
use crate::sz::{self, NPSIZES, PAGE};

#[derive(Debug, Clone, Copy)]
struct Resident {
    bucket: usize,
    base: usize,
    sn: u64,
}

#[derive(Debug)]
pub struct Psset {
    buckets: Vec<BTreeSet<(usize, u64, ExtentId)>>,
    nonempty: FlatBitmap,
    resident: HashMap<ExtentId, Resident>,
    owned: BTreeSet<ExtentId>,
    nactive: usize,
}

impl Default for Psset {
    fn default() -> Self {
        Self::new()
    }
}

/// First run of at least `npages` unset bits, scanning from bit 0.
fn first_fit(bitmap: &FlatBitmap, npages: usize) -> Option<usize> {
    let mut cursor = 0;
    while let Some((begin, len)) = bitmap.next_unset_run(cursor) {
        if len >= npages {
            return Some(begin);
        }
        cursor = begin + len;
    }
    None
}

impl Psset {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: (0..NPSIZES).map(|_| BTreeSet::new()).collect(),
            nonempty: FlatBitmap::new(NPSIZES),
            resident: HashMap::new(),
            owned: BTreeSet::new(),
            nactive: 0,
        }
    }

    /// Pageslabs owned by the set, full ones included.
    #[must_use]
    pub fn npageslabs(&self) -> usize {
        self.owned.len()
    }

    /// Pages handed out across all pageslabs.
    #[must_use]
    pub fn nactive(&self) -> usize {
        self.nactive
    }

    #[must_use]
    pub fn contains(&self, ps: ExtentId) -> bool {
        self.owned.contains(&ps)
    }

    /// Bucket holding `ps`, or `None` when it is full or not owned.
    #[must_use]
    pub fn bucket_of(&self, ps: ExtentId) -> Option<usize> {
        self.resident.get(&ps).map(|r| r.bucket)
    }

    #[must_use]
    pub fn pageslabs(&self) -> Vec<ExtentId> {
        self.owned.iter().copied().collect()
    }

    fn insert(&mut self, ps: ExtentId, base: usize, sn: u64, longest: usize) {
        debug_assert!(longest > 0);
        let bucket = sz::bucket_floor(longest * PAGE);
        if self.buckets[bucket].is_empty() {
            self.nonempty.set(bucket);
        }
        self.buckets[bucket].insert((base, sn, ps));
        self.resident.insert(ps, Resident { bucket, base, sn });
    }

    fn remove(&mut self, ps: ExtentId) {
        let Some(r) = self.resident.remove(&ps) else {
            return;
        };
        let bucket = &mut self.buckets[r.bucket];
        bucket.remove(&(r.base, r.sn, ps));
        if bucket.is_empty() {
            self.nonempty.unset(r.bucket);
        }
    }

    /// Carves `npages` out of the best resident slab. Returns the slab and
    /// the first page index of the run.
    pub fn alloc_reuse(&mut self, records: &RecordCache, npages: usize) -> Option<(ExtentId, usize)> {
        if npages == 0 {
            return None;
        }
        let bucket = self.nonempty.ffs(sz::bucket_ceil(npages * PAGE))?;
        let &(_, _, ps) = self.buckets[bucket].first()?;
        let (begin, longest, base, sn) = records
            .with(ps, |e| {
                let data = e.slab_data.as_deref_mut()?;
                let begin = first_fit(&data.bitmap, npages)?;
                data.bitmap.set_range(begin, npages);
                data.longest_free_range = data.bitmap.longest_unset_run();
                Some((begin, data.longest_free_range, e.base, e.sn))
            })
            .flatten()?;
        self.remove(ps);
        if longest > 0 {
            self.insert(ps, base, sn, longest);
        }
        self.nactive += npages;
        Some((ps, begin))
    }

    /// Adopts the empty slab `ps` and carves `npages` from its start.
    pub fn alloc_new(&mut self, records: &RecordCache, ps: ExtentId, npages: usize) -> Option<usize> {
        let (longest, base, sn) = records
            .with(ps, |e| {
                let total = e.npages();
                let data = e
                    .slab_data
                    .get_or_insert_with(|| Box::new(PageslabData::new(total)));
                if npages == 0 || npages > data.npages() || !data.bitmap.none_set() {
                    return None;
                }
                data.bitmap.set_range(0, npages);
                data.longest_free_range = data.npages() - npages;
                Some((data.longest_free_range, e.base, e.sn))
            })
            .flatten()?;
        self.owned.insert(ps);
        if longest > 0 {
            self.insert(ps, base, sn, longest);
        }
        self.nactive += npages;
        Some(0)
    }

    /// Returns `[addr, addr + size)` to slab `ps`. When the slab becomes
    /// entirely free it leaves the set and is returned.
    pub fn dalloc(
        &mut self,
        records: &RecordCache,
        ps: ExtentId,
        addr: usize,
        size: usize,
    ) -> Option<ExtentId> {
        debug_assert!(self.owned.contains(&ps));
        let npages = size / PAGE;
        let (old, run, total, base, sn) = records
            .with(ps, |e| {
                let begin = (addr - e.base) / PAGE;
                let data = e.slab_data.as_deref_mut()?;
                debug_assert!(
                    data.bitmap.ffu(begin).is_none_or(|u| u >= begin + npages),
                    "freeing pages that are not allocated"
                );
                data.bitmap.unset_range(begin, npages);
                let run_begin = match begin {
                    0 => 0,
                    _ => data.bitmap.fls(begin - 1).map_or(0, |b| b + 1),
                };
                let run_end = data.bitmap.ffs(begin + npages).unwrap_or(data.npages());
                let old = data.longest_free_range;
                let run = run_end - run_begin;
                if run > old {
                    data.longest_free_range = run;
                }
                Some((old, run, data.npages(), e.base, e.sn))
            })
            .flatten()?;
        self.nactive -= npages;
        if run <= old {
            return None;
        }
        self.remove(ps);
        if run == total {
            self.owned.remove(&ps);
            return Some(ps);
        }
        self.insert(ps, base, sn, run);
        None
    }
}
