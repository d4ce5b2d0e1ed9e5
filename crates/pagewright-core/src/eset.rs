//! Extent set: the free extents of one state.
//!
//! Members are bucketed by the floor page-size class of their size. Inside a
//! bucket they are ordered by `(base, sn)`. A bitmap over the buckets marks
//! the nonempty ones so a fit scan skips empty classes word-at-a-time. An LRU
//! sequence over all members gives eviction order.
//!
//! The set is a plain data structure; its owner supplies the mutex.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::bitmap::FlatBitmap;
use crate::extent::{Extent, ExtentId, ExtentState};
use crate::sz::{self, NPSIZES, PAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Member {
    bucket: usize,
    base: usize,
    size: usize,
    sn: u64,
    seq: u64,
}

/// Restrictions applied by [`Eset::fit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FitPolicy {
    /// Only the bucket of the request's own class is eligible.
    pub exact_only: bool,
    /// Delayed-coalesce sets stop at buckets whose class exceeds
    /// `size << lg_max_fit`.
    pub lg_max_fit: Option<u32>,
}

/// Free extents of one state.
#[derive(Debug)]
pub struct Eset {
    state: ExtentState,
    delay_coalesce: bool,
    buckets: Vec<BTreeSet<(usize, u64, ExtentId)>>,
    nonempty: FlatBitmap,
    lru: BTreeMap<u64, ExtentId>,
    members: HashMap<ExtentId, Member>,
    next_seq: u64,
    npages: usize,
}

impl Eset {
    #[must_use]
    pub fn new(state: ExtentState, delay_coalesce: bool) -> Self {
        Self {
            state,
            delay_coalesce,
            buckets: (0..=NPSIZES).map(|_| BTreeSet::new()).collect(),
            nonempty: FlatBitmap::new(NPSIZES + 1),
            lru: BTreeMap::new(),
            members: HashMap::new(),
            next_seq: 0,
            npages: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> ExtentState {
        self.state
    }

    #[must_use]
    pub fn delay_coalesce(&self) -> bool {
        self.delay_coalesce
    }

    /// Free pages held by the set.
    #[must_use]
    pub fn npages(&self) -> usize {
        self.npages
    }

    #[must_use]
    pub fn nextents(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ExtentId) -> bool {
        self.members.contains_key(&id)
    }

    /// Members and total bytes of bucket `pind`.
    #[must_use]
    pub fn bucket_stats(&self, pind: usize) -> (usize, usize) {
        let bucket = &self.buckets[pind];
        let bytes = bucket
            .iter()
            .filter_map(|(_, _, id)| self.members.get(id))
            .map(|m| m.size)
            .sum();
        (bucket.len(), bytes)
    }

    /// Adds a free extent. The record must already carry this set's state.
    pub fn insert(&mut self, id: ExtentId, extent: &Extent) {
        debug_assert_eq!(extent.state, self.state);
        debug_assert!(sz::is_page_multiple(extent.size));
        let bucket = sz::bucket_floor(extent.size);
        let seq = self.next_seq;
        self.next_seq += 1;
        let member = Member {
            bucket,
            base: extent.base,
            size: extent.size,
            sn: extent.sn,
            seq,
        };
        let previous = self.members.insert(id, member);
        debug_assert!(previous.is_none(), "extent inserted twice");
        if self.buckets[bucket].is_empty() {
            self.nonempty.set(bucket);
        }
        self.buckets[bucket].insert((member.base, member.sn, id));
        self.lru.insert(seq, id);
        self.npages += member.size / PAGE;
    }

    /// Removes a member. Returns `false` if `id` is not in the set.
    pub fn remove(&mut self, id: ExtentId) -> bool {
        let Some(member) = self.members.remove(&id) else {
            return false;
        };
        let bucket = &mut self.buckets[member.bucket];
        bucket.remove(&(member.base, member.sn, id));
        if bucket.is_empty() {
            self.nonempty.unset(member.bucket);
        }
        self.lru.remove(&member.seq);
        self.npages -= member.size / PAGE;
        true
    }

    /// Least recently inserted member.
    #[must_use]
    pub fn first_lru(&self) -> Option<ExtentId> {
        self.lru.values().next().copied()
    }

    fn bucket_head(&self, bucket: usize) -> Option<(ExtentId, Member)> {
        let (_, _, id) = self.buckets[bucket].first()?;
        self.members.get(id).map(|m| (*id, *m))
    }

    fn class_size(bucket: usize) -> usize {
        if bucket < NPSIZES {
            sz::pind2sz(bucket)
        } else {
            usize::MAX
        }
    }

    /// Smallest nonempty bucket guaranteed to hold `size`, address-lowest
    /// member first.
    fn first_fit(&self, size: usize, policy: FitPolicy) -> Option<ExtentId> {
        let pind = sz::bucket_ceil(size);
        if policy.exact_only {
            return self.bucket_head(pind).map(|(id, _)| id);
        }
        let bucket = self.nonempty.ffs(pind)?;
        if self.delay_coalesce {
            if let Some(shift) = policy.lg_max_fit {
                if (Self::class_size(bucket) >> shift) > size {
                    return None;
                }
            }
        }
        self.bucket_head(bucket).map(|(id, _)| id)
    }

    /// Alignment-aware pass over buckets for sizes in `[min_size, max_size)`.
    fn fit_alignment(&self, min_size: usize, max_size: usize, alignment: usize) -> Option<ExtentId> {
        let pind_max = sz::bucket_ceil(max_size);
        let align = sz::page_ceil(alignment);
        let mut cursor = self.nonempty.ffs(sz::bucket_ceil(min_size));
        while let Some(bucket) = cursor {
            if bucket >= pind_max {
                break;
            }
            if let Some((id, member)) = self.bucket_head(bucket) {
                if let Some(next_align) = sz::align_ceil(member.base, align) {
                    if member.base + member.size > next_align
                        && member.size - (next_align - member.base) >= min_size
                    {
                        return Some(id);
                    }
                }
            }
            cursor = self.nonempty.ffs(bucket + 1);
        }
        None
    }

    /// Finds a member that can hold `esize` bytes at `alignment`.
    #[must_use]
    pub fn fit(&self, esize: usize, alignment: usize, policy: FitPolicy) -> Option<ExtentId> {
        let max_size = esize.checked_add(sz::page_ceil(alignment))? - PAGE;
        if max_size < esize {
            return None;
        }
        let found = self.first_fit(max_size, policy);
        if found.is_none() && alignment > PAGE {
            return self.fit_alignment(esize, max_size, alignment);
        }
        found
    }

    /// Members as `(id, base, size)`, ascending by address.
    #[must_use]
    pub fn members_by_addr(&self) -> Vec<(ExtentId, usize, usize)> {
        let mut out: Vec<_> = self
            .members
            .iter()
            .map(|(id, m)| (*id, m.base, m.size))
            .collect();
        out.sort_by_key(|(_, base, _)| *base);
        out
    }
}
