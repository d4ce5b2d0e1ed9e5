//! Metadata-record cache.
//!
//! Extent records live in a chunked arena that only ever grows, so a record's
//! address is stable for the life of the cache. Handles carry a generation
//! that is bumped on every `put`; a stale handle can never lock a recycled
//! record.

use std::sync::OnceLock;

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::error::{ExtentError, Result};
use crate::extent::{Extent, ExtentId};

const CHUNK_SHIFT: u32 = 10;
const CHUNK_LEN: usize = 1 << CHUNK_SHIFT;
const MAX_CHUNKS: usize = 1 << 12;

/// Locked record.
pub type RecordGuard<'a> = MappedMutexGuard<'a, Extent>;

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    live: bool,
    extent: Extent,
}

#[derive(Debug, Default)]
struct FreeList {
    free: Vec<u32>,
    next_fresh: u32,
    live: usize,
}

/// Arena of extent records.
pub struct RecordCache {
    chunks: Box<[OnceLock<Box<[Mutex<Slot>]>>]>,
    free: Mutex<FreeList>,
    capacity: Option<usize>,
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("live", &self.live())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl RecordCache {
    /// Creates a cache holding at most `capacity` live records.
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        let chunks = (0..MAX_CHUNKS).map(|_| OnceLock::new()).collect();
        Self {
            chunks,
            free: Mutex::new(FreeList::default()),
            capacity,
        }
    }

    fn slot(&self, index: u32) -> Option<&Mutex<Slot>> {
        let index = index as usize;
        let chunk = self.chunks.get(index >> CHUNK_SHIFT)?.get()?;
        chunk.get(index & (CHUNK_LEN - 1))
    }

    fn slot_or_init(&self, index: u32) -> Option<&Mutex<Slot>> {
        let index = index as usize;
        let chunk = self.chunks.get(index >> CHUNK_SHIFT)?.get_or_init(|| {
            (0..CHUNK_LEN)
                .map(|_| Mutex::new(Slot::default()))
                .collect()
        });
        chunk.get(index & (CHUNK_LEN - 1))
    }

    /// Stores `extent` in a free record and returns its handle.
    pub fn get(&self, extent: Extent) -> Result<ExtentId> {
        let index = {
            let mut free = self.free.lock();
            if self.capacity.is_some_and(|cap| free.live >= cap) {
                return Err(ExtentError::oom("record"));
            }
            let index = match free.free.pop() {
                Some(index) => index,
                None => {
                    if free.next_fresh as usize >= MAX_CHUNKS * CHUNK_LEN {
                        return Err(ExtentError::oom("record"));
                    }
                    let index = free.next_fresh;
                    free.next_fresh += 1;
                    index
                }
            };
            free.live += 1;
            index
        };
        let Some(slot) = self.slot_or_init(index) else {
            return Err(ExtentError::oom("record"));
        };
        let mut slot = slot.lock();
        debug_assert!(!slot.live, "record {index} handed out twice");
        slot.live = true;
        slot.extent = extent;
        Ok(ExtentId {
            index,
            generation: slot.generation,
        })
    }

    /// Returns a record to the cache. Stale handles are ignored and reported
    /// as `false`.
    pub fn put(&self, id: ExtentId) -> bool {
        let Some(slot) = self.slot(id.index) else {
            return false;
        };
        {
            let mut slot = slot.lock();
            if !slot.live || slot.generation != id.generation {
                return false;
            }
            slot.live = false;
            slot.generation = slot.generation.wrapping_add(1);
            slot.extent = Extent::default();
        }
        let mut free = self.free.lock();
        free.live -= 1;
        free.free.push(id.index);
        true
    }

    /// Locks the record behind `id`, or `None` if the handle is stale.
    #[must_use]
    pub fn lock(&self, id: ExtentId) -> Option<RecordGuard<'_>> {
        let guard = self.slot(id.index)?.lock();
        if !guard.live || guard.generation != id.generation {
            return None;
        }
        Some(MutexGuard::map(guard, |slot| &mut slot.extent))
    }

    /// Locks two distinct records in handle order.
    #[must_use]
    pub fn lock2(&self, a: ExtentId, b: ExtentId) -> Option<(RecordGuard<'_>, RecordGuard<'_>)> {
        debug_assert_ne!(a.index, b.index);
        if a.index < b.index {
            let ga = self.lock(a)?;
            let gb = self.lock(b)?;
            Some((ga, gb))
        } else {
            let gb = self.lock(b)?;
            let ga = self.lock(a)?;
            Some((ga, gb))
        }
    }

    /// Runs `f` on the locked record.
    pub fn with<R>(&self, id: ExtentId, f: impl FnOnce(&mut Extent) -> R) -> Option<R> {
        self.lock(id).map(|mut guard| f(&mut guard))
    }

    /// Copy of the record behind `id`.
    #[must_use]
    pub fn read(&self, id: ExtentId) -> Option<Extent> {
        self.with(id, |e| e.clone())
    }

    /// Number of records currently handed out.
    #[must_use]
    pub fn live(&self) -> usize {
        self.free.lock().live
    }

    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sz::PAGE;

    fn extent(base: usize) -> Extent {
        Extent {
            base,
            size: PAGE,
            ..Extent::default()
        }
    }

    #[test]
    fn test_get_put_recycles_index_with_new_generation() {
        let cache = RecordCache::new(None);
        let a = cache.get(extent(0)).expect("get");
        assert_eq!(cache.live(), 1);
        assert!(cache.put(a));
        let b = cache.get(extent(PAGE)).expect("get");
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        assert!(cache.lock(a).is_none());
        assert_eq!(cache.read(b).map(|e| e.base), Some(PAGE));
        assert!(!cache.put(a), "stale put must be rejected");
        assert_eq!(cache.live(), 1);
    }

    #[test]
    fn test_capacity_injects_oom() {
        let cache = RecordCache::new(Some(2));
        let a = cache.get(extent(0)).expect("first");
        let _b = cache.get(extent(PAGE)).expect("second");
        assert_eq!(cache.get(extent(2 * PAGE)), Err(ExtentError::oom("record")));
        cache.put(a);
        assert!(cache.get(extent(2 * PAGE)).is_ok());
    }

    #[test]
    fn test_lock2_returns_guards_in_argument_order() {
        let cache = RecordCache::new(None);
        let a = cache.get(extent(0)).expect("a");
        let b = cache.get(extent(PAGE)).expect("b");
        let (gb, ga) = cache.lock2(b, a).expect("lock2");
        assert_eq!(gb.base, PAGE);
        assert_eq!(ga.base, 0);
    }

    #[test]
    fn test_records_span_chunks() {
        let cache = RecordCache::new(None);
        let ids: Vec<_> = (0..CHUNK_LEN + 5)
            .map(|i| cache.get(extent(i * PAGE)).expect("get"))
            .collect();
        let last = ids[CHUNK_LEN + 4];
        assert_eq!(cache.read(last).map(|e| e.base), Some((CHUNK_LEN + 4) * PAGE));
    }
}
