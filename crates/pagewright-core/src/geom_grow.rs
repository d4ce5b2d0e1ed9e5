//! Geometric growth series over page-size classes.
//!
//! Each growth maps at least the next class in the series. The series
//! pointer only moves forward and stops at the configured limit, which bounds
//! how many disjoint mappings a domain accumulates.

use crate::sz::{self, NPSIZES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeomGrow {
    next: usize,
    limit: usize,
}

impl GeomGrow {
    /// Series starting at class `start`, capped at class `limit`.
    #[must_use]
    pub fn new(start: usize, limit: usize) -> Self {
        let limit = limit.min(NPSIZES - 1);
        Self {
            next: start.min(limit),
            limit,
        }
    }

    /// Class index the next growth starts from.
    #[must_use]
    pub fn next(&self) -> usize {
        self.next
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Smallest class at or after the pointer holding `alloc_size_min`, as
    /// `(size, skip)`. `None` once the series runs past the largest class.
    #[must_use]
    pub fn size_prepare(&self, alloc_size_min: usize) -> Option<(usize, usize)> {
        let mut skip = 0;
        let mut alloc_size = sz::pind2sz(self.next);
        while alloc_size < alloc_size_min {
            skip += 1;
            if self.next + skip >= NPSIZES {
                return None;
            }
            alloc_size = sz::pind2sz(self.next + skip);
        }
        Some((alloc_size, skip))
    }

    /// Advances past the class just used, saturating at the limit.
    pub fn size_commit(&mut self, skip: usize) {
        let advanced = self.next + skip + 1;
        if advanced <= self.limit {
            self.next = advanced;
        } else {
            self.next = self.limit;
        }
    }
}
