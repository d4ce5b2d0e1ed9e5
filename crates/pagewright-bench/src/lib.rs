//! Shared inputs for the pagewright benchmarks.

use pagewright_core::extent::Extent;
use pagewright_core::{ExtentId, ExtentState, PAGE, PageAllocator};

/// Deterministic page counts in `1..=max_pages`.
#[must_use]
pub fn page_counts(seed: u64, n: usize, max_pages: usize) -> Vec<usize> {
    let mut state = seed.max(1);
    (0..n)
        .map(|_| {
            state ^= state >> 12;
            state ^= state << 25;
            state ^= state >> 27;
            let r = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
            1 + (r % max_pages as u64) as usize
        })
        .collect()
}

/// Free dirty extents laid out back to back with one-page gaps, so none of
/// them would coalesce.
#[must_use]
pub fn scattered_dirty(counts: &[usize]) -> Vec<(ExtentId, Extent)> {
    let mut base = 0;
    counts
        .iter()
        .enumerate()
        .map(|(i, &npages)| {
            let extent = Extent::new(
                0,
                base,
                npages * PAGE,
                i as u64,
                ExtentState::Dirty,
                false,
                true,
                PageAllocator::Extent,
                false,
            );
            base += (npages + 1) * PAGE;
            let id = ExtentId {
                index: i as u32,
                generation: 0,
            };
            (id, extent)
        })
        .collect()
}
