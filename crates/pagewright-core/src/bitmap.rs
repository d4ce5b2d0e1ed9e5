//! Flat bitmap over `u64` groups.
//!
//! Used twice: as the nonempty-bucket index of free sets (set bit = bucket has
//! members) and as the page-occupancy map of a pageslab (set bit = page in
//! use). All searches are word-at-a-time.

const GROUP_BITS: usize = u64::BITS as usize;

/// Fixed-length bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatBitmap {
    nbits: usize,
    groups: Vec<u64>,
}

impl FlatBitmap {
    /// Creates a bitmap of `nbits` bits, all unset.
    #[must_use]
    pub fn new(nbits: usize) -> Self {
        Self {
            nbits,
            groups: vec![0; nbits.div_ceil(GROUP_BITS)],
        }
    }

    /// Number of bits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nbits
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nbits == 0
    }

    /// True if no bit is set.
    #[must_use]
    pub fn none_set(&self) -> bool {
        self.groups.iter().all(|g| *g == 0)
    }

    /// True if every bit is set.
    #[must_use]
    pub fn all_set(&self) -> bool {
        self.count_set() == self.nbits
    }

    /// Number of set bits.
    #[must_use]
    pub fn count_set(&self) -> usize {
        self.groups.iter().map(|g| g.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn get(&self, bit: usize) -> bool {
        debug_assert!(bit < self.nbits);
        self.groups[bit / GROUP_BITS] & (1u64 << (bit % GROUP_BITS)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.groups[bit / GROUP_BITS] |= 1u64 << (bit % GROUP_BITS);
    }

    pub fn unset(&mut self, bit: usize) {
        debug_assert!(bit < self.nbits);
        self.groups[bit / GROUP_BITS] &= !(1u64 << (bit % GROUP_BITS));
    }

    /// Sets bits `[start, start + len)`.
    pub fn set_range(&mut self, start: usize, len: usize) {
        self.assign_range(start, len, true);
    }

    /// Unsets bits `[start, start + len)`.
    pub fn unset_range(&mut self, start: usize, len: usize) {
        self.assign_range(start, len, false);
    }

    fn assign_range(&mut self, start: usize, len: usize, value: bool) {
        debug_assert!(start + len <= self.nbits);
        let mut bit = start;
        let end = start + len;
        while bit < end {
            let group = bit / GROUP_BITS;
            let offset = bit % GROUP_BITS;
            let take = (GROUP_BITS - offset).min(end - bit);
            let mask = if take == GROUP_BITS {
                u64::MAX
            } else {
                ((1u64 << take) - 1) << offset
            };
            if value {
                self.groups[group] |= mask;
            } else {
                self.groups[group] &= !mask;
            }
            bit += take;
        }
    }

    /// First set bit at or after `start`.
    #[must_use]
    pub fn ffs(&self, start: usize) -> Option<usize> {
        self.find_forward(start, false)
    }

    /// First unset bit at or after `start`.
    #[must_use]
    pub fn ffu(&self, start: usize) -> Option<usize> {
        self.find_forward(start, true)
    }

    /// Last set bit at or before `start`.
    #[must_use]
    pub fn fls(&self, start: usize) -> Option<usize> {
        self.find_backward(start, false)
    }

    /// Last unset bit at or before `start`.
    #[must_use]
    pub fn flu(&self, start: usize) -> Option<usize> {
        self.find_backward(start, true)
    }

    fn find_forward(&self, start: usize, invert: bool) -> Option<usize> {
        if start >= self.nbits {
            return None;
        }
        let mut group = start / GROUP_BITS;
        let mut word = self.word(group, invert) & (u64::MAX << (start % GROUP_BITS));
        loop {
            if word != 0 {
                let bit = group * GROUP_BITS + word.trailing_zeros() as usize;
                return (bit < self.nbits).then_some(bit);
            }
            group += 1;
            if group >= self.groups.len() {
                return None;
            }
            word = self.word(group, invert);
        }
    }

    fn find_backward(&self, start: usize, invert: bool) -> Option<usize> {
        if self.nbits == 0 {
            return None;
        }
        let start = start.min(self.nbits - 1);
        let mut group = start / GROUP_BITS;
        let offset = start % GROUP_BITS;
        let keep = if offset == GROUP_BITS - 1 {
            u64::MAX
        } else {
            (1u64 << (offset + 1)) - 1
        };
        let mut word = self.word(group, invert) & keep;
        loop {
            if word != 0 {
                return Some(group * GROUP_BITS + (GROUP_BITS - 1 - word.leading_zeros() as usize));
            }
            if group == 0 {
                return None;
            }
            group -= 1;
            word = self.word(group, invert);
        }
    }

    #[inline]
    fn word(&self, group: usize, invert: bool) -> u64 {
        let raw = self.groups[group];
        if !invert {
            return raw;
        }
        let inverted = !raw;
        let tail = self.nbits - group * GROUP_BITS;
        if tail >= GROUP_BITS {
            inverted
        } else {
            inverted & ((1u64 << tail) - 1)
        }
    }

    /// Next maximal run of unset bits starting at or after `start`, as
    /// `(begin, len)`.
    #[must_use]
    pub fn next_unset_run(&self, start: usize) -> Option<(usize, usize)> {
        let begin = self.ffu(start)?;
        let end = self.ffs(begin).unwrap_or(self.nbits);
        Some((begin, end - begin))
    }

    /// Length of the longest run of unset bits.
    #[must_use]
    pub fn longest_unset_run(&self) -> usize {
        let mut longest = 0;
        let mut cursor = 0;
        while let Some((begin, len)) = self.next_unset_run(cursor) {
            longest = longest.max(len);
            cursor = begin + len;
        }
        longest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_longest(bits: &[bool]) -> usize {
        let mut best = 0;
        let mut run = 0;
        for b in bits {
            if *b {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best
    }

    #[test]
    fn test_range_ops_cross_group_boundaries() {
        let mut fb = FlatBitmap::new(200);
        fb.set_range(60, 80);
        assert_eq!(fb.count_set(), 80);
        assert!(!fb.get(59));
        assert!(fb.get(60));
        assert!(fb.get(139));
        assert!(!fb.get(140));
        fb.unset_range(64, 64);
        assert_eq!(fb.count_set(), 16);
        assert_eq!(fb.ffs(0), Some(60));
        assert_eq!(fb.ffs(64), Some(128));
        assert_eq!(fb.ffu(60), Some(64));
    }

    #[test]
    fn test_backward_search() {
        let mut fb = FlatBitmap::new(130);
        fb.set(3);
        fb.set(70);
        assert_eq!(fb.fls(129), Some(70));
        assert_eq!(fb.fls(69), Some(3));
        assert_eq!(fb.fls(2), None);
        assert_eq!(fb.flu(70), Some(69));
        fb.set_range(0, 130);
        assert_eq!(fb.flu(129), None);
        assert!(fb.all_set());
    }

    #[test]
    fn test_unset_search_ignores_padding_bits() {
        let mut fb = FlatBitmap::new(10);
        fb.set_range(0, 10);
        assert_eq!(fb.ffu(0), None);
        assert_eq!(fb.next_unset_run(0), None);
        assert_eq!(fb.longest_unset_run(), 0);
    }

    #[test]
    fn test_longest_run_matches_brute_force() {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        for _ in 0..50 {
            let mut fb = FlatBitmap::new(512);
            let mut shadow = vec![false; 512];
            for _ in 0..40 {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let start = (state % 512) as usize;
                let len = ((state >> 20) % 64) as usize;
                let len = len.min(512 - start);
                if state & 1 == 0 {
                    fb.set_range(start, len);
                    shadow[start..start + len].iter_mut().for_each(|b| *b = true);
                } else {
                    fb.unset_range(start, len);
                    shadow[start..start + len].iter_mut().for_each(|b| *b = false);
                }
                assert_eq!(fb.longest_unset_run(), brute_longest(&shadow));
            }
        }
    }
}
