//! Page-size classes.
//!
//! Page multiples are grouped four classes per doubling: 1, 2, 3, 4, 5, 6,
//! 7, 8, 10, 12, 14, 16, 20, ... pages. Free sets bucket extents by these
//! classes, and growth walks them as its geometric series.

/// log2 of the page size.
pub const LG_PAGE: u32 = 12;
/// Page size in bytes.
pub const PAGE: usize = 1 << LG_PAGE;
/// Mask of the in-page offset bits.
pub const PAGE_MASK: usize = PAGE - 1;

const LG_NGROUP: u32 = 2;
const NGROUP: usize = 1 << LG_NGROUP;

/// log2 of the largest page-size class.
pub const LG_MAX_PSZ: u32 = 47;
/// Largest page-size class in bytes.
pub const MAX_PSZ: usize = 1 << LG_MAX_PSZ;
/// Number of page-size classes. `psz2ind` returns this for sizes past
/// [`MAX_PSZ`].
pub const NPSIZES: usize = psz2ind(MAX_PSZ) + 1;

#[inline]
const fn lg_floor(x: usize) -> u32 {
    usize::BITS - 1 - x.leading_zeros()
}

/// Rounds `size` up to a page multiple, saturating at the top page.
#[inline]
#[must_use]
pub const fn page_ceil(size: usize) -> usize {
    match size.checked_add(PAGE_MASK) {
        Some(v) => v & !PAGE_MASK,
        None => usize::MAX & !PAGE_MASK,
    }
}

/// Rounds `addr` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_ceil(addr: usize, align: usize) -> Option<usize> {
    match addr.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// True when `size` is a nonzero page multiple.
#[inline]
#[must_use]
pub const fn is_page_multiple(size: usize) -> bool {
    size != 0 && size & PAGE_MASK == 0
}

/// Index of the smallest class holding at least `psz` bytes.
#[must_use]
pub const fn psz2ind(psz: usize) -> usize {
    if psz == 0 {
        return 0;
    }
    if psz > MAX_PSZ {
        return NPSIZES_UNCHECKED;
    }
    let x = lg_floor((psz << 1) - 1);
    let shift = if x < LG_NGROUP + LG_PAGE {
        0
    } else {
        x - (LG_NGROUP + LG_PAGE)
    };
    let grp = (shift as usize) << LG_NGROUP;
    let lg_delta = if x < LG_NGROUP + LG_PAGE + 1 {
        LG_PAGE
    } else {
        x - LG_NGROUP - 1
    };
    let delta_inverse_mask = usize::MAX << lg_delta;
    let modulo = (((psz - 1) & delta_inverse_mask) >> lg_delta) & (NGROUP - 1);
    grp + modulo
}

// `psz2ind` cannot name `NPSIZES` while computing it.
const NPSIZES_UNCHECKED: usize = {
    let x = LG_MAX_PSZ;
    let grp = ((x - (LG_NGROUP + LG_PAGE)) as usize) << LG_NGROUP;
    grp + NGROUP
};

/// Size in bytes of class `pind`.
#[must_use]
pub const fn pind2sz(pind: usize) -> usize {
    let grp = pind >> LG_NGROUP;
    let modulo = pind & (NGROUP - 1);
    let grp_size = if grp == 0 {
        0
    } else {
        (1usize << (LG_PAGE + (LG_NGROUP - 1))) << grp
    };
    let shift = if grp == 0 { 1 } else { grp as u32 };
    let lg_delta = shift + (LG_PAGE - 1);
    grp_size + ((modulo + 1) << lg_delta)
}

/// Largest class not exceeding `size`. `size` must be a page multiple.
#[must_use]
pub fn quantize_floor(size: usize) -> usize {
    debug_assert!(is_page_multiple(size));
    let pind = psz2ind(size + 1);
    if pind == 0 {
        return size;
    }
    pind2sz(pind - 1)
}

/// Smallest class not below `size`. `size` must be a page multiple.
#[must_use]
pub fn quantize_ceil(size: usize) -> usize {
    debug_assert!(is_page_multiple(size));
    let pind = psz2ind(size);
    if pind >= NPSIZES {
        return size;
    }
    pind2sz(pind)
}

/// Bucket index for a free extent of `size` bytes: the floor class, or
/// [`NPSIZES`] for sizes past the largest class.
#[must_use]
pub fn bucket_floor(size: usize) -> usize {
    if size > MAX_PSZ {
        return NPSIZES;
    }
    psz2ind(quantize_floor(size))
}

/// First bucket that can hold a request of `size` bytes.
#[must_use]
pub fn bucket_ceil(size: usize) -> usize {
    if size > MAX_PSZ {
        return NPSIZES;
    }
    psz2ind(quantize_ceil(size))
}
