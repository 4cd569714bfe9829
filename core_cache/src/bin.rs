use std::ops::Range;

/// mask of the lowest `width` bits. `width` of 64 or more yields all ones.
#[inline]
pub const fn low_mask(width: u32) -> u64 {
    if width >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// mask of bits `r.start ..= r.end - 1`. empty range yields zero.
#[inline]
pub const fn bit_range(r: Range<u32>) -> u64 {
    if r.start >= r.end {
        0
    } else {
        low_mask(r.end) & !low_mask(r.start)
    }
}

#[inline]
pub const fn mask(bin: u64, r: Range<u32>) -> u64 {
    bin & bit_range(r)
}

/// extracts field `r` and shifts it down to bit 0.
#[inline]
pub const fn extract(bin: u64, r: Range<u32>) -> u64 {
    let left = r.start;
    if left >= u64::BITS {
        0
    } else {
        mask(bin, r) >> left
    }
}
