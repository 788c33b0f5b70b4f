use std::ops::Range;

/// mask with the lower `width` bits set. `width` may be the full 32 bits.
#[inline]
pub const fn low_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// bits `r.start..r.end` of `bin` (end exclusive), shifted down to bit 0.
#[inline]
pub const fn extract(bin: u32, r: Range<u32>) -> u32 {
    if r.start >= 32 {
        return 0;
    }
    (bin >> r.start) & low_mask(r.end - r.start)
}

/// `bin` truncated to its lower `width` bits.
#[inline]
pub const fn truncate(bin: u32, width: u32) -> u32 {
    bin & low_mask(width)
}
