//! Address and alignment arithmetic.

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Align a size up to the given power-of-two alignment.
#[inline]
pub const fn align_size(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// [`align_up`], or `None` when the result does not fit in a `u64`.
#[inline]
pub const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// [`align_size`], or `None` when the result does not fit in a `usize`.
#[inline]
pub const fn checked_align_size(size: usize, align: usize) -> Option<usize> {
    match size.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Whether `value` is a multiple of the power-of-two `align`.
#[inline]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}
