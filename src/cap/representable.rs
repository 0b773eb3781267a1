//! Representable Bounds
//!
//! The compressed capability encoding stores bounds with a fixed mantissa
//! precision. Short objects are exact; larger objects can only be described
//! in granules of `2^e` bytes, where `e` grows with the length.
//!
//! # Contract
//! - `representable_length(n) >= n`
//! - `representable_length(representable_length(n)) == representable_length(n)`
//! - A capability of length `representable_length(n)` is exact only when its
//!   base is aligned to `representable_alignment(n)`.
//!
//! Every allocation that will back a capability is rounded here before the
//! memory is acquired, and every offset added to such a capability must be
//! aligned the same way, or the derived bounds silently cover neighbouring
//! bytes.

use crate::config::CAP_PRECISION_BITS;

/// Number of significant bits in `len`.
#[inline]
const fn bit_length(len: usize) -> u32 {
    usize::BITS - len.leading_zeros()
}

/// Exponent needed to fit `len` in the mantissa, before rounding.
#[inline]
const fn raw_exponent(len: usize) -> u32 {
    let bits = bit_length(len);
    if bits <= CAP_PRECISION_BITS {
        0
    } else {
        bits - CAP_PRECISION_BITS
    }
}

/// Exponent after rounding `len` up to its granule.
///
/// Rounding may carry into a new top bit, which costs one more exponent step.
const fn exponent(len: usize) -> u32 {
    let e = raw_exponent(len);
    if e == 0 {
        return 0;
    }
    let granule = 1usize << e;
    let rounded = match len.checked_add(granule - 1) {
        Some(v) => v & !(granule - 1),
        None => return e + 1,
    };
    if raw_exponent(rounded) > e {
        e + 1
    } else {
        e
    }
}

/// Alignment mask a capability of length `len` must honour.
#[inline]
pub const fn representable_alignment_mask(len: usize) -> usize {
    !((1usize << exponent(len)) - 1)
}

/// Alignment (in bytes) a capability of length `len` must honour.
#[inline]
pub const fn representable_alignment(len: usize) -> usize {
    1usize << exponent(len)
}

/// Smallest representable length that is at least `len`.
///
/// Defined for lengths up to [`crate::config::MAX_OBJECT_SIZE`].
#[inline]
pub const fn representable_length(len: usize) -> usize {
    let mask = representable_alignment_mask(len);
    match len.checked_add(!mask) {
        Some(v) => v & mask,
        None => usize::MAX & mask,
    }
}

/// Check whether `[base, base + len)` can be encoded without rounding.
#[inline]
pub const fn is_exact(base: usize, len: usize) -> bool {
    representable_length(len) == len && base & !representable_alignment_mask(len) == 0
}

/// Round `value` up to a power-of-two `align`.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a power-of-two `align`.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}
