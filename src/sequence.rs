//! Modular sequence number arithmetic.
//!
//! Sequence numbers live in `[0, SEQUENCE_SPACE)` and wrap. Every early/late
//! decision in the channels goes through [`relative`], which maps the modular
//! distance between two sequence numbers into `(-S/2, S/2]`.

/// Size of the sequence number space per (kind, direction).
pub const SEQUENCE_SPACE: u16 = 1024;

/// Half the sequence space; distances above this wrap negative.
const HALF_SPACE: i32 = (SEQUENCE_SPACE / 2) as i32;

/// Returns the modular distance from `b` to `a` in `(-S/2, S/2]`.
///
/// A positive result means `a` is ahead of `b` (early), negative means it is
/// behind (late), zero means on time.
#[inline]
pub fn relative(a: u16, b: u16) -> i32 {
    debug_assert!(a < SEQUENCE_SPACE && b < SEQUENCE_SPACE);
    let c = (a as i32 - b as i32).rem_euclid(SEQUENCE_SPACE as i32);
    if c > HALF_SPACE {
        c - SEQUENCE_SPACE as i32
    } else {
        c
    }
}

/// Advances a sequence number by `n`, wrapping within the sequence space.
#[inline]
pub fn advance(seq: u16, n: u16) -> u16 {
    (seq + n) % SEQUENCE_SPACE
}
