//! Wrap-aware sequence numbers.
//!
//! Sequence numbers are `u32` and wrap modulo 2^32. Two numbers are ordered
//! by the signed distance between them, which is correct as long as they are
//! less than half the sequence space (2^31) apart. Never compare the raw
//! values with `<`.

use std::fmt;

/// Half the sequence space; distances at or beyond this are "behind".
const HALF_RANGE: u32 = 1 << 31;

/// A per-connection, per-direction packet sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    /// The first sequence number of a fresh connection.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The following sequence number, wrapping at `u32::MAX`.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// `self + n`, wrapping.
    #[must_use]
    pub fn wrapping_add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// `self - n`, wrapping.
    #[must_use]
    pub fn wrapping_sub(self, n: u32) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Forward distance from `earlier` to `self`, modulo 2^32.
    pub fn distance_from(self, earlier: Self) -> u32 {
        self.0.wrapping_sub(earlier.0)
    }

    /// `true` if `self` comes strictly after `other`.
    pub fn is_after(self, other: Self) -> bool {
        let d = self.distance_from(other);
        d != 0 && d < HALF_RANGE
    }

    /// `true` if `self` comes strictly before `other`.
    pub fn is_before(self, other: Self) -> bool {
        other.is_after(self)
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u32 {
    fn from(seq: SequenceNumber) -> u32 {
        seq.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(v: u32) -> SequenceNumber {
        SequenceNumber::new(v)
    }

    #[test]
    fn test_simple_ordering() {
        assert!(seq(2).is_after(seq(1)));
        assert!(seq(1).is_before(seq(2)));
        assert!(!seq(1).is_after(seq(1)));
        assert!(!seq(1).is_before(seq(1)));
    }

    #[test]
    fn test_wrap_ordering() {
        // 0xFFFFFFFE precedes 0x00000001 across the wrap.
        assert!(seq(0xFFFF_FFFE).is_before(seq(0x0000_0001)));
        assert!(seq(0x0000_0001).is_after(seq(0xFFFF_FFFE)));
        assert!(seq(0).is_after(seq(u32::MAX)));
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(seq(u32::MAX).next(), seq(0));
        assert_eq!(seq(u32::MAX).wrapping_add(3), seq(2));
        assert_eq!(seq(1).wrapping_sub(3), seq(u32::MAX - 1));
    }

    #[test]
    fn test_distance() {
        assert_eq!(seq(5).distance_from(seq(3)), 2);
        assert_eq!(seq(1).distance_from(seq(u32::MAX)), 2);
    }

    #[test]
    fn test_half_range_boundary() {
        // Exactly half the space apart is ambiguous and never "after".
        assert!(!seq(HALF_RANGE).is_after(seq(0)));
        assert!(seq(HALF_RANGE - 1).is_after(seq(0)));
    }
}
