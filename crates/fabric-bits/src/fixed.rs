//! Single-word field bitset for objects with at most 32 fields.

use std::fmt;

/// Bitmask over field indices `0..32`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct FixedBits(u32);

impl FixedBits {
    /// Number of addressable indices.
    pub const CAPACITY: u32 = 32;

    pub const EMPTY: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_word(word: u32) -> Self {
        Self(word)
    }

    #[inline]
    #[must_use]
    pub const fn word(self) -> u32 {
        self.0
    }

    #[inline]
    const fn mask(index: u32) -> u32 {
        assert!(index < Self::CAPACITY, "FixedBits index out of range");
        1 << index
    }

    #[inline]
    #[must_use]
    pub const fn get(self, index: u32) -> bool {
        self.0 & Self::mask(index) != 0
    }

    /// Set `index`. Returns `true` if the bit was not set before.
    #[inline]
    pub fn set(&mut self, index: u32) -> bool {
        let mask = Self::mask(index);
        let fresh = self.0 & mask == 0;
        self.0 |= mask;
        fresh
    }

    /// Clear `index`. Returns `true` if the bit was set before.
    #[inline]
    pub fn unset(&mut self, index: u32) -> bool {
        let mask = Self::mask(index);
        let was = self.0 & mask != 0;
        self.0 &= !mask;
        was
    }

    #[inline]
    #[must_use]
    pub const fn merge(a: Self, b: Self) -> Self {
        Self(a.0 | b.0)
    }

    #[inline]
    #[must_use]
    pub const fn intersects(a: Self, b: Self) -> bool {
        a.0 & b.0 != 0
    }

    /// Bits of `a` that are not in `b`.
    #[inline]
    #[must_use]
    pub const fn and_not(a: Self, b: Self) -> Self {
        Self(a.0 & !b.0)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Set indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        let mut word = self.0;
        std::iter::from_fn(move || {
            if word == 0 {
                return None;
            }
            let bit = word.trailing_zeros();
            word &= word - 1;
            Some(bit)
        })
    }
}

impl fmt::Debug for FixedBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedBits({:#034b})", self.0)
    }
}

impl FromIterator<u32> for FixedBits {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut bits = Self::EMPTY;
        for index in iter {
            bits.set(index);
        }
        bits
    }
}
