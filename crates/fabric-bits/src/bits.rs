//! Field-set representation chosen by object shape.

use crate::fixed::FixedBits;
use crate::sparse::SparseBits;

/// Either a single-word bitmask or a sparse table.
///
/// Objects with at most [`FixedBits::CAPACITY`] fields start fixed. Setting an
/// index beyond the fixed range promotes the set to sparse; nothing demotes
/// it back.
#[derive(Clone, PartialEq, Eq)]
pub enum Bits {
    Fixed(FixedBits),
    Sparse(SparseBits),
}

impl Bits {
    /// Empty set sized for an object with `field_count` fields.
    #[must_use]
    pub fn for_fields(field_count: u32) -> Self {
        if field_count <= FixedBits::CAPACITY {
            Self::Fixed(FixedBits::EMPTY)
        } else {
            Self::Sparse(SparseBits::new())
        }
    }

    #[must_use]
    pub const fn fixed() -> Self {
        Self::Fixed(FixedBits::EMPTY)
    }

    #[must_use]
    pub const fn is_fixed(&self) -> bool {
        matches!(self, Self::Fixed(_))
    }

    #[must_use]
    pub fn get(&self, index: u32) -> bool {
        match self {
            Self::Fixed(bits) => index < FixedBits::CAPACITY && bits.get(index),
            Self::Sparse(bits) => bits.get(index),
        }
    }

    /// Returns whether the bit was fresh.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= FixedBits::CAPACITY {
            self.promote();
        }
        match self {
            Self::Fixed(bits) => bits.set(index),
            Self::Sparse(bits) => bits.set(index),
        }
    }

    /// Returns whether the bit was set.
    pub fn unset(&mut self, index: u32) -> bool {
        match self {
            Self::Fixed(bits) => index < FixedBits::CAPACITY && bits.unset(index),
            Self::Sparse(bits) => bits.unset(index),
        }
    }

    fn promote(&mut self) {
        if let Self::Fixed(bits) = *self {
            *self = Self::Sparse(bits.iter().collect());
        }
    }

    fn to_sparse(&self) -> SparseBits {
        match self {
            Self::Fixed(bits) => bits.iter().collect(),
            Self::Sparse(bits) => bits.clone(),
        }
    }

    /// OR every bit of `other` into `self`.
    pub fn merge_in(&mut self, other: &Self) {
        if self.is_fixed() && !other.is_fixed() {
            self.promote();
        }
        match (self, other) {
            (Self::Fixed(a), Self::Fixed(b)) => *a = FixedBits::merge(*a, *b),
            (Self::Sparse(a), Self::Sparse(b)) => a.merge_in(b),
            (Self::Sparse(a), Self::Fixed(b)) => {
                for index in b.iter() {
                    a.set(index);
                }
            }
            (Self::Fixed(_), Self::Sparse(_)) => {}
        }
    }

    #[must_use]
    pub fn merge(a: &Self, b: &Self) -> Self {
        let mut out = a.clone();
        out.merge_in(b);
        out
    }

    #[must_use]
    pub fn intersects(a: &Self, b: &Self) -> bool {
        match (a, b) {
            (Self::Fixed(a), Self::Fixed(b)) => FixedBits::intersects(*a, *b),
            (Self::Sparse(a), Self::Sparse(b)) => SparseBits::intersects(a, b),
            (Self::Sparse(s), Self::Fixed(f)) | (Self::Fixed(f), Self::Sparse(s)) => {
                s.intersects_low_word(f.word())
            }
        }
    }

    /// Bits of `a` that are not in `b`.
    #[must_use]
    pub fn and_not(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (Self::Fixed(a), Self::Fixed(b)) => Self::Fixed(FixedBits::and_not(*a, *b)),
            (Self::Fixed(a), Self::Sparse(b)) => {
                Self::Fixed(a.iter().filter(|i| !b.get(*i)).collect())
            }
            (Self::Sparse(a), _) => Self::Sparse(SparseBits::and_not(a, &b.to_sparse())),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Fixed(bits) => bits.is_empty(),
            Self::Sparse(bits) => bits.is_empty(),
        }
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        match self {
            Self::Fixed(bits) => bits.count(),
            Self::Sparse(bits) => bits.count(),
        }
    }

    /// Set indices in ascending order.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        match self {
            Self::Fixed(bits) => bits.iter().collect(),
            Self::Sparse(bits) => bits.indices(),
        }
    }
}

impl Default for Bits {
    fn default() -> Self {
        Self::fixed()
    }
}

impl std::fmt::Debug for Bits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.indices()).finish()
    }
}

impl FromIterator<u32> for Bits {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut bits = Self::fixed();
        for index in iter {
            bits.set(index);
        }
        bits
    }
}
