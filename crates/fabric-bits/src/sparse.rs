//! Sparse, self-growing bitset.
//!
//! Indices are grouped into 64-bit words keyed by `index >> 6`. Words live in
//! an open-addressed table whose capacity is always a power of two. An insert
//! that cannot find a slot within [`MAX_DISPLACEMENT`] positions, or that would push
//! the table past its load limit, fails with [`TableFull`]; the caller then
//! reindexes into a table of double capacity and retries. Reindexing itself
//! keeps doubling until every existing word fits, so pathological clustering
//! costs memory rather than correctness.
//!
//! Only the exclusive owner of a bitset mutates it. Published versions share
//! their bits read-only.

use std::fmt;

/// Farthest from its home slot an insert may walk before reporting [`TableFull`].
pub const MAX_DISPLACEMENT: usize = 8;

/// The table is full once `entries >= cap - (cap >> LOAD_SHIFT)`.
pub const LOAD_SHIFT: u32 = 2;

const MIN_CAPACITY: usize = 4;
const WORD_BITS: u32 = 64;
const FIBONACCI: u64 = 0x9E37_79B9_7F4A_7C15;

/// An insert could not be placed at the current capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

impl fmt::Display for TableFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sparse bit table full at current capacity")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    base: u32,
    word: u64,
}

/// Open-addressed array of `(base, word)` entries.
#[derive(Clone)]
pub struct SparseBits {
    slots: Box<[Option<Entry>]>,
    occupied: usize,
    reindexes: u32,
}

#[inline]
const fn split(index: u32) -> (u32, u64) {
    (index / WORD_BITS, 1_u64 << (index % WORD_BITS))
}

impl SparseBits {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Table with room for at least `capacity` slots (rounded up to a power
    /// of two).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: vec![None; cap].into_boxed_slice(),
            occupied: 0,
            reindexes: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of times this table has been reindexed.
    #[inline]
    #[must_use]
    pub const fn reindex_count(&self) -> u32 {
        self.reindexes
    }

    #[inline]
    fn home(&self, base: u32) -> usize {
        let bits = self.slots.len().trailing_zeros();
        #[allow(clippy::cast_possible_truncation)]
        let slot = (u64::from(base).wrapping_mul(FIBONACCI) >> (64 - bits)) as usize;
        slot
    }

    #[inline]
    fn load_limit(&self) -> usize {
        let cap = self.slots.len();
        cap - (cap >> LOAD_SHIFT)
    }

    fn position(&self, base: u32) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let home = self.home(base);
        for step in 0..MAX_DISPLACEMENT.min(self.slots.len()) {
            let at = (home + step) & mask;
            match self.slots[at] {
                Some(entry) if entry.base == base => return Some(at),
                Some(_) => {}
                None => return None,
            }
        }
        None
    }

    fn word_at(&self, base: u32) -> u64 {
        self.position(base)
            .and_then(|at| self.slots[at])
            .map_or(0, |entry| entry.word)
    }

    /// OR `mask` into the word for `base`, returning the previous word.
    fn try_or(&mut self, base: u32, mask: u64) -> Result<u64, TableFull> {
        let cap_mask = self.slots.len() - 1;
        let home = self.home(base);
        let full = self.occupied >= self.load_limit();
        for step in 0..MAX_DISPLACEMENT.min(self.slots.len()) {
            let at = (home + step) & cap_mask;
            match &mut self.slots[at] {
                Some(entry) if entry.base == base => {
                    let old = entry.word;
                    entry.word |= mask;
                    return Ok(old);
                }
                Some(_) => {}
                slot @ None => {
                    if full {
                        return Err(TableFull);
                    }
                    *slot = Some(Entry { base, word: mask });
                    self.occupied += 1;
                    return Ok(0);
                }
            }
        }
        Err(TableFull)
    }

    /// Set `index` without growing. Returns whether the bit was fresh.
    pub fn try_set(&mut self, index: u32) -> Result<bool, TableFull> {
        let (base, mask) = split(index);
        self.try_or(base, mask).map(|old| old & mask == 0)
    }

    fn or_word(&mut self, base: u32, mask: u64) -> u64 {
        loop {
            match self.try_or(base, mask) {
                Ok(old) => return old,
                Err(TableFull) => self.reindex(),
            }
        }
    }

    /// Set `index`, growing the table as needed. Returns whether the bit was
    /// fresh.
    pub fn set(&mut self, index: u32) -> bool {
        let (base, mask) = split(index);
        self.or_word(base, mask) & mask == 0
    }

    /// Clear `index`. Returns whether the bit was set. Emptied words stay in
    /// place until the next reindex so lookup chains remain intact.
    pub fn unset(&mut self, index: u32) -> bool {
        let (base, mask) = split(index);
        let Some(at) = self.position(base) else {
            return false;
        };
        match &mut self.slots[at] {
            Some(entry) => {
                let was = entry.word & mask != 0;
                entry.word &= !mask;
                was
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, index: u32) -> bool {
        let (base, mask) = split(index);
        self.word_at(base) & mask != 0
    }

    /// Reallocate at double capacity and reinsert every non-empty word,
    /// doubling again until all of them fit.
    pub fn reindex(&mut self) {
        let live: Vec<Entry> = self.live_entries().collect();
        let mut cap = self.slots.len() * 2;
        loop {
            let mut next = Self::with_capacity(cap);
            if live
                .iter()
                .all(|entry| next.try_or(entry.base, entry.word).is_ok())
            {
                tracing::trace!(
                    from = self.slots.len(),
                    to = cap,
                    words = live.len(),
                    "sparse bits reindexed"
                );
                self.slots = next.slots;
                self.occupied = next.occupied;
                self.reindexes += 1;
                return;
            }
            cap *= 2;
        }
    }

    fn live_entries(&self) -> impl Iterator<Item = Entry> + '_ {
        self.slots.iter().flatten().copied().filter(|e| e.word != 0)
    }

    /// `(base, word)` pairs with at least one bit set, in table order.
    pub fn entries(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.live_entries().map(|e| (e.base, e.word))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_entries().next().is_none()
    }

    #[must_use]
    pub fn count(&self) -> u32 {
        self.live_entries().map(|e| e.word.count_ones()).sum()
    }

    /// All set indices in ascending order.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.count() as usize);
        for entry in self.live_entries() {
            let mut word = entry.word;
            while word != 0 {
                out.push(entry.base * WORD_BITS + word.trailing_zeros());
                word &= word - 1;
            }
        }
        out.sort_unstable();
        out
    }

    /// Highest set index, if any.
    #[must_use]
    pub fn max_index(&self) -> Option<u32> {
        self.live_entries()
            .map(|e| e.base * WORD_BITS + (WORD_BITS - 1 - e.word.leading_zeros()))
            .max()
    }

    /// Union of `a` and `b`.
    #[must_use]
    pub fn merge(a: &Self, b: &Self) -> Self {
        let (big, small) = if a.occupied >= b.occupied { (a, b) } else { (b, a) };
        let mut out = big.clone();
        out.merge_in(small);
        out
    }

    /// OR every bit of `other` into `self`.
    pub fn merge_in(&mut self, other: &Self) {
        for entry in other.live_entries() {
            self.or_word(entry.base, entry.word);
        }
    }

    #[must_use]
    pub fn intersects(a: &Self, b: &Self) -> bool {
        let (small, table) = if a.occupied <= b.occupied { (a, b) } else { (b, a) };
        small
            .live_entries()
            .any(|entry| table.word_at(entry.base) & entry.word != 0)
    }

    /// Bits of `a` that are not in `b`.
    #[must_use]
    pub fn and_not(a: &Self, b: &Self) -> Self {
        let mut out = Self::with_capacity(a.slots.len());
        for entry in a.live_entries() {
            let word = entry.word & !b.word_at(entry.base);
            if word != 0 {
                out.or_word(entry.base, word);
            }
        }
        out
    }

    /// Whether `self` has bit `index` for any `index` in `0..32` also set in
    /// `word`. Used when comparing against a fixed-width bitset.
    #[must_use]
    pub fn intersects_low_word(&self, word: u32) -> bool {
        self.word_at(0) & u64::from(word) != 0
    }
}

impl Default for SparseBits {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for SparseBits {
    fn eq(&self, other: &Self) -> bool {
        self.live_entries().count() == other.live_entries().count()
            && self
                .live_entries()
                .all(|entry| other.word_at(entry.base) == entry.word)
    }
}

impl Eq for SparseBits {}

impl fmt::Debug for SparseBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.indices()).finish()
    }
}

impl FromIterator<u32> for SparseBits {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut bits = Self::new();
        for index in iter {
            bits.set(index);
        }
        bits
    }
}
