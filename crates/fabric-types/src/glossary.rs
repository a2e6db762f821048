//! Identity types used across the engine.
//!
//! All numeric identities are non-zero so that `Option<Id>` stays the size of
//! the raw integer and zero can mean "absent" on the wire.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! nonzero_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(NonZeroU64);

        impl $name {
            /// Construct from a raw value; `None` for zero.
            #[inline]
            pub const fn new(raw: u64) -> Option<Self> {
                match NonZeroU64::new(raw) {
                    Some(nz) => Some(Self(nz)),
                    None => None,
                }
            }

            /// Get the raw u64 value.
            #[inline]
            pub const fn get(self) -> u64 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.get())
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> u64 {
                id.get()
            }
        }
    };
}

nonzero_id!(
    /// A line of transactional history (a trunk or a branch of it).
    BranchId,
    "branch"
);

nonzero_id!(
    /// Identity of a replicated object, unique within the object graph.
    ObjectId,
    "obj"
);

nonzero_id!(
    /// Transaction identity, unique within a process.
    TxnId,
    "txn"
);

nonzero_id!(
    /// A transport-level peer link. Tags VersionMaps that arrived over it.
    ConnectionId,
    "conn"
);

nonzero_id!(
    /// An acknowledgement gate over a run of VersionMaps.
    InterceptionId,
    "icpt"
);

nonzero_id!(
    /// Outstanding remote method call.
    CallId,
    "call"
);

// ---------------------------------------------------------------------------
// ClassId
// ---------------------------------------------------------------------------

/// Numeric class identity resolved through the object model.
///
/// Negative ids are reserved for built-in array classes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ClassId(i32);

impl ClassId {
    /// Built-in array of [`crate::Value`] elements.
    pub const ARRAY: Self = Self(-1);
    /// Built-in keyed map.
    pub const MAP: Self = Self(-2);
    /// Built-in keyed set (values are ignored).
    pub const SET: Self = Self(-3);

    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Whether this id denotes a built-in class.
    #[inline]
    pub const fn is_builtin(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SiteId
// ---------------------------------------------------------------------------

/// Identity of a process participating in the object graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct SiteId([u8; 16]);

impl SiteId {
    pub const LEN: usize = 16;

    #[inline]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Derive a site id from arbitrary seed material (host name, pid, ...).
    #[must_use]
    pub fn derive(seed: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(seed);
        Self(hash.to_be_bytes())
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// IdSequence
// ---------------------------------------------------------------------------

/// Monotonic allocator for non-zero identities.
///
/// Allocation uses a CAS loop (never `fetch_add`) so that exhaustion is
/// detected instead of wrapping to zero.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Start allocating at `first` (clamped to at least 1).
    #[must_use]
    pub const fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(if first == 0 { 1 } else { first }),
        }
    }

    /// Allocate the next raw id; `None` once the space is exhausted.
    pub fn alloc(&self) -> Option<NonZeroU64> {
        loop {
            let current = self.next.load(Ordering::Acquire);
            let next = current.checked_add(1)?;
            if self
                .next
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return NonZeroU64::new(current);
            }
        }
    }

    /// Peek at the next id without allocating.
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_an_id() {
        assert!(BranchId::new(0).is_none());
        assert_eq!(BranchId::new(5).unwrap().get(), 5);
        assert_eq!(
            std::mem::size_of::<Option<ObjectId>>(),
            std::mem::size_of::<u64>()
        );
    }

    #[test]
    fn display_prefixes() {
        assert_eq!(TxnId::new(9).unwrap().to_string(), "txn#9");
        assert_eq!(ConnectionId::new(2).unwrap().to_string(), "conn#2");
        assert_eq!(ClassId::ARRAY.to_string(), "class#-1");
    }

    #[test]
    fn builtin_classes_are_negative() {
        assert!(ClassId::ARRAY.is_builtin());
        assert!(ClassId::MAP.is_builtin());
        assert!(!ClassId::new(12).is_builtin());
    }

    #[test]
    fn site_id_derivation_is_stable() {
        let a = SiteId::derive(b"host-a:42");
        let b = SiteId::derive(b"host-a:42");
        let c = SiteId::derive(b"host-b:42");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 16);
    }

    #[test]
    fn id_sequence_is_monotonic_and_unique() {
        let seq = IdSequence::new();
        let ids: Vec<u64> = (0..100).map(|_| seq.alloc().unwrap().get()).collect();
        assert_eq!(ids[0], 1);
        assert!(ids.windows(2).all(|w| w[0] + 1 == w[1]));
    }

    #[test]
    fn id_sequence_exhaustion() {
        let seq = IdSequence::starting_at(u64::MAX);
        assert!(seq.alloc().is_none());
    }

    #[test]
    fn id_sequence_concurrent() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let seq = Arc::new(IdSequence::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                std::thread::spawn(move || {
                    (0..250)
                        .map(|_| seq.alloc().unwrap().get())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(all.len(), 1000);
    }
}
