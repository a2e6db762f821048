//! Field bitsets and keyed open-addressed tables.
//!
//! These structures record which fields or keys a transaction touched. They
//! are mutated only by the exclusive owner of a private version and are
//! shared read-only once the version is published.

pub mod bits;
pub mod fixed;
pub mod keyed;
pub mod sparse;

pub use bits::Bits;
pub use fixed::FixedBits;
pub use keyed::{EntryValue, Held, KeyedEntry, KeyedTable, MergeMode, guarded, hash_key};
pub use sparse::{SparseBits, TableFull};
