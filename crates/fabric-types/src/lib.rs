//! Shared vocabulary of the fabric engine: identities, values and flags.

pub mod flags;
pub mod glossary;
pub mod value;

pub use flags::TxnFlags;
pub use glossary::{
    BranchId, CallId, ClassId, ConnectionId, IdSequence, InterceptionId, ObjectId, SiteId, TxnId,
};
pub use value::Value;
