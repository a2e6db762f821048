//! Field and key values carried by versions.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::glossary::ObjectId;

/// A dynamically typed field value.
///
/// `F64` compares and hashes by bit pattern so that values can be used as
/// keys in keyed collections.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Reference to another replicated object.
    Ref(ObjectId),
}

/// Wire tags for [`Value`] variants.
pub mod tag {
    pub const NULL: u8 = 0;
    pub const BOOL_FALSE: u8 = 1;
    pub const BOOL_TRUE: u8 = 2;
    pub const I32: u8 = 3;
    pub const I64: u8 = 4;
    pub const F64: u8 = 5;
    pub const STR: u8 = 6;
    pub const BYTES: u8 = 7;
    pub const REF: u8 = 8;
    pub const MAX: u8 = REF;
}

impl Value {
    /// Wire tag for this value.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Null => tag::NULL,
            Self::Bool(false) => tag::BOOL_FALSE,
            Self::Bool(true) => tag::BOOL_TRUE,
            Self::I32(_) => tag::I32,
            Self::I64(_) => tag::I64,
            Self::F64(_) => tag::F64,
            Self::Str(_) => tag::STR,
            Self::Bytes(_) => tag::BYTES,
            Self::Ref(_) => tag::REF,
        }
    }

    /// Short type name, used in error messages.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::F64(_) => "f64",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Ref(_) => "ref",
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Self::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// 64-bit hash used by open-addressed keyed tables.
    #[must_use]
    pub fn hash64(&self) -> u64 {
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::I32(a), Self::I32(b)) => a == b,
            (Self::I64(a), Self::I64(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Ref(a), Self::Ref(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.tag());
        match self {
            Self::Null | Self::Bool(_) => {}
            Self::I32(v) => state.write_i32(*v),
            Self::I64(v) => state.write_i64(*v),
            Self::F64(v) => state.write_u64(v.to_bits()),
            Self::Str(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::Ref(id) => id.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Ref(id) => write!(f, "{id}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Self::Ref(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_keys_compare_by_bits() {
        assert_eq!(Value::F64(f64::NAN), Value::F64(f64::NAN));
        assert_ne!(Value::F64(0.0), Value::F64(-0.0));
        assert_eq!(Value::F64(1.5).hash64(), Value::F64(1.5).hash64());
    }

    #[test]
    fn variants_do_not_collide() {
        assert_ne!(Value::I32(1), Value::I64(1));
        assert_ne!(Value::I32(1).hash64(), Value::I64(1).hash64());
        assert_eq!(Value::I32(1).as_i64(), Value::I64(1).as_i64());
    }

    #[test]
    fn tags_are_distinct() {
        let values = [
            Value::Null,
            Value::Bool(false),
            Value::Bool(true),
            Value::I32(0),
            Value::I64(0),
            Value::F64(0.0),
            Value::Str(String::new()),
            Value::Bytes(Vec::new()),
            Value::Ref(ObjectId::new(1).unwrap()),
        ];
        let mut tags: Vec<u8> = values.iter().map(Value::tag).collect();
        tags.dedup();
        assert_eq!(tags.len(), values.len());
        assert!(tags.iter().all(|t| *t <= tag::MAX));
    }

    #[test]
    fn serde_json_roundtrip() {
        let v = Value::Str("hello".to_owned());
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn display() {
        assert_eq!(Value::from("x").to_string(), "\"x\"");
        assert_eq!(Value::Bytes(vec![1, 2]).to_string(), "<2 bytes>");
        assert_eq!(Value::Null.to_string(), "null");
    }
}
