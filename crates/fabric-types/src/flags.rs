//! Transaction flags.

bitflags::bitflags! {
    /// Behaviour switches for a transaction or one of its nested layers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TxnFlags: u32 {
        /// Retry automatically on conflict.
        const AUTO = 1;
        /// Do not record reads (no conflict detection for this layer).
        const NO_READS = 1 << 1;
        /// Writes are rejected.
        const NO_WRITES = 1 << 2;
        /// Changes arrived from a remote site.
        const REMOTE = 1 << 3;
        /// Public view of a branch: always reads the newest snapshot.
        const PUBLIC = 1 << 4;
        /// Skip read validation at commit (last writer wins).
        const IGNORE_CONFLICTS = 1 << 5;
    }
}

impl TxnFlags {
    /// Flags of a read-only layer.
    pub const READ_ONLY: Self = Self::NO_WRITES;

    /// Whether reads made under these flags are recorded.
    #[must_use]
    pub const fn records_reads(self) -> bool {
        !self.contains(Self::NO_READS) && !self.contains(Self::IGNORE_CONFLICTS)
    }
}

impl serde::Serialize for TxnFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> serde::Deserialize<'de> for TxnFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Self::from_bits(bits)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown transaction flags {bits:#x}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_reads() {
        assert!(TxnFlags::empty().records_reads());
        assert!(TxnFlags::AUTO.records_reads());
        assert!(!TxnFlags::NO_READS.records_reads());
        assert!(!(TxnFlags::AUTO | TxnFlags::IGNORE_CONFLICTS).records_reads());
    }

    #[test]
    fn serde_rejects_unknown_bits() {
        let ok: TxnFlags = serde_json::from_str("3").unwrap();
        assert_eq!(ok, TxnFlags::AUTO | TxnFlags::NO_READS);
        assert!(serde_json::from_str::<TxnFlags>("4096").is_err());
    }
}
