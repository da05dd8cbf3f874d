//! Merged documents and the fingerprints of what went into them.

use depot_storage::StoreKey;
use time::OffsetDateTime;

/// Identifies the exact content one constituent contributed to a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub store: StoreKey,
    /// BLAKE3 hash of the contributed bytes, hex encoded.
    pub hash: String,
}
impl Fingerprint {
    pub fn of(store: StoreKey, bytes: &[u8]) -> Self {
        Self { store, hash: blake3::hash(bytes).to_string() }
    }
}

/// The result of merging one path across a group's constituents.
///
/// Never mutated once built; a recompute produces a new document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedDocument {
    bytes: Vec<u8>,
    fingerprints: Vec<Fingerprint>,
    computed_at: OffsetDateTime,
}
impl MergedDocument {
    pub fn new(bytes: Vec<u8>, fingerprints: Vec<Fingerprint>) -> Self {
        Self { bytes, fingerprints, computed_at: OffsetDateTime::now_utc() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// One entry per contributing constituent, in precedence order.
    pub fn fingerprints(&self) -> &[Fingerprint] {
        &self.fingerprints
    }

    pub fn computed_at(&self) -> OffsetDateTime {
        self.computed_at
    }

    pub fn is_derived_from(&self, store: &StoreKey) -> bool {
        self.fingerprints.iter().any(|fingerprint| &fingerprint.store == store)
    }
}
