//! Content addressing for stored blobs and commits.
//!
//! Addresses are SHA-256 digests. The incremental hasher is
//! field-oriented: every field is length-prefixed before it reaches the
//! digest, so adjacent fields cannot be confused by concatenation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte SHA-256 digest used as a content address.
///
/// `Ord` follows byte order, which gives parent lists and fetch sets a
/// stable, implementation-independent ordering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Create a hash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Get the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash a single field in one shot.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.field(data);
        hasher.finish()
    }

    /// Convert to a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 32] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Hash(bytes))
    }

    /// Truncated display form (first 8 hex chars).
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

/// Incremental, field-oriented SHA-256 hashing.
///
/// Feed one [`field`](Hasher::field) per logical component and call
/// [`finish`](Hasher::finish) for the address. The length prefix makes
/// field boundaries part of the hashed stream: `("ab", "c")` and
/// `("a", "bc")` produce different addresses.
pub struct Hasher {
    inner: Sha256,
}

impl Hasher {
    /// Start a fresh hasher.
    pub fn new() -> Self {
        Hasher {
            inner: Sha256::new(),
        }
    }

    /// Feed one length-prefixed field.
    pub fn field(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update((data.len() as u64).to_le_bytes());
        self.inner.update(data);
        self
    }

    /// Finish and produce the address.
    pub fn finish(self) -> Hash {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&self.inner.finalize());
        Hash(bytes)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_deterministic() {
        let a = Hash::digest(b"hello");
        let b = Hash::digest(b"hello");
        let c = Hash::digest(b"world");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hex_roundtrip() {
        let h = Hash::digest(b"roundtrip");
        let encoded = h.to_hex();

        assert_eq!(encoded.len(), 64);
        assert_eq!(Hash::from_hex(&encoded), Some(h));

        // Bad digits and bad lengths both fail to parse.
        assert_eq!(Hash::from_hex("zz"), None);
        assert_eq!(Hash::from_hex(&encoded[..32]), None);
    }

    #[test]
    fn short_is_prefix() {
        let h = Hash::digest(b"prefix");
        assert!(h.to_hex().starts_with(&h.short()));
        assert_eq!(h.short().len(), 8);
    }

    #[test]
    fn field_boundaries_are_hashed() {
        let mut split_early = Hasher::new();
        split_early.field(b"ab").field(b"c");

        let mut split_late = Hasher::new();
        split_late.field(b"a").field(b"bc");

        assert_ne!(split_early.finish(), split_late.finish());
    }
}
