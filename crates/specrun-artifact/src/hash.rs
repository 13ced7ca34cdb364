//! Content-addressed hashing primitives
//!
//! Provides [`ContentHash`], a strongly-typed SHA-256 digest used for
//! content addressing of artifacts, manifests and collaboration events.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::canonical;

/// Textual prefix naming the digest algorithm.
pub const HASH_PREFIX: &str = "sha256:";

/// A 32-byte content hash (SHA-256)
///
/// Rendered as `sha256:<64 hex chars>`; parsing accepts the bare hex form
/// as well. Immutable and cheap to clone (Copy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes
    #[inline]
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get reference to the underlying bytes
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create hash from byte slice
    ///
    /// # Errors
    /// Returns error if slice length is not exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| HashError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    /// SHA-256 of arbitrary bytes
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hash of a JSON value in canonical form (sorted keys, compact separators)
    #[must_use]
    pub fn of_json(value: &serde_json::Value) -> Self {
        Self::compute(canonical::to_canonical_string(value).as_bytes())
    }

    /// Hash of any serializable value, canonicalized through `serde_json::Value`
    ///
    /// # Errors
    /// Returns error if the value cannot be represented as JSON
    pub fn of_serializable<T: serde::Serialize>(value: &T) -> Result<Self, HashError> {
        let json = serde_json::to_value(value)?;
        Ok(Self::of_json(&json))
    }

    /// Short string representation (first 16 hex chars)
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check if hash is all zeros (placeholder/uninitialized)
    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{HASH_PREFIX}{}", hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s.strip_prefix(HASH_PREFIX).unwrap_or(s);
        let bytes = hex::decode(hex_part)?;
        Self::from_slice(&bytes)
    }
}

impl Default for ContentHash {
    fn default() -> Self {
        Self([0; 32])
    }
}

impl serde::Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ContentHashVisitor;

        impl serde::de::Visitor<'_> for ContentHashVisitor {
            type Value = ContentHash;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
                formatter.write_str("a sha256 digest as `sha256:<hex>` or bare hex")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(ContentHashVisitor)
    }
}

/// Errors that can occur when working with content hashes
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Invalid hash length
    #[error("invalid hash length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// Hex encoding error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
