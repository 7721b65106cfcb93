//! Fingerprint: a BLAKE3 hash truncated to 128 bits (32 hex chars).
//!
//! Used wherever "same content" has to be decided by value: clip buffer keys
//! and automation signatures. The encoding matches the CAS content hash so
//! keys are recognisable across tools.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 128-bit BLAKE3 fingerprint in lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash raw bytes.
    pub fn from_data(data: &[u8]) -> Self {
        let hash_bytes = blake3::hash(data);
        Self(hex::encode(&hash_bytes.as_bytes()[..16]))
    }

    /// Hash the canonical JSON encoding of a value.
    ///
    /// Maps in hashed values must be ordered (`BTreeMap`) for the encoding to
    /// be canonical.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Self {
        // Serializing plain data structs into a Vec cannot fail
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        Self::from_data(&bytes)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Content-derived key of an engine-resident clip buffer
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferKey(Fingerprint);

impl BufferKey {
    /// Key for `path` decoded and resampled to `sample_rate`, with the
    /// resulting geometry. Identical effective content always maps to the
    /// same key.
    pub fn derive(path: &str, sample_rate: u32, frames: usize, channels: usize) -> Self {
        Self(Fingerprint::of(&(path, sample_rate, frames, channels)))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for BufferKey {
    fn from(s: &str) -> Self {
        Self(Fingerprint(s.to_string()))
    }
}
