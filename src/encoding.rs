//! Pluggable payload serialization.
//!
//! An [`Encoding`] is a pair of encode/decode functions injected per log.
//! The entry structure never looks inside payload bytes; equality and
//! hashing are over the encoded form.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encoder/decoder pair for payload values.
pub struct Encoding<T> {
    /// Serialize a value to its payload bytes.
    pub encoder: fn(&T) -> Result<Vec<u8>>,
    /// Deserialize payload bytes back into a value.
    pub decoder: fn(&[u8]) -> Result<T>,
}

impl<T> std::fmt::Debug for Encoding<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoding").finish_non_exhaustive()
    }
}

impl<T> Clone for Encoding<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Encoding<T> {}

/// The default encoding: JSON.
pub fn json_encoding<T: Serialize + DeserializeOwned>() -> Encoding<T> {
    Encoding {
        encoder: |value| Ok(serde_json::to_vec(value)?),
        decoder: |bytes| Ok(serde_json::from_slice(bytes)?),
    }
}

/// Compact binary encoding via postcard.
pub fn postcard_encoding<T: Serialize + DeserializeOwned>() -> Encoding<T> {
    Encoding {
        encoder: |value| Ok(postcard::to_stdvec(value)?),
        decoder: |bytes| Ok(postcard::from_bytes(bytes)?),
    }
}
