//! Pluggable entry codecs.
//!
//! The log stores opaque caller entries; an [`EntryCodec`] maps them to and
//! from payload bytes. The core is agnostic to the entry type — framing and
//! checksums wrap whatever the codec produces.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::StorageError;

/// Serializes entries to payload bytes and back.
///
/// Implementations must be deterministic in one direction: `decode(encode(e))`
/// yields a value equal to `e`. The encoded length is what the log enforces
/// `max_entry_size` against.
pub trait EntryCodec<E>: Send + Sync {
    /// Serializes an entry to payload bytes.
    fn encode(&self, entry: &E) -> Result<Bytes, StorageError>;

    /// Deserializes an entry from payload bytes.
    fn decode(&self, payload: &[u8]) -> Result<E, StorageError>;
}

/// Identity codec for raw byte entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl EntryCodec<Bytes> for BytesCodec {
    fn encode(&self, entry: &Bytes) -> Result<Bytes, StorageError> {
        Ok(entry.clone())
    }

    fn decode(&self, payload: &[u8]) -> Result<Bytes, StorageError> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

/// JSON codec for any serde-serializable entry type.
#[derive(Debug)]
pub struct JsonCodec<E> {
    _entry: PhantomData<fn() -> E>,
}

impl<E> JsonCodec<E> {
    pub fn new() -> Self {
        Self {
            _entry: PhantomData,
        }
    }
}

impl<E> Default for JsonCodec<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for JsonCodec<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> EntryCodec<E> for JsonCodec<E>
where
    E: Serialize + DeserializeOwned,
{
    fn encode(&self, entry: &E) -> Result<Bytes, StorageError> {
        let encoded = serde_json::to_vec(entry).map_err(|e| StorageError::Codec {
            reason: e.to_string(),
        })?;
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, payload: &[u8]) -> Result<E, StorageError> {
        serde_json::from_slice(payload).map_err(|e| StorageError::Codec {
            reason: e.to_string(),
        })
    }
}
