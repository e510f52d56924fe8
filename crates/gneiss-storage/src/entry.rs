//! An entry paired with its assigned log position.

use gneiss_types::Index;

/// A caller entry together with the index the log assigned to it and the
/// serialized payload length it occupies on disk (excluding the 8-byte
/// `length | crc32` framing).
///
/// `Indexed` values are shared as `Arc<Indexed<E>>` between the append path,
/// the entry cache, and readers, so a cache hit never re-decodes or clones
/// the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed<E> {
    index: Index,
    entry: E,
    size: u32,
}

impl<E> Indexed<E> {
    pub(crate) fn new(index: Index, entry: E, size: u32) -> Self {
        Self { index, entry, size }
    }

    /// The logical index assigned to this entry.
    pub fn index(&self) -> Index {
        self.index
    }

    /// The entry value.
    pub fn entry(&self) -> &E {
        &self.entry
    }

    /// Serialized payload length in bytes, excluding framing.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Total on-disk footprint of this entry's record, including the
    /// `length | crc32` framing.
    pub(crate) fn record_len(&self) -> u64 {
        u64::from(self.size) + crate::writer::RECORD_HEADER_BYTES
    }
}
