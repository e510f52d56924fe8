//! Single-writer append path for one segment.
//!
//! Records are framed as `length: u32 LE | crc32: u32 LE | payload` and
//! written with a single `write_all` at the tracked tail offset. A zero (or
//! oversized) length field marks logical end-of-data inside the
//! pre-allocated file, so the zeroed region past the tail is the EOF
//! sentinel and truncation only has to zero one frame header.
//!
//! Appending does not imply durability; [`SegmentWriter::flush`] forces
//! previously written records to stable storage.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::BytesMut;
use gneiss_types::{Index, SegmentId};

use crate::cache::EntryCache;
use crate::descriptor::DESCRIPTOR_BYTES;
use crate::index::SparseIndex;
use crate::{EntryCodec, Indexed, StorageError};

/// Framing overhead per record: 4-byte length + 4-byte CRC32.
pub(crate) const RECORD_HEADER_BYTES: u64 = 8;

/// Appends entries to a single segment file.
///
/// Exactly one writer exists per segment; it exclusively owns the append
/// file handle, the scratch buffer, and the tail offset. On error the
/// rejected entry is dropped — the multi-segment [`Log`](crate::Log) avoids
/// this by checking fit before handing the entry down.
#[derive(Debug)]
pub struct SegmentWriter<E, C> {
    file: File,
    codec: Arc<C>,
    index: Arc<SparseIndex>,
    cache: Arc<EntryCache<E>>,
    id: SegmentId,
    first_index: u64,
    next_index: u64,
    /// File offset where the next record will be written.
    tail: u64,
    max_entry_size: u32,
    max_segment_size: u64,
    scratch: BytesMut,
}

impl<E, C> SegmentWriter<E, C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file: File,
        codec: Arc<C>,
        index: Arc<SparseIndex>,
        cache: Arc<EntryCache<E>>,
        id: SegmentId,
        first_index: Index,
        next_index: Index,
        tail: u64,
        max_entry_size: u32,
        max_segment_size: u64,
    ) -> Self {
        debug_assert!(tail >= DESCRIPTOR_BYTES as u64);
        debug_assert!(next_index >= first_index);
        Self {
            file,
            codec,
            index,
            cache,
            id,
            first_index: first_index.as_u64(),
            next_index: next_index.as_u64(),
            tail,
            max_entry_size,
            max_segment_size,
            scratch: BytesMut::with_capacity(
                max_entry_size as usize + RECORD_HEADER_BYTES as usize,
            ),
        }
    }

    /// Index of the last appended entry; `first_index - 1` when empty.
    pub fn last_index(&self) -> Index {
        Index::new(self.next_index - 1)
    }

    /// Index the next append will be assigned.
    pub fn next_index(&self) -> Index {
        Index::new(self.next_index)
    }

    /// Bytes written to the segment, including the descriptor.
    pub fn size(&self) -> u64 {
        self.tail
    }

    /// Returns `true` if not even a minimal record fits before the end of
    /// the segment.
    pub fn is_full(&self) -> bool {
        self.tail + RECORD_HEADER_BYTES + 1 > self.max_segment_size
    }

    /// Returns `true` if a record with a `payload_len`-byte payload fits
    /// before the end of the segment.
    pub(crate) fn fits(&self, payload_len: usize) -> bool {
        self.tail + RECORD_HEADER_BYTES + payload_len as u64 <= self.max_segment_size
    }

    /// Forces previously appended records to stable storage.
    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Scans forward from the nearest sparse-index point to the file offset
    /// of the record holding `target`. Only frame lengths are read; the
    /// records were CRC-verified when written.
    fn offset_of(&mut self, target: Index) -> Result<u64, StorageError> {
        let (mut index, mut offset) = match self.index.lookup(target) {
            Some(position) => (position.index.as_u64(), position.offset),
            None => (self.first_index, DESCRIPTOR_BYTES as u64),
        };

        let mut length = [0u8; 4];
        while index < target.as_u64() {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.read_exact(&mut length)?;
            let length = u32::from_le_bytes(length);
            debug_assert!(
                length > 0 && length <= self.max_entry_size,
                "scanned past a valid record at offset {offset}"
            );
            offset += RECORD_HEADER_BYTES + u64::from(length);
            index += 1;
        }
        Ok(offset)
    }
}

impl<E, C> SegmentWriter<E, C>
where
    C: EntryCodec<E>,
{
    /// Serializes and appends `entry`, returning it with its assigned index
    /// and on-disk payload size.
    ///
    /// Fails with [`StorageError::EntryTooLarge`] if the serialized entry
    /// exceeds the maximum entry size, and with [`StorageError::SegmentFull`]
    /// if the record would not fit before the end of the segment. In both
    /// cases the segment is unchanged.
    pub fn append(&mut self, entry: E) -> Result<Arc<Indexed<E>>, StorageError> {
        let payload = self.codec.encode(&entry)?;
        self.append_encoded(entry, &payload)
    }

    pub(crate) fn append_encoded(
        &mut self,
        entry: E,
        payload: &[u8],
    ) -> Result<Arc<Indexed<E>>, StorageError> {
        let size = payload.len();
        if size == 0 {
            // A zero length is the on-disk EOF sentinel and cannot name a
            // record.
            return Err(StorageError::Codec {
                reason: "codec produced an empty payload".to_string(),
            });
        }
        if size > self.max_entry_size as usize {
            return Err(StorageError::EntryTooLarge {
                size,
                max: self.max_entry_size,
            });
        }
        if !self.fits(size) {
            return Err(StorageError::SegmentFull { id: self.id });
        }

        let crc = crc32fast::hash(payload);
        self.scratch.clear();
        self.scratch.extend_from_slice(&(size as u32).to_le_bytes());
        self.scratch.extend_from_slice(&crc.to_le_bytes());
        self.scratch.extend_from_slice(payload);

        let offset = self.tail;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&self.scratch)?;

        let index = Index::new(self.next_index);
        self.tail = offset + self.scratch.len() as u64;
        self.next_index += 1;

        let indexed = Arc::new(Indexed::new(index, entry, size as u32));
        self.cache.put(Arc::clone(&indexed));
        self.index.index(index, offset);

        Ok(indexed)
    }

    /// Drops all entries with index above `new_last_index`.
    ///
    /// Truncating below `first_index` resets the segment to empty. The frame
    /// header at the new tail is zeroed and flushed so readers (and crash
    /// recovery) observe logical EOF there; the sparse index and entry cache
    /// are truncated to match.
    pub fn truncate(&mut self, new_last_index: Index) -> Result<(), StorageError> {
        let new_last = new_last_index.as_u64();
        if new_last + 1 >= self.next_index {
            return Ok(());
        }

        let (tail, next_index) = if new_last < self.first_index {
            (DESCRIPTOR_BYTES as u64, self.first_index)
        } else {
            let offset = self.offset_of(Index::new(new_last + 1))?;
            (offset, new_last + 1)
        };

        self.index.truncate(new_last_index);
        self.cache.truncate(new_last_index);

        self.file.seek(SeekFrom::Start(tail))?;
        self.file
            .write_all(&[0u8; RECORD_HEADER_BYTES as usize])?;
        self.file.sync_all()?;

        tracing::info!(
            segment = %self.id,
            new_last_index = new_last,
            dropped = self.next_index - next_index,
            "truncated segment"
        );

        self.tail = tail;
        self.next_index = next_index;
        Ok(())
    }
}
