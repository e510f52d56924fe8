//! Forward-only cursor over one segment.
//!
//! Each reader owns a private file handle and a private read-ahead buffer of
//! twice the maximum record size, so readers never contend with each other
//! or the writer on I/O state. Decoding consults the shared entry cache
//! first; on a hit the file cursor is advanced past the record's on-disk
//! bytes without touching disk, so a later miss resumes at the correct
//! position.
//!
//! A zero or oversized length field, or a CRC mismatch, stops the cursor
//! cleanly: the record is treated as logical end-of-data and the cursor
//! does not advance past it. The read-ahead window is dropped on such a
//! stop, so a tailing reader that probes again after the writer has
//! appended more records re-reads the tail from disk and sees them.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use gneiss_types::{Index, SegmentId};

use crate::cache::EntryCache;
use crate::descriptor::DESCRIPTOR_BYTES;
use crate::index::SparseIndex;
use crate::writer::RECORD_HEADER_BYTES;
use crate::{EntryCodec, Indexed, StorageError};

/// Sequentially decodes records from a segment file.
#[derive(Debug)]
pub struct SegmentReader<E, C> {
    file: File,
    codec: Arc<C>,
    index: Arc<SparseIndex>,
    cache: Arc<EntryCache<E>>,
    id: SegmentId,
    first_index: u64,
    max_entry_size: u32,
    max_segment_size: u64,
    /// File offset of the next unread record.
    offset: u64,
    /// Index of the next entry to emit.
    next_index: u64,
    /// Last entry returned by [`Self::next_entry`].
    current: Option<Arc<Indexed<E>>>,
    /// Entry loaded by [`Self::has_next`] but not yet handed out.
    peeked: Option<Arc<Indexed<E>>>,
    buf: Vec<u8>,
    /// File offset of `buf[0]`; the window is `buf[..buf_len]`.
    buf_offset: u64,
    buf_len: usize,
}

impl<E, C> SegmentReader<E, C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        file: File,
        codec: Arc<C>,
        index: Arc<SparseIndex>,
        cache: Arc<EntryCache<E>>,
        id: SegmentId,
        first_index: Index,
        max_entry_size: u32,
        max_segment_size: u64,
    ) -> Self {
        let capacity = 2 * (max_entry_size as usize + RECORD_HEADER_BYTES as usize);
        Self {
            file,
            codec,
            index,
            cache,
            id,
            first_index: first_index.as_u64(),
            max_entry_size,
            max_segment_size,
            offset: DESCRIPTOR_BYTES as u64,
            next_index: first_index.as_u64(),
            current: None,
            peeked: None,
            buf: vec![0; capacity],
            buf_offset: 0,
            buf_len: 0,
        }
    }

    /// Id of the segment this reader is attached to.
    pub fn segment_id(&self) -> SegmentId {
        self.id
    }

    /// Index the next [`Self::next_entry`] call will emit.
    pub fn next_index(&self) -> Index {
        match &self.peeked {
            Some(entry) => entry.index(),
            None => Index::new(self.next_index),
        }
    }

    /// Index of the most recently emitted entry; `first_index - 1` if the
    /// cursor is positioned before the first entry.
    pub fn current_index(&self) -> Index {
        Index::new(self.next_index().as_u64() - 1)
    }

    /// The most recently emitted entry, if any.
    pub fn current_entry(&self) -> Option<Arc<Indexed<E>>> {
        self.current.clone()
    }

    /// File offset of the next unread record.
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Repositions the cursor before the first entry of the segment.
    pub fn reset(&mut self) {
        self.offset = DESCRIPTOR_BYTES as u64;
        self.next_index = self.first_index;
        self.current = None;
        self.peeked = None;
        self.invalidate();
    }

    /// Drops the read-ahead window so the next access re-reads from disk.
    fn invalidate(&mut self) {
        self.buf_len = 0;
    }

    /// Makes `[at, at + need)` available in the read-ahead window and
    /// returns the window offset of `at`. Returns `None` when the range
    /// extends past the end of the segment file.
    fn ensure(&mut self, at: u64, need: usize) -> Result<Option<usize>, StorageError> {
        if at + need as u64 > self.max_segment_size {
            return Ok(None);
        }
        let buffered =
            at >= self.buf_offset && at + need as u64 <= self.buf_offset + self.buf_len as u64;
        if !buffered {
            self.buf_offset = at;
            self.buf_len = 0;
            self.file.seek(SeekFrom::Start(at))?;
            while self.buf_len < need {
                let read = self.file.read(&mut self.buf[self.buf_len..])?;
                if read == 0 {
                    // The file is pre-allocated, so a short read means the
                    // segment was removed or externally truncated.
                    return Ok(None);
                }
                self.buf_len += read;
            }
        }
        Ok(Some((at - self.buf_offset) as usize))
    }
}

impl<E, C> SegmentReader<E, C>
where
    C: EntryCodec<E>,
{
    /// Returns `true` iff another valid record exists at or after the
    /// cursor.
    pub fn has_next(&mut self) -> Result<bool, StorageError> {
        if self.peeked.is_none() {
            self.peeked = self.read_next()?;
        }
        Ok(self.peeked.is_some())
    }

    /// Emits the next entry and advances the cursor, or returns `None` at
    /// logical end-of-data.
    pub fn next_entry(&mut self) -> Result<Option<Arc<Indexed<E>>>, StorageError> {
        let next = match self.peeked.take() {
            Some(entry) => Some(entry),
            None => self.read_next()?,
        };
        if let Some(entry) = &next {
            self.current = Some(Arc::clone(entry));
        }
        Ok(next)
    }

    /// Repositions the cursor so the next emitted entry has index
    /// `target` (or is the first entry if `target` precedes the segment).
    ///
    /// Jumps to the greatest sparse-index point below `target` and scans
    /// forward from there; with index density `d` the scan is bounded by
    /// `ceil(1/d)` records.
    pub fn seek(&mut self, target: Index) -> Result<(), StorageError> {
        self.reset();
        if target.as_u64() <= self.first_index {
            return Ok(());
        }

        if let Some(position) = self.index.lookup(Index::new(target.as_u64() - 1)) {
            self.offset = position.offset;
            self.next_index = position.index.as_u64();
        }
        let mut scanned = 0u64;
        while self.next_index < target.as_u64() {
            if self.read_next()?.is_none() {
                break;
            }
            scanned += 1;
        }

        tracing::debug!(
            segment = %self.id,
            target = target.as_u64(),
            scanned,
            "positioned reader"
        );
        Ok(())
    }

    /// Loads the record at the cursor, preferring the entry cache.
    pub(crate) fn read_next(&mut self) -> Result<Option<Arc<Indexed<E>>>, StorageError> {
        let index = Index::new(self.next_index);

        if let Some(cached) = self.cache.get(index) {
            // The cached size tells us the record's on-disk footprint, so
            // the file cursor stays in sync without re-parsing the frame.
            self.offset += cached.record_len();
            self.next_index += 1;
            return Ok(Some(cached));
        }

        let Some(start) = self.ensure(self.offset, RECORD_HEADER_BYTES as usize)? else {
            self.invalidate();
            return Ok(None);
        };
        let length = u32::from_le_bytes(
            self.buf[start..start + 4]
                .try_into()
                .expect("window holds a full frame header"),
        );
        let crc = u32::from_le_bytes(
            self.buf[start + 4..start + 8]
                .try_into()
                .expect("window holds a full frame header"),
        );

        if length == 0 || length > self.max_entry_size {
            self.invalidate();
            return Ok(None);
        }

        let frame_len = RECORD_HEADER_BYTES as usize + length as usize;
        let Some(start) = self.ensure(self.offset, frame_len)? else {
            self.invalidate();
            return Ok(None);
        };
        let payload = &self.buf[start + RECORD_HEADER_BYTES as usize..start + frame_len];

        if crc32fast::hash(payload) != crc {
            // Indistinguishable from a torn write at the tail; stop cleanly
            // without advancing past the record.
            self.invalidate();
            return Ok(None);
        }

        let entry = self.codec.decode(payload)?;
        let indexed = Arc::new(Indexed::new(index, entry, length));
        self.offset += frame_len as u64;
        self.next_index += 1;
        Ok(Some(indexed))
    }
}
