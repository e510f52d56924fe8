//! A single pre-allocated segment file and its in-memory companions.
//!
//! The segment owns the descriptor, the file path, the sparse index, the
//! entry cache, and the single writer. Its lifecycle is a one-way gate:
//!
//! ```text
//!         create / open
//!   ───────────────────────▶ OPEN ──close──▶ CLOSED
//!                             │
//!                             └──delete──▶ DELETED
//! ```
//!
//! While open, `writer()` and `create_reader()` succeed; each reader opens
//! its own file handle so readers are independent of the writer and of each
//! other. Closed and deleted segments reject both.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use gneiss_types::{Index, SegmentId};

use crate::cache::EntryCache;
use crate::descriptor::{DESCRIPTOR_BYTES, SegmentDescriptor, VERSION};
use crate::index::SparseIndex;
use crate::reader::SegmentReader;
use crate::writer::{RECORD_HEADER_BYTES, SegmentWriter};
use crate::{EntryCodec, LogOptions, StorageError};

/// Formats a segment filename from its id.
///
/// Ids and the format version are zero-padded so lexicographic order of
/// filenames matches creation order.
pub(crate) fn segment_filename(id: SegmentId) -> String {
    format!("segment_{:010}_{:03}.log", id.as_u64(), VERSION)
}

/// Parses a segment filename back into its id, or `None` if the name does
/// not follow the convention.
pub(crate) fn parse_segment_filename(name: &str) -> Option<SegmentId> {
    let rest = name.strip_prefix("segment_")?.strip_suffix(".log")?;
    let (id, version) = rest.split_once('_')?;
    if id.len() != 10 || version.len() != 3 {
        return None;
    }
    let id: u64 = id.parse().ok()?;
    // Version compatibility is enforced by the descriptor on open.
    let _: u32 = version.parse().ok()?;
    Some(SegmentId::new(id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Open,
    Closed,
    Deleted,
}

/// One segment of the log: a pre-allocated file plus its sparse index,
/// entry cache, and writer.
#[derive(Debug)]
pub struct Segment<E, C> {
    descriptor: SegmentDescriptor,
    path: PathBuf,
    codec: Arc<C>,
    index: Arc<SparseIndex>,
    cache: Arc<EntryCache<E>>,
    max_entry_size: u32,
    state: RwLock<SegmentState>,
    writer: Mutex<Option<SegmentWriter<E, C>>>,
}

/// Exclusive access to a segment's writer for the duration of the guard.
#[derive(Debug)]
pub struct SegmentWriterGuard<'a, E, C> {
    guard: MutexGuard<'a, Option<SegmentWriter<E, C>>>,
}

impl<E, C> Deref for SegmentWriterGuard<'_, E, C> {
    type Target = SegmentWriter<E, C>;

    fn deref(&self) -> &Self::Target {
        self.guard
            .as_ref()
            .expect("writer present while guard is held")
    }
}

impl<E, C> DerefMut for SegmentWriterGuard<'_, E, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard
            .as_mut()
            .expect("writer present while guard is held")
    }
}

impl<E, C> Segment<E, C> {
    /// Id assigned to this segment at creation.
    pub fn id(&self) -> SegmentId {
        self.descriptor.id
    }

    /// Logical index of the first entry this segment may hold.
    pub fn first_index(&self) -> Index {
        self.descriptor.first_index
    }

    /// The segment's fixed header.
    pub fn descriptor(&self) -> &SegmentDescriptor {
        &self.descriptor
    }

    /// Returns `true` while the segment accepts writers and readers.
    pub fn is_open(&self) -> bool {
        *self.state.read().expect("segment state lock poisoned") == SegmentState::Open
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::SegmentNotOpen {
                id: self.descriptor.id,
            })
        }
    }

    /// Exclusive handle to the segment's writer.
    pub fn writer(&self) -> Result<SegmentWriterGuard<'_, E, C>, StorageError> {
        self.check_open()?;
        let guard = self.writer.lock().expect("segment writer lock poisoned");
        if guard.is_none() {
            // Closed concurrently between the state check and the lock.
            return Err(StorageError::SegmentNotOpen {
                id: self.descriptor.id,
            });
        }
        Ok(SegmentWriterGuard { guard })
    }

    /// Index of the last appended entry; `first_index - 1` when empty.
    pub fn last_index(&self) -> Result<Index, StorageError> {
        Ok(self.writer()?.last_index())
    }

    /// Bytes written to the segment, including the descriptor.
    pub fn size(&self) -> Result<u64, StorageError> {
        Ok(self.writer()?.size())
    }

    /// Returns `true` if the next append cannot fit in this segment.
    pub fn is_full(&self) -> Result<bool, StorageError> {
        Ok(self.writer()?.is_full())
    }

    /// Flushes the writer and releases it. Outstanding readers are
    /// unaffected and close independently.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().expect("segment state lock poisoned");
        if *state != SegmentState::Open {
            return Ok(());
        }
        *state = SegmentState::Closed;
        drop(state);

        let writer = self
            .writer
            .lock()
            .expect("segment writer lock poisoned")
            .take();
        if let Some(mut writer) = writer {
            writer.flush()?;
        }
        tracing::info!(segment = %self.descriptor.id, "closed segment");
        Ok(())
    }

    /// Closes the segment and unlinks its file. Outstanding readers keep
    /// their open handles until they are dropped.
    pub fn delete(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().expect("segment state lock poisoned");
        if *state == SegmentState::Deleted {
            return Ok(());
        }
        *state = SegmentState::Deleted;
        drop(state);

        drop(
            self.writer
                .lock()
                .expect("segment writer lock poisoned")
                .take(),
        );
        std::fs::remove_file(&self.path)?;
        tracing::info!(segment = %self.descriptor.id, "deleted segment");
        Ok(())
    }

    /// Scans every record, checking frame bounds and CRCs.
    ///
    /// Returns the number of valid records. Unlike normal reads, a failed
    /// CRC followed by a valid record is surfaced as
    /// [`StorageError::CorruptRecord`]; a failed record with nothing valid
    /// after it is indistinguishable from a torn tail and ends the scan
    /// cleanly.
    pub fn verify(&self) -> Result<u64, StorageError> {
        self.check_open()?;
        let mut file = File::open(&self.path)?;
        let max_segment_size = self.descriptor.max_segment_size;

        let mut offset = DESCRIPTOR_BYTES as u64;
        let mut verified = 0u64;
        loop {
            match read_frame(&mut file, offset, self.max_entry_size, max_segment_size)? {
                Frame::Valid { length } => {
                    verified += 1;
                    offset += RECORD_HEADER_BYTES + u64::from(length);
                }
                Frame::End => break,
                Frame::BadCrc { length } => {
                    let probe = offset + RECORD_HEADER_BYTES + u64::from(length);
                    if let Frame::Valid { .. } =
                        read_frame(&mut file, probe, self.max_entry_size, max_segment_size)?
                    {
                        return Err(StorageError::CorruptRecord { offset });
                    }
                    tracing::warn!(
                        segment = %self.descriptor.id,
                        offset,
                        "torn record at segment tail"
                    );
                    break;
                }
            }
        }
        Ok(verified)
    }
}

impl<E, C> Segment<E, C>
where
    C: EntryCodec<E>,
{
    /// Creates a fresh segment: writes the descriptor, pre-allocates the
    /// file to `max_segment_size`, and opens the writer at the first record
    /// offset.
    pub(crate) fn create(
        dir: &Path,
        id: SegmentId,
        first_index: Index,
        options: &LogOptions,
        codec: Arc<C>,
    ) -> Result<Self, StorageError> {
        let descriptor = SegmentDescriptor {
            id,
            first_index,
            max_segment_size: options.max_segment_size,
        };
        let path = dir.join(segment_filename(id));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&descriptor.encode())?;
        file.set_len(options.max_segment_size)?;
        file.sync_all()?;

        let index = Arc::new(SparseIndex::new(first_index, options.index_density));
        let cache = Arc::new(EntryCache::new(options.cache_size));
        let writer = SegmentWriter::new(
            file,
            Arc::clone(&codec),
            Arc::clone(&index),
            Arc::clone(&cache),
            id,
            first_index,
            first_index,
            DESCRIPTOR_BYTES as u64,
            options.max_entry_size,
            options.max_segment_size,
        );

        tracing::info!(segment = %id, first_index = %first_index, "created segment");

        Ok(Self {
            descriptor,
            path,
            codec,
            index,
            cache,
            max_entry_size: options.max_entry_size,
            state: RwLock::new(SegmentState::Open),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Opens an existing segment, replaying its records to rebuild the
    /// sparse index, warm the entry cache, and recompute the writer tail.
    ///
    /// A torn record at the tail stops the replay cleanly; the writer
    /// resumes after the last fully written record.
    pub(crate) fn open(
        path: &Path,
        options: &LogOptions,
        codec: Arc<C>,
    ) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let descriptor = SegmentDescriptor::read_from(&file)?;
        if file.metadata()?.len() != descriptor.max_segment_size {
            // Pre-allocation was interrupted; restore the zero-filled tail.
            file.set_len(descriptor.max_segment_size)?;
        }

        let index = Arc::new(SparseIndex::new(
            descriptor.first_index,
            options.index_density,
        ));
        let cache = Arc::new(EntryCache::new(options.cache_size));

        let mut reader = SegmentReader::new(
            File::open(path)?,
            Arc::clone(&codec),
            Arc::clone(&index),
            Arc::clone(&cache),
            descriptor.id,
            descriptor.first_index,
            options.max_entry_size,
            descriptor.max_segment_size,
        );
        loop {
            let offset = reader.offset();
            match reader.read_next()? {
                Some(entry) => {
                    index.index(entry.index(), offset);
                    cache.put(entry);
                }
                None => break,
            }
        }
        let tail = reader.offset();
        let next_index = reader.next_index();

        let writer = SegmentWriter::new(
            file,
            Arc::clone(&codec),
            Arc::clone(&index),
            Arc::clone(&cache),
            descriptor.id,
            descriptor.first_index,
            next_index,
            tail,
            options.max_entry_size,
            descriptor.max_segment_size,
        );

        tracing::info!(
            segment = %descriptor.id,
            first_index = %descriptor.first_index,
            last_index = next_index.as_u64() - 1,
            "opened segment"
        );

        Ok(Self {
            descriptor,
            path: path.to_path_buf(),
            codec,
            index,
            cache,
            max_entry_size: options.max_entry_size,
            state: RwLock::new(SegmentState::Open),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Opens an independent forward cursor over this segment.
    pub fn create_reader(&self) -> Result<SegmentReader<E, C>, StorageError> {
        self.check_open()?;
        let file = File::open(&self.path)?;
        Ok(SegmentReader::new(
            file,
            Arc::clone(&self.codec),
            Arc::clone(&self.index),
            Arc::clone(&self.cache),
            self.descriptor.id,
            self.descriptor.first_index,
            self.max_entry_size,
            self.descriptor.max_segment_size,
        ))
    }
}

impl<E, C> Drop for Segment<E, C> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.writer.lock() {
            if let Some(writer) = guard.as_mut() {
                if let Err(e) = writer.flush() {
                    tracing::error!(
                        segment = %self.descriptor.id,
                        error = %e,
                        "failed to flush segment during drop"
                    );
                }
            }
        }
    }
}

enum Frame {
    Valid { length: u32 },
    BadCrc { length: u32 },
    End,
}

/// Reads and classifies one record frame at `offset`.
fn read_frame(
    file: &mut File,
    offset: u64,
    max_entry_size: u32,
    max_segment_size: u64,
) -> Result<Frame, StorageError> {
    if offset + RECORD_HEADER_BYTES > max_segment_size {
        return Ok(Frame::End);
    }
    file.seek(SeekFrom::Start(offset))?;

    let mut header = [0u8; RECORD_HEADER_BYTES as usize];
    if read_exact_or_eof(file, &mut header)? {
        return Ok(Frame::End);
    }
    let length = u32::from_le_bytes(header[..4].try_into().expect("header is 8 bytes"));
    let crc = u32::from_le_bytes(header[4..].try_into().expect("header is 8 bytes"));

    if length == 0
        || length > max_entry_size
        || offset + RECORD_HEADER_BYTES + u64::from(length) > max_segment_size
    {
        return Ok(Frame::End);
    }

    let mut payload = vec![0u8; length as usize];
    if read_exact_or_eof(file, &mut payload)? {
        return Ok(Frame::End);
    }

    if crc32fast::hash(&payload) == crc {
        Ok(Frame::Valid { length })
    } else {
        Ok(Frame::BadCrc { length })
    }
}

/// Fills `buf` from `file`; returns `true` on a clean end-of-file.
fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<bool, StorageError> {
    match file.read_exact(buf) {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(true),
        Err(e) => Err(StorageError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    use crate::BytesCodec;

    fn options() -> LogOptions {
        LogOptions::default()
            .with_max_entry_size(1024)
            .with_max_segment_size(64 * 1024)
            .with_index_density(1.0)
            .with_cache_size(8)
    }

    fn create_segment(dir: &Path) -> Segment<Bytes, BytesCodec> {
        Segment::create(
            dir,
            SegmentId::new(1),
            Index::new(1),
            &options(),
            Arc::new(BytesCodec),
        )
        .unwrap()
    }

    #[test]
    fn filename_roundtrip_and_ordering() {
        let a = segment_filename(SegmentId::new(2));
        let b = segment_filename(SegmentId::new(10));
        assert!(a < b, "lexicographic order must match id order");
        assert_eq!(parse_segment_filename(&a), Some(SegmentId::new(2)));
        assert_eq!(parse_segment_filename("manifest.json"), None);
        assert_eq!(parse_segment_filename("segment_abc_001.log"), None);
    }

    #[test]
    fn create_preallocates_file() {
        let dir = tempdir().unwrap();
        let segment = create_segment(dir.path());
        let path = dir.path().join(segment_filename(SegmentId::new(1)));
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            options().max_segment_size
        );
        assert_eq!(segment.size().unwrap(), DESCRIPTOR_BYTES as u64);
    }

    #[test]
    fn append_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let segment = create_segment(dir.path());

        for value in [&b"alpha"[..], b"beta", b"gamma"] {
            segment
                .writer()
                .unwrap()
                .append(Bytes::copy_from_slice(value))
                .unwrap();
        }

        let mut reader = segment.create_reader().unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = reader.next_entry().unwrap() {
            seen.push((entry.index().as_u64(), entry.entry().clone()));
        }
        assert_eq!(
            seen,
            vec![
                (1, Bytes::from_static(b"alpha")),
                (2, Bytes::from_static(b"beta")),
                (3, Bytes::from_static(b"gamma")),
            ]
        );
    }

    #[test]
    fn closed_segment_rejects_writer_and_reader() {
        let dir = tempdir().unwrap();
        let segment = create_segment(dir.path());
        segment.close().unwrap();

        assert!(!segment.is_open());
        assert!(matches!(
            segment.writer().err(),
            Some(StorageError::SegmentNotOpen { .. })
        ));
        assert!(matches!(
            segment.create_reader().err(),
            Some(StorageError::SegmentNotOpen { .. })
        ));
        // close is idempotent
        segment.close().unwrap();
    }

    #[test]
    fn delete_unlinks_file() {
        let dir = tempdir().unwrap();
        let segment = create_segment(dir.path());
        let path = dir.path().join(segment_filename(SegmentId::new(1)));
        assert!(path.exists());
        segment.delete().unwrap();
        assert!(!path.exists());
        assert!(matches!(
            segment.writer().err(),
            Some(StorageError::SegmentNotOpen { .. })
        ));
    }

    #[test]
    fn open_recovers_entries_and_tail() {
        let dir = tempdir().unwrap();
        {
            let segment = create_segment(dir.path());
            let mut writer = segment.writer().unwrap();
            for value in [&b"one"[..], b"two"] {
                writer.append(Bytes::copy_from_slice(value)).unwrap();
            }
            writer.flush().unwrap();
        }

        let path = dir.path().join(segment_filename(SegmentId::new(1)));
        let segment: Segment<Bytes, BytesCodec> =
            Segment::open(&path, &options(), Arc::new(BytesCodec)).unwrap();
        assert_eq!(segment.last_index().unwrap(), Index::new(2));

        let appended = segment
            .writer()
            .unwrap()
            .append(Bytes::from_static(b"three"))
            .unwrap();
        assert_eq!(appended.index(), Index::new(3));
    }

    #[test]
    fn verify_counts_valid_records() {
        let dir = tempdir().unwrap();
        let segment = create_segment(dir.path());
        for value in [&b"one"[..], b"two", b"three"] {
            segment
                .writer()
                .unwrap()
                .append(Bytes::copy_from_slice(value))
                .unwrap();
        }
        assert_eq!(segment.verify().unwrap(), 3);
    }

    #[test]
    fn verify_treats_torn_tail_as_eof() {
        let dir = tempdir().unwrap();
        let segment = create_segment(dir.path());
        let offset_of_last;
        {
            let mut writer = segment.writer().unwrap();
            writer.append(Bytes::from_static(b"first")).unwrap();
            offset_of_last = writer.size();
            writer.append(Bytes::from_static(b"second")).unwrap();
            writer.flush().unwrap();
        }

        // Clobber the final payload bytes of the last record.
        let path = dir.path().join(segment_filename(SegmentId::new(1)));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(offset_of_last + RECORD_HEADER_BYTES + 3))
            .unwrap();
        file.write_all(&[0, 0, 0]).unwrap();

        assert_eq!(segment.verify().unwrap(), 1);
    }

    #[test]
    fn verify_surfaces_mid_file_corruption() {
        let dir = tempdir().unwrap();
        let segment = create_segment(dir.path());
        {
            let mut writer = segment.writer().unwrap();
            writer.append(Bytes::from_static(b"first")).unwrap();
            writer.append(Bytes::from_static(b"second")).unwrap();
            writer.flush().unwrap();
        }

        // Flip a payload byte of the first record; the second record is
        // still valid, so this is corruption, not a torn tail.
        let path = dir.path().join(segment_filename(SegmentId::new(1)));
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(DESCRIPTOR_BYTES as u64 + RECORD_HEADER_BYTES))
            .unwrap();
        file.write_all(&[0xFF]).unwrap();

        assert!(matches!(
            segment.verify(),
            Err(StorageError::CorruptRecord { .. })
        ));
    }
}
