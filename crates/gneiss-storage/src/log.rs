//! Multi-segment log orchestration.
//!
//! [`Log`] composes segments into one logical sequence: it rolls to a fresh
//! segment when the active one fills, multiplexes readers across segment
//! boundaries, and implements bulk truncation and compaction.
//!
//! A `Log` handle is cheap to clone; clones share the same segments. At most
//! one [`LogWriter`] exists at a time (a second `writer()` call blocks until
//! the first guard drops), while any number of [`LogReader`]s may iterate
//! concurrently. A reader positioned past a truncation point observes
//! unspecified entries until it is re-positioned with
//! [`LogReader::seek`].

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use gneiss_types::{Index, SegmentId};

use crate::descriptor::DESCRIPTOR_BYTES;
use crate::reader::SegmentReader;
use crate::segment::{Segment, parse_segment_filename};
use crate::writer::RECORD_HEADER_BYTES;
use crate::{EntryCodec, Indexed, StorageError};

/// Configuration for a [`Log`].
///
/// `max_entry_size` and `index_density` must not shrink between runs of the
/// same log: records larger than the configured maximum are treated as
/// end-of-data when read back.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Upper bound on serialized entry length; also sizes reader buffers.
    pub max_entry_size: u32,
    /// File pre-allocation size and roll-over threshold.
    pub max_segment_size: u64,
    /// Fraction of entries recorded in the sparse index, in `(0, 1]`.
    pub index_density: f64,
    /// Capacity of the per-segment entry cache.
    pub cache_size: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            max_entry_size: 1024 * 1024,
            max_segment_size: 32 * 1024 * 1024,
            index_density: 0.005,
            cache_size: 1024,
        }
    }
}

impl LogOptions {
    pub fn with_max_entry_size(mut self, max_entry_size: u32) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    pub fn with_max_segment_size(mut self, max_segment_size: u64) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    pub fn with_index_density(mut self, index_density: f64) -> Self {
        self.index_density = index_density;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Asserts configuration preconditions; violating them is a caller bug.
    fn validate(&self) {
        assert!(self.max_entry_size > 0, "max_entry_size must be non-zero");
        assert!(
            self.max_segment_size > DESCRIPTOR_BYTES as u64 + RECORD_HEADER_BYTES,
            "max_segment_size must leave room for at least one record"
        );
        assert!(
            self.index_density > 0.0 && self.index_density <= 1.0,
            "index_density must be in (0, 1]"
        );
        assert!(self.cache_size > 0, "cache_size must be non-zero");
    }
}

#[derive(Debug)]
struct LogInner<E, C> {
    dir: PathBuf,
    options: LogOptions,
    codec: Arc<C>,
    /// Segments ordered by first index.
    segments: RwLock<BTreeMap<u64, Arc<Segment<E, C>>>>,
    /// Serializes [`LogWriter`] existence: the single-producer gate.
    writer_gate: Mutex<()>,
    open: AtomicBool,
}

/// The segmented append-only log.
#[derive(Debug)]
pub struct Log<E, C> {
    inner: Arc<LogInner<E, C>>,
}

impl<E, C> Clone for Log<E, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E, C> Log<E, C>
where
    C: EntryCodec<E>,
{
    /// Opens the log in `dir`, creating the directory and an initial segment
    /// if none exist.
    ///
    /// Existing segments are replayed to rebuild their in-memory state; a
    /// torn record at the tail of the last segment is absorbed, so the log
    /// resumes at the last fully written entry. Segment first indices must
    /// form a gap-free sequence.
    pub fn open(
        dir: impl Into<PathBuf>,
        codec: C,
        options: LogOptions,
    ) -> Result<Self, StorageError> {
        options.validate();
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut found: Vec<(SegmentId, PathBuf)> = Vec::new();
        for dirent in fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = parse_segment_filename(name) {
                found.push((id, dirent.path()));
            }
        }
        found.sort_by_key(|(id, _)| *id);

        let codec = Arc::new(codec);
        let mut segments = BTreeMap::new();
        let mut expected_first: Option<u64> = None;
        for (_, path) in found {
            let segment = Segment::open(&path, &options, Arc::clone(&codec))?;
            if let Some(expected) = expected_first {
                if segment.first_index().as_u64() != expected {
                    return Err(StorageError::NonContiguousSegments {
                        id: segment.id(),
                        expected,
                        actual: segment.first_index().as_u64(),
                    });
                }
            }
            expected_first = Some(segment.last_index()?.as_u64() + 1);
            segments.insert(segment.first_index().as_u64(), Arc::new(segment));
        }

        if segments.is_empty() {
            let segment = Segment::create(
                &dir,
                SegmentId::new(1),
                Index::new(1),
                &options,
                Arc::clone(&codec),
            )?;
            segments.insert(1, Arc::new(segment));
        }

        tracing::info!(
            dir = %dir.display(),
            segments = segments.len(),
            "opened log"
        );

        Ok(Self {
            inner: Arc::new(LogInner {
                dir,
                options,
                codec,
                segments: RwLock::new(segments),
                writer_gate: Mutex::new(()),
                open: AtomicBool::new(true),
            }),
        })
    }

    /// Opens a reader positioned so its first entry has index
    /// `start_index` (or the first retained entry, if `start_index` has
    /// been compacted away).
    pub fn open_reader(&self, start_index: Index) -> Result<LogReader<E, C>, StorageError> {
        let segment = self.segment_for(start_index);
        let mut reader = segment.create_reader()?;
        reader.seek(start_index)?;
        Ok(LogReader {
            log: self.clone(),
            reader,
            last_returned: None,
            peeked: None,
        })
    }
}

impl<E, C> Log<E, C> {
    /// Acquires the log's single append handle, blocking while another
    /// [`LogWriter`] exists.
    pub fn writer(&self) -> Result<LogWriter<'_, E, C>, StorageError> {
        if !self.is_open() {
            return Err(StorageError::SegmentNotOpen {
                id: self.active().id(),
            });
        }
        let gate = self
            .inner
            .writer_gate
            .lock()
            .expect("writer gate poisoned");
        Ok(LogWriter {
            log: self,
            _gate: gate,
        })
    }

    /// Deletes every segment whose entries all precede `new_first_index`.
    ///
    /// The segment containing `new_first_index` (and the active segment) are
    /// always retained, so the log may still serve some earlier indices
    /// after compaction.
    pub fn compact(&self, new_first_index: Index) -> Result<(), StorageError> {
        let mut segments = self.inner.segments.write().expect("segments lock poisoned");
        let keys: Vec<u64> = segments.keys().copied().collect();
        let mut removed = 0usize;
        for pair in keys.windows(2) {
            // This segment's last index is the next segment's first - 1.
            if pair[1] <= new_first_index.as_u64() {
                if let Some(segment) = segments.remove(&pair[0]) {
                    segment.delete()?;
                    removed += 1;
                }
            } else {
                break;
            }
        }
        drop(segments);

        if removed > 0 {
            tracing::info!(
                new_first_index = %new_first_index,
                removed,
                "compacted log"
            );
        }
        Ok(())
    }

    /// Scans every record of every segment, checking frame bounds and CRCs.
    /// Returns the total number of valid records; mid-file corruption is
    /// surfaced as [`StorageError::CorruptRecord`].
    pub fn verify(&self) -> Result<u64, StorageError> {
        let segments: Vec<_> = self
            .inner
            .segments
            .read()
            .expect("segments lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut verified = 0;
        for segment in segments {
            verified += segment.verify()?;
        }
        Ok(verified)
    }

    /// Returns `true` until [`Log::close`] is called.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Flushes and closes every segment. Outstanding readers finish
    /// independently; further writer or reader creation fails.
    pub fn close(&self) -> Result<(), StorageError> {
        self.inner.open.store(false, Ordering::Release);
        let segments: Vec<_> = self
            .inner
            .segments
            .read()
            .expect("segments lock poisoned")
            .values()
            .cloned()
            .collect();

        let mut first_error = None;
        for segment in segments {
            if let Err(e) = segment.close() {
                tracing::error!(segment = %segment.id(), error = %e, "failed to close segment");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        tracing::info!(dir = %self.inner.dir.display(), "closed log");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Index of the first retained entry.
    pub fn first_index(&self) -> Index {
        let segments = self.inner.segments.read().expect("segments lock poisoned");
        Index::new(
            *segments
                .keys()
                .next()
                .expect("log always has at least one segment"),
        )
    }

    /// Index of the last appended entry; `first_index - 1` when empty.
    pub fn last_index(&self) -> Result<Index, StorageError> {
        self.active().last_index()
    }

    /// Index the next append will be assigned.
    pub fn next_index(&self) -> Result<Index, StorageError> {
        Ok(self.last_index()?.next())
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.inner
            .segments
            .read()
            .expect("segments lock poisoned")
            .len()
    }
}

impl<E, C> Log<E, C> {
    /// The segment currently accepting appends.
    fn active(&self) -> Arc<Segment<E, C>> {
        self.inner
            .segments
            .read()
            .expect("segments lock poisoned")
            .values()
            .next_back()
            .map(Arc::clone)
            .expect("log always has at least one segment")
    }

    /// The segment whose index range contains `index`, or the first segment
    /// if `index` precedes all retained entries.
    fn segment_for(&self, index: Index) -> Arc<Segment<E, C>> {
        let segments = self.inner.segments.read().expect("segments lock poisoned");
        segments
            .range(..=index.as_u64())
            .next_back()
            .or_else(|| segments.iter().next())
            .map(|(_, segment)| Arc::clone(segment))
            .expect("log always has at least one segment")
    }
}

/// The log's single append handle.
///
/// Holding a `LogWriter` excludes all other writers. Appends are totally
/// ordered by index assignment; durability is explicit via
/// [`LogWriter::commit`].
#[derive(Debug)]
pub struct LogWriter<'a, E, C> {
    log: &'a Log<E, C>,
    _gate: MutexGuard<'a, ()>,
}

impl<E, C> LogWriter<'_, E, C>
where
    C: EntryCodec<E>,
{
    /// Serializes and appends `entry`, rolling to a fresh segment if the
    /// active one cannot fit the record.
    pub fn append(&mut self, entry: E) -> Result<Arc<Indexed<E>>, StorageError> {
        let payload = self.log.inner.codec.encode(&entry)?;

        // An entry that cannot fit even an empty segment would make
        // roll-over loop forever; reject it up front.
        let options = &self.log.inner.options;
        if DESCRIPTOR_BYTES as u64 + RECORD_HEADER_BYTES + payload.len() as u64
            > options.max_segment_size
        {
            return Err(StorageError::EntryTooLarge {
                size: payload.len(),
                max: options.max_entry_size,
            });
        }

        let active = self.log.active();
        {
            let mut writer = active.writer()?;
            if writer.fits(payload.len()) {
                return writer.append_encoded(entry, &payload);
            }
        }

        let next = self.roll(&active)?;
        let mut writer = next.writer()?;
        writer.append_encoded(entry, &payload)
    }

    /// Seals the active segment and creates its successor.
    fn roll(&mut self, active: &Arc<Segment<E, C>>) -> Result<Arc<Segment<E, C>>, StorageError> {
        let (id, first_index) = {
            let mut writer = active.writer()?;
            writer.flush()?;
            (active.id().next(), writer.next_index())
        };

        let segment = Arc::new(Segment::create(
            &self.log.inner.dir,
            id,
            first_index,
            &self.log.inner.options,
            Arc::clone(&self.log.inner.codec),
        )?);
        self.log
            .inner
            .segments
            .write()
            .expect("segments lock poisoned")
            .insert(first_index.as_u64(), Arc::clone(&segment));

        tracing::info!(
            old_segment = %active.id(),
            new_segment = %id,
            first_index = %first_index,
            "rolled to new segment"
        );
        Ok(segment)
    }

    /// Forces all previously appended records to stable storage.
    pub fn commit(&mut self) -> Result<(), StorageError> {
        self.log.active().writer()?.flush()
    }

    /// Drops all entries with index above `new_last_index`: deletes every
    /// segment that starts past it and truncates the containing segment.
    /// Truncating below the first retained index resets the log to empty.
    pub fn truncate(&mut self, new_last_index: Index) -> Result<(), StorageError> {
        if new_last_index >= self.log.last_index()? {
            return Ok(());
        }

        let target = {
            let mut segments = self.log.inner.segments.write().expect("segments lock poisoned");
            let target_key = segments
                .range(..=new_last_index.as_u64())
                .next_back()
                .map(|(&key, _)| key)
                .unwrap_or_else(|| {
                    *segments
                        .keys()
                        .next()
                        .expect("log always has at least one segment")
                });

            let to_delete: Vec<u64> = segments
                .range((Bound::Excluded(target_key), Bound::Unbounded))
                .map(|(&key, _)| key)
                .collect();
            for key in to_delete {
                if let Some(segment) = segments.remove(&key) {
                    segment.delete()?;
                }
            }
            Arc::clone(segments.get(&target_key).expect("target segment retained"))
        };

        target.writer()?.truncate(new_last_index)?;
        tracing::info!(new_last_index = %new_last_index, "truncated log");
        Ok(())
    }

    /// Index of the last appended entry.
    pub fn last_index(&self) -> Result<Index, StorageError> {
        self.log.last_index()
    }

    /// Index the next append will be assigned.
    pub fn next_index(&self) -> Result<Index, StorageError> {
        self.log.next_index()
    }
}

impl<E, C> Drop for LogWriter<'_, E, C> {
    fn drop(&mut self) {
        if !self.log.is_open() {
            return;
        }
        let result = self.log.active().writer().and_then(|mut w| w.flush());
        if let Err(e) = result {
            tracing::error!(error = %e, "failed to flush log writer during drop");
        }
    }
}

/// A forward cursor over the whole log, crossing segment boundaries
/// transparently.
#[derive(Debug)]
pub struct LogReader<E, C> {
    log: Log<E, C>,
    reader: SegmentReader<E, C>,
    last_returned: Option<Arc<Indexed<E>>>,
    peeked: Option<Arc<Indexed<E>>>,
}

impl<E, C> LogReader<E, C>
where
    C: EntryCodec<E>,
{
    /// Returns `true` iff another entry exists at or after the cursor.
    pub fn has_next(&mut self) -> Result<bool, StorageError> {
        if self.peeked.is_none() {
            self.peeked = self.fetch()?;
        }
        Ok(self.peeked.is_some())
    }

    /// Emits the next entry and advances, or returns `None` at the end of
    /// the log.
    pub fn next_entry(&mut self) -> Result<Option<Arc<Indexed<E>>>, StorageError> {
        let next = match self.peeked.take() {
            Some(entry) => Some(entry),
            None => self.fetch()?,
        };
        if let Some(entry) = &next {
            self.last_returned = Some(Arc::clone(entry));
        }
        Ok(next)
    }

    /// Advances within the current segment, switching to the following
    /// segment at its end.
    fn fetch(&mut self) -> Result<Option<Arc<Indexed<E>>>, StorageError> {
        loop {
            if let Some(entry) = self.reader.next_entry()? {
                return Ok(Some(entry));
            }
            let next_index = self.reader.next_index().as_u64();
            let next_segment = {
                let segments = self
                    .log
                    .inner
                    .segments
                    .read()
                    .expect("segments lock poisoned");
                segments.get(&next_index).map(Arc::clone)
            };
            match next_segment {
                Some(segment) if segment.id() != self.reader.segment_id() => {
                    self.reader = segment.create_reader()?;
                }
                _ => return Ok(None),
            }
        }
    }

    /// Repositions the cursor so the next emitted entry has index `target`
    /// (or the first retained entry, if `target` precedes the log).
    pub fn seek(&mut self, target: Index) -> Result<(), StorageError> {
        self.peeked = None;
        self.last_returned = None;
        let segment = self.log.segment_for(target);
        if segment.id() != self.reader.segment_id() {
            self.reader = segment.create_reader()?;
        }
        self.reader.seek(target)
    }

    /// Repositions the cursor before the first retained entry.
    pub fn reset(&mut self) -> Result<(), StorageError> {
        let first = self.log.first_index();
        self.seek(first)
    }

    /// Index the next [`Self::next_entry`] call will emit.
    pub fn next_index(&self) -> Index {
        match &self.peeked {
            Some(entry) => entry.index(),
            None => self.reader.next_index(),
        }
    }

    /// Index of the most recently emitted entry.
    pub fn current_index(&self) -> Index {
        Index::new(self.next_index().as_u64() - 1)
    }

    /// The most recently emitted entry, if any.
    pub fn current_entry(&self) -> Option<Arc<Indexed<E>>> {
        self.last_returned.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;
    use tempfile::tempdir;

    use crate::BytesCodec;

    fn small_options() -> LogOptions {
        LogOptions::default()
            .with_max_entry_size(1024)
            .with_max_segment_size(64 * 1024)
            .with_index_density(1.0)
            .with_cache_size(8)
    }

    fn open_log(dir: &std::path::Path, options: LogOptions) -> Log<Bytes, BytesCodec> {
        Log::open(dir, BytesCodec, options).unwrap()
    }

    fn entry(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    #[test]
    fn append_read_roundtrip() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options());

        let mut writer = log.writer().unwrap();
        for (i, value) in ["a", "b", "c"].iter().enumerate() {
            let appended = writer.append(entry(value)).unwrap();
            assert_eq!(appended.index().as_u64(), i as u64 + 1);
        }
        drop(writer);

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        for (i, value) in ["a", "b", "c"].iter().enumerate() {
            let read = reader.next_entry().unwrap().unwrap();
            assert_eq!(read.index().as_u64(), i as u64 + 1);
            assert_eq!(read.entry(), &entry(value));
        }
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn positioned_reader_starts_at_target() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options());

        let mut writer = log.writer().unwrap();
        for value in ["a", "b", "c"] {
            writer.append(entry(value)).unwrap();
        }
        drop(writer);

        let mut reader = log.open_reader(Index::new(2)).unwrap();
        assert_eq!(reader.next_index(), Index::new(2));
        let read = reader.next_entry().unwrap().unwrap();
        assert_eq!(read.index(), Index::new(2));
        assert_eq!(read.entry(), &entry("b"));
    }

    #[test]
    fn exact_fit_rolls_to_second_segment() {
        let dir = tempdir().unwrap();
        // Room for exactly two records with 4-byte payloads.
        let options = small_options()
            .with_max_segment_size(DESCRIPTOR_BYTES as u64 + 2 * (RECORD_HEADER_BYTES + 4));
        let log = open_log(dir.path(), options);

        let mut writer = log.writer().unwrap();
        for value in ["aaaa", "bbbb", "cccc"] {
            writer.append(entry(value)).unwrap();
        }
        drop(writer);

        assert_eq!(log.segment_count(), 2);
        assert_eq!(log.last_index().unwrap(), Index::new(3));

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        let mut values = Vec::new();
        while let Some(read) = reader.next_entry().unwrap() {
            values.push((read.index().as_u64(), read.entry().clone()));
        }
        assert_eq!(
            values,
            vec![
                (1, entry("aaaa")),
                (2, entry("bbbb")),
                (3, entry("cccc")),
            ]
        );
    }

    #[test]
    fn truncate_then_append_continues_from_new_tail() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options());

        let mut writer = log.writer().unwrap();
        for i in 1..=10u64 {
            writer.append(entry(&format!("e{i:03}"))).unwrap();
        }
        writer.truncate(Index::new(5)).unwrap();
        assert_eq!(writer.last_index().unwrap(), Index::new(5));

        let appended = writer.append(entry("x")).unwrap();
        assert_eq!(appended.index(), Index::new(6));
        drop(writer);

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        for i in 1..=5u64 {
            let read = reader.next_entry().unwrap().unwrap();
            assert_eq!(read.index().as_u64(), i);
            assert_eq!(read.entry(), &entry(&format!("e{i:03}")));
        }
        let read = reader.next_entry().unwrap().unwrap();
        assert_eq!(read.index(), Index::new(6));
        assert_eq!(read.entry(), &entry("x"));
        assert!(!reader.has_next().unwrap());

        let mut past_end = log.open_reader(Index::new(7)).unwrap();
        assert!(!past_end.has_next().unwrap());
    }

    #[test]
    fn truncate_across_segments_deletes_later_ones() {
        let dir = tempdir().unwrap();
        // Two 4-byte records per segment.
        let options = small_options()
            .with_max_segment_size(DESCRIPTOR_BYTES as u64 + 2 * (RECORD_HEADER_BYTES + 4));
        let log = open_log(dir.path(), options);

        let mut writer = log.writer().unwrap();
        for i in 1..=6u64 {
            writer.append(entry(&format!("e{i:03}"))).unwrap();
        }
        assert_eq!(log.segment_count(), 3);

        writer.truncate(Index::new(3)).unwrap();
        assert_eq!(log.segment_count(), 2);
        assert_eq!(writer.last_index().unwrap(), Index::new(3));

        let appended = writer.append(entry("e999")).unwrap();
        assert_eq!(appended.index(), Index::new(4));
        drop(writer);

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        let mut indices = Vec::new();
        while let Some(read) = reader.next_entry().unwrap() {
            indices.push(read.index().as_u64());
        }
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[test]
    fn truncate_below_first_resets_log() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options());

        let mut writer = log.writer().unwrap();
        for i in 1..=4u64 {
            writer.append(entry(&format!("e{i:03}"))).unwrap();
        }
        writer.truncate(Index::ZERO).unwrap();
        assert_eq!(writer.last_index().unwrap(), Index::ZERO);

        let appended = writer.append(entry("new")).unwrap();
        assert_eq!(appended.index(), Index::new(1));
        assert_eq!(appended.entry(), &entry("new"));
    }

    #[test]
    fn torn_tail_is_dropped_on_reopen() {
        let dir = tempdir().unwrap();
        let record_len = RECORD_HEADER_BYTES + 4;
        let torn_payload_offset =
            DESCRIPTOR_BYTES as u64 + 5 * record_len + RECORD_HEADER_BYTES;
        {
            let log = open_log(dir.path(), small_options());
            let mut writer = log.writer().unwrap();
            for i in 1..=5u64 {
                writer.append(entry(&format!("e{i:03}"))).unwrap();
            }
            writer.commit().unwrap();
            writer.append(entry("e006")).unwrap();
        }

        // Simulate a torn write: zero the last 3 payload bytes of entry 6.
        let mut segment_file = None;
        for dirent in std::fs::read_dir(dir.path()).unwrap() {
            segment_file = Some(dirent.unwrap().path());
        }
        let path = segment_file.unwrap();
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(torn_payload_offset + 1)).unwrap();
        file.write_all(&[0, 0, 0]).unwrap();
        drop(file);

        let log = open_log(dir.path(), small_options());
        assert_eq!(log.last_index().unwrap(), Index::new(5));

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        let mut indices = Vec::new();
        while let Some(read) = reader.next_entry().unwrap() {
            indices.push(read.index().as_u64());
        }
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);

        let mut writer = log.writer().unwrap();
        let appended = writer.append(entry("e006")).unwrap();
        assert_eq!(appended.index(), Index::new(6));
    }

    #[test]
    fn sparse_density_still_locates_entries() {
        let dir = tempdir().unwrap();
        let options = LogOptions::default()
            .with_max_entry_size(64)
            .with_max_segment_size(64 * 1024)
            .with_index_density(0.1)
            .with_cache_size(8);
        let log = open_log(dir.path(), options);

        let mut writer = log.writer().unwrap();
        for i in 1..=1000u64 {
            writer.append(entry(&format!("{i:04}"))).unwrap();
        }
        drop(writer);

        let mut reader = log.open_reader(Index::new(873)).unwrap();
        let read = reader.next_entry().unwrap().unwrap();
        assert_eq!(read.index(), Index::new(873));
        assert_eq!(read.entry(), &entry("0873"));
    }

    #[test]
    fn reader_resumes_from_disk_after_cache_eviction() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options().with_cache_size(4));

        let mut writer = log.writer().unwrap();
        for i in 1..=4u64 {
            writer.append(entry(&format!("e{i:03}"))).unwrap();
        }

        // Both reads are cache hits; the reader's file cursor advances
        // purely from cached sizes.
        let mut reader = log.open_reader(Index::new(1)).unwrap();
        assert_eq!(reader.next_entry().unwrap().unwrap().index().as_u64(), 1);
        assert_eq!(reader.next_entry().unwrap().unwrap().index().as_u64(), 2);

        // Slide the cache window past the reader's position.
        for i in 5..=12u64 {
            writer.append(entry(&format!("e{i:03}"))).unwrap();
        }
        drop(writer);

        // Entry 3 is evicted, so this read must come from disk at the
        // offset the cache-hit path maintained.
        for i in 3..=12u64 {
            let read = reader.next_entry().unwrap().unwrap();
            assert_eq!(read.index().as_u64(), i);
            assert_eq!(read.entry(), &entry(&format!("e{i:03}")));
        }
        assert!(!reader.has_next().unwrap());
    }

    #[test]
    fn tailing_reader_sees_later_appends() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options());

        let mut writer = log.writer().unwrap();
        writer.append(entry("a")).unwrap();

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        assert!(reader.next_entry().unwrap().is_some());
        assert!(!reader.has_next().unwrap());

        writer.append(entry("b")).unwrap();
        assert!(reader.has_next().unwrap());
        assert_eq!(
            reader.next_entry().unwrap().unwrap().entry(),
            &entry("b")
        );
    }

    #[test]
    fn tailing_reader_follows_roll_over() {
        let dir = tempdir().unwrap();
        let options = small_options()
            .with_max_segment_size(DESCRIPTOR_BYTES as u64 + 2 * (RECORD_HEADER_BYTES + 4));
        let log = open_log(dir.path(), options);

        let mut writer = log.writer().unwrap();
        writer.append(entry("aaaa")).unwrap();
        writer.append(entry("bbbb")).unwrap();

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        assert!(reader.next_entry().unwrap().is_some());
        assert!(reader.next_entry().unwrap().is_some());
        assert!(!reader.has_next().unwrap());

        // Roll happens here; the reader crosses into the new segment.
        writer.append(entry("cccc")).unwrap();
        let read = reader.next_entry().unwrap().unwrap();
        assert_eq!(read.index(), Index::new(3));
        assert_eq!(read.entry(), &entry("cccc"));
    }

    #[test]
    fn compaction_deletes_covered_prefix() {
        let dir = tempdir().unwrap();
        let options = small_options()
            .with_max_segment_size(DESCRIPTOR_BYTES as u64 + 2 * (RECORD_HEADER_BYTES + 4));
        let log = open_log(dir.path(), options);

        let mut writer = log.writer().unwrap();
        for i in 1..=6u64 {
            writer.append(entry(&format!("e{i:03}"))).unwrap();
        }
        drop(writer);
        assert_eq!(log.segment_count(), 3);

        log.compact(Index::new(4)).unwrap();
        assert_eq!(log.segment_count(), 2);
        assert_eq!(log.first_index(), Index::new(3));

        // A reader below the retained range starts at the first entry left.
        let mut reader = log.open_reader(Index::new(1)).unwrap();
        assert_eq!(reader.next_entry().unwrap().unwrap().index(), Index::new(3));

        // Compacting past the end never deletes the active segment.
        log.compact(Index::new(100)).unwrap();
        assert_eq!(log.segment_count(), 1);
    }

    #[test]
    fn reopen_recovers_multi_segment_log() {
        let dir = tempdir().unwrap();
        let options = small_options()
            .with_max_segment_size(DESCRIPTOR_BYTES as u64 + 2 * (RECORD_HEADER_BYTES + 4));
        {
            let log = open_log(dir.path(), options.clone());
            let mut writer = log.writer().unwrap();
            for i in 1..=5u64 {
                writer.append(entry(&format!("e{i:03}"))).unwrap();
            }
            writer.commit().unwrap();
        }

        let log = open_log(dir.path(), options);
        assert_eq!(log.segment_count(), 3);
        assert_eq!(log.last_index().unwrap(), Index::new(5));

        let mut writer = log.writer().unwrap();
        assert_eq!(writer.append(entry("e006")).unwrap().index(), Index::new(6));
        drop(writer);

        let mut reader = log.open_reader(Index::new(1)).unwrap();
        let mut indices = Vec::new();
        while let Some(read) = reader.next_entry().unwrap() {
            indices.push(read.index().as_u64());
        }
        assert_eq!(indices, (1..=6).collect::<Vec<_>>());
    }

    #[test]
    fn closed_log_rejects_writers_and_readers() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options());
        log.writer().unwrap().append(entry("a")).unwrap();

        log.close().unwrap();
        assert!(!log.is_open());
        assert!(log.writer().is_err());
        assert!(matches!(
            log.open_reader(Index::new(1)).err(),
            Some(StorageError::SegmentNotOpen { .. })
        ));
    }

    #[test]
    fn oversized_entry_is_rejected_without_side_effects() {
        let dir = tempdir().unwrap();
        let log = open_log(dir.path(), small_options().with_max_entry_size(16));

        let mut writer = log.writer().unwrap();
        let err = writer.append(Bytes::from(vec![0x42; 17])).unwrap_err();
        assert!(matches!(err, StorageError::EntryTooLarge { size: 17, .. }));
        assert_eq!(writer.last_index().unwrap(), Index::ZERO);

        writer.append(entry("fits")).unwrap();
        assert_eq!(writer.last_index().unwrap(), Index::new(1));
    }

    #[test]
    fn verify_counts_records_across_segments() {
        let dir = tempdir().unwrap();
        let options = small_options()
            .with_max_segment_size(DESCRIPTOR_BYTES as u64 + 2 * (RECORD_HEADER_BYTES + 4));
        let log = open_log(dir.path(), options);

        let mut writer = log.writer().unwrap();
        for i in 1..=5u64 {
            writer.append(entry(&format!("e{i:03}"))).unwrap();
        }
        drop(writer);

        assert_eq!(log.verify().unwrap(), 5);
    }

    proptest! {
        #[test]
        fn arbitrary_entries_roundtrip(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 1..=64),
                1..=40,
            )
        ) {
            let dir = tempdir().unwrap();
            // Small segments so longer runs exercise roll-over.
            let options = LogOptions::default()
                .with_max_entry_size(64)
                .with_max_segment_size(DESCRIPTOR_BYTES as u64 + 256)
                .with_index_density(0.25)
                .with_cache_size(4);
            let log = Log::open(dir.path(), BytesCodec, options).unwrap();

            let mut writer = log.writer().unwrap();
            for payload in &payloads {
                writer.append(Bytes::copy_from_slice(payload)).unwrap();
            }
            drop(writer);

            let mut reader = log.open_reader(Index::new(1)).unwrap();
            for (i, payload) in payloads.iter().enumerate() {
                let read = reader.next_entry().unwrap().unwrap();
                prop_assert_eq!(read.index().as_u64(), i as u64 + 1);
                prop_assert_eq!(read.entry().as_ref(), payload.as_slice());
            }
            prop_assert!(!reader.has_next().unwrap());
        }
    }
}
