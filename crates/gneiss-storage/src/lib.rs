//! Segmented append-only log storage.
//!
//! The log is an ordered, gap-free sequence of segment files. Each segment is
//! a single pre-allocated file holding a fixed-width descriptor followed by
//! length-prefixed, CRC-protected entry records. One segment — the active
//! segment — accepts appends; prior segments are immutable until truncated or
//! compacted away.
//!
//! # File Layout
//!
//! ```text
//! {storage_dir}/
//! ├── segment_0000000001_001.log   <- first segment (immutable after roll)
//! ├── segment_0000000002_001.log   <- second segment
//! └── segment_0000000003_001.log   <- active segment
//! ```
//!
//! # Components
//!
//! - [`Log`] — the multi-segment orchestrator: roll-over, truncation,
//!   compaction, reader multiplexing.
//! - [`LogWriter`] — the single append handle; at most one exists at a time.
//! - [`LogReader`] — a forward cursor that transparently crosses segment
//!   boundaries.
//! - [`Segment`] — one pre-allocated file plus its sparse index and entry
//!   cache.
//! - [`EntryCodec`] — the pluggable serializer mapping caller entries to
//!   payload bytes.
//!
//! # Durability
//!
//! `append` does not imply durability; call [`LogWriter::commit`] to force
//! previously appended records to stable storage. A crash mid-append leaves a
//! torn record at the tail, which recovery absorbs: reopening the log yields
//! the prefix of all fully written records.

mod cache;
mod codec;
mod descriptor;
mod entry;
mod index;
mod log;
mod reader;
mod segment;
mod writer;

pub use cache::EntryCache;
pub use codec::{BytesCodec, EntryCodec, JsonCodec};
pub use descriptor::{DESCRIPTOR_BYTES, SegmentDescriptor};
pub use entry::Indexed;
pub use index::{Position, SparseIndex};
pub use log::{Log, LogOptions, LogReader, LogWriter};
pub use reader::SegmentReader;
pub use segment::{Segment, SegmentWriterGuard};
pub use writer::SegmentWriter;

use gneiss_types::SegmentId;

/// Errors produced by the segmented log.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying file system failure. The log is unusable until reopened.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The serialized entry exceeds the configured maximum entry size.
    /// The log state is unchanged.
    #[error("entry of {size} bytes exceeds maximum entry size {max}")]
    EntryTooLarge { size: usize, max: u32 },

    /// The record would not fit before the end of the segment. Recovered
    /// internally by the log, which rolls to a fresh segment and retries.
    #[error("segment {id} is full")]
    SegmentFull { id: SegmentId },

    /// Operation on a segment that has been closed or deleted.
    #[error("segment {id} is not open")]
    SegmentNotOpen { id: SegmentId },

    /// A record failed its CRC check but is followed by valid data.
    /// Only surfaced by explicit verification; normal reads treat any
    /// checksum failure as end of log.
    #[error("corrupt record at file offset {offset}")]
    CorruptRecord { offset: u64 },

    /// The segment descriptor does not start with the expected magic bytes.
    #[error("invalid segment magic")]
    InvalidSegmentMagic,

    /// The segment was written by an unsupported format version.
    #[error("unsupported segment version {0}")]
    UnsupportedSegmentVersion(u32),

    /// The segment file is too small to hold a descriptor.
    #[error("segment descriptor truncated: expected {expected} bytes, found {actual}")]
    DescriptorTruncated { expected: usize, actual: usize },

    /// Segment first indices do not form a gap-free sequence on open.
    #[error("segment {id} starts at index {actual}, expected {expected}")]
    NonContiguousSegments {
        id: SegmentId,
        expected: u64,
        actual: u64,
    },

    /// The entry codec failed to encode or decode a payload.
    #[error("codec error: {reason}")]
    Codec { reason: String },
}
