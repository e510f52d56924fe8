//! Fixed-width segment descriptor.
//!
//! Every segment file begins with a 64-byte descriptor identifying the
//! segment and fixing its geometry:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │  Offset  │  Size  │  Description                    │
//! ├─────────────────────────────────────────────────────┤
//! │  0       │  4     │  Magic bytes: "GSEG"            │
//! │  4       │  4     │  Version (u32 LE)               │
//! │  8       │  8     │  Segment id (u64 LE)            │
//! │  16      │  8     │  First index (u64 LE)           │
//! │  24      │  8     │  Max segment size (u64 LE)      │
//! │  32      │  1     │  Updated flag (reserved)        │
//! │  33      │  31    │  Zero padding                   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian, the on-disk byte order used everywhere in
//! this crate. The `updated` flag is reserved: it is written as zero and
//! ignored on read until a consumer for it is specified.

use std::io::Read;

use gneiss_types::{Index, SegmentId};

use crate::StorageError;

/// Magic bytes identifying a gneiss segment file.
const MAGIC: &[u8; 4] = b"GSEG";

/// Current segment format version.
pub(crate) const VERSION: u32 = 1;

/// Total descriptor size in bytes. The first entry record starts at this
/// offset in every segment file.
pub const DESCRIPTOR_BYTES: usize = 64;

// Field offsets within the descriptor.
const VERSION_OFFSET: usize = 4;
const ID_OFFSET: usize = 8;
const FIRST_INDEX_OFFSET: usize = 16;
const MAX_SEGMENT_SIZE_OFFSET: usize = 24;
const UPDATED_OFFSET: usize = 32;

/// The fixed header at offset 0 of every segment file.
///
/// The descriptor is written once at segment creation and never modified
/// afterwards; everything mutable about a segment (its tail, its last index)
/// is recovered by replaying records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Monotonic segment id, assigned at creation.
    pub id: SegmentId,
    /// Logical index of the first entry this segment may hold.
    pub first_index: Index,
    /// Pre-allocated file size; also the roll-over threshold.
    pub max_segment_size: u64,
}

impl SegmentDescriptor {
    /// Serializes the descriptor into its fixed 64-byte form.
    pub fn encode(&self) -> [u8; DESCRIPTOR_BYTES] {
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        buf[..4].copy_from_slice(MAGIC);
        buf[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&VERSION.to_le_bytes());
        buf[ID_OFFSET..ID_OFFSET + 8].copy_from_slice(&self.id.as_u64().to_le_bytes());
        buf[FIRST_INDEX_OFFSET..FIRST_INDEX_OFFSET + 8]
            .copy_from_slice(&self.first_index.as_u64().to_le_bytes());
        buf[MAX_SEGMENT_SIZE_OFFSET..MAX_SEGMENT_SIZE_OFFSET + 8]
            .copy_from_slice(&self.max_segment_size.to_le_bytes());
        buf[UPDATED_OFFSET] = 0;
        buf
    }

    /// Deserializes a descriptor, validating size, magic, and version.
    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        if data.len() < DESCRIPTOR_BYTES {
            return Err(StorageError::DescriptorTruncated {
                expected: DESCRIPTOR_BYTES,
                actual: data.len(),
            });
        }

        if &data[..4] != MAGIC {
            return Err(StorageError::InvalidSegmentMagic);
        }

        let version = u32::from_le_bytes(
            data[VERSION_OFFSET..VERSION_OFFSET + 4]
                .try_into()
                .expect("slice is exactly 4 bytes after bounds check"),
        );
        if version != VERSION {
            return Err(StorageError::UnsupportedSegmentVersion(version));
        }

        let id = u64::from_le_bytes(
            data[ID_OFFSET..ID_OFFSET + 8]
                .try_into()
                .expect("slice is exactly 8 bytes after bounds check"),
        );
        let first_index = u64::from_le_bytes(
            data[FIRST_INDEX_OFFSET..FIRST_INDEX_OFFSET + 8]
                .try_into()
                .expect("slice is exactly 8 bytes after bounds check"),
        );
        let max_segment_size = u64::from_le_bytes(
            data[MAX_SEGMENT_SIZE_OFFSET..MAX_SEGMENT_SIZE_OFFSET + 8]
                .try_into()
                .expect("slice is exactly 8 bytes after bounds check"),
        );

        // The updated flag at UPDATED_OFFSET is reserved; ignore it.

        Ok(Self {
            id: SegmentId::new(id),
            first_index: Index::new(first_index),
            max_segment_size,
        })
    }

    /// Reads and decodes a descriptor from the start of `reader`.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, StorageError> {
        let mut buf = [0u8; DESCRIPTOR_BYTES];
        reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                StorageError::DescriptorTruncated {
                    expected: DESCRIPTOR_BYTES,
                    actual: 0,
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        Self::decode(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> SegmentDescriptor {
        SegmentDescriptor {
            id: SegmentId::new(7),
            first_index: Index::new(4097),
            max_segment_size: 32 * 1024 * 1024,
        }
    }

    #[test]
    fn roundtrip() {
        let desc = descriptor();
        let encoded = desc.encode();
        assert_eq!(encoded.len(), DESCRIPTOR_BYTES);
        assert_eq!(SegmentDescriptor::decode(&encoded).unwrap(), desc);
    }

    #[test]
    fn padding_is_zeroed() {
        let encoded = descriptor().encode();
        assert!(encoded[33..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = descriptor().encode();
        encoded[0] = b'X';
        assert!(matches!(
            SegmentDescriptor::decode(&encoded),
            Err(StorageError::InvalidSegmentMagic)
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut encoded = descriptor().encode();
        encoded[VERSION_OFFSET..VERSION_OFFSET + 4].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            SegmentDescriptor::decode(&encoded),
            Err(StorageError::UnsupportedSegmentVersion(9))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let encoded = descriptor().encode();
        assert!(matches!(
            SegmentDescriptor::decode(&encoded[..32]),
            Err(StorageError::DescriptorTruncated { actual: 32, .. })
        ));
    }
}
