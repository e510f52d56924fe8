//! Sparse in-memory index mapping entry indices to file offsets.
//!
//! Indexing every entry is memory-prohibitive at scale, so the index records
//! a density-selected subset of positions: with density `d`, one entry in
//! every `ceil(1/d)` is indexed, counted from the segment's first index. A
//! positioned read looks up the greatest indexed entry at or below its
//! target and scans forward at most `ceil(1/d) - 1` records.
//!
//! # Invariants
//!
//! - The first entry of the segment is always indexed (if any entry exists).
//! - Every recorded position references the start of a valid record.
//! - Positions are recorded by the single writer; readers only look up.

use std::collections::BTreeMap;
use std::sync::RwLock;

use gneiss_types::Index;

/// A recorded `(entry index, file offset)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    /// The indexed entry.
    pub index: Index,
    /// File offset of the start of the entry's record.
    pub offset: u64,
}

/// Density-sampled map from entry index to file offset.
///
/// Shared between one writer (which records positions during appends) and
/// any number of readers (which look up seek targets). All access goes
/// through a short `RwLock` critical section; readers observe either the
/// prior or the new state, never a torn intermediate.
#[derive(Debug)]
pub struct SparseIndex {
    first_index: u64,
    /// Record one entry in every `stride`; `stride = ceil(1 / density)`.
    stride: u64,
    positions: RwLock<BTreeMap<u64, u64>>,
}

impl SparseIndex {
    /// Creates an empty index for a segment starting at `first_index`.
    ///
    /// # Panics
    ///
    /// Panics if `density` is not in `(0, 1]`.
    pub fn new(first_index: Index, density: f64) -> Self {
        assert!(
            density > 0.0 && density <= 1.0,
            "index density must be in (0, 1], got {density}"
        );
        let stride = (1.0 / density).ceil() as u64;
        Self {
            first_index: first_index.as_u64(),
            stride: stride.max(1),
            positions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Records the position of `index` if it falls on the density stride;
    /// otherwise a no-op. Idempotent for a given index.
    pub fn index(&self, index: Index, offset: u64) {
        debug_assert!(
            index.as_u64() >= self.first_index,
            "index {index} precedes segment first index {}",
            self.first_index
        );

        if (index.as_u64() - self.first_index) % self.stride == 0 {
            self.positions
                .write()
                .expect("sparse index lock poisoned")
                .insert(index.as_u64(), offset);
        }
    }

    /// Returns the recorded position with the greatest entry index that is
    /// at or below `target`, or `None` if no such entry is indexed.
    pub fn lookup(&self, target: Index) -> Option<Position> {
        self.positions
            .read()
            .expect("sparse index lock poisoned")
            .range(..=target.as_u64())
            .next_back()
            .map(|(&index, &offset)| Position {
                index: Index::new(index),
                offset,
            })
    }

    /// Drops all recorded positions above `new_last_index`.
    pub fn truncate(&self, new_last_index: Index) {
        let mut positions = self.positions.write().expect("sparse index lock poisoned");
        let _ = positions.split_off(&(new_last_index.as_u64() + 1));
    }

    /// Number of recorded positions.
    pub fn len(&self) -> usize {
        self.positions
            .read()
            .expect("sparse index lock poisoned")
            .len()
    }

    /// Returns `true` if no positions are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn full_density_indexes_every_entry() {
        let index = SparseIndex::new(Index::new(1), 1.0);
        for i in 1..=10u64 {
            index.index(Index::new(i), 64 + (i - 1) * 20);
        }
        assert_eq!(index.len(), 10);
        let pos = index.lookup(Index::new(4)).unwrap();
        assert_eq!(pos.index, Index::new(4));
        assert_eq!(pos.offset, 64 + 3 * 20);
    }

    #[test]
    fn first_entry_is_always_indexed() {
        let index = SparseIndex::new(Index::new(100), 0.01);
        index.index(Index::new(100), 64);
        assert_eq!(
            index.lookup(Index::new(100)),
            Some(Position {
                index: Index::new(100),
                offset: 64
            })
        );
    }

    #[test]
    fn lookup_returns_floor_entry() {
        let index = SparseIndex::new(Index::new(1), 0.5);
        for i in 1..=9u64 {
            index.index(Index::new(i), i * 100);
        }
        // stride 2: indices 1, 3, 5, 7, 9 recorded
        let pos = index.lookup(Index::new(6)).unwrap();
        assert_eq!(pos.index, Index::new(5));
        assert_eq!(pos.offset, 500);
        assert_eq!(index.lookup(Index::new(0)), None);
    }

    #[test_case(1.0, 1000; "every entry")]
    #[test_case(0.5, 500; "every second entry")]
    #[test_case(0.1, 100; "every tenth entry")]
    fn density_controls_cardinality(density: f64, expected: usize) {
        let index = SparseIndex::new(Index::new(1), density);
        for i in 1..=1000u64 {
            index.index(Index::new(i), i * 16);
        }
        assert_eq!(index.len(), expected);
    }

    #[test]
    fn truncate_drops_positions_above() {
        let index = SparseIndex::new(Index::new(1), 1.0);
        for i in 1..=10u64 {
            index.index(Index::new(i), i * 16);
        }
        index.truncate(Index::new(6));
        assert_eq!(index.len(), 6);
        assert_eq!(index.lookup(Index::new(10)).unwrap().index, Index::new(6));
    }

    #[test]
    fn truncate_to_zero_empties_the_index() {
        let index = SparseIndex::new(Index::new(1), 1.0);
        index.index(Index::new(1), 64);
        index.truncate(Index::ZERO);
        assert!(index.is_empty());
    }

    #[test]
    fn indexing_is_idempotent() {
        let index = SparseIndex::new(Index::new(1), 1.0);
        index.index(Index::new(1), 64);
        index.index(Index::new(1), 64);
        assert_eq!(index.len(), 1);
    }

    #[test]
    #[should_panic(expected = "index density must be in (0, 1]")]
    fn rejects_zero_density() {
        let _ = SparseIndex::new(Index::new(1), 0.0);
    }
}
