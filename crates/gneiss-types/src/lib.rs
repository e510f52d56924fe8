//! # gneiss-types: Core types for the gneiss log
//!
//! Shared newtypes used across the gneiss segmented log:
//! - [`Index`] — logical position of an entry in the log
//! - [`SegmentId`] — monotonic identifier assigned to a segment at creation

use std::{
    fmt::Display,
    ops::{Add, AddAssign, Sub},
};

use serde::{Deserialize, Serialize};

/// Logical position of an entry within the log.
///
/// Indices are one-based and strictly sequential: the first entry in a fresh
/// log has index 1, the second index 2, and so on. Index 0 never names an
/// entry and is used as the "empty log" sentinel (`last_index` of an empty
/// log is `first_index - 1`).
///
/// Uses `u64` internally — indices are never negative by definition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Index(u64);

impl Index {
    pub const ZERO: Index = Index(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// Returns the index as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the index that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Index {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Index> for u64 {
    fn from(index: Index) -> Self {
        index.0
    }
}

impl Add for Index {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Index {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Index {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// Unique identifier for a segment, assigned monotonically at creation.
///
/// Segment ids start at 1 and increase by one on every roll-over. The id
/// orders segment files on disk: the filename encoding zero-pads the id so
/// lexicographic sort matches creation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SegmentId(u64);

impl SegmentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the id as a `u64`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the id of the segment that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SegmentId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SegmentId> for u64 {
    fn from(id: SegmentId) -> Self {
        id.0
    }
}
