//! Segment planning: how a resource of a given size splits into fixed chunks.

use crate::error::{Error, Result};

/// An inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a range covers at least one byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Value for the HTTP `Range` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Fixed-size segmentation of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    total_size: u64,
    chunk_size: u64,
}

impl SegmentPlan {
    /// Creates a plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if either size is zero.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if total_size == 0 {
            return Err(Error::InvalidState("total size must be positive".into()));
        }
        if chunk_size == 0 {
            return Err(Error::InvalidState("chunk size must be positive".into()));
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    /// Total resource length in bytes.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Chunk length in bytes.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(total_size / chunk_size)`.
    #[must_use]
    pub const fn segment_count(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    /// Byte range for a segment, or `None` past the last segment.
    #[must_use]
    pub fn range(&self, index: u64) -> Option<ByteRange> {
        if index >= self.segment_count() {
            return None;
        }
        let start = index * self.chunk_size;
        let end = (start + self.chunk_size - 1).min(self.total_size - 1);
        Some(ByteRange { start, end })
    }

    /// All ranges in index order.
    pub fn ranges(&self) -> impl Iterator<Item = ByteRange> + '_ {
        (0..self.segment_count()).filter_map(|i| self.range(i))
    }

    /// Sum of the lengths of the given segments. Out-of-range indices count as zero.
    #[must_use]
    pub fn bytes_for<'a>(&self, indices: impl IntoIterator<Item = &'a u64>) -> u64 {
        indices
            .into_iter()
            .filter_map(|&i| self.range(i))
            .map(|r| r.len())
            .sum()
    }
}
