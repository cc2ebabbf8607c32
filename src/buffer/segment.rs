//! A contiguous region of an arena.
//!
//! A [`Segment`] is the unit the pool hands out and takes back. It owns its
//! bytes exclusively through a `BytesMut` split off the arena allocation, so
//! two live segments can never alias. Offset and length never change; a
//! split or merge consumes the segment and produces new ones.

use std::fmt;

use bytes::BytesMut;

/// Pool id used for segments that belong to no pool.
pub(crate) const UNPOOLED: u64 = 0;

/// A contiguous memory region: `offset..offset + len` of one arena.
pub struct Segment {
    pool: u64,
    arena: u64,
    offset: usize,
    data: BytesMut,
}

impl Segment {
    /// Create a segment covering a whole arena.
    pub(crate) fn arena(pool: u64, arena: u64, data: BytesMut) -> Self {
        Self {
            pool,
            arena,
            offset: 0,
            data,
        }
    }

    /// Wrap caller memory that belongs to no pool.
    pub fn unpooled(data: BytesMut) -> Self {
        Self {
            pool: UNPOOLED,
            arena: 0,
            offset: 0,
            data,
        }
    }

    /// Region length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset of the region within its arena.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// One past the last arena offset covered.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.data.len()
    }

    /// Id of the arena backing this region.
    #[inline]
    pub fn arena_id(&self) -> u64 {
        self.arena
    }

    /// Id of the originating pool, `0` if none.
    #[inline]
    pub(crate) fn pool_id(&self) -> u64 {
        self.pool
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Split into `[0, at)` and `[at, len)`. The tail is `None` when `at == len`.
    pub(crate) fn split_at(mut self, at: usize) -> (Segment, Option<Segment>) {
        debug_assert!(at <= self.len());
        if at == self.len() {
            return (self, None);
        }
        let tail_data = self.data.split_off(at);
        let tail = Segment {
            pool: self.pool,
            arena: self.arena,
            offset: self.offset + at,
            data: tail_data,
        };
        (self, Some(tail))
    }

    /// Append `next` when it directly follows this region in the same arena.
    ///
    /// Returns `next` unchanged when the regions are not adjacent.
    pub(crate) fn try_merge(&mut self, next: Segment) -> Result<(), Segment> {
        if self.pool == UNPOOLED
            || self.pool != next.pool
            || self.arena != next.arena
            || self.end() != next.offset
        {
            return Err(next);
        }
        // Both halves were split from the same allocation, so this is O(1).
        self.data.unsplit(next.data);
        Ok(())
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("pool", &self.pool)
            .field("arena", &self.arena)
            .field("offset", &self.offset)
            .field("len", &self.len())
            .finish()
    }
}
