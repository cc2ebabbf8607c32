//! Segmented byte buffers.
//!
//! A [`ChunkBuffer`] is an ordered list of [`Segment`]s presented as one
//! logical byte range. Buffers borrowed from a [`BufferPool`] hand their
//! segments back when dropped or when passed to [`BufferPool::give_back`].
//!
//! Narrowing is done through [`ChunkSlice`], a borrowed view that shares the
//! underlying memory and therefore cannot outlive the buffer it came from.

use std::fmt;

use bytes::BytesMut;

use super::pool::BufferPool;
use super::segment::Segment;
use crate::error::{Result, RpcError};

/// An ordered sequence of segments forming one logical byte buffer.
pub struct ChunkBuffer {
    segments: Vec<Segment>,
    len: usize,
    pool: Option<BufferPool>,
}

impl ChunkBuffer {
    /// An empty buffer with no backing memory.
    pub fn empty() -> Self {
        Self {
            segments: Vec::new(),
            len: 0,
            pool: None,
        }
    }

    /// Wrap a fixed region that belongs to no pool.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::from_bytes_mut(BytesMut::from(&data[..]))
    }

    /// Wrap a fixed region that belongs to no pool.
    pub fn from_bytes_mut(data: BytesMut) -> Self {
        let len = data.len();
        let segments = if len == 0 {
            Vec::new()
        } else {
            vec![Segment::unpooled(data)]
        };
        Self {
            segments,
            len,
            pool: None,
        }
    }

    pub(crate) fn from_segments(segments: Vec<Segment>, pool: Option<BufferPool>) -> Self {
        let len = segments.iter().map(Segment::len).sum();
        Self {
            segments,
            len,
            pool,
        }
    }

    /// Total length: the sum of all segment lengths.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of segments.
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The pool this buffer returns to, if any.
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Segments in stream order.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Segment::as_slice)
    }

    /// Mutable segments in stream order.
    pub fn segments_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.segments.iter_mut().map(Segment::as_mut_slice)
    }

    pub(crate) fn segment(&self, index: usize) -> &[u8] {
        self.segments[index].as_slice()
    }

    pub(crate) fn raw_segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Find `(segment index, offset in segment)` for a logical offset.
    ///
    /// `offset == len` maps to `(segment_count, 0)`.
    pub fn locate(&self, offset: usize) -> Option<(usize, usize)> {
        if offset > self.len {
            return None;
        }
        let mut base = 0;
        for (index, segment) in self.segments.iter().enumerate() {
            if offset < base + segment.len() {
                return Some((index, offset - base));
            }
            base += segment.len();
        }
        Some((self.segments.len(), 0))
    }

    fn check_range(&self, offset: usize, count: usize) -> Result<()> {
        match offset.checked_add(count) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RpcError::invalid(format!(
                "range {}+{} outside buffer of length {}",
                offset, count, self.len
            ))),
        }
    }

    /// Copy `src` into the buffer starting at `offset`.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        if src.is_empty() {
            return Ok(());
        }
        let (mut index, mut at) = self.locate(offset).unwrap_or((0, 0));
        let mut written = 0;
        while written < src.len() {
            let target = &mut self.segments[index].as_mut_slice()[at..];
            let n = target.len().min(src.len() - written);
            target[..n].copy_from_slice(&src[written..written + n]);
            written += n;
            index += 1;
            at = 0;
        }
        Ok(())
    }

    /// Copy bytes starting at `offset` into `dst`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let slice = self.sub_range(offset, dst.len())?;
        let mut copied = 0;
        for part in slice.parts() {
            dst[copied..copied + part.len()].copy_from_slice(part);
            copied += part.len();
        }
        Ok(())
    }

    /// Copy the whole content into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment.as_slice());
        }
        out
    }

    /// A view of bytes `[offset, offset + count)` sharing this buffer's memory.
    ///
    /// Cut points inside a segment are located with a linear scan.
    pub fn sub_range(&self, offset: usize, count: usize) -> Result<ChunkSlice<'_>> {
        self.check_range(offset, count)?;
        let mut parts = Vec::new();
        if count == 0 {
            return Ok(ChunkSlice::from_parts(parts));
        }
        let (mut index, mut at) = self.locate(offset).unwrap_or((0, 0));
        let mut remaining = count;
        while remaining > 0 {
            let segment = &self.segments[index].as_slice()[at..];
            let n = segment.len().min(remaining);
            parts.push(&segment[..n]);
            remaining -= n;
            index += 1;
            at = 0;
        }
        Ok(ChunkSlice::from_parts(parts))
    }

    /// A view of the whole buffer.
    pub fn as_slice(&self) -> ChunkSlice<'_> {
        ChunkSlice::from_parts(self.segments().collect())
    }

    /// Append `additional` bytes of fresh memory at the end.
    ///
    /// Already-written bytes never move.
    pub fn grow(&mut self, additional: usize) -> Result<()> {
        if additional == 0 {
            return Err(RpcError::invalid("grow length must be positive"));
        }
        match &self.pool {
            Some(pool) => {
                let extra = pool.take_segments(additional);
                self.segments.extend(extra);
            }
            None => self
                .segments
                .push(Segment::unpooled(BytesMut::zeroed(additional))),
        }
        self.len += additional;
        Ok(())
    }

    /// Move all segments of `other` to the end of this buffer.
    ///
    /// An empty buffer adopts the origin of `other`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when both buffers hold memory of different origin.
    /// `other` is then dropped and its segments go back to its own pool.
    pub fn append(&mut self, mut other: ChunkBuffer) -> Result<()> {
        if other.segments.is_empty() {
            return Ok(());
        }
        if self.segments.is_empty() {
            self.pool = other.pool.take();
        } else {
            let same_origin = match (&self.pool, &other.pool) {
                (Some(ours), Some(theirs)) => ours.same_pool(theirs),
                (None, None) => true,
                _ => false,
            };
            if !same_origin {
                return Err(RpcError::invalid(
                    "cannot append a buffer from a different pool",
                ));
            }
        }
        self.len += other.len;
        self.segments.append(&mut other.segments);
        other.len = 0;
        Ok(())
    }

    /// Split off bytes `[0, at)` into a new buffer, keeping `[at, len)`.
    pub fn split_to(&mut self, at: usize) -> Result<ChunkBuffer> {
        self.check_range(0, at)?;
        let mut front = Vec::new();
        let mut taken = 0;
        let mut rest = std::mem::take(&mut self.segments).into_iter();
        let mut back = Vec::new();
        for segment in rest.by_ref() {
            if taken == at {
                back.push(segment);
                break;
            }
            if taken + segment.len() <= at {
                taken += segment.len();
                front.push(segment);
            } else {
                let (head, tail) = segment.split_at(at - taken);
                front.push(head);
                back.extend(tail);
                break;
            }
        }
        back.extend(rest);
        self.segments = back;
        self.len -= at;
        Ok(ChunkBuffer::from_segments(front, self.pool.clone()))
    }

    /// Keep the first `len` bytes and release the rest.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        if let Ok(front) = self.split_to(len) {
            let tail = std::mem::replace(self, front);
            drop(tail);
        }
    }

    pub(crate) fn take_segments(&mut self) -> Vec<Segment> {
        self.len = 0;
        std::mem::take(&mut self.segments)
    }

    pub(crate) fn detach_pool(&mut self) -> Option<BufferPool> {
        self.pool.take()
    }
}

impl Drop for ChunkBuffer {
    fn drop(&mut self) {
        if self.segments.is_empty() {
            return;
        }
        if let Some(pool) = self.pool.take() {
            pool.recycle(std::mem::take(&mut self.segments));
        }
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ChunkBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkBuffer")
            .field("len", &self.len)
            .field("segments", &self.segments)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// A borrowed, possibly discontiguous view of bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ChunkSlice<'a> {
    parts: Vec<&'a [u8]>,
    len: usize,
}

impl<'a> ChunkSlice<'a> {
    /// Build a view from parts in stream order. Empty parts are skipped.
    pub fn from_parts(parts: Vec<&'a [u8]>) -> Self {
        let parts: Vec<&'a [u8]> = parts.into_iter().filter(|p| !p.is_empty()).collect();
        let len = parts.iter().map(|p| p.len()).sum();
        Self { parts, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The contiguous parts of the view.
    pub fn parts(&self) -> &[&'a [u8]] {
        &self.parts
    }

    /// Bytes of the view in order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.parts.iter().flat_map(|p| p.iter().copied())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for part in &self.parts {
            out.extend_from_slice(part);
        }
        out
    }

    /// Narrow this view further.
    pub fn sub_range(&self, offset: usize, count: usize) -> Result<ChunkSlice<'a>> {
        match offset.checked_add(count) {
            Some(end) if end <= self.len => {}
            _ => {
                return Err(RpcError::invalid(format!(
                    "range {}+{} outside view of length {}",
                    offset, count, self.len
                )))
            }
        }
        let mut parts = Vec::new();
        let mut skip = offset;
        let mut remaining = count;
        for part in &self.parts {
            if remaining == 0 {
                break;
            }
            if skip >= part.len() {
                skip -= part.len();
                continue;
            }
            let n = (part.len() - skip).min(remaining);
            parts.push(&part[skip..skip + n]);
            remaining -= n;
            skip = 0;
        }
        Ok(ChunkSlice::from_parts(parts))
    }
}

impl fmt::Debug for ChunkSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkSlice")
            .field("len", &self.len)
            .field("parts", &self.parts.len())
            .finish()
    }
}
