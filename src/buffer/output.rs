//! Byte sink for the serializer.
//!
//! [`OutputBuffer`] collects an outgoing frame as a list of chunks:
//!
//! - copying writes land in pool-backed segments ([`OutputBuffer::write_copy`],
//!   also reached through [`std::io::Write`]);
//! - zero-copy writes append a caller's `Bytes` as-is
//!   ([`OutputBuffer::write_shared`]).
//!
//! The chunks are flushed with vectored writes, one `IoSlice` per chunk.

use std::fmt;
use std::io::{self, IoSlice, Write};

use bytes::Bytes;

use super::chunk::{ChunkBuffer, ChunkSlice};
use super::input::QuotaExceeded;
use super::pool::BufferPool;
use crate::error::CodecError;

enum OutputChunk {
    /// Pool memory, of which the first `filled` bytes are written.
    Pooled { buffer: ChunkBuffer, filled: usize },
    /// Caller memory appended without copying.
    Shared(Bytes),
}

impl OutputChunk {
    fn len(&self) -> usize {
        match self {
            OutputChunk::Pooled { filled, .. } => *filled,
            OutputChunk::Shared(bytes) => bytes.len(),
        }
    }

    fn push_parts<'a>(&'a self, parts: &mut Vec<&'a [u8]>) {
        match self {
            OutputChunk::Pooled { buffer, filled } => {
                let mut remaining = *filled;
                for segment in buffer.segments() {
                    if remaining == 0 {
                        break;
                    }
                    let n = segment.len().min(remaining);
                    parts.push(&segment[..n]);
                    remaining -= n;
                }
            }
            OutputChunk::Shared(bytes) => parts.push(bytes),
        }
    }
}

/// Chunked, pool-backed output buffer.
pub struct OutputBuffer {
    chunks: Vec<OutputChunk>,
    pool: BufferPool,
    len: usize,
    quota: Option<usize>,
}

impl OutputBuffer {
    pub fn new(pool: BufferPool) -> Self {
        Self {
            chunks: Vec::new(),
            pool,
            len: 0,
            quota: None,
        }
    }

    /// Fail writes that would grow the buffer past `limit` bytes.
    pub fn with_quota(mut self, limit: usize) -> Self {
        self.quota = Some(limit);
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks, pooled and shared.
    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn check_quota(&self, additional: usize) -> Result<(), CodecError> {
        match self.quota {
            Some(limit) if self.len + additional > limit => Err(CodecError::QuotaExceeded { limit }),
            _ => Ok(()),
        }
    }

    /// Copy `src` into pool segments.
    pub fn write_copy(&mut self, mut src: &[u8]) -> Result<(), CodecError> {
        self.check_quota(src.len())?;
        self.len += src.len();

        if let Some(OutputChunk::Pooled { buffer, filled }) = self.chunks.last_mut() {
            let spare = buffer.len() - *filled;
            let n = spare.min(src.len());
            if n > 0 {
                buffer
                    .write_at(*filled, &src[..n])
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                *filled += n;
                src = &src[n..];
            }
        }

        if !src.is_empty() {
            let size = src.len().max(self.pool.chunk_size());
            let mut buffer = self
                .pool
                .borrow(size)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            buffer
                .write_at(0, src)
                .map_err(|e| CodecError::Encode(e.to_string()))?;
            self.chunks.push(OutputChunk::Pooled {
                buffer,
                filled: src.len(),
            });
        }
        Ok(())
    }

    /// Append `bytes` without copying.
    pub fn write_shared(&mut self, bytes: Bytes) -> Result<(), CodecError> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_quota(bytes.len())?;
        self.len += bytes.len();
        self.chunks.push(OutputChunk::Shared(bytes));
        Ok(())
    }

    /// A view of everything written so far.
    pub fn as_slice(&self) -> ChunkSlice<'_> {
        let mut parts = Vec::with_capacity(self.chunks.len());
        for chunk in &self.chunks {
            chunk.push_parts(&mut parts);
        }
        ChunkSlice::from_parts(parts)
    }

    /// One `IoSlice` per contiguous part, for vectored writes.
    pub fn io_slices(&self) -> Vec<IoSlice<'_>> {
        self.as_slice()
            .parts()
            .iter()
            .map(|part| IoSlice::new(*part))
            .collect()
    }

    /// `IoSlice`s for the bytes after the first `skip`, for resuming a
    /// partial write.
    pub fn remaining_slices(&self, skip: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::new();
        let mut skipped = 0;
        let view = self.as_slice();
        for &part in view.parts() {
            let end = skipped + part.len();
            if skip < end {
                let start = skip.saturating_sub(skipped);
                slices.push(IoSlice::new(&part[start..]));
            }
            skipped = end;
        }
        slices
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.as_slice().to_vec()
    }

    /// Release all chunks.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Replace the content with the output of `filter`.
    ///
    /// The filter reads the current bytes and writes the replacement into a
    /// fresh buffer. The replacement becomes visible only when the filter
    /// returns `Ok`; on error the content is left untouched.
    pub fn swap<F, E>(&mut self, filter: F) -> Result<(), E>
    where
        F: FnOnce(&ChunkSlice<'_>, &mut OutputBuffer) -> Result<(), E>,
    {
        let mut replacement = OutputBuffer {
            chunks: Vec::new(),
            pool: self.pool.clone(),
            len: 0,
            quota: self.quota,
        };
        {
            let current = self.as_slice();
            filter(&current, &mut replacement)?;
        }
        *self = replacement;
        Ok(())
    }
}

impl Write for OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_copy(buf).map_err(|e| match e {
            CodecError::QuotaExceeded { limit } => {
                io::Error::new(io::ErrorKind::InvalidData, QuotaExceeded { limit })
            }
            other => io::Error::other(other.to_string()),
        })?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputBuffer")
            .field("len", &self.len)
            .field("chunks", &self.chunks.len())
            .field("quota", &self.quota)
            .finish()
    }
}
