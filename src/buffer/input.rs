//! Pull-based byte source for the deserializer.
//!
//! [`InputBuffer`] walks a [`ChunkBuffer`] with a `(segment, offset)` cursor.
//! Once the current window is exhausted it asks its [`Feed`] for more bytes.
//! A feed that reports zero bytes ends the stream; that is end-of-input, not
//! an error. The buffer is consumed once; there is no rewind.
//!
//! `InputBuffer` implements [`std::io::Read`], so any MessagePack reader can
//! decode straight from pooled segments.

use std::fmt;
use std::io::{self, Read};

use super::chunk::ChunkBuffer;

/// Source of additional bytes for an [`InputBuffer`].
pub trait Feed: Send {
    /// Refill `buffer` and return how many leading bytes are now valid.
    ///
    /// The feed may overwrite the buffer in place or replace it wholesale,
    /// for example with a larger buffer from the pool. Returning `0` ends
    /// the stream.
    fn feed(&mut self, buffer: &mut ChunkBuffer) -> io::Result<usize>;
}

impl<F> Feed for F
where
    F: FnMut(&mut ChunkBuffer) -> io::Result<usize> + Send,
{
    fn feed(&mut self, buffer: &mut ChunkBuffer) -> io::Result<usize> {
        self(buffer)
    }
}

/// A [`Feed`] that fills the buffer from a blocking reader.
pub struct ReadFeed<R> {
    reader: R,
}

impl<R: Read + Send> ReadFeed<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> Feed for ReadFeed<R> {
    fn feed(&mut self, buffer: &mut ChunkBuffer) -> io::Result<usize> {
        match buffer.segments_mut().next() {
            Some(first) => self.reader.read(first),
            None => Ok(0),
        }
    }
}

/// Raised through `io::Error` when the byte quota is exceeded.
#[derive(Debug, Clone, Copy)]
pub struct QuotaExceeded {
    /// The configured limit.
    pub limit: usize,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "input exceeds quota of {} bytes", self.limit)
    }
}

impl std::error::Error for QuotaExceeded {}

impl QuotaExceeded {
    /// Recover the quota error from an `io::Error`, if that is what it carries.
    pub fn from_io(err: &io::Error) -> Option<QuotaExceeded> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<QuotaExceeded>())
            .copied()
    }
}

/// Lazy, extensible byte cursor over a [`ChunkBuffer`].
pub struct InputBuffer {
    buffer: ChunkBuffer,
    segment: usize,
    offset: usize,
    /// Valid bytes in the current window.
    window: usize,
    /// Bytes consumed from the current window.
    window_pos: usize,
    /// Bytes consumed since construction, across feeds.
    consumed: usize,
    quota: Option<usize>,
    feed: Option<Box<dyn Feed>>,
    ended: bool,
}

impl InputBuffer {
    /// Read the first `logical_len` bytes of `buffer`, with no feed.
    pub fn new(buffer: ChunkBuffer, logical_len: usize) -> Self {
        let window = logical_len.min(buffer.len());
        Self {
            buffer,
            segment: 0,
            offset: 0,
            window,
            window_pos: 0,
            consumed: 0,
            quota: None,
            feed: None,
            ended: false,
        }
    }

    /// Start with an empty window that is filled on first read.
    pub fn with_feed(buffer: ChunkBuffer, feed: impl Feed + 'static) -> Self {
        Self::new(buffer, 0).feed(feed)
    }

    /// Attach a feed.
    pub fn feed(mut self, feed: impl Feed + 'static) -> Self {
        self.feed = Some(Box::new(feed));
        self
    }

    /// Fail reads once more than `limit` bytes would have been consumed.
    pub fn quota(mut self, limit: usize) -> Self {
        self.quota = Some(limit);
        self
    }

    /// Total bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.consumed
    }

    /// Bytes left in the current window without feeding.
    #[inline]
    pub fn available(&self) -> usize {
        self.window - self.window_pos
    }

    /// Whether the feed has signalled end of stream.
    #[inline]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Give back the underlying buffer.
    pub fn into_inner(self) -> ChunkBuffer {
        self.buffer
    }

    /// Next byte, `None` at end of stream.
    pub fn next_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn refill(&mut self) -> io::Result<bool> {
        if self.ended {
            return Ok(false);
        }
        let Some(feed) = self.feed.as_mut() else {
            self.ended = true;
            return Ok(false);
        };
        let n = feed.feed(&mut self.buffer)?;
        if n == 0 {
            self.ended = true;
            return Ok(false);
        }
        if n > self.buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "feed reported {} bytes for a buffer of {}",
                    n,
                    self.buffer.len()
                ),
            ));
        }
        self.window = n;
        self.window_pos = 0;
        self.segment = 0;
        self.offset = 0;
        Ok(true)
    }
}

impl Read for InputBuffer {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if self.available() == 0 && !self.refill()? {
            return Ok(0);
        }

        let mut want = dst.len().min(self.available());
        if let Some(limit) = self.quota {
            if self.consumed + want > limit {
                if self.consumed >= limit {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        QuotaExceeded { limit },
                    ));
                }
                want = limit - self.consumed;
            }
        }

        let mut copied = 0;
        while copied < want {
            let segment = self.buffer.segment(self.segment);
            let src = &segment[self.offset..];
            let n = src.len().min(want - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
            self.offset += n;
            if self.offset == segment.len() {
                self.segment += 1;
                self.offset = 0;
            }
        }
        self.window_pos += copied;
        self.consumed += copied;
        Ok(copied)
    }
}

impl fmt::Debug for InputBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputBuffer")
            .field("position", &self.consumed)
            .field("available", &self.available())
            .field("ended", &self.ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::pool::{BufferPool, PoolPolicy};
    use std::io::Cursor;

    #[test]
    fn test_reads_window_then_ends() {
        let input_data = ChunkBuffer::from_vec(vec![1, 2, 3, 4, 5]);
        let mut input = InputBuffer::new(input_data, 3);

        let mut out = Vec::new();
        input.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert!(input.is_ended());
        assert_eq!(input.position(), 3);
    }

    #[test]
    fn test_reads_across_segments() {
        let pool = BufferPool::new(PoolPolicy::Recycling, 8);
        let mut buffer = pool.borrow(20).unwrap();
        let data: Vec<u8> = (0..20).collect();
        buffer.write_at(0, &data).unwrap();

        let mut input = InputBuffer::new(buffer, 20);
        let mut out = vec![0u8; 13];
        input.read_exact(&mut out).unwrap();
        assert_eq!(&out[..], &data[..13]);
        let mut rest = Vec::new();
        input.read_to_end(&mut rest).unwrap();
        assert_eq!(&rest[..], &data[13..]);
    }

    #[test]
    fn test_feed_pulls_more_bytes() {
        let mut chunks = vec![vec![7u8, 8, 9], vec![4u8, 5], vec![1u8, 2, 3]];
        let feed = move |buffer: &mut ChunkBuffer| -> io::Result<usize> {
            match chunks.pop() {
                Some(chunk) => {
                    buffer.write_at(0, &chunk).map_err(io::Error::other)?;
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        };
        let mut input = InputBuffer::with_feed(ChunkBuffer::from_vec(vec![0; 4]), feed);

        let mut out = Vec::new();
        input.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 7, 8, 9]);
        assert_eq!(input.position(), 8);
    }

    #[test]
    fn test_feed_may_replace_buffer() {
        let pool = BufferPool::new(PoolPolicy::Recycling, 4);
        let mut round = 0;
        let feed_pool = pool.clone();
        let feed = move |buffer: &mut ChunkBuffer| -> io::Result<usize> {
            round += 1;
            if round > 2 {
                return Ok(0);
            }
            let mut bigger = feed_pool.borrow(10).map_err(io::Error::other)?;
            bigger.write_at(0, &[round as u8; 10]).map_err(io::Error::other)?;
            *buffer = bigger;
            Ok(10)
        };
        let mut input = InputBuffer::with_feed(pool.borrow(2).unwrap(), feed);

        let mut out = Vec::new();
        input.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 20);
        assert!(out[..10].iter().all(|&b| b == 1));
        assert!(out[10..].iter().all(|&b| b == 2));
        assert_eq!(input.position(), 20);
    }

    #[test]
    fn test_quota_exceeded() {
        let buffer = ChunkBuffer::from_vec(vec![0; 10]);
        let mut input = InputBuffer::new(buffer, 10).quota(4);

        let mut out = vec![0u8; 10];
        let n = input.read(&mut out).unwrap();
        assert_eq!(n, 4);
        let err = input.read(&mut out).unwrap_err();
        assert_eq!(QuotaExceeded::from_io(&err).unwrap().limit, 4);
    }

    #[test]
    fn test_read_feed() {
        let source = Cursor::new(b"abcdef".to_vec());
        let mut input =
            InputBuffer::with_feed(ChunkBuffer::from_vec(vec![0; 4]), ReadFeed::new(source));
        let mut out = Vec::new();
        input.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[test]
    fn test_next_byte() {
        let mut input = InputBuffer::new(ChunkBuffer::from_vec(vec![42]), 1);
        assert_eq!(input.next_byte().unwrap(), Some(42));
        assert_eq!(input.next_byte().unwrap(), None);
    }
}
