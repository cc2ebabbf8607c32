//! Frame extraction from received bytes.
//!
//! A stream carries frames back to back with no length prefix. The framer
//! measures the frame boundary incrementally: it walks item headers as bytes
//! arrive, skipping over payloads, and keeps its place between reads. Only a
//! complete frame is decoded, once. A datagram carries exactly one frame.
//!
//! Received buffers are appended segment by segment; nothing is copied into
//! a contiguous staging area.

use rmp::Marker;
use rmpv::Value;

use crate::buffer::{ChunkBuffer, InputBuffer};
use crate::codec::MessageCodec;
use crate::error::{CodecError, Result};

/// Longest item header: ext32 marker, four length bytes and the type byte.
const MAX_HEADER: usize = 6;

/// Accumulates stream bytes and yields complete frames.
pub(crate) struct StreamFramer {
    pending: ChunkBuffer,
    max_frame: usize,
    /// Offset of the next unmeasured item of the current frame. May run
    /// past the buffered bytes while a payload is still arriving.
    cursor: u64,
    /// Items still missing from the current frame.
    items: u64,
}

impl StreamFramer {
    pub(crate) fn new(max_frame: usize) -> Self {
        Self {
            pending: ChunkBuffer::empty(),
            max_frame,
            cursor: 0,
            items: 1,
        }
    }

    /// Queue received bytes behind the ones already buffered.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `data` comes from another pool than the
    /// bytes already buffered.
    pub(crate) fn push(&mut self, data: ChunkBuffer) -> Result<()> {
        self.pending.append(data)
    }

    /// Bytes received but not yet part of a complete frame.
    pub(crate) fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Extract the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A frame that decodes
    /// as MessagePack is consumed even if the caller later rejects its
    /// shape, so the stream stays aligned.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` when a frame grows past the limit, `Decode` when the
    /// bytes are not MessagePack. Both leave the stream unusable.
    pub(crate) fn next_frame(&mut self) -> std::result::Result<Option<Value>, CodecError> {
        let Some(len) = self.measure()? else {
            return Ok(None);
        };
        let frame = self
            .pending
            .split_to(len)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        self.cursor = 0;
        self.items = 1;
        let mut input = InputBuffer::new(frame, len);
        MessageCodec::read_frame(&mut input).map(Some)
    }

    /// Walk item headers over the buffered bytes, resuming where the last
    /// call stopped. Returns the frame length once the frame is complete.
    fn measure(&mut self) -> std::result::Result<Option<usize>, CodecError> {
        let available = self.pending.len() as u64;
        if self.items > 0 && self.cursor < available {
            let mut reader = Cursor::new(&self.pending, self.cursor);
            let mut head = [0u8; MAX_HEADER];
            while self.items > 0 && self.cursor < available {
                let filled = reader.peek(&mut head);
                let Some(header) = parse_header(&head[..filled])? else {
                    break;
                };
                let step = header.len + header.payload;
                self.cursor += step;
                self.items = self.items - 1 + header.children;
                self.check_quota()?;
                reader.skip(step);
            }
        }
        if self.items == 0 && self.cursor <= available {
            Ok(Some(self.cursor as usize))
        } else {
            Ok(None)
        }
    }

    fn check_quota(&self) -> std::result::Result<(), CodecError> {
        // Every missing item needs at least one more byte.
        if self.cursor.saturating_add(self.items) > self.max_frame as u64 {
            return Err(CodecError::QuotaExceeded {
                limit: self.max_frame,
            });
        }
        Ok(())
    }
}

/// Shape of one item header.
struct Header {
    /// Marker plus length and type bytes.
    len: u64,
    /// Bytes that follow the header.
    payload: u64,
    /// Nested items the header opens.
    children: u64,
}

impl Header {
    fn scalar(payload: u64) -> Self {
        Self {
            len: 1,
            payload,
            children: 0,
        }
    }

    fn container(children: u64) -> Self {
        Self {
            len: 1,
            payload: 0,
            children,
        }
    }
}

enum Body {
    Bytes,
    Ext,
    Items(u64),
}

/// Parse the header at the start of `head`, or `None` when it is cut short.
fn parse_header(head: &[u8]) -> std::result::Result<Option<Header>, CodecError> {
    let Some(&first) = head.first() else {
        return Ok(None);
    };
    let header = match Marker::from_u8(first) {
        Marker::FixPos(_) | Marker::FixNeg(_) | Marker::Null | Marker::True | Marker::False => {
            Header::scalar(0)
        }
        Marker::U8 | Marker::I8 => Header::scalar(1),
        Marker::U16 | Marker::I16 => Header::scalar(2),
        Marker::U32 | Marker::I32 | Marker::F32 => Header::scalar(4),
        Marker::U64 | Marker::I64 | Marker::F64 => Header::scalar(8),
        Marker::FixStr(len) => Header::scalar(u64::from(len)),
        Marker::FixArray(len) => Header::container(u64::from(len)),
        Marker::FixMap(len) => Header::container(2 * u64::from(len)),
        Marker::FixExt1 => Header::scalar(2),
        Marker::FixExt2 => Header::scalar(3),
        Marker::FixExt4 => Header::scalar(5),
        Marker::FixExt8 => Header::scalar(9),
        Marker::FixExt16 => Header::scalar(17),
        Marker::Str8 | Marker::Bin8 => return Ok(sized(head, 1, Body::Bytes)),
        Marker::Str16 | Marker::Bin16 => return Ok(sized(head, 2, Body::Bytes)),
        Marker::Str32 | Marker::Bin32 => return Ok(sized(head, 4, Body::Bytes)),
        Marker::Ext8 => return Ok(sized(head, 1, Body::Ext)),
        Marker::Ext16 => return Ok(sized(head, 2, Body::Ext)),
        Marker::Ext32 => return Ok(sized(head, 4, Body::Ext)),
        Marker::Array16 => return Ok(sized(head, 2, Body::Items(1))),
        Marker::Array32 => return Ok(sized(head, 4, Body::Items(1))),
        Marker::Map16 => return Ok(sized(head, 2, Body::Items(2))),
        Marker::Map32 => return Ok(sized(head, 4, Body::Items(2))),
        Marker::Reserved => {
            return Err(CodecError::Decode(format!(
                "reserved marker {:#04x}",
                first
            )))
        }
    };
    Ok(Some(header))
}

/// Header with a big-endian length of `width` bytes after the marker.
fn sized(head: &[u8], width: usize, body: Body) -> Option<Header> {
    let extra = if matches!(body, Body::Ext) { 1 } else { 0 };
    let len_bytes = head.get(1..1 + width)?;
    if head.len() < 1 + width + extra {
        return None;
    }
    let length = len_bytes
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    let len = (1 + width + extra) as u64;
    Some(match body {
        Body::Bytes | Body::Ext => Header {
            len,
            payload: length,
            children: 0,
        },
        Body::Items(per_entry) => Header {
            len,
            payload: 0,
            children: length * per_entry,
        },
    })
}

/// Forward-only position over the segments of a buffer.
struct Cursor<'a> {
    buffer: &'a ChunkBuffer,
    index: usize,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(buffer: &'a ChunkBuffer, position: u64) -> Self {
        let mut cursor = Self {
            buffer,
            index: 0,
            offset: 0,
        };
        cursor.skip(position);
        cursor
    }

    /// Copy bytes ahead without moving. Returns how many were available.
    fn peek(&self, dst: &mut [u8]) -> usize {
        let (mut index, mut offset) = (self.index, self.offset);
        let mut filled = 0;
        while filled < dst.len() && index < self.buffer.segment_count() {
            let segment = self.buffer.segment(index);
            let n = (segment.len() - offset).min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&segment[offset..offset + n]);
            filled += n;
            offset += n;
            if offset == segment.len() {
                index += 1;
                offset = 0;
            }
        }
        filled
    }

    /// Move ahead by `n` bytes, stopping at the end of the buffer.
    fn skip(&mut self, mut n: u64) {
        while n > 0 && self.index < self.buffer.segment_count() {
            let left = self.buffer.segment(self.index).len() - self.offset;
            if n < left as u64 {
                self.offset += n as usize;
                return;
            }
            n -= left as u64;
            self.index += 1;
            self.offset = 0;
        }
    }
}

/// Decode one datagram as exactly one frame.
pub(crate) fn datagram_frame(
    data: ChunkBuffer,
    max_frame: usize,
) -> std::result::Result<Value, CodecError> {
    if data.len() > max_frame {
        return Err(CodecError::QuotaExceeded { limit: max_frame });
    }
    let mut framer = StreamFramer::new(max_frame);
    framer.pending = data;
    let value = framer
        .next_frame()?
        .ok_or_else(|| CodecError::InvalidFrame("datagram ends inside a frame".into()))?;
    if framer.buffered() > 0 {
        tracing::warn!(
            trailing = framer.buffered(),
            "ignoring bytes after the frame in a datagram"
        );
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, OutputBuffer, PoolPolicy};
    use crate::codec::Envelope;

    fn encode(envelope: &Envelope) -> Vec<u8> {
        let mut out = OutputBuffer::new(BufferPool::recycling());
        MessageCodec::serialize(envelope, &mut out).unwrap();
        out.to_vec()
    }

    fn chunk(pool: &BufferPool, bytes: &[u8]) -> ChunkBuffer {
        let mut buffer = pool.borrow(bytes.len()).unwrap();
        buffer.write_at(0, bytes).unwrap();
        buffer
    }

    #[test]
    fn test_frames_split_across_reads() {
        let pool = BufferPool::new(PoolPolicy::Recycling, 8);
        let mut wire = encode(&Envelope::success(1, "first"));
        wire.extend(encode(&Envelope::success(2, "second")));

        let mut framer = StreamFramer::new(1024);
        let mut frames = Vec::new();
        for piece in wire.chunks(3) {
            framer.push(chunk(&pool, piece)).unwrap();
            while let Some(value) = framer.next_frame().unwrap() {
                frames.push(MessageCodec::from_value(value).unwrap());
            }
        }

        assert_eq!(
            frames,
            vec![Envelope::success(1, "first"), Envelope::success(2, "second")]
        );
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let pool = BufferPool::recycling();
        let mut wire = Vec::new();
        for id in 0..5 {
            wire.extend(encode(&Envelope::success(id, id)));
        }
        let mut framer = StreamFramer::new(1024);
        framer.push(chunk(&pool, &wire)).unwrap();

        let mut ids = Vec::new();
        while let Some(value) = framer.next_frame().unwrap() {
            ids.push(MessageCodec::response_id(&value).unwrap());
        }
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_partial_frame_waits() {
        let pool = BufferPool::recycling();
        let wire = encode(&Envelope::success(9, "payload"));
        let mut framer = StreamFramer::new(1024);
        framer.push(chunk(&pool, &wire[..wire.len() - 1])).unwrap();
        assert!(framer.next_frame().unwrap().is_none());
        assert_eq!(framer.buffered(), wire.len() - 1);

        framer.push(chunk(&pool, &wire[wire.len() - 1..])).unwrap();
        assert!(framer.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_large_frame_in_small_reads() {
        let pool = BufferPool::new(PoolPolicy::Recycling, 32 * 1024);
        let blob = Value::Binary(vec![0xab; 4 * 1024 * 1024]);
        let nested = Value::Array(vec![blob.clone(), Value::from("tail")]);
        let wire = encode(&Envelope::success(11, nested.clone()));
        let mut framer = StreamFramer::new(8 * 1024 * 1024);

        let pieces: Vec<&[u8]> = wire.chunks(32 * 1024).collect();
        let (last, head) = pieces.split_last().unwrap();
        for piece in head {
            framer.push(chunk(&pool, piece)).unwrap();
            assert!(framer.next_frame().unwrap().is_none());
        }
        // The blob was measured from its header alone.
        assert!(framer.cursor > 4 * 1024 * 1024);

        framer.push(chunk(&pool, last)).unwrap();
        let value = framer.next_frame().unwrap().unwrap();
        assert_eq!(
            MessageCodec::from_value(value).unwrap(),
            Envelope::success(11, nested)
        );
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_quota_applies_before_payload_arrives() {
        let pool = BufferPool::recycling();
        let wire = encode(&Envelope::success(1, Value::Binary(vec![0; 4096])));
        let mut framer = StreamFramer::new(1024);
        // The bin16 header alone declares more than the limit.
        framer.push(chunk(&pool, &wire[..16])).unwrap();
        assert!(matches!(
            framer.next_frame(),
            Err(CodecError::QuotaExceeded { limit: 1024 })
        ));
    }

    #[test]
    fn test_malformed_envelope_keeps_alignment() {
        let pool = BufferPool::recycling();
        // [1, 5, nil, nil, 0] then a valid response.
        let mut wire = vec![0x95, 0x01, 0x05, 0xc0, 0xc0, 0x00];
        wire.extend(encode(&Envelope::success(6, "ok")));
        let mut framer = StreamFramer::new(1024);
        framer.push(chunk(&pool, &wire)).unwrap();

        let bad = framer.next_frame().unwrap().unwrap();
        assert!(MessageCodec::from_value(bad).is_err());
        let good = framer.next_frame().unwrap().unwrap();
        assert_eq!(
            MessageCodec::from_value(good).unwrap(),
            Envelope::success(6, "ok")
        );
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let pool = BufferPool::recycling();
        let wire = encode(&Envelope::success(1, "x".repeat(100)));
        let mut framer = StreamFramer::new(32);
        framer.push(chunk(&pool, &wire)).unwrap();
        assert!(matches!(
            framer.next_frame(),
            Err(CodecError::QuotaExceeded { limit: 32 })
        ));
    }

    #[test]
    fn test_reserved_marker_is_decode_error() {
        let pool = BufferPool::recycling();
        let mut framer = StreamFramer::new(1024);
        framer.push(chunk(&pool, &[0xc1])).unwrap();
        assert!(matches!(framer.next_frame(), Err(CodecError::Decode(_))));

        // Nested inside a response as well.
        let mut framer = StreamFramer::new(1024);
        framer
            .push(chunk(&pool, &[0x94, 0x01, 0x02, 0xc0, 0xc1]))
            .unwrap();
        assert!(matches!(framer.next_frame(), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_push_from_other_pool_rejected() {
        let ours = BufferPool::recycling();
        let theirs = BufferPool::recycling();
        let mut framer = StreamFramer::new(1024);
        framer.push(chunk(&ours, &[0x94])).unwrap();
        assert!(framer.push(chunk(&theirs, &[0x01])).is_err());
        assert_eq!(framer.buffered(), 1);
        assert_eq!(theirs.stats().leased_bytes, 0);
    }

    #[test]
    fn test_datagram_frame() {
        let pool = BufferPool::recycling();
        let wire = encode(&Envelope::success(3, "dgram"));
        let value = datagram_frame(chunk(&pool, &wire), 1024).unwrap();
        assert_eq!(MessageCodec::response_id(&value), Some(3));

        let truncated = datagram_frame(chunk(&pool, &wire[..4]), 1024);
        assert!(matches!(truncated, Err(CodecError::InvalidFrame(_))));

        let oversized = datagram_frame(chunk(&pool, &wire), 4);
        assert!(matches!(oversized, Err(CodecError::QuotaExceeded { limit: 4 })));
    }
}
