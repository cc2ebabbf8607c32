//! Envelope codec on top of `rmp` / `rmpv`.
//!
//! Frames are written straight into an [`OutputBuffer`] and read straight
//! out of an [`InputBuffer`]; neither side materializes the frame in a
//! contiguous `Vec` first.
//!
//! Typed arguments go through `rmp_serde::to_vec_named`, so structs inside
//! the argument list are encoded as maps with field names, which is what
//! dynamic-language servers expect.
//!
//! # Example
//!
//! ```
//! use msgpack_rpc_client::buffer::{BufferPool, InputBuffer, OutputBuffer};
//! use msgpack_rpc_client::codec::{Envelope, MessageCodec};
//!
//! let pool = BufferPool::recycling();
//! let mut out = OutputBuffer::new(pool.clone());
//! let args = MessageCodec::encode_args(&("hi",)).unwrap();
//! MessageCodec::serialize(&Envelope::request(7, "Echo", args), &mut out).unwrap();
//!
//! let bytes = out.to_vec();
//! let mut buffer = pool.borrow(bytes.len()).unwrap();
//! buffer.write_at(0, &bytes).unwrap();
//! let mut input = InputBuffer::new(buffer, bytes.len());
//! let frame = MessageCodec::deserialize(&mut input).unwrap();
//! assert_eq!(frame.id(), Some(7));
//! ```

use std::io::{self, Write};

use bytes::Bytes;
use rmp::encode::{self as rmp_enc, ValueWriteError};
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::envelope::{Arguments, Envelope, MessageType};
use crate::buffer::{InputBuffer, OutputBuffer, QuotaExceeded};
use crate::error::CodecError;

/// `io::Write` adapter that remembers the buffer-level failure, so quota
/// errors survive the trip through the MessagePack writer.
struct Sink<'a> {
    out: &'a mut OutputBuffer,
    failure: Option<CodecError>,
}

impl<'a> Sink<'a> {
    fn new(out: &'a mut OutputBuffer) -> Self {
        Self { out, failure: None }
    }

    fn fail(&mut self, err: impl std::fmt::Display) -> CodecError {
        self.failure
            .take()
            .unwrap_or_else(|| CodecError::Encode(err.to_string()))
    }

    fn shared(&mut self, bytes: Bytes) -> Result<(), CodecError> {
        self.out.write_shared(bytes)
    }
}

impl Write for Sink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.out.write_copy(buf) {
            Ok(()) => Ok(buf.len()),
            Err(err) => {
                let message = err.to_string();
                self.failure = Some(err);
                Err(io::Error::other(message))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// MessagePack-RPC envelope codec.
///
/// A marker struct with associated functions; it carries no state.
pub struct MessageCodec;

impl MessageCodec {
    /// Write one frame into `out`.
    ///
    /// # Errors
    ///
    /// `QuotaExceeded` if `out` has a quota and the frame does not fit;
    /// `InvalidFrame` if raw arguments are not a MessagePack array.
    pub fn serialize(envelope: &Envelope, out: &mut OutputBuffer) -> Result<(), CodecError> {
        let mut sink = Sink::new(out);
        let kind = envelope.message_type();

        write_header(&mut sink, kind)?;
        match envelope {
            Envelope::Request { id, method, args } => {
                rmp_enc::write_uint(&mut sink, u64::from(*id)).map_err(|e| fail_value(&mut sink, e))?;
                rmp_enc::write_str(&mut sink, method).map_err(|e| fail_value(&mut sink, e))?;
                write_args(&mut sink, args)?;
            }
            Envelope::Response { id, error, result } => {
                rmp_enc::write_uint(&mut sink, u64::from(*id)).map_err(|e| fail_value(&mut sink, e))?;
                rmpv::encode::write_value(&mut sink, error).map_err(|e| sink.fail(e))?;
                rmpv::encode::write_value(&mut sink, result).map_err(|e| sink.fail(e))?;
            }
            Envelope::Notification { method, args } => {
                rmp_enc::write_str(&mut sink, method).map_err(|e| fail_value(&mut sink, e))?;
                write_args(&mut sink, args)?;
            }
        }
        Ok(())
    }

    /// Read one frame from `input`.
    ///
    /// The whole MessagePack value is consumed before its shape is checked,
    /// so a structurally valid but malformed frame leaves the stream
    /// positioned at the next frame.
    ///
    /// # Errors
    ///
    /// - `Incomplete` if the input ends inside the value
    /// - `QuotaExceeded` if the input's quota was hit
    /// - `Decode` for bytes that are not MessagePack
    /// - `InvalidFrame` for wrong arity, type tag or field types
    pub fn deserialize(input: &mut InputBuffer) -> Result<Envelope, CodecError> {
        Self::from_value(Self::read_frame(input)?)
    }

    /// Read one MessagePack value without checking its envelope shape.
    pub fn read_frame(input: &mut InputBuffer) -> Result<Value, CodecError> {
        rmpv::decode::read_value(input).map_err(decode_failure)
    }

    /// Message id of a response-tagged frame, even one that is otherwise
    /// malformed.
    pub fn response_id(value: &Value) -> Option<u32> {
        let items = value.as_array()?;
        if items.first()?.as_u64()? != u64::from(MessageType::Response.tag()) {
            return None;
        }
        u32::try_from(items.get(1)?.as_u64()?).ok()
    }

    /// Validate a decoded value as an envelope.
    pub fn from_value(value: Value) -> Result<Envelope, CodecError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(CodecError::InvalidFrame(format!(
                    "frame is not an array: {}",
                    other
                )))
            }
        };
        let arity = items.len();
        if arity != 3 && arity != 4 {
            return Err(CodecError::InvalidFrame(format!(
                "frame has {} elements, expected 3 or 4",
                arity
            )));
        }

        let mut items = items.into_iter();
        let tag = items
            .next()
            .and_then(|v| v.as_u64())
            .and_then(MessageType::from_tag)
            .ok_or_else(|| CodecError::InvalidFrame("invalid message type tag".into()))?;
        if tag.arity() as usize != arity {
            return Err(CodecError::InvalidFrame(format!(
                "{} frame has {} elements, expected {}",
                tag,
                arity,
                tag.arity()
            )));
        }

        let mut next = move || items.next().unwrap_or(Value::Nil);
        let envelope = match tag {
            MessageType::Request => Envelope::Request {
                id: message_id(next())?,
                method: method_name(next())?,
                args: arguments(next())?,
            },
            MessageType::Response => Envelope::Response {
                id: message_id(next())?,
                error: next(),
                result: next(),
            },
            MessageType::Notification => Envelope::Notification {
                method: method_name(next())?,
                args: arguments(next())?,
            },
        };
        Ok(envelope)
    }

    /// Encode typed arguments as a raw MessagePack array.
    ///
    /// # Errors
    ///
    /// `InvalidFrame` if `args` does not serialize to an array (use a
    /// tuple or a `Vec`). `()` is accepted as the empty argument list.
    pub fn encode_args<T: Serialize + ?Sized>(args: &T) -> Result<Arguments, CodecError> {
        let bytes = rmp_serde::to_vec_named(args)?;
        if bytes == [rmp::Marker::Null.to_u8()] {
            return Ok(Arguments::Values(Vec::new()));
        }
        check_array_marker(&bytes)?;
        Ok(Arguments::Raw(Bytes::from(bytes)))
    }

    /// Decode a result value into `T`.
    pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T, CodecError> {
        rmpv::ext::from_value(value).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

fn write_header(sink: &mut Sink<'_>, kind: MessageType) -> Result<(), CodecError> {
    rmp_enc::write_array_len(&mut *sink, kind.arity()).map_err(|e| fail_value(sink, e))?;
    rmp_enc::write_uint(&mut *sink, u64::from(kind.tag())).map_err(|e| fail_value(sink, e))?;
    Ok(())
}

fn write_args(sink: &mut Sink<'_>, args: &Arguments) -> Result<(), CodecError> {
    match args {
        Arguments::Values(values) => {
            let len = u32::try_from(values.len())
                .map_err(|_| CodecError::Encode("too many arguments".into()))?;
            rmp_enc::write_array_len(&mut *sink, len).map_err(|e| fail_value(sink, e))?;
            for value in values {
                rmpv::encode::write_value(&mut *sink, value).map_err(|e| sink.fail(e))?;
            }
            Ok(())
        }
        Arguments::Raw(bytes) => {
            check_array_marker(bytes)?;
            sink.shared(bytes.clone())
        }
    }
}

fn fail_value(sink: &mut Sink<'_>, err: ValueWriteError) -> CodecError {
    sink.fail(err)
}

fn check_array_marker(bytes: &[u8]) -> Result<(), CodecError> {
    match bytes.first() {
        Some(0x90..=0x9f) | Some(0xdc) | Some(0xdd) => Ok(()),
        _ => Err(CodecError::InvalidFrame(
            "arguments must encode to a MessagePack array".into(),
        )),
    }
}

fn decode_failure(err: rmpv::decode::Error) -> CodecError {
    let io_err = match &err {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => e,
        _ => return CodecError::Decode(err.to_string()),
    };
    if let Some(quota) = QuotaExceeded::from_io(io_err) {
        return CodecError::QuotaExceeded { limit: quota.limit };
    }
    if io_err.kind() == io::ErrorKind::UnexpectedEof {
        return CodecError::Incomplete;
    }
    CodecError::Decode(err.to_string())
}

fn message_id(value: Value) -> Result<u32, CodecError> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| CodecError::InvalidFrame(format!("invalid message id: {}", value)))
}

fn method_name(value: Value) -> Result<String, CodecError> {
    match value {
        Value::String(s) => s
            .into_str()
            .ok_or_else(|| CodecError::InvalidFrame("method name is not UTF-8".into())),
        other => Err(CodecError::InvalidFrame(format!(
            "method name is not a string: {}",
            other
        ))),
    }
}

fn arguments(value: Value) -> Result<Arguments, CodecError> {
    match value {
        Value::Array(values) => Ok(Arguments::Values(values)),
        other => Err(CodecError::InvalidFrame(format!(
            "arguments are not an array: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, ChunkBuffer, PoolPolicy};
    use serde::Deserialize;

    fn encode(envelope: &Envelope) -> Vec<u8> {
        let mut out = OutputBuffer::new(BufferPool::new(PoolPolicy::Recycling, 16));
        MessageCodec::serialize(envelope, &mut out).unwrap();
        out.to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
        let mut input = InputBuffer::new(ChunkBuffer::from_vec(bytes.to_vec()), bytes.len());
        MessageCodec::deserialize(&mut input)
    }

    #[test]
    fn test_request_wire_bytes() {
        let frame = encode(&Envelope::request(7, "Echo", vec![Value::from("hi")]));
        assert_eq!(
            frame,
            vec![0x94, 0x00, 0x07, 0xa4, b'E', b'c', b'h', b'o', 0x91, 0xa2, b'h', b'i']
        );
    }

    #[test]
    fn test_notification_wire_bytes() {
        let args = vec![Value::from(1), Value::from(2), Value::from(3)];
        let frame = encode(&Envelope::notification("Log", args));
        assert_eq!(
            frame,
            vec![0x93, 0x02, 0xa3, b'L', b'o', b'g', 0x93, 0x01, 0x02, 0x03]
        );
    }

    #[test]
    fn test_response_decodes() {
        // [1, 7, nil, "hi"]
        let bytes = [0x94, 0x01, 0x07, 0xc0, 0xa2, b'h', b'i'];
        let frame = decode(&bytes).unwrap();
        assert_eq!(frame, Envelope::success(7, "hi"));
    }

    #[test]
    fn test_wrong_arity_is_invalid_frame() {
        // [1, 7, nil, "hi", 0]
        let bytes = [0x95, 0x01, 0x07, 0xc0, 0xa2, b'h', b'i', 0x00];
        let mut input = InputBuffer::new(ChunkBuffer::from_vec(bytes.to_vec()), bytes.len());
        let err = MessageCodec::deserialize(&mut input).unwrap_err();
        assert!(matches!(err, CodecError::InvalidFrame(_)));
        // The bad frame was consumed in full.
        assert_eq!(input.position(), bytes.len());
    }

    #[test]
    fn test_response_id_survives_bad_arity() {
        let bytes = [0x95, 0x01, 0x2a, 0xc0, 0xc0, 0x00];
        let mut input = InputBuffer::new(ChunkBuffer::from_vec(bytes.to_vec()), bytes.len());
        let value = MessageCodec::read_frame(&mut input).unwrap();
        assert_eq!(MessageCodec::response_id(&value), Some(42));

        // Requests carry an id too, but it is not a response id.
        let request = Value::Array(vec![0.into(), 42.into(), "m".into(), Value::Array(vec![])]);
        assert_eq!(MessageCodec::response_id(&request), None);
    }

    #[test]
    fn test_type_and_arity_mismatch() {
        // [2, 7, "m", []]: a notification with four elements.
        let bytes = [0x94, 0x02, 0x07, 0xa1, b'm', 0x90];
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidFrame(_))));
        // [9, 7, nil, nil]
        let bytes = [0x94, 0x09, 0x07, 0xc0, 0xc0];
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidFrame(_))));
    }

    #[test]
    fn test_id_out_of_range() {
        // [1, 2^32, nil, nil]
        let bytes = [0x94, 0x01, 0xcf, 0, 0, 0, 1, 0, 0, 0, 0, 0xc0, 0xc0];
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidFrame(_))));
    }

    #[test]
    fn test_truncated_frame_is_incomplete() {
        let frame = encode(&Envelope::success(3, "a longer result"));
        for cut in 0..frame.len() {
            let err = decode(&frame[..cut]).unwrap_err();
            assert!(err.is_incomplete(), "cut at {} gave {:?}", cut, err);
        }
    }

    #[test]
    fn test_input_quota() {
        let frame = encode(&Envelope::success(3, "x".repeat(100)));
        let mut input =
            InputBuffer::new(ChunkBuffer::from_vec(frame.clone()), frame.len()).quota(32);
        assert!(matches!(
            MessageCodec::deserialize(&mut input),
            Err(CodecError::QuotaExceeded { limit: 32 })
        ));
    }

    #[test]
    fn test_output_quota() {
        let mut out = OutputBuffer::new(BufferPool::recycling()).with_quota(16);
        let envelope = Envelope::request(1, "method", vec![Value::from("x".repeat(64))]);
        assert!(matches!(
            MessageCodec::serialize(&envelope, &mut out),
            Err(CodecError::QuotaExceeded { limit: 16 })
        ));
    }

    #[test]
    fn test_typed_args_are_zero_copy() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
            y: i32,
        }

        let args = MessageCodec::encode_args(&(Point { x: 1, y: 2 }, "label")).unwrap();
        let Arguments::Raw(raw) = &args else {
            panic!("expected raw arguments");
        };

        let mut out = OutputBuffer::new(BufferPool::recycling());
        MessageCodec::serialize(&Envelope::request(1, "Plot", args.clone()), &mut out).unwrap();
        let view = out.as_slice();
        assert!(view.parts().iter().any(|part| part.as_ptr() == raw.as_ptr()));

        // The struct went out as a map.
        let decoded = decode(&out.to_vec()).unwrap();
        let Envelope::Request { args, .. } = decoded else {
            panic!("expected request");
        };
        let values = args.to_values().unwrap();
        assert!(values[0].is_map());
    }

    #[test]
    fn test_unit_args_are_empty() {
        assert!(matches!(
            MessageCodec::encode_args(&()),
            Ok(Arguments::Values(values)) if values.is_empty()
        ));
    }

    #[test]
    fn test_scalar_args_rejected() {
        assert!(matches!(
            MessageCodec::encode_args(&42),
            Err(CodecError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_decode_value() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Reply {
            ok: bool,
        }

        let value = Value::Map(vec![(Value::from("ok"), Value::from(true))]);
        let reply: Reply = MessageCodec::decode_value(value).unwrap();
        assert_eq!(reply, Reply { ok: true });

        let err = MessageCodec::decode_value::<u32>(Value::from("nope")).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_reserved_marker_is_not_an_envelope() {
        // rmpv reads the unused 0xc1 marker as nil. Streams reject it
        // earlier, while scanning for the frame boundary.
        let mut input = InputBuffer::new(ChunkBuffer::from_vec(vec![0xc1]), 1);
        assert_eq!(MessageCodec::read_frame(&mut input).unwrap(), Value::Nil);
        assert!(matches!(decode(&[0xc1]), Err(CodecError::InvalidFrame(_))));
    }
}
