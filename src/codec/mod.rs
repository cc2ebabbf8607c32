//! Codec module - framing of the MessagePack-RPC envelope.
//!
//! - [`Envelope`] - the request / response / notification frame
//! - [`MessageCodec`] - writes frames into an [`OutputBuffer`](crate::buffer::OutputBuffer)
//!   and reads them out of an [`InputBuffer`](crate::buffer::InputBuffer)
//! - [`FilterChain`] - hooks that run around serialization
//!
//! # Design
//!
//! The codec is a marker struct with associated functions rather than a
//! trait object; frames are small and the codec holds no state.

mod envelope;
mod filter;
mod msgpack;

pub use envelope::{Arguments, Envelope, MessageType};
pub use filter::{FilterChain, FilterContext, SerializationFilter, TraceFilter};
pub use msgpack::MessageCodec;
