//! Pooled, segmented byte buffers.
//!
//! - [`Segment`]: a contiguous region of an arena
//! - [`ChunkBuffer`]: an ordered list of segments viewed as one buffer
//! - [`BufferPool`]: arena allocator with an optional recycling free list
//! - [`InputBuffer`] / [`OutputBuffer`]: the codec's byte source and sink

mod chunk;
mod input;
mod output;
mod pool;
mod segment;

pub use chunk::{ChunkBuffer, ChunkSlice};
pub use input::{Feed, InputBuffer, QuotaExceeded, ReadFeed};
pub use output::OutputBuffer;
pub use pool::{BufferPool, PoolPolicy, PoolStats, DEFAULT_CHUNK_SIZE};
pub use segment::Segment;
