//! Serialization filter pipeline.
//!
//! Filters run around [`MessageCodec::serialize`]: `before` sees the
//! envelope that is about to be written, `after` sees the finished frame and
//! may rewrite it through [`OutputBuffer::swap`]. Any filter may mark the
//! context as failed, which stops the pipeline and aborts the send.

use std::fmt;
use std::sync::Arc;

use super::envelope::{Envelope, MessageType};
use super::msgpack::MessageCodec;
use crate::buffer::OutputBuffer;
use crate::error::CodecError;

/// Per-frame state shared by all filters of one pipeline run.
pub struct FilterContext<'a> {
    envelope: &'a Envelope,
    error: Option<CodecError>,
}

impl<'a> FilterContext<'a> {
    fn new(envelope: &'a Envelope) -> Self {
        Self {
            envelope,
            error: None,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        self.envelope
    }

    pub fn message_type(&self) -> MessageType {
        self.envelope.message_type()
    }

    /// Stop the pipeline with `error`. The first error wins.
    pub fn fail(&mut self, error: CodecError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    fn check(&mut self) -> Result<(), CodecError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A hook around frame serialization.
pub trait SerializationFilter: Send + Sync {
    /// Runs before the envelope is written.
    fn before(&self, _ctx: &mut FilterContext<'_>) {}

    /// Runs after the frame is complete in `frame`.
    fn after(&self, _ctx: &mut FilterContext<'_>, _frame: &mut OutputBuffer) {}
}

/// An ordered list of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn SerializationFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter; filters run in insertion order.
    pub fn push(&mut self, filter: impl SerializationFilter + 'static) {
        self.filters.push(Arc::new(filter));
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run `before` filters, the codec, then `after` filters.
    pub fn serialize(&self, envelope: &Envelope, out: &mut OutputBuffer) -> Result<(), CodecError> {
        let mut ctx = FilterContext::new(envelope);
        for filter in &self.filters {
            filter.before(&mut ctx);
            ctx.check()?;
        }

        MessageCodec::serialize(envelope, out)?;

        for filter in &self.filters {
            filter.after(&mut ctx, out);
            ctx.check()?;
        }
        Ok(())
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Logs every outgoing frame at `trace` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceFilter;

impl SerializationFilter for TraceFilter {
    fn after(&self, ctx: &mut FilterContext<'_>, frame: &mut OutputBuffer) {
        let envelope = ctx.envelope();
        tracing::trace!(
            kind = %envelope.message_type(),
            id = ?envelope.id(),
            method = ?envelope.method(),
            len = frame.len(),
            chunks = frame.chunk_count(),
            "frame serialized"
        );
    }
}
