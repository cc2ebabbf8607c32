//! Socket operation contexts.
//!
//! A [`SocketOperation`] carries one connect, send or receive through its
//! lifecycle:
//!
//! ```text
//! Idle ─► Issued ─┬─► CompletedSynchronously  ─┬─► Dispatched
//!                 └─► CompletedAsynchronously ─┘
//! ```
//!
//! The operation owns its buffer for as long as it is in flight, so no
//! other component can touch the bytes until the completion is dispatched.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::buffer::{ChunkBuffer, OutputBuffer};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle of a socket registered with an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Connect,
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Issued,
    CompletedSynchronously,
    CompletedAsynchronously,
    Dispatched,
}

/// The transport-level context an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationContext {
    Connecting,
    /// Sequence number of the outbound batch.
    Sending(u64),
    Receiving,
}

/// One pending connect, send or receive.
pub struct SocketOperation {
    id: u64,
    socket: SocketId,
    kind: OperationKind,
    state: OperationState,
    remote: Option<SocketAddr>,
    frames: Vec<OutputBuffer>,
    target: Option<ChunkBuffer>,
    transferred: usize,
    last_error: Option<io::Error>,
    context: Option<OperationContext>,
}

impl SocketOperation {
    fn new(socket: SocketId, kind: OperationKind) -> Self {
        Self {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            socket,
            kind,
            state: OperationState::Idle,
            remote: None,
            frames: Vec::new(),
            target: None,
            transferred: 0,
            last_error: None,
            context: None,
        }
    }

    pub fn connect(socket: SocketId, remote: SocketAddr) -> Self {
        let mut op = Self::new(socket, OperationKind::Connect);
        op.remote = Some(remote);
        op
    }

    /// Send `frames` back to back. Datagram sockets send one frame per
    /// operation.
    pub fn send(socket: SocketId, frames: Vec<OutputBuffer>) -> Self {
        let mut op = Self::new(socket, OperationKind::Send);
        op.frames = frames;
        op
    }

    /// Receive into `target`. The first segment is filled.
    pub fn receive(socket: SocketId, target: ChunkBuffer) -> Self {
        let mut op = Self::new(socket, OperationKind::Receive);
        op.target = Some(target);
        op
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn socket(&self) -> SocketId {
        self.socket
    }

    #[inline]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    #[inline]
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn last_error(&self) -> Option<&io::Error> {
        self.last_error.as_ref()
    }

    /// Whether the completion ran inline on the issuing call.
    pub fn completed_synchronously(&self) -> bool {
        self.state == OperationState::CompletedSynchronously
    }

    /// Attach the transport-level context. The slot is one-shot.
    pub fn attach(&mut self, context: OperationContext) -> Result<(), OperationContext> {
        if self.context.is_some() {
            return Err(context);
        }
        self.context = Some(context);
        Ok(())
    }

    pub fn context(&self) -> Option<OperationContext> {
        self.context
    }

    pub(crate) fn mark_issued(&mut self) {
        debug_assert_eq!(self.state, OperationState::Idle);
        self.state = OperationState::Issued;
    }

    /// Record the outcome. Send and receive results count bytes.
    pub(crate) fn complete(&mut self, result: io::Result<usize>, synchronously: bool) {
        debug_assert_eq!(self.state, OperationState::Issued);
        match result {
            Ok(n) => self.transferred = n,
            Err(err) => self.last_error = Some(err),
        }
        self.state = if synchronously {
            OperationState::CompletedSynchronously
        } else {
            OperationState::CompletedAsynchronously
        };
    }

    pub(crate) fn mark_dispatched(&mut self) {
        debug_assert!(matches!(
            self.state,
            OperationState::CompletedSynchronously | OperationState::CompletedAsynchronously
        ));
        self.state = OperationState::Dispatched;
    }

    /// Take the error, leaving the operation successful.
    pub fn take_error(&mut self) -> Option<io::Error> {
        self.last_error.take()
    }

    /// Total bytes to send.
    pub fn send_len(&self) -> usize {
        self.frames.iter().map(OutputBuffer::len).sum()
    }

    /// Slices of the send payload after the first `skip` bytes.
    pub(crate) fn send_slices(&self, skip: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::new();
        let mut base = 0;
        for frame in &self.frames {
            let end = base + frame.len();
            if skip < end {
                slices.extend(frame.remaining_slices(skip.saturating_sub(base)));
            }
            base = end;
        }
        slices
    }

    /// The first frame as one contiguous datagram.
    pub(crate) fn datagram(&self) -> Cow<'_, [u8]> {
        match self.frames.first() {
            Some(frame) => {
                let view = frame.as_slice();
                match view.parts() {
                    [single] => Cow::Borrowed(*single),
                    _ => Cow::Owned(view.to_vec()),
                }
            }
            None => Cow::Borrowed(&[]),
        }
    }

    /// Give the sent frames back for reuse or drop.
    pub fn take_frames(&mut self) -> Vec<OutputBuffer> {
        std::mem::take(&mut self.frames)
    }

    /// The receive target's first segment.
    pub(crate) fn receive_slice(&mut self) -> Option<&mut [u8]> {
        self.target.as_mut()?.segments_mut().next()
    }

    /// The received bytes, truncated to what was transferred.
    pub fn take_received(&mut self) -> Option<ChunkBuffer> {
        let mut buffer = self.target.take()?;
        buffer.truncate(self.transferred);
        Some(buffer)
    }
}

impl fmt::Debug for SocketOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOperation")
            .field("id", &self.id)
            .field("socket", &self.socket)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("transferred", &self.transferred)
            .field("error", &self.last_error)
            .field("context", &self.context)
            .finish()
    }
}

/// Shared cancellation flag, checked before every new operation.
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.flag.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Typed completion handlers.
pub trait CompletionHandler {
    fn on_connect(&mut self, op: SocketOperation);
    fn on_send(&mut self, op: SocketOperation);
    fn on_receive(&mut self, op: SocketOperation);
}

/// Route a completed operation to its typed handler.
pub fn dispatch<H: CompletionHandler + ?Sized>(mut op: SocketOperation, handler: &mut H) {
    op.mark_dispatched();
    match op.kind() {
        OperationKind::Connect => handler.on_connect(op),
        OperationKind::Send => handler.on_send(op),
        OperationKind::Receive => handler.on_receive(op),
    }
}
