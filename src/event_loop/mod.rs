//! Event loops: where socket operations are issued and completed.
//!
//! Both backends implement [`EventLoop`]:
//!
//! - [`CompletionLoop`] runs pending operations as tokio tasks. This is the
//!   default.
//! - [`PollingLoop`] owns a `mio::Poll` on a dedicated thread and retries
//!   pending operations on readiness.
//!
//! `issue` first attempts the operation without blocking. When it succeeds
//! right away the completed operation is handed back to the caller
//! ([`Issued::Completed`]); otherwise it is delivered later on the socket's
//! completion channel. Callers must handle both paths the same way.

mod completion;
mod operation;
mod polling;

use std::io;
use std::net::Shutdown;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{EventLoopKind, TransportKind};
use crate::error::Result;

pub use completion::CompletionLoop;
pub use operation::{
    dispatch, Cancellation, CompletionHandler, OperationContext, OperationKind, OperationState,
    SocketId, SocketOperation,
};
pub use polling::PollingLoop;

/// Channel on which asynchronously completed operations arrive.
pub type CompletionSender = mpsc::UnboundedSender<SocketOperation>;

/// Receiving side of [`CompletionSender`].
pub type CompletionReceiver = mpsc::UnboundedReceiver<SocketOperation>;

/// Outcome of [`EventLoop::issue`].
#[derive(Debug)]
pub enum Issued {
    /// In flight; the completion arrives on the socket's channel.
    Pending,
    /// Finished inline.
    Completed(SocketOperation),
    /// The loop is cancelled; the operation was not started.
    Cancelled(SocketOperation),
}

/// A socket I/O backend.
pub trait EventLoop: Send + Sync {
    /// Reserve a socket slot. Completions for it are sent to `completions`.
    fn register(&self, transport: TransportKind, completions: CompletionSender) -> Result<SocketId>;

    /// Start an operation.
    fn issue(&self, op: SocketOperation) -> Issued;

    /// Shut down one or both directions of a connected socket.
    fn shutdown(&self, socket: SocketId, how: Shutdown) -> io::Result<()>;

    /// Drop the socket and its slot. Operations still pending are discarded.
    fn release(&self, socket: SocketId);

    /// The loop-wide cancellation flag.
    fn cancellation(&self) -> &Cancellation;

    /// Cancel and stop the loop. Pending operations are abandoned.
    fn dispose(&self);
}

/// Create the configured backend.
///
/// The completion backend needs a tokio runtime on the current thread.
pub fn create(kind: EventLoopKind) -> Result<Arc<dyn EventLoop>> {
    match kind {
        EventLoopKind::Completion => Ok(Arc::new(CompletionLoop::new()?)),
        EventLoopKind::Polling => Ok(Arc::new(PollingLoop::new()?)),
    }
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is not connected")
}

pub(crate) fn interrupted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "event loop disposed")
}
