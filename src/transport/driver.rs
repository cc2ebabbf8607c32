//! Per-connection driver task.
//!
//! The driver owns the socket's side of the connection: it issues every
//! socket operation, and every completion, whether it ran inline or
//! arrived on the completion channel, goes through the one [`dispatch`]
//! function. Inline completions are queued and handled by [`Driver::pump`]
//! in a loop, never by recursion, so a handler never runs inside the call
//! that issued its operation.
//!
//! ```text
//! Transport::send ─► commands ─┐
//!                               ├─► Driver ─► EventLoop ─► socket
//! EventLoop ─► completions ────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::framing::{datagram_frame, StreamFramer};
use super::TransportEvent;
use crate::buffer::{BufferPool, OutputBuffer};
use crate::codec::{Envelope, MessageCodec};
use crate::config::{Settings, TransportKind};
use crate::error::{RemoteError, Result, RpcError};
use crate::event_loop::{
    dispatch, CompletionHandler, CompletionReceiver, EventLoop, Issued, OperationContext,
    SocketId, SocketOperation,
};
use crate::session::SessionTable;

/// Maximum frames written by one stream send.
const MAX_BATCH_SIZE: usize = 64;

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    /// Closing: no new sends, waiting for pending calls.
    Draining,
    Closed,
}

impl ConnectionState {
    /// Whether socket operations may still be issued.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Draining)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State visible to both the transport handle and the driver.
pub(crate) struct Shared {
    state: Mutex<ConnectionState>,
    /// Why the connection closed, when it did not close on request.
    terminal: Mutex<Option<RpcError>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Unconnected),
            terminal: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!(from = %*state, to = %next, "connection state");
            *state = next;
        }
    }

    /// `Connected -> Draining`. Returns false from any other state.
    pub(crate) fn begin_draining(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connected {
            return false;
        }
        tracing::debug!(from = %*state, to = %ConnectionState::Draining, "connection state");
        *state = ConnectionState::Draining;
        true
    }

    fn set_terminal(&self, error: RpcError) {
        let mut terminal = self.terminal.lock();
        if terminal.is_none() {
            *terminal = Some(error);
        }
    }

    /// The error returned to operations attempted after close.
    pub(crate) fn closed_error(&self) -> RpcError {
        match &*self.terminal.lock() {
            Some(error) => error.duplicate(),
            None => RpcError::Disposed,
        }
    }
}

/// Who is waiting on an outbound frame.
pub(crate) enum SendTarget {
    /// A request; its outcome arrives through the session table.
    Call(u32),
    /// A notification, completed when the bytes are written.
    Notify(oneshot::Sender<Result<()>>),
}

pub(crate) struct Outbound {
    pub(crate) frame: OutputBuffer,
    pub(crate) target: SendTarget,
}

pub(crate) enum Command {
    Send(Outbound),
    Close(oneshot::Sender<()>),
}

struct InFlight {
    batch: u64,
    targets: Vec<SendTarget>,
}

/// How a loop-wide error is escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    /// Dropped with a warning when nobody observes it.
    Recoverable,
    /// Fatal when nobody observes it.
    Escalating,
    /// Always closes the connection.
    Fatal,
}

/// Handles shared between a transport and its driver.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) shared: Arc<Shared>,
    pub(crate) sessions: Arc<SessionTable>,
    pub(crate) events: broadcast::Sender<TransportEvent>,
    pub(crate) pool: BufferPool,
}

pub(crate) struct Driver {
    socket: SocketId,
    event_loop: Arc<dyn EventLoop>,
    transport: TransportKind,
    link: Link,
    receive_size: usize,
    /// Serves receive buffers; sized for whole datagrams on UDP.
    receive_pool: BufferPool,
    max_response: usize,
    framer: StreamFramer,
    queue: VecDeque<Outbound>,
    in_flight: Option<InFlight>,
    next_batch: u64,
    receiving: bool,
    /// Operations that completed inline, waiting for dispatch.
    ready: VecDeque<SocketOperation>,
    connected: Option<oneshot::Sender<Result<()>>>,
    closing: bool,
    close_acks: Vec<oneshot::Sender<()>>,
}

impl Driver {
    pub(crate) fn new(
        socket: SocketId,
        event_loop: Arc<dyn EventLoop>,
        settings: &Settings,
        link: Link,
        connected: oneshot::Sender<Result<()>>,
    ) -> Self {
        let receive_size = match settings.transport {
            TransportKind::Tcp => settings.chunk_size,
            // One extra byte makes an oversized datagram detectable.
            TransportKind::Udp => settings.max_response_length.min(MAX_DATAGRAM) + 1,
        };
        let receive_pool = receive_pool(&link.pool, receive_size);
        Self {
            socket,
            event_loop,
            transport: settings.transport,
            link,
            receive_size,
            receive_pool,
            max_response: settings.max_response_length,
            framer: StreamFramer::new(settings.max_response_length),
            queue: VecDeque::new(),
            in_flight: None,
            next_batch: 0,
            receiving: false,
            ready: VecDeque::new(),
            connected: Some(connected),
            closing: false,
            close_acks: Vec::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        remote: SocketAddr,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: CompletionReceiver,
    ) {
        tracing::debug!(%remote, transport = ?self.transport, "driver started");
        self.link.shared.set_state(ConnectionState::Connecting);
        self.issue(
            SocketOperation::connect(self.socket, remote),
            OperationContext::Connecting,
        );

        let mut accepting = true;
        loop {
            self.pump();
            if self.link.shared.state() == ConnectionState::Closed {
                break;
            }
            tokio::select! {
                op = completions.recv() => match op {
                    Some(op) => dispatch(op, &mut self),
                    None => self.fail(RpcError::Disposed),
                },
                command = commands.recv(), if accepting => match command {
                    Some(Command::Send(outbound)) => self.queue.push_back(outbound),
                    Some(Command::Close(ack)) => self.begin_close(Some(ack)),
                    None => {
                        accepting = false;
                        self.begin_close(None);
                    }
                },
            }
        }

        // Anything that slipped in after the close is refused.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::Send(outbound) => self.refuse(outbound.target),
                Command::Close(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        tracing::debug!(%remote, "driver stopped");
    }

    /// Dispatch inline completions and start whatever I/O is now possible,
    /// until neither produces more work.
    fn pump(&mut self) {
        loop {
            self.start_io();
            match self.ready.pop_front() {
                Some(op) => dispatch(op, self),
                None => break,
            }
        }
        if self.closing
            && self.in_flight.is_none()
            && (self.queue.is_empty() || !self.link.shared.state().is_open())
            && self.link.shared.state() != ConnectionState::Closed
        {
            self.finish();
        }
    }

    fn start_io(&mut self) {
        if !self.link.shared.state().is_open() {
            return;
        }
        if self.in_flight.is_none() && !self.queue.is_empty() {
            self.start_send();
        }
        if !self.receiving && self.link.shared.state().is_open() {
            self.start_receive();
        }
    }

    fn start_send(&mut self) {
        let count = match self.transport {
            TransportKind::Tcp => self.queue.len().min(MAX_BATCH_SIZE),
            TransportKind::Udp => 1,
        };
        let mut frames = Vec::with_capacity(count);
        let mut targets = Vec::with_capacity(count);
        for outbound in self.queue.drain(..count) {
            frames.push(outbound.frame);
            targets.push(outbound.target);
        }

        let batch = self.next_batch;
        self.next_batch += 1;
        self.in_flight = Some(InFlight { batch, targets });
        self.issue(
            SocketOperation::send(self.socket, frames),
            OperationContext::Sending(batch),
        );
    }

    fn start_receive(&mut self) {
        let target = match self.receive_pool.borrow(self.receive_size) {
            Ok(buffer) => buffer,
            Err(e) => return self.fail(e),
        };
        self.receiving = true;
        self.issue(
            SocketOperation::receive(self.socket, target),
            OperationContext::Receiving,
        );
    }

    fn issue(&mut self, mut op: SocketOperation, context: OperationContext) {
        let attached = op.attach(context);
        debug_assert!(attached.is_ok(), "operation attached twice");
        match self.event_loop.issue(op) {
            Issued::Pending => {}
            Issued::Completed(op) => self.ready.push_back(op),
            Issued::Cancelled(op) => {
                tracing::debug!(kind = ?op.kind(), "operation cancelled before issue");
                self.fail(RpcError::Disposed);
            }
        }
    }

    fn begin_close(&mut self, ack: Option<oneshot::Sender<()>>) {
        self.closing = true;
        self.close_acks.extend(ack);
    }

    /// Fail everything and close because of `error`.
    fn fail(&mut self, error: RpcError) {
        if self.link.shared.state() == ConnectionState::Closed {
            return;
        }
        tracing::debug!(%error, "closing connection");
        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Err(error.duplicate()));
        }
        let failed = self.link.sessions.fail_all(&error);
        if failed > 0 {
            tracing::debug!(failed, "failed pending calls");
        }

        let mut targets = self
            .in_flight
            .take()
            .map(|in_flight| in_flight.targets)
            .unwrap_or_default();
        targets.extend(self.queue.drain(..).map(|outbound| outbound.target));
        for target in targets {
            if let SendTarget::Notify(done) = target {
                let _ = done.send(Err(error.duplicate()));
            }
        }

        self.link.shared.set_terminal(error);
        self.finish();
    }

    /// Shut the socket down, release it and enter `Closed`.
    fn finish(&mut self) {
        if let Err(e) = self.event_loop.shutdown(self.socket, Shutdown::Both) {
            tracing::debug!(error = %e, "socket shutdown failed");
        }
        self.event_loop.release(self.socket);
        self.event_loop.dispose();
        self.link.shared.set_state(ConnectionState::Closed);
        self.ready.clear();
        self.receiving = false;

        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Err(RpcError::Disposed));
        }
        for outbound in std::mem::take(&mut self.queue) {
            self.refuse(outbound.target);
        }
        let abandoned = self.link.sessions.fail_all(&RpcError::Disposed);
        if abandoned > 0 {
            tracing::warn!(abandoned, "abandoning pending calls on close");
        }
        for ack in self.close_acks.drain(..) {
            let _ = ack.send(());
        }
    }

    fn refuse(&self, target: SendTarget) {
        let error = self.link.shared.closed_error();
        match target {
            SendTarget::Call(id) => {
                if let Some(call) = self.link.sessions.take(id) {
                    call.resolve(Err(error));
                }
            }
            SendTarget::Notify(done) => {
                let _ = done.send(Err(error));
            }
        }
    }

    /// Raise a loop-wide error.
    ///
    /// Subscribers always see it. Whether it closes the connection depends
    /// on `severity` and on whether anyone was subscribed.
    fn report(&mut self, error: RpcError, severity: Severity) {
        let observed = self.link.events.receiver_count() > 0;
        if observed {
            let _ = self.link.events.send(TransportEvent {
                error: Arc::new(error.duplicate()),
                fatal: severity == Severity::Fatal,
            });
        }
        match severity {
            Severity::Fatal => self.fail(error),
            Severity::Escalating if !observed => {
                tracing::error!(%error, "unobserved transport error");
                self.fail(error);
            }
            Severity::Recoverable if !observed => {
                tracing::warn!(%error, "dropping malformed frame");
            }
            _ => {}
        }
    }

    /// Handle one inbound frame.
    fn on_frame(&mut self, value: Value) {
        let recoverable_id = MessageCodec::response_id(&value);
        match MessageCodec::from_value(value) {
            Ok(Envelope::Response { id, error, result }) => match self.link.sessions.take(id) {
                Some(call) => {
                    let outcome = if error.is_nil() {
                        Ok(result)
                    } else {
                        Err(RpcError::RemoteFault(RemoteError::new(error, result)))
                    };
                    call.resolve(outcome);
                }
                None => tracing::debug!(id, "dropping response for unknown message id"),
            },
            Ok(other) => {
                tracing::warn!(message_type = %other.message_type(), "ignoring inbound frame");
            }
            Err(e) => match recoverable_id.and_then(|id| self.link.sessions.take(id)) {
                Some(call) => call.resolve(Err(e.into())),
                None => self.report(e.into(), Severity::Recoverable),
            },
        }
    }
}

impl CompletionHandler for Driver {
    fn on_connect(&mut self, mut op: SocketOperation) {
        if let Some(e) = op.take_error() {
            tracing::debug!(error = %e, "connect failed");
            return self.fail(RpcError::Transport(e));
        }
        if self.link.shared.state() != ConnectionState::Connecting {
            return;
        }
        self.link.shared.set_state(ConnectionState::Connected);
        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Ok(()));
        }
    }

    fn on_send(&mut self, mut op: SocketOperation) {
        let Some(in_flight) = self.in_flight.take() else {
            tracing::warn!(op = op.id(), "send completion with nothing in flight");
            return;
        };
        debug_assert_eq!(
            op.context(),
            Some(OperationContext::Sending(in_flight.batch))
        );
        drop(op.take_frames());

        let Some(e) = op.take_error() else {
            tracing::trace!(
                bytes = op.transferred(),
                frames = in_flight.targets.len(),
                "batch sent"
            );
            for target in in_flight.targets {
                if let SendTarget::Notify(done) = target {
                    let _ = done.send(Ok(()));
                }
            }
            return;
        };

        let error = RpcError::Transport(e);
        for target in in_flight.targets {
            match target {
                SendTarget::Call(id) => {
                    if let Some(call) = self.link.sessions.take(id) {
                        call.resolve(Err(error.duplicate()));
                    }
                }
                SendTarget::Notify(done) => {
                    let _ = done.send(Err(error.duplicate()));
                }
            }
        }
        // A failed write leaves a stream at an unknown position.
        if self.transport == TransportKind::Tcp {
            self.report(error, Severity::Fatal);
        }
    }

    fn on_receive(&mut self, mut op: SocketOperation) {
        self.receiving = false;
        if let Some(e) = op.take_error() {
            let severity = match self.transport {
                TransportKind::Tcp => Severity::Fatal,
                TransportKind::Udp => Severity::Escalating,
            };
            return self.report(RpcError::Transport(e), severity);
        }

        let transferred = op.transferred();
        let Some(data) = op.take_received() else {
            return;
        };
        match self.transport {
            TransportKind::Tcp => {
                if transferred == 0 {
                    tracing::debug!(buffered = self.framer.buffered(), "peer closed the stream");
                    return self.fail(RpcError::ConnectionClosed);
                }
                if let Err(e) = self.framer.push(data) {
                    return self.report(e, Severity::Fatal);
                }
                loop {
                    match self.framer.next_frame() {
                        Ok(Some(value)) => self.on_frame(value),
                        Ok(None) => break,
                        Err(e) => {
                            self.report(e.into(), Severity::Fatal);
                            break;
                        }
                    }
                }
            }
            TransportKind::Udp => match datagram_frame(data, self.max_response) {
                Ok(value) => self.on_frame(value),
                Err(e) => self.report(e.into(), Severity::Recoverable),
            },
        }
    }
}

/// The shared pool when it can hand out `receive_size` bytes in one run,
/// otherwise a dedicated pool with that chunk size.
fn receive_pool(pool: &BufferPool, receive_size: usize) -> BufferPool {
    if receive_size <= pool.chunk_size() {
        pool.clone()
    } else {
        BufferPool::new(pool.policy(), receive_size)
    }
}
