//! Connection-oriented (TCP) and datagram (UDP) transports.
//!
//! A [`Transport`] is a handle to one connection. The socket itself is
//! driven by a background task that owns the connection state machine;
//! the handle serializes outgoing frames, registers pending calls in the
//! [`SessionTable`] and hands frames to the task over a channel.
//!
//! Loop-wide errors, the ones no single call can be blamed for, are
//! published as [`TransportEvent`]s. A fatal one always closes the
//! connection; a non-fatal one closes it only if nobody is subscribed.

mod driver;
mod framing;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::ToSocketAddrs;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::buffer::{BufferPool, OutputBuffer};
use crate::codec::{Envelope, FilterChain};
use crate::config::{Settings, TransportKind};
use crate::error::{Result, RpcError};
use crate::event_loop::{self, Cancellation, EventLoop};
use crate::session::{PendingCall, Responder, SessionTable};

use driver::{Command, Driver, Link, Outbound, SendTarget, Shared};

pub use driver::ConnectionState;

/// Capacity of the loop-wide error channel.
const EVENT_CAPACITY: usize = 64;

/// A loop-wide error.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub error: Arc<RpcError>,
    /// Whether the connection was closed because of it.
    pub fatal: bool,
}

/// How the sender of a frame learns its outcome.
pub(crate) enum Completion {
    /// The response to a request.
    Response(Responder),
    /// The write of a notification.
    Sent(oneshot::Sender<Result<()>>),
}

/// One connection to a MessagePack-RPC server.
pub struct Transport {
    remote: SocketAddr,
    settings: Settings,
    commands: mpsc::UnboundedSender<Command>,
    link: Link,
    filters: Arc<FilterChain>,
    event_loop: Arc<dyn EventLoop>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Transport {
    /// Resolve `addr` and connect.
    ///
    /// # Errors
    ///
    /// - `Transport` if the address does not resolve or the connect fails
    /// - `Timeout` if the connect takes longer than the connect timeout
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        settings: Settings,
        filters: Arc<FilterChain>,
    ) -> Result<Self> {
        let remote = resolve(addr, settings.force_ipv4).await?;
        let event_loop = event_loop::create(settings.event_loop)?;
        let pool = BufferPool::new(settings.pool_policy, settings.chunk_size);

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let socket = event_loop.register(settings.transport, completions_tx)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let link = Link {
            shared: Arc::new(Shared::new()),
            sessions: Arc::new(SessionTable::new()),
            events,
            pool,
        };
        let driver = Driver::new(
            socket,
            event_loop.clone(),
            &settings,
            link.clone(),
            connected_tx,
        );
        let task = tokio::spawn(driver.run(remote, commands_rx, completions_rx));

        let connect_timeout = settings.connect_timeout;
        let transport = Self {
            remote,
            settings,
            commands: commands_tx,
            link,
            filters,
            event_loop,
            task: Mutex::new(Some(task)),
        };

        match tokio::time::timeout(connect_timeout, connected_rx).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(%remote, "connected");
                Ok(transport)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(transport.link.shared.closed_error()),
            Err(_) => Err(RpcError::Timeout {
                operation: "connect",
                elapsed: connect_timeout,
            }),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn kind(&self) -> TransportKind {
        self.settings.transport
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.link.shared.state()
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.link.sessions
    }

    pub fn pool(&self) -> &BufferPool {
        &self.link.pool
    }

    /// The event loop's cancellation flag. Once set, no new socket
    /// operation is issued and the connection closes.
    pub fn cancellation(&self) -> Cancellation {
        self.event_loop.cancellation().clone()
    }

    /// Observe loop-wide errors.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.link.events.subscribe()
    }

    /// Serialize `envelope` and queue it for sending.
    ///
    /// A request is registered in the session table only after it
    /// serialized successfully, and removed again if it cannot be queued.
    pub(crate) fn send(&self, envelope: Envelope, completion: Completion) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(self.link.shared.closed_error()),
            _ => return Err(RpcError::Disposed),
        }
        match envelope.method() {
            Some(method) if !method.is_empty() => {}
            Some(_) => return Err(RpcError::invalid("method name must not be empty")),
            None => {
                return Err(RpcError::invalid(
                    "only requests and notifications can be sent",
                ))
            }
        }

        let (pending, target) = match (&envelope, completion) {
            (Envelope::Request { id, method, .. }, Completion::Response(responder)) => (
                Some((*id, PendingCall::new(method.as_str(), responder))),
                SendTarget::Call(*id),
            ),
            (Envelope::Notification { .. }, Completion::Sent(done)) => {
                (None, SendTarget::Notify(done))
            }
            _ => {
                return Err(RpcError::invalid(
                    "completion does not match the message type",
                ))
            }
        };

        let mut frame =
            OutputBuffer::new(self.link.pool.clone()).with_quota(self.settings.max_request_length);
        self.filters.serialize(&envelope, &mut frame)?;

        let id = match pending {
            Some((id, call)) => {
                self.link.sessions.insert(id, call)?;
                Some(id)
            }
            None => None,
        };
        if self
            .commands
            .send(Command::Send(Outbound { frame, target }))
            .is_err()
        {
            if let Some(id) = id {
                self.link.sessions.take(id);
            }
            return Err(self.link.shared.closed_error());
        }
        Ok(())
    }

    /// Wait until no call is pending.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        self.link.sessions.drain(timeout).await
    }

    /// Orderly shutdown: stop accepting sends, drain pending calls up to
    /// the drain timeout, flush queued frames, then close the socket.
    ///
    /// Calls still pending when the drain times out are abandoned and
    /// resolve with `Disposed`.
    pub async fn close(&self) -> Result<()> {
        if self.link.shared.begin_draining() {
            let timeout = self.settings.drain_timeout;
            if self.drain(timeout).await.is_err() {
                tracing::warn!(
                    pending = self.link.sessions.outstanding(),
                    ?timeout,
                    "drain timed out"
                );
            }
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!("driver task failed: {}", e);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("remote", &self.remote)
            .field("kind", &self.settings.transport)
            .field("state", &self.state())
            .field("outstanding", &self.link.sessions.outstanding())
            .finish()
    }
}

async fn resolve<A: ToSocketAddrs>(addr: A, force_ipv4: bool) -> Result<SocketAddr> {
    let mut candidates = tokio::net::lookup_host(addr).await?;
    candidates
        .find(|candidate| !force_ipv4 || candidate.is_ipv4())
        .ok_or_else(|| {
            RpcError::Transport(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no usable address",
            ))
        })
}
