//! Client facade and builder.
//!
//! The [`ClientBuilder`] provides a fluent API over [`ClientConfig`] and the
//! serialization filter chain. The [`Client`] issues calls and
//! notifications on one [`Transport`]:
//! 1. Pick a message id that is not live
//! 2. Serialize and register the pending call
//! 3. Queue the frame for the driver
//! 4. Resolve the returned [`CallHandle`] when the response arrives
//!
//! # Example
//!
//! ```no_run
//! use msgpack_rpc_client::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .connect_timeout(std::time::Duration::from_secs(2))
//!         .connect("127.0.0.1:18800")
//!         .await?;
//!
//!     let echoed: String = client.call("Echo", &("hi",)).await?;
//!     assert_eq!(echoed, "hi");
//!
//!     client.notify("Log", &(1, 2, 3))?.await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::ToSocketAddrs;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};

use crate::buffer::PoolPolicy;
use crate::codec::{Arguments, Envelope, FilterChain, MessageCodec, SerializationFilter};
use crate::config::{ClientConfig, EventLoopKind, TransportKind};
use crate::error::{Result, RpcError};
use crate::session::SessionTable;
use crate::transport::{Completion, ConnectionState, Transport, TransportEvent};

/// Attempts at finding a free message id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

/// Builder for configuring and connecting a [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    filters: FilterChain,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Size of pooled buffer chunks.
    ///
    /// Default: 32 KiB
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.config.chunk_size = Some(bytes);
        self
    }

    /// Default: 30 seconds
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(millis(timeout));
        self
    }

    /// How long `close` waits for pending calls.
    ///
    /// Default: 5 seconds
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = Some(millis(timeout));
        self
    }

    /// Largest request frame. Default: 4 MiB
    pub fn max_request_length(mut self, bytes: usize) -> Self {
        self.config.max_request_length = Some(bytes);
        self
    }

    /// Largest response frame. Default: 4 MiB
    pub fn max_response_length(mut self, bytes: usize) -> Self {
        self.config.max_response_length = Some(bytes);
        self
    }

    /// Only connect to IPv4 addresses.
    pub fn force_ipv4(mut self, force: bool) -> Self {
        self.config.force_ipv4 = Some(force);
        self
    }

    pub fn pool_policy(mut self, policy: PoolPolicy) -> Self {
        self.config.pool_policy = Some(policy);
        self
    }

    pub fn event_loop(mut self, kind: EventLoopKind) -> Self {
        self.config.event_loop = Some(kind);
        self
    }

    pub fn transport(mut self, kind: TransportKind) -> Self {
        self.config.transport = Some(kind);
        self
    }

    /// Append a serialization filter. Filters run in insertion order.
    pub fn filter(mut self, filter: impl SerializationFilter + 'static) -> Self {
        self.filters.push(filter);
        self
    }

    /// Validate the configuration and connect.
    pub async fn connect<A: ToSocketAddrs>(self, addr: A) -> Result<Client> {
        let settings = self.config.resolve()?;
        let transport = Transport::connect(addr, settings, Arc::new(self.filters)).await?;
        Ok(Client {
            transport,
            runtime: Handle::current(),
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A connected MessagePack-RPC client.
///
/// Calls may be issued concurrently from any number of tasks; responses
/// are matched to calls by message id, in whatever order they arrive.
pub struct Client {
    transport: Transport,
    runtime: Handle,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with an explicit configuration.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> Result<Self> {
        ClientBuilder::new().config(config).connect(addr).await
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Number of calls waiting for a response.
    pub fn outstanding(&self) -> usize {
        self.transport.sessions().outstanding()
    }

    /// Start a call with an automatically assigned message id.
    pub fn begin_call<A: Serialize + ?Sized>(&self, method: &str, args: &A) -> Result<CallHandle> {
        let args = MessageCodec::encode_args(args)?;
        self.begin_call_auto(method, args)
    }

    /// Start a call with a caller-chosen message id.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a call with `id` is still pending.
    pub fn begin_call_with_id<A: Serialize + ?Sized>(
        &self,
        id: u32,
        method: &str,
        args: &A,
    ) -> Result<CallHandle> {
        let args = MessageCodec::encode_args(args)?;
        self.begin_call_as(id, method, args)
    }

    /// Start a call whose arguments are an already encoded MessagePack
    /// array. The bytes are sent without copying.
    pub fn begin_call_raw(&self, method: &str, args: Bytes) -> Result<CallHandle> {
        self.begin_call_auto(method, Arguments::Raw(args))
    }

    /// Call and decode the result.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.begin_call(method, args)?.await?;
        Ok(MessageCodec::decode_value(value)?)
    }

    /// Blocking variant of [`call`](Self::call).
    ///
    /// Must be called from outside the runtime, e.g. from
    /// `spawn_blocking` or a plain thread.
    pub fn call_blocking<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.begin_call(method, args)?.wait()?;
        Ok(MessageCodec::decode_value(value)?)
    }

    /// Send a notification. The handle resolves once the frame is written;
    /// no response is ever expected.
    pub fn notify<A: Serialize + ?Sized>(&self, method: &str, args: &A) -> Result<NotifyHandle> {
        let args = MessageCodec::encode_args(args)?;
        let (tx, rx) = oneshot::channel();
        self.transport
            .send(Envelope::notification(method, args), Completion::Sent(tx))?;
        Ok(NotifyHandle {
            receiver: rx,
            runtime: self.runtime.clone(),
        })
    }

    /// Observe loop-wide transport errors.
    ///
    /// While at least one receiver is alive, malformed frames that cannot
    /// be attributed to a call are reported here instead of being logged
    /// and dropped, and datagram receive errors no longer close the
    /// connection.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.subscribe()
    }

    /// Wait until no call is pending.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        self.transport.drain(timeout).await
    }

    /// Drain, flush and close the connection.
    pub async fn close(&self) -> Result<()> {
        self.transport.close().await
    }

    fn begin_call_auto(&self, method: &str, args: Arguments) -> Result<CallHandle> {
        let sessions = self.transport.sessions();
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = sessions.next_free_id();
            match self.begin_call_as(id, method, args.clone()) {
                // Lost a race with a caller-chosen id.
                Err(RpcError::InvalidArgument(_)) if sessions.contains(id) => continue,
                other => return other,
            }
        }
        Err(RpcError::invalid("no free message id"))
    }

    fn begin_call_as(&self, id: u32, method: &str, args: Arguments) -> Result<CallHandle> {
        let (tx, rx) = oneshot::channel();
        self.transport
            .send(Envelope::request(id, method, args), Completion::Response(tx))?;
        Ok(CallHandle {
            id,
            receiver: rx,
            sessions: self.transport.sessions().clone(),
            runtime: self.runtime.clone(),
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("transport", &self.transport)
            .finish()
    }
}

/// The pending result of a call.
///
/// Resolves exactly once: with the result, the remote error, a transport
/// failure, or `Disposed` if the client closed first. Await it, or use
/// [`wait`](Self::wait) from a blocking context.
#[derive(Debug)]
pub struct CallHandle {
    id: u32,
    receiver: oneshot::Receiver<Result<Value>>,
    sessions: Arc<SessionTable>,
    runtime: Handle,
}

impl CallHandle {
    /// The message id on the wire.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Block until the call resolves.
    pub fn wait(self) -> Result<Value> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(RpcError::Disposed))
    }

    /// Block until the call resolves or `timeout` elapses.
    ///
    /// On timeout the call is removed from the session table; a response
    /// arriving later is dropped.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Value> {
        let runtime = self.runtime.clone();
        runtime.block_on(self.timeout(timeout))
    }

    /// Await the call for at most `timeout`.
    pub async fn timeout(mut self, timeout: Duration) -> Result<Value> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(outcome) => outcome.unwrap_or(Err(RpcError::Disposed)),
            Err(_) => {
                // Closing first keeps a response sent at the deadline
                // readable, and marks our entry as the one to remove. The id
                // may already belong to a newer call.
                self.receiver.close();
                if let Ok(outcome) = self.receiver.try_recv() {
                    return outcome;
                }
                self.sessions
                    .take_if(self.id, |call| call.responder.is_closed());
                Err(RpcError::Timeout {
                    operation: "call",
                    elapsed: timeout,
                })
            }
        }
    }
}

impl Future for CallHandle {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(RpcError::Disposed)))
    }
}

/// Completion of a notification send.
#[derive(Debug)]
pub struct NotifyHandle {
    receiver: oneshot::Receiver<Result<()>>,
    runtime: Handle,
}

impl NotifyHandle {
    /// Block until the frame is written.
    pub fn wait(self) -> Result<()> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(RpcError::Disposed))
    }

    /// Block for at most `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<()> {
        let runtime = self.runtime.clone();
        runtime.block_on(async move {
            match tokio::time::timeout(timeout, self).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RpcError::Timeout {
                    operation: "notify",
                    elapsed: timeout,
                }),
            }
        })
    }
}

impl Future for NotifyHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(RpcError::Disposed)))
    }
}
