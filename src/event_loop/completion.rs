//! Completion-based backend on tokio.
//!
//! Each pending operation is a tokio task that waits for readiness, retries
//! the non-blocking call and posts the finished operation to the socket's
//! completion channel.

use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;

use super::operation::{OperationKind, SocketId, SocketOperation};
use super::{interrupted, not_connected, Cancellation, CompletionSender, EventLoop, Issued};
use crate::config::TransportKind;
use crate::error::{Result, RpcError};

#[derive(Clone)]
enum Endpoint {
    Tcp(Arc<TcpStream>),
    Udp(Arc<UdpSocket>),
}

impl Endpoint {
    async fn open(transport: TransportKind, remote: SocketAddr) -> io::Result<Endpoint> {
        match transport {
            TransportKind::Tcp => {
                let stream = TcpStream::connect(remote).await?;
                stream.set_nodelay(true)?;
                Ok(Endpoint::Tcp(Arc::new(stream)))
            }
            TransportKind::Udp => {
                let socket = UdpSocket::bind(unspecified_for(remote)).await?;
                socket.connect(remote).await?;
                Ok(Endpoint::Udp(Arc::new(socket)))
            }
        }
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            Endpoint::Tcp(s) => s.writable().await,
            Endpoint::Udp(s) => s.writable().await,
        }
    }

    async fn readable(&self) -> io::Result<()> {
        match self {
            Endpoint::Tcp(s) => s.readable().await,
            Endpoint::Udp(s) => s.readable().await,
        }
    }

    /// Write as much as possible. `Ok` means everything was sent.
    fn try_send(&self, op: &SocketOperation, written: &mut usize) -> io::Result<()> {
        match self {
            Endpoint::Tcp(s) => {
                let total = op.send_len();
                while *written < total {
                    let n = s.try_write_vectored(&op.send_slices(*written))?;
                    if n == 0 {
                        return Err(io::ErrorKind::WriteZero.into());
                    }
                    *written += n;
                }
                Ok(())
            }
            Endpoint::Udp(s) => {
                *written = s.try_send(&op.datagram())?;
                Ok(())
            }
        }
    }

    fn try_receive(&self, op: &mut SocketOperation) -> io::Result<usize> {
        let buf = op.receive_slice().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "receive without a buffer")
        })?;
        match self {
            Endpoint::Tcp(s) => s.try_read(buf),
            Endpoint::Udp(s) => s.try_recv(buf),
        }
    }
}

pub(crate) fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    match remote {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}

struct Slot {
    transport: TransportKind,
    endpoint: Option<Endpoint>,
    completions: CompletionSender,
}

type Slots = Arc<Mutex<HashMap<SocketId, Slot>>>;

/// tokio-driven [`EventLoop`].
pub struct CompletionLoop {
    runtime: Handle,
    slots: Slots,
    next_socket: AtomicU64,
    cancel: Cancellation,
    disposed: Cancellation,
}

impl CompletionLoop {
    /// Create a loop on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when called outside a runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            RpcError::invalid(format!("completion event loop needs a tokio runtime: {}", e))
        })?;
        Ok(Self::with_handle(runtime))
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_socket: AtomicU64::new(1),
            cancel: Cancellation::new(),
            disposed: Cancellation::new(),
        }
    }

    fn issue_connect(
        &self,
        mut op: SocketOperation,
        transport: TransportKind,
        completions: CompletionSender,
    ) -> Issued {
        let Some(remote) = op.remote() else {
            op.complete(
                Err(io::Error::new(io::ErrorKind::InvalidInput, "connect without a remote")),
                true,
            );
            return Issued::Completed(op);
        };
        let slots = self.slots.clone();
        let disposed = self.disposed.clone();
        self.runtime.spawn(async move {
            let result = tokio::select! {
                opened = Endpoint::open(transport, remote) => opened,
                _ = disposed.cancelled() => Err(interrupted()),
            };
            let result = result.and_then(|endpoint| {
                let mut slots = slots.lock();
                match slots.get_mut(&op.socket()) {
                    Some(slot) => {
                        slot.endpoint = Some(endpoint);
                        Ok(0)
                    }
                    None => Err(not_connected()),
                }
            });
            op.complete(result, false);
            let _ = completions.send(op);
        });
        Issued::Pending
    }

    fn issue_send(
        &self,
        mut op: SocketOperation,
        endpoint: Endpoint,
        completions: CompletionSender,
    ) -> Issued {
        let mut written = 0;
        match endpoint.try_send(&op, &mut written) {
            Ok(()) => {
                op.complete(Ok(written), true);
                Issued::Completed(op)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let disposed = self.disposed.clone();
                self.runtime.spawn(async move {
                    let result = loop {
                        tokio::select! {
                            ready = endpoint.writable() => {
                                if let Err(e) = ready {
                                    break Err(e);
                                }
                            }
                            _ = disposed.cancelled() => break Err(interrupted()),
                        }
                        match endpoint.try_send(&op, &mut written) {
                            Ok(()) => break Ok(written),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                            Err(e) => break Err(e),
                        }
                    };
                    op.complete(result, false);
                    let _ = completions.send(op);
                });
                Issued::Pending
            }
            Err(e) => {
                op.complete(Err(e), true);
                Issued::Completed(op)
            }
        }
    }

    fn issue_receive(
        &self,
        mut op: SocketOperation,
        endpoint: Endpoint,
        completions: CompletionSender,
    ) -> Issued {
        match endpoint.try_receive(&mut op) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let disposed = self.disposed.clone();
                self.runtime.spawn(async move {
                    let result = loop {
                        tokio::select! {
                            ready = endpoint.readable() => {
                                if let Err(e) = ready {
                                    break Err(e);
                                }
                            }
                            _ = disposed.cancelled() => break Err(interrupted()),
                        }
                        match endpoint.try_receive(&mut op) {
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                            other => break other,
                        }
                    };
                    op.complete(result, false);
                    let _ = completions.send(op);
                });
                Issued::Pending
            }
            result => {
                op.complete(result, true);
                Issued::Completed(op)
            }
        }
    }
}

impl EventLoop for CompletionLoop {
    fn register(&self, transport: TransportKind, completions: CompletionSender) -> Result<SocketId> {
        if self.disposed.is_cancelled() {
            return Err(RpcError::Disposed);
        }
        let id = SocketId(self.next_socket.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().insert(
            id,
            Slot {
                transport,
                endpoint: None,
                completions,
            },
        );
        Ok(id)
    }

    fn issue(&self, mut op: SocketOperation) -> Issued {
        if self.cancel.is_cancelled() || self.disposed.is_cancelled() {
            return Issued::Cancelled(op);
        }
        let slot = {
            let slots = self.slots.lock();
            slots
                .get(&op.socket())
                .map(|slot| (slot.transport, slot.endpoint.clone(), slot.completions.clone()))
        };
        op.mark_issued();
        let Some((transport, endpoint, completions)) = slot else {
            op.complete(Err(not_connected()), true);
            return Issued::Completed(op);
        };

        match (op.kind(), endpoint) {
            (OperationKind::Connect, _) => self.issue_connect(op, transport, completions),
            (OperationKind::Send, Some(endpoint)) => self.issue_send(op, endpoint, completions),
            (OperationKind::Receive, Some(endpoint)) => {
                self.issue_receive(op, endpoint, completions)
            }
            (_, None) => {
                op.complete(Err(not_connected()), true);
                Issued::Completed(op)
            }
        }
    }

    fn shutdown(&self, socket: SocketId, how: Shutdown) -> io::Result<()> {
        let endpoint = self
            .slots
            .lock()
            .get(&socket)
            .and_then(|slot| slot.endpoint.clone());
        match endpoint {
            Some(Endpoint::Tcp(stream)) => match SockRef::from(&*stream).shutdown(how) {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            Some(Endpoint::Udp(_)) | None => Ok(()),
        }
    }

    fn release(&self, socket: SocketId) {
        self.slots.lock().remove(&socket);
    }

    fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    fn dispose(&self) {
        self.cancel.cancel();
        self.disposed.cancel();
        self.slots.lock().clear();
    }
}

impl Drop for CompletionLoop {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, OutputBuffer};
    use crate::event_loop::OperationState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    async fn complete(
        event_loop: &CompletionLoop,
        op: SocketOperation,
        rx: &mut mpsc::UnboundedReceiver<SocketOperation>,
    ) -> SocketOperation {
        match event_loop.issue(op) {
            Issued::Completed(op) => op,
            Issued::Pending => rx.recv().await.unwrap(),
            Issued::Cancelled(op) => panic!("cancelled: {:?}", op),
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_send_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let event_loop = CompletionLoop::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = event_loop.register(TransportKind::Tcp, tx).unwrap();

        let op = complete(&event_loop, SocketOperation::connect(socket, addr), &mut rx).await;
        assert_eq!(op.state(), OperationState::CompletedAsynchronously);
        assert!(op.last_error().is_none());

        let pool = BufferPool::recycling();
        let mut frame = OutputBuffer::new(pool.clone());
        frame.write_copy(b"hello").unwrap();
        let op = complete(&event_loop, SocketOperation::send(socket, vec![frame]), &mut rx).await;
        assert_eq!(op.transferred(), 5);

        let mut received = Vec::new();
        while received.len() < 5 {
            let mut op = complete(
                &event_loop,
                SocketOperation::receive(socket, pool.borrow(64).unwrap()),
                &mut rx,
            )
            .await;
            assert!(op.last_error().is_none());
            received.extend(op.take_received().unwrap().to_vec());
        }
        assert_eq!(received, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with no listener.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let event_loop = CompletionLoop::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = event_loop.register(TransportKind::Tcp, tx).unwrap();

        let op = complete(&event_loop, SocketOperation::connect(socket, addr), &mut rx).await;
        assert!(op.last_error().is_some());
    }

    #[tokio::test]
    async fn test_cancelled_loop_fails_soft() {
        let event_loop = CompletionLoop::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let socket = event_loop.register(TransportKind::Tcp, tx).unwrap();
        event_loop.cancellation().cancel();

        match event_loop.issue(SocketOperation::send(socket, Vec::new())) {
            Issued::Cancelled(op) => assert_eq!(op.state(), OperationState::Idle),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let event_loop = CompletionLoop::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let socket = event_loop.register(TransportKind::Tcp, tx).unwrap();

        match event_loop.issue(SocketOperation::send(socket, Vec::new())) {
            Issued::Completed(op) => {
                assert!(op.completed_synchronously());
                assert_eq!(
                    op.last_error().map(io::Error::kind),
                    Some(io::ErrorKind::NotConnected)
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();

        let event_loop = CompletionLoop::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let socket = event_loop.register(TransportKind::Udp, tx).unwrap();
        let op = complete(&event_loop, SocketOperation::connect(socket, addr), &mut rx).await;
        assert!(op.last_error().is_none());

        let pool = BufferPool::recycling();
        let mut frame = OutputBuffer::new(pool.clone());
        frame.write_copy(b"ping").unwrap();
        complete(&event_loop, SocketOperation::send(socket, vec![frame]), &mut rx).await;

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        peer.send_to(b"pong", from).await.unwrap();

        let mut op = complete(
            &event_loop,
            SocketOperation::receive(socket, pool.borrow(16).unwrap()),
            &mut rx,
        )
        .await;
        assert_eq!(op.take_received().unwrap().to_vec(), b"pong");
    }
}
