//! Readiness-based backend on `mio`.
//!
//! One thread owns the `mio::Poll`. `issue` tries the operation right away
//! under the state lock; on `WouldBlock` it parks the operation on its
//! socket, and the poll thread retries it on the next readiness event. The
//! try and the park happen under the same lock the poll thread takes, so a
//! readiness edge can never slip in between.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use super::completion::unspecified_for;
use super::operation::{OperationKind, SocketId, SocketOperation};
use super::{interrupted, not_connected, Cancellation, CompletionSender, EventLoop, Issued};
use crate::config::TransportKind;
use crate::error::{Result, RpcError};

const WAKER: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

enum MioSocket {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl MioSocket {
    fn try_send(&mut self, op: &SocketOperation, written: &mut usize) -> io::Result<()> {
        match self {
            MioSocket::Tcp(s) => {
                let total = op.send_len();
                while *written < total {
                    match s.write_vectored(&op.send_slices(*written)) {
                        Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                        Ok(n) => *written += n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            MioSocket::Udp(s) => {
                *written = s.send(&op.datagram())?;
                Ok(())
            }
        }
    }

    fn try_receive(&mut self, op: &mut SocketOperation) -> io::Result<usize> {
        let buf = op.receive_slice().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "receive without a buffer")
        })?;
        loop {
            let result = match self {
                MioSocket::Tcp(s) => s.read(buf),
                MioSocket::Udp(s) => s.recv(buf),
            };
            match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    /// Outcome of a non-blocking connect, `None` while still in progress.
    fn connect_result(&self) -> Option<io::Result<usize>> {
        let MioSocket::Tcp(s) = self else {
            return Some(Ok(0));
        };
        match s.take_error() {
            Ok(Some(e)) | Err(e) => return Some(Err(e)),
            Ok(None) => {}
        }
        match s.peer_addr() {
            Ok(_) => Some(Ok(0)),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => None,
            Err(e) => Some(Err(e)),
        }
    }

    fn source(&mut self) -> &mut dyn mio::event::Source {
        match self {
            MioSocket::Tcp(s) => s,
            MioSocket::Udp(s) => s,
        }
    }
}

struct PolledSocket {
    transport: TransportKind,
    socket: Option<MioSocket>,
    completions: CompletionSender,
    connect: Option<SocketOperation>,
    send: Option<(SocketOperation, usize)>,
    receive: Option<SocketOperation>,
}

struct PollShared {
    registry: Registry,
    waker: Waker,
    sockets: Mutex<HashMap<Token, PolledSocket>>,
    next_token: AtomicUsize,
    cancel: Cancellation,
    stopped: AtomicBool,
}

/// `mio`-driven [`EventLoop`].
pub struct PollingLoop {
    shared: Arc<PollShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollingLoop {
    /// Create the poll and start its thread.
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        let shared = Arc::new(PollShared {
            registry,
            waker,
            sockets: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            cancel: Cancellation::new(),
            stopped: AtomicBool::new(false),
        });

        let worker = shared.clone();
        let thread = std::thread::Builder::new()
            .name("msgpack-rpc-poll".into())
            .spawn(move || worker.run(poll))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn token(socket: SocketId) -> Token {
        Token(socket.0 as usize)
    }
}

impl PollShared {
    fn run(&self, mut poll: Poll) {
        tracing::debug!("poll thread started");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        while !self.stopped.load(Ordering::Acquire) {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("poll failed: {}", e);
                break;
            }
            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed() || event.is_error();
                self.on_ready(event.token(), readable, writable);
            }
        }
        self.abandon_all();
        tracing::debug!("poll thread stopped");
    }

    fn on_ready(&self, token: Token, readable: bool, writable: bool) {
        let mut done = Vec::new();
        let completions = {
            let mut sockets = self.sockets.lock();
            let Some(entry) = sockets.get_mut(&token) else {
                return;
            };
            let Some(socket) = entry.socket.as_mut() else {
                return;
            };

            if writable {
                if let Some(mut op) = entry.connect.take() {
                    match socket.connect_result() {
                        Some(result) => {
                            op.complete(result, false);
                            done.push(op);
                        }
                        None => entry.connect = Some(op),
                    }
                }
                if let Some((mut op, mut written)) = entry.send.take() {
                    match socket.try_send(&op, &mut written) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            entry.send = Some((op, written));
                        }
                        result => {
                            op.complete(result.map(|()| written), false);
                            done.push(op);
                        }
                    }
                }
            }
            if readable {
                if let Some(mut op) = entry.receive.take() {
                    match socket.try_receive(&mut op) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            entry.receive = Some(op);
                        }
                        result => {
                            op.complete(result, false);
                            done.push(op);
                        }
                    }
                }
            }
            entry.completions.clone()
        };

        for op in done {
            let _ = completions.send(op);
        }
    }

    /// Fail every parked operation on shutdown.
    fn abandon_all(&self) {
        let mut sockets = self.sockets.lock();
        for (_, mut entry) in sockets.drain() {
            let parked = entry
                .connect
                .take()
                .into_iter()
                .chain(entry.send.take().map(|(op, _)| op))
                .chain(entry.receive.take());
            for mut op in parked {
                op.complete(Err(interrupted()), false);
                let _ = entry.completions.send(op);
            }
            if let Some(mut socket) = entry.socket.take() {
                let _ = self.registry.deregister(socket.source());
            }
        }
    }

    fn connect(&self, token: Token, entry: &mut PolledSocket, mut op: SocketOperation) -> Issued {
        let Some(remote) = op.remote() else {
            op.complete(
                Err(io::Error::new(io::ErrorKind::InvalidInput, "connect without a remote")),
                true,
            );
            return Issued::Completed(op);
        };
        match self.open(token, entry.transport, remote) {
            Ok(socket) => {
                entry.socket = Some(socket);
                match entry.transport {
                    TransportKind::Tcp => {
                        entry.connect = Some(op);
                        Issued::Pending
                    }
                    TransportKind::Udp => {
                        op.complete(Ok(0), true);
                        Issued::Completed(op)
                    }
                }
            }
            Err(e) => {
                op.complete(Err(e), true);
                Issued::Completed(op)
            }
        }
    }

    fn open(&self, token: Token, transport: TransportKind, remote: SocketAddr) -> io::Result<MioSocket> {
        let mut socket = match transport {
            TransportKind::Tcp => {
                let stream = TcpStream::connect(remote)?;
                stream.set_nodelay(true)?;
                MioSocket::Tcp(stream)
            }
            TransportKind::Udp => {
                let socket = UdpSocket::bind(unspecified_for(remote))?;
                socket.connect(remote)?;
                MioSocket::Udp(socket)
            }
        };
        self.registry
            .register(socket.source(), token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(socket)
    }
}

impl EventLoop for PollingLoop {
    fn register(&self, transport: TransportKind, completions: CompletionSender) -> Result<SocketId> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(RpcError::Disposed);
        }
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared.sockets.lock().insert(
            Token(token),
            PolledSocket {
                transport,
                socket: None,
                completions,
                connect: None,
                send: None,
                receive: None,
            },
        );
        Ok(SocketId(token as u64))
    }

    fn issue(&self, mut op: SocketOperation) -> Issued {
        if self.shared.cancel.is_cancelled() || self.shared.stopped.load(Ordering::Acquire) {
            return Issued::Cancelled(op);
        }
        let token = Self::token(op.socket());
        let mut sockets = self.shared.sockets.lock();
        op.mark_issued();
        let Some(entry) = sockets.get_mut(&token) else {
            op.complete(Err(not_connected()), true);
            return Issued::Completed(op);
        };

        if op.kind() == OperationKind::Connect {
            return self.shared.connect(token, entry, op);
        }
        let Some(socket) = entry.socket.as_mut() else {
            op.complete(Err(not_connected()), true);
            return Issued::Completed(op);
        };

        match op.kind() {
            OperationKind::Send if entry.send.is_none() => {
                let mut written = 0;
                match socket.try_send(&op, &mut written) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        entry.send = Some((op, written));
                        Issued::Pending
                    }
                    result => {
                        op.complete(result.map(|()| written), true);
                        Issued::Completed(op)
                    }
                }
            }
            OperationKind::Receive if entry.receive.is_none() => {
                match socket.try_receive(&mut op) {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        entry.receive = Some(op);
                        Issued::Pending
                    }
                    result => {
                        op.complete(result, true);
                        Issued::Completed(op)
                    }
                }
            }
            _ => {
                op.complete(
                    Err(io::Error::other("operation of this kind already in flight")),
                    true,
                );
                Issued::Completed(op)
            }
        }
    }

    fn shutdown(&self, socket: SocketId, how: Shutdown) -> io::Result<()> {
        let sockets = self.shared.sockets.lock();
        match sockets
            .get(&Self::token(socket))
            .and_then(|entry| entry.socket.as_ref())
        {
            Some(MioSocket::Tcp(stream)) => match stream.shutdown(how) {
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            Some(MioSocket::Udp(_)) | None => Ok(()),
        }
    }

    fn release(&self, socket: SocketId) {
        let removed = self.shared.sockets.lock().remove(&Self::token(socket));
        if let Some(mut socket) = removed.and_then(|entry| entry.socket) {
            let _ = self.shared.registry.deregister(socket.source());
        }
    }

    fn cancellation(&self) -> &Cancellation {
        &self.shared.cancel
    }

    fn dispose(&self) {
        self.shared.cancel.cancel();
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.shared.waker.wake() {
            tracing::warn!("failed to wake poll thread: {}", e);
        }
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != std::thread::current().id() && thread.join().is_err() {
                tracing::error!("poll thread panicked");
            }
        }
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        self.dispose();
    }
}
