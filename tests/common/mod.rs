//! In-process MessagePack-RPC servers for integration tests.
//!
//! Requests are answered by method name:
//!
//! | method | reply |
//! |---|---|
//! | `Echo` | first argument |
//! | `Add` | sum of integer arguments |
//! | `Fail` | error `"RPCError.ArgumentError"`, detail `"bad argument"` |
//! | `Sleep` | waits `args[0]` ms, then `nil` |
//! | `Stray` | a response for unknown id 42, then the first argument |
//! | `Malformed` | a five-element response carrying the call's id |
//! | `Garbage` | a five-element frame with no usable id, then the first argument |
//! | `Ignore` | nothing |
//! | `Hangup` | closes the connection |
//!
//! Notifications are forwarded to [`TestServer::notifications`].

#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;

pub struct TestServer {
    pub addr: SocketAddr,
    pub notifications: mpsc::UnboundedReceiver<Value>,
}

/// Replies are written in this order once `order.len()` requests arrived.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub reply_order: Option<Vec<usize>>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn tcp_server() -> TestServer {
    tcp_server_with(Options::default()).await
}

pub async fn tcp_server_with(options: Options) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_stream(stream, tx.clone(), options.clone()));
        }
    });
    TestServer {
        addr,
        notifications: rx,
    }
}

pub async fn udp_server() -> TestServer {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_536];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(frame) = rmpv::decode::read_value(&mut &buf[..n]) else {
                continue;
            };
            for reply in respond(frame, &tx).await {
                let _ = socket.send_to(&reply, from).await;
            }
        }
    });
    TestServer {
        addr,
        notifications: rx,
    }
}

async fn serve_stream(mut stream: TcpStream, tx: mpsc::UnboundedSender<Value>, options: Options) {
    let mut pending = Vec::new();
    let mut held: Vec<Vec<Vec<u8>>> = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);

        while let Some(frame) = next_frame(&mut pending) {
            if method_of(&frame) == Some("Hangup") {
                return;
            }
            let replies = respond(frame, &tx).await;
            match &options.reply_order {
                Some(order) => {
                    if !replies.is_empty() {
                        held.push(replies);
                    }
                    if held.len() == order.len() {
                        for &index in order {
                            for reply in &held[index] {
                                stream.write_all(reply).await.unwrap();
                            }
                        }
                        held.clear();
                    }
                }
                None => {
                    for reply in replies {
                        stream.write_all(&reply).await.unwrap();
                    }
                }
            }
        }
    }
}

fn next_frame(pending: &mut Vec<u8>) -> Option<Value> {
    let mut cursor = Cursor::new(&pending[..]);
    let value = rmpv::decode::read_value(&mut cursor).ok()?;
    let consumed = cursor.position() as usize;
    pending.drain(..consumed);
    Some(value)
}

fn method_of(frame: &Value) -> Option<&str> {
    let items = frame.as_array()?;
    match items.first()?.as_u64()? {
        0 => items.get(2)?.as_str(),
        2 => items.get(1)?.as_str(),
        _ => None,
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, value).unwrap();
    out
}

pub fn response(id: u32, error: Value, result: Value) -> Vec<u8> {
    encode(&Value::Array(vec![1.into(), id.into(), error, result]))
}

async fn respond(frame: Value, notifications: &mpsc::UnboundedSender<Value>) -> Vec<Vec<u8>> {
    let Value::Array(items) = frame else {
        return Vec::new();
    };
    match items.first().and_then(Value::as_u64) {
        Some(2) => {
            let _ = notifications.send(Value::Array(items));
            return Vec::new();
        }
        Some(0) if items.len() == 4 => {}
        _ => return Vec::new(),
    }

    let id = items[1].as_u64().unwrap_or_default() as u32;
    let method = items[2].as_str().unwrap_or_default().to_string();
    let args = items[3].as_array().cloned().unwrap_or_default();
    let first = args.first().cloned().unwrap_or(Value::Nil);

    match method.as_str() {
        "Echo" => vec![response(id, Value::Nil, first)],
        "Add" => {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            vec![response(id, Value::Nil, sum.into())]
        }
        "Fail" => vec![response(
            id,
            "RPCError.ArgumentError".into(),
            "bad argument".into(),
        )],
        "Sleep" => {
            let millis = first.as_u64().unwrap_or_default();
            tokio::time::sleep(Duration::from_millis(millis)).await;
            vec![response(id, Value::Nil, Value::Nil)]
        }
        "Ignore" => Vec::new(),
        "Stray" => vec![
            response(42, Value::Nil, "stray".into()),
            response(id, Value::Nil, first),
        ],
        "Malformed" => vec![encode(&Value::Array(vec![
            1.into(),
            id.into(),
            Value::Nil,
            first,
            0.into(),
        ]))],
        "Garbage" => vec![
            encode(&Value::Array(vec![
                1.into(),
                Value::Nil,
                Value::Nil,
                Value::Nil,
                0.into(),
            ])),
            response(id, Value::Nil, first),
        ],
        other => vec![response(
            id,
            "RPCError.NoMethodError".into(),
            format!("no method {}", other).into(),
        )],
    }
}
