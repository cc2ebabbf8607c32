//! # msgpack-rpc-client
//!
//! Client engine for MessagePack-RPC over TCP or UDP.
//!
//! ## Architecture
//!
//! - **Buffers**: pooled, segmented byte buffers shared between socket I/O
//!   and the codec, with zero-copy writes and on-demand growth
//! - **Event loop**: connect/send/receive operations completed either by
//!   tokio tasks or by a `mio` poll thread
//! - **Transport**: one driver task per connection that owns the
//!   connection state machine and matches responses to pending calls
//!
//! ## Wire format
//!
//! ```text
//! Request:      [0, message_id, method, args]
//! Response:     [1, message_id, error, result]
//! Notification: [2, method, args]
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use msgpack_rpc_client::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), msgpack_rpc_client::RpcError> {
//!     let client = Client::connect("127.0.0.1:18800", ClientConfig::new()).await?;
//!     let sum: i64 = client.call("Add", &(1, 2)).await?;
//!     println!("1 + 2 = {}", sum);
//!     client.close().await
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod session;
pub mod transport;

mod client;

pub use client::{CallHandle, Client, ClientBuilder, NotifyHandle};
pub use config::ClientConfig;
pub use error::{ErrorKind, RemoteError, RemoteErrorKind, RpcError};
pub use transport::{ConnectionState, TransportEvent};
