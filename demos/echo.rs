//! Echo client - calls `Echo` on a MessagePack-RPC server.
//!
//! ```text
//! cargo run --example echo -- 127.0.0.1:18800 hello
//! ```
//!
//! The server is expected to return its first argument unchanged. Set
//! `RUST_LOG=msgpack_rpc_client=debug` to watch the connection lifecycle.

use std::time::Duration;

use msgpack_rpc_client::{Client, TransportEvent};
use serde::{Deserialize, Serialize};

/// Argument and expected result of the `Echo` method.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct Message {
    text: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:18800".to_string());
    let text = args.next().unwrap_or_else(|| "hello".to_string());

    let client = Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .drain_timeout(Duration::from_secs(1))
        .connect(addr.as_str())
        .await?;

    let mut errors = client.subscribe_errors();
    tokio::spawn(async move {
        while let Ok(TransportEvent { error, fatal }) = errors.recv().await {
            eprintln!("transport error (fatal: {}): {}", fatal, error);
        }
    });

    let sent = Message {
        text,
        payload: (0u8..16).collect(),
    };
    let echoed: Message = client.call("Echo", &(&sent,)).await?;
    println!("{:?}", echoed);
    if echoed != sent {
        eprintln!("server returned a different message");
    }

    client.notify("Log", &("echo finished",))?.await?;
    client.close().await?;
    Ok(())
}
