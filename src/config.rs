//! Client configuration.
//!
//! [`ClientConfig`] mirrors the options a caller may set; every field is
//! optional and `None` means "use the default". [`ClientConfig::resolve`]
//! validates the options and produces the [`Settings`] the transport runs
//! with. The config is built once and handed to each component; there is
//! no process-wide registry.
//!
//! ```
//! use msgpack_rpc_client::config::ClientConfig;
//!
//! let config = ClientConfig::from_json(r#"{ "chunk_size": 4096, "force_ipv4": true }"#).unwrap();
//! let settings = config.resolve().unwrap();
//! assert_eq!(settings.chunk_size, 4096);
//! assert!(settings.force_ipv4);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::buffer::{PoolPolicy, DEFAULT_CHUNK_SIZE};
use crate::error::{Result, RpcError};

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default drain timeout on close.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum frame length, both directions.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4 * 1024 * 1024;

/// Which event-loop backend drives the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLoopKind {
    /// tokio tasks complete operations.
    #[default]
    Completion,
    /// A dedicated `mio` poll thread completes operations.
    Polling,
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Connection-oriented byte stream.
    #[default]
    Tcp,
    /// One frame per datagram.
    Udp,
}

/// Caller-facing options. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    pub chunk_size: Option<usize>,
    pub connect_timeout: Option<u64>,
    pub drain_timeout: Option<u64>,
    pub max_request_length: Option<usize>,
    pub max_response_length: Option<usize>,
    pub force_ipv4: Option<bool>,
    pub use_connection_pooling: Option<bool>,
    pub pool_policy: Option<PoolPolicy>,
    pub event_loop: Option<EventLoopKind>,
    pub transport: Option<TransportKind>,
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_request_length: usize,
    pub max_response_length: usize,
    pub force_ipv4: bool,
    pub pool_policy: PoolPolicy,
    pub event_loop: EventLoopKind,
    pub transport: TransportKind,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_request_length: DEFAULT_MAX_MESSAGE_LENGTH,
            max_response_length: DEFAULT_MAX_MESSAGE_LENGTH,
            force_ipv4: false,
            pool_policy: PoolPolicy::default(),
            event_loop: EventLoopKind::default(),
            transport: TransportKind::default(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RpcError::invalid(format!("invalid config: {}", e)))
    }

    /// Apply defaults and validate.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when a size or timeout is zero, or when connection
    /// pooling is requested.
    pub fn resolve(&self) -> Result<Settings> {
        if self.use_connection_pooling == Some(true) {
            return Err(RpcError::invalid(
                "connection pooling is not supported; use one client per endpoint",
            ));
        }
        let defaults = Settings::default();
        let settings = Settings {
            chunk_size: positive("chunk_size", self.chunk_size, defaults.chunk_size)?,
            connect_timeout: millis("connect_timeout", self.connect_timeout, defaults.connect_timeout)?,
            drain_timeout: millis("drain_timeout", self.drain_timeout, defaults.drain_timeout)?,
            max_request_length: positive(
                "max_request_length",
                self.max_request_length,
                defaults.max_request_length,
            )?,
            max_response_length: positive(
                "max_response_length",
                self.max_response_length,
                defaults.max_response_length,
            )?,
            force_ipv4: self.force_ipv4.unwrap_or(defaults.force_ipv4),
            pool_policy: self.pool_policy.unwrap_or(defaults.pool_policy),
            event_loop: self.event_loop.unwrap_or(defaults.event_loop),
            transport: self.transport.unwrap_or(defaults.transport),
        };
        Ok(settings)
    }
}

fn positive(name: &str, value: Option<usize>, default: usize) -> Result<usize> {
    match value {
        None => Ok(default),
        Some(0) => Err(RpcError::invalid(format!("{} must be positive", name))),
        Some(v) => Ok(v),
    }
}

fn millis(name: &str, value: Option<u64>, default: Duration) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(0) => Err(RpcError::invalid(format!("{} must be positive", name))),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}
