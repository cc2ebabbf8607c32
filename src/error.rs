//! Error types for the MessagePack-RPC client.
//!
//! Every failure surfaced to a caller is an [`RpcError`]. Its [`ErrorKind`]
//! tells where the failure originated: a local argument check, the codec,
//! the socket, the remote application, a local deadline, or a transport
//! that has already been shut down.

use std::fmt;
use std::time::Duration;

use rmpv::Value;
use thiserror::Error;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Writing a MessagePack value failed.
    #[error("MsgPack encode error: {0}")]
    Encode(String),

    /// Serde-level encoding of a typed argument failed.
    #[error("MsgPack encode error: {0}")]
    Serialize(#[from] rmp_serde::encode::Error),

    /// The byte stream is not valid MessagePack.
    #[error("MsgPack decode error: {0}")]
    Decode(String),

    /// Decoding a value into the requested Rust type failed.
    #[error("MsgPack decode error: {0}")]
    Deserialize(#[from] rmp_serde::decode::Error),

    /// The frame is valid MessagePack but not a valid envelope.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The frame grew beyond the configured byte quota.
    #[error("Frame exceeds quota of {limit} bytes")]
    QuotaExceeded {
        /// The configured maximum.
        limit: usize,
    },

    /// The available bytes end in the middle of a frame.
    #[error("Incomplete frame")]
    Incomplete,
}

impl CodecError {
    /// Whether this error only means "wait for more bytes".
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete)
    }

    fn duplicate(&self) -> Self {
        match self {
            CodecError::Encode(m) => CodecError::Encode(m.clone()),
            CodecError::Serialize(e) => CodecError::Encode(e.to_string()),
            CodecError::Decode(m) => CodecError::Decode(m.clone()),
            CodecError::Deserialize(e) => CodecError::Decode(e.to_string()),
            CodecError::InvalidFrame(m) => CodecError::InvalidFrame(m.clone()),
            CodecError::QuotaExceeded { limit } => CodecError::QuotaExceeded { limit: *limit },
            CodecError::Incomplete => CodecError::Incomplete,
        }
    }
}

/// Classification of a remote application error by its wire identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// The remote has no such method.
    NoMethod,
    /// The remote rejected the arguments.
    Argument,
    /// The remote timed out while handling the call.
    Timeout,
    /// Generic transport failure reported by the remote.
    Transport,
    /// The remote could not reach a downstream endpoint.
    Unreachable,
    /// A downstream connection was refused.
    ConnectionRefused,
    /// The remote refused the message.
    MessageRefused,
    /// The request was larger than the remote accepts.
    MessageTooLarge,
    /// Generic call failure.
    Call,
    /// Internal server failure.
    Server,
    /// Identifier not present in the table.
    Unknown,
}

/// Identifier to kind table. Identifiers are matched exactly.
const REMOTE_ERROR_TABLE: &[(&str, RemoteErrorKind)] = &[
    ("RPCError.NoMethodError", RemoteErrorKind::NoMethod),
    ("RPCError.ArgumentError", RemoteErrorKind::Argument),
    ("RPCError.TimeoutError", RemoteErrorKind::Timeout),
    ("RPCError.TransportError", RemoteErrorKind::Transport),
    ("RPCError.NetworkUnreacheableError", RemoteErrorKind::Unreachable),
    ("RPCError.ConnectionRefusedError", RemoteErrorKind::ConnectionRefused),
    ("RPCError.MessageRefusedError", RemoteErrorKind::MessageRefused),
    ("RPCError.MessageTooLargeError", RemoteErrorKind::MessageTooLarge),
    ("RPCError.CallError", RemoteErrorKind::Call),
    ("RPCError.ServerError", RemoteErrorKind::Server),
    ("NoMethodError", RemoteErrorKind::NoMethod),
    ("ArgumentError", RemoteErrorKind::Argument),
];

impl RemoteErrorKind {
    /// Look up the kind for a wire identifier.
    pub fn from_identifier(identifier: &str) -> Self {
        REMOTE_ERROR_TABLE
            .iter()
            .find(|(id, _)| *id == identifier)
            .map(|(_, kind)| *kind)
            .unwrap_or(RemoteErrorKind::Unknown)
    }
}

/// An application-level failure carried in a well-formed response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Kind looked up from the identifier.
    pub kind: RemoteErrorKind,
    /// The raw `error` field.
    pub error: Value,
    /// The `result` field, when the remote sent detail alongside the error.
    pub detail: Option<Value>,
}

impl RemoteError {
    /// Build from the `error` and `result` fields of a response.
    pub fn new(error: Value, result: Value) -> Self {
        let kind = match error.as_str() {
            Some(id) => RemoteErrorKind::from_identifier(id),
            None => RemoteErrorKind::Unknown,
        };
        let detail = if result.is_nil() { None } else { Some(result) };
        Self {
            kind,
            error,
            detail,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error.as_str() {
            Some(id) => write!(f, "{}", id)?,
            None => write!(f, "{}", self.error)?,
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {}", detail)?;
        }
        Ok(())
    }
}

/// Coarse classification of [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad call parameters, never sent over the wire.
    ArgumentInvalid,
    /// Malformed frame, wrong arity or type, or quota exceeded.
    Codec,
    /// Socket-level failure.
    Transport,
    /// The response carried a non-nil error.
    RemoteFault,
    /// A local deadline expired.
    Timeout,
    /// The transport was shut down.
    Disposed,
}

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Invalid call parameters.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Frame encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// I/O error during socket operations.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer closed the connection while the operation was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The remote returned an error value.
    #[error("Remote fault: {0}")]
    RemoteFault(RemoteError),

    /// A local operation exceeded its deadline.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// What was being waited on.
        operation: &'static str,
        /// The configured deadline.
        elapsed: Duration,
    },

    /// Operation attempted after shutdown.
    #[error("Transport disposed")]
    Disposed,
}

impl RpcError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::InvalidArgument(_) => ErrorKind::ArgumentInvalid,
            RpcError::Codec(_) => ErrorKind::Codec,
            RpcError::Transport(_) | RpcError::ConnectionClosed => ErrorKind::Transport,
            RpcError::RemoteFault(_) => ErrorKind::RemoteFault,
            RpcError::Timeout { .. } => ErrorKind::Timeout,
            RpcError::Disposed => ErrorKind::Disposed,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        RpcError::InvalidArgument(message.into())
    }

    /// Duplicate an error for fan-out to several waiters.
    ///
    /// `io::Error` is not `Clone`; its kind and message are preserved.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            RpcError::InvalidArgument(m) => RpcError::InvalidArgument(m.clone()),
            RpcError::Codec(e) => RpcError::Codec(e.duplicate()),
            RpcError::Transport(e) => {
                RpcError::Transport(std::io::Error::new(e.kind(), e.to_string()))
            }
            RpcError::ConnectionClosed => RpcError::ConnectionClosed,
            RpcError::RemoteFault(e) => RpcError::RemoteFault(e.clone()),
            RpcError::Timeout { operation, elapsed } => RpcError::Timeout {
                operation,
                elapsed: *elapsed,
            },
            RpcError::Disposed => RpcError::Disposed,
        }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_kind_table() {
        assert_eq!(
            RemoteErrorKind::from_identifier("RPCError.NoMethodError"),
            RemoteErrorKind::NoMethod
        );
        assert_eq!(
            RemoteErrorKind::from_identifier("RPCError.MessageTooLargeError"),
            RemoteErrorKind::MessageTooLarge
        );
        assert_eq!(
            RemoteErrorKind::from_identifier("SomethingElse"),
            RemoteErrorKind::Unknown
        );
    }

    #[test]
    fn test_remote_error_detail() {
        let err = RemoteError::new(
            Value::from("RPCError.ArgumentError"),
            Value::from("expected 2 args"),
        );
        assert_eq!(err.kind, RemoteErrorKind::Argument);
        assert_eq!(err.detail, Some(Value::from("expected 2 args")));
        let text = err.to_string();
        assert!(text.starts_with("RPCError.ArgumentError: "));
        assert!(text.contains("expected 2 args"));

        let err = RemoteError::new(Value::from(17), Value::Nil);
        assert_eq!(err.kind, RemoteErrorKind::Unknown);
        assert!(err.detail.is_none());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(RpcError::invalid("x").kind(), ErrorKind::ArgumentInvalid);
        assert_eq!(
            RpcError::from(CodecError::QuotaExceeded { limit: 1 }).kind(),
            ErrorKind::Codec
        );
        assert_eq!(RpcError::ConnectionClosed.kind(), ErrorKind::Transport);
        assert_eq!(RpcError::Disposed.kind(), ErrorKind::Disposed);
    }

    #[test]
    fn test_duplicate_preserves_io_kind() {
        let err = RpcError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        match err.duplicate() {
            RpcError::Transport(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_preserves_codec_variant() {
        let err = RpcError::Codec(CodecError::QuotaExceeded { limit: 16 });
        assert!(matches!(
            err.duplicate(),
            RpcError::Codec(CodecError::QuotaExceeded { limit: 16 })
        ));
    }
}
