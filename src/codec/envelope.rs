//! The MessagePack-RPC message envelope.
//!
//! One frame is one MessagePack array:
//!
//! | Type         | Layout                                   |
//! |--------------|------------------------------------------|
//! | Request      | `[0, msgid: u32, method: str, args: []]` |
//! | Response     | `[1, msgid: u32, error, result]`         |
//! | Notification | `[2, method: str, args: []]`             |

use std::fmt;

use bytes::Bytes;
use rmpv::Value;

/// Envelope type tag, the first element of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Notification = 2,
}

impl MessageType {
    /// Parse a wire tag.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Notification),
            _ => None,
        }
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Number of array elements a frame of this type carries.
    #[inline]
    pub fn arity(self) -> u32 {
        match self {
            MessageType::Notification => 3,
            MessageType::Request | MessageType::Response => 4,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Call arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Arguments {
    /// Decoded values, written element by element.
    Values(Vec<Value>),
    /// A complete, already-encoded MessagePack array, written without copying.
    Raw(Bytes),
}

impl Arguments {
    /// No arguments.
    pub fn empty() -> Self {
        Arguments::Values(Vec::new())
    }

    /// Decode into values, parsing raw bytes if needed.
    pub fn to_values(&self) -> Option<Vec<Value>> {
        match self {
            Arguments::Values(values) => Some(values.clone()),
            Arguments::Raw(bytes) => {
                let mut reader = &bytes[..];
                match rmpv::decode::read_value(&mut reader) {
                    Ok(Value::Array(values)) => Some(values),
                    _ => None,
                }
            }
        }
    }
}

impl From<Vec<Value>> for Arguments {
    fn from(values: Vec<Value>) -> Self {
        Arguments::Values(values)
    }
}

impl From<Bytes> for Arguments {
    fn from(bytes: Bytes) -> Self {
        Arguments::Raw(bytes)
    }
}

/// One decoded or to-be-encoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: u32,
        method: String,
        args: Arguments,
    },
    Response {
        id: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        args: Arguments,
    },
}

impl Envelope {
    pub fn request(id: u32, method: impl Into<String>, args: impl Into<Arguments>) -> Self {
        Envelope::Request {
            id,
            method: method.into(),
            args: args.into(),
        }
    }

    pub fn notification(method: impl Into<String>, args: impl Into<Arguments>) -> Self {
        Envelope::Notification {
            method: method.into(),
            args: args.into(),
        }
    }

    /// A successful response.
    pub fn success(id: u32, result: impl Into<Value>) -> Self {
        Envelope::Response {
            id,
            error: Value::Nil,
            result: result.into(),
        }
    }

    /// A failed response.
    pub fn failure(id: u32, error: impl Into<Value>, detail: impl Into<Value>) -> Self {
        Envelope::Response {
            id,
            error: error.into(),
            result: detail.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Request { .. } => MessageType::Request,
            Envelope::Response { .. } => MessageType::Response,
            Envelope::Notification { .. } => MessageType::Notification,
        }
    }

    /// Message id, `None` for notifications.
    pub fn id(&self) -> Option<u32> {
        match self {
            Envelope::Request { id, .. } | Envelope::Response { id, .. } => Some(*id),
            Envelope::Notification { .. } => None,
        }
    }

    /// Method name, `None` for responses.
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request { method, .. } | Envelope::Notification { method, .. } => {
                Some(method)
            }
            Envelope::Response { .. } => None,
        }
    }
}
