//! Error types for the RPC layer
//!
//! Covers the whole failure taxonomy of the wire protocol: malformed bytes,
//! protocol violations, remote application errors and transport failures.

use std::fmt;
use std::io;

use crate::rpc::value::Value;

// ============================================================================
// Codec Errors
// ============================================================================

/// Failure to decode wire bytes into a value or message
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Input ended before the value was complete")]
    Truncated,

    #[error("Reserved marker byte 0x{0:02x}")]
    ReservedMarker(u8),

    #[error("Invalid UTF-8 in string: {0}")]
    InvalidUtf8(String),

    #[error("Unsigned integer {0} does not fit in i64")]
    IntegerOverflow(u64),

    #[error("Nesting deeper than {0} levels")]
    DepthLimitExceeded(usize),

    #[error("Invalid extension type {ty}: {reason}")]
    InvalidExtension { ty: i8, reason: String },

    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Failure to encode a value
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EncodeError {
    #[error("Write failed: {0}")]
    Write(String),

    #[error("Length {0} exceeds the format limit")]
    TooLong(usize),
}

impl EncodeError {
    pub(crate) fn write<E: fmt::Display>(error: E) -> Self {
        EncodeError::Write(error.to_string())
    }
}

/// Error type of the stream codec
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Message too large: {size} bytes buffered (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

// ============================================================================
// Remote Errors
// ============================================================================

/// Error category reported by the remote process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Method raised an exception while running
    Exception,
    /// Arguments were rejected before the method ran
    Validation,
    /// Any other error code
    Other(i64),
}

impl RemoteErrorKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => RemoteErrorKind::Exception,
            1 => RemoteErrorKind::Validation,
            other => RemoteErrorKind::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            RemoteErrorKind::Exception => 0,
            RemoteErrorKind::Validation => 1,
            RemoteErrorKind::Other(code) => code,
        }
    }
}

/// Error carried in the error slot of a response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Exception,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Validation,
            message: message.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        self.kind == RemoteErrorKind::Validation
    }

    /// Interpret the error slot of a response
    ///
    /// The remote sends `[code, message]`; anything else is kept verbatim as
    /// an `Other` error so no information is lost.
    pub fn from_value(value: Value) -> Self {
        if let Value::Array(items) = &value {
            if let [Value::Integer(code), Value::String(message)] = items.as_slice() {
                return Self {
                    kind: RemoteErrorKind::from_code(*code),
                    message: message.clone(),
                };
            }
        }
        match value {
            Value::String(message) => Self {
                kind: RemoteErrorKind::Other(-1),
                message,
            },
            other => Self {
                kind: RemoteErrorKind::Other(-1),
                message: other.to_string(),
            },
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Integer(self.kind.code()),
            Value::String(self.message.clone()),
        ])
    }
}

// ============================================================================
// Session Errors
// ============================================================================

/// Errors surfaced by the RPC session to callers
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("RPC session closed")]
    SessionClosed,

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("No handler for method: {0}")]
    NoHandler(String),

    #[error("Response for unknown request id {0}")]
    UnknownRequestId(u64),

    #[error("Request timeout: {method}")]
    Timeout { method: String },
}

impl RpcError {
    /// Remote validation failures are the only recoverable remote errors
    pub fn is_validation(&self) -> bool {
        matches!(self, RpcError::Remote(remote) if remote.is_validation())
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, RpcError::SessionClosed)
    }
}
