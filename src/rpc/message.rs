//! RPC message shapes
//!
//! Three message kinds travel over the wire, each an array led by a type tag:
//!
//! - request: `[0, id, method, params]`
//! - response: `[1, id, error, result]`
//! - notification: `[2, method, params]`

use crate::rpc::codec;
use crate::rpc::error::{DecodeError, RemoteError};
use crate::rpc::value::Value;

const REQUEST_TAG: i64 = 0;
const RESPONSE_TAG: i64 = 1;
const NOTIFICATION_TAG: i64 = 2;

/// Decoded RPC message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u64,
        method: String,
        params: Vec<Value>,
    },
    Response {
        id: u64,
        result: Result<Value, RemoteError>,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    /// Method name for requests and notifications, used for logging
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => {
                Some(method)
            }
            Message::Response { .. } => None,
        }
    }

    /// Convert into the array form written on the wire
    pub fn into_value(self) -> Value {
        match self {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::Integer(REQUEST_TAG),
                Value::Integer(id as i64),
                Value::String(method),
                Value::Array(params),
            ]),
            Message::Response { id, result } => {
                let (error, result) = match result {
                    Ok(value) => (Value::Nil, value),
                    Err(error) => (error.to_value(), Value::Nil),
                };
                Value::Array(vec![
                    Value::Integer(RESPONSE_TAG),
                    Value::Integer(id as i64),
                    error,
                    result,
                ])
            }
            Message::Notification { method, params } => Value::Array(vec![
                Value::Integer(NOTIFICATION_TAG),
                Value::String(method),
                Value::Array(params),
            ]),
        }
    }

    /// Request id of an encoded response whose body may not decode
    ///
    /// Reads only the `[1, id, ...` header so a response carrying an
    /// ill-typed result can still be matched to its caller.
    pub fn response_id(frame: &[u8]) -> Option<u64> {
        let (&header, rest) = frame.split_first()?;
        // fixarray of four elements
        if header != 0x94 {
            return None;
        }
        let (tag, used) = codec::decode_prefix(rest).ok()?;
        if tag.as_i64() != Some(RESPONSE_TAG) {
            return None;
        }
        let (id, _) = codec::decode_prefix(rest.get(used..)?).ok()?;
        read_id(Some(id)).ok()
    }

    /// Interpret a decoded value as a message
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let items = value
            .into_array()
            .ok_or_else(|| invalid("message is not an array"))?;
        let mut items = items.into_iter();

        let tag = items
            .next()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| invalid("missing message type tag"))?;

        match tag {
            REQUEST_TAG => {
                let id = read_id(items.next())?;
                let method = read_method(items.next())?;
                let params = read_params(items.next())?;
                Ok(Message::Request { id, method, params })
            }
            RESPONSE_TAG => {
                let id = read_id(items.next())?;
                let error = items.next().ok_or_else(|| invalid("missing error slot"))?;
                let result = items.next().ok_or_else(|| invalid("missing result slot"))?;
                let result = if error.is_nil() {
                    Ok(result)
                } else {
                    Err(RemoteError::from_value(error))
                };
                Ok(Message::Response { id, result })
            }
            NOTIFICATION_TAG => {
                let method = read_method(items.next())?;
                let params = read_params(items.next())?;
                Ok(Message::Notification { method, params })
            }
            other => Err(invalid(&format!("unknown message type {other}"))),
        }
    }
}

fn invalid(reason: &str) -> DecodeError {
    DecodeError::InvalidMessage(reason.to_string())
}

fn read_id(value: Option<Value>) -> Result<u64, DecodeError> {
    value
        .and_then(|v| v.as_i64())
        .and_then(|id| u64::try_from(id).ok())
        .ok_or_else(|| invalid("missing or negative message id"))
}

fn read_method(value: Option<Value>) -> Result<String, DecodeError> {
    value
        .and_then(Value::into_string)
        .ok_or_else(|| invalid("missing method name"))
}

fn read_params(value: Option<Value>) -> Result<Vec<Value>, DecodeError> {
    match value {
        Some(Value::Array(params)) => Ok(params),
        Some(Value::Nil) | None => Ok(Vec::new()),
        Some(other) => Err(invalid(&format!(
            "params must be an array, found {}",
            other.kind()
        ))),
    }
}
