//! Wire value model
//!
//! `Value` is the universal argument and result type crossing the RPC
//! boundary. It mirrors the MessagePack data model plus the three handle
//! kinds the editor encodes as extension types.

use std::fmt;

use crate::rpc::codec::{MAX_DEPTH, decode_within};

// ============================================================================
// Handles
// ============================================================================

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub i64);

        impl $name {
            /// Handle `0` addresses the current object in request position
            pub const CURRENT: $name = $name(0);

            /// Raw integer identifier
            pub fn id(self) -> i64 {
                self.0
            }

            /// Whether this handle names a concrete remote object
            pub fn is_valid(self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }

        impl From<$name> for Value {
            fn from(handle: $name) -> Self {
                Value::$name(handle)
            }
        }
    };
}

handle_type!(
    /// Remote buffer identifier
    Buffer,
    "buffer"
);
handle_type!(
    /// Remote window identifier
    Window,
    "window"
);
handle_type!(
    /// Remote tabpage identifier
    Tabpage,
    "tabpage"
);

/// Extension type codes used by the remote process for its handles
pub const BUFFER_EXT_TYPE: i8 = 0;
pub const WINDOW_EXT_TYPE: i8 = 1;
pub const TABPAGE_EXT_TYPE: i8 = 2;

// ============================================================================
// Value
// ============================================================================

/// Self-describing wire value
///
/// Map equality ignores entry order. Extension payloads that are not one of
/// the handle kinds are kept opaque in `Ext` until [`Value::unpack_extensions`]
/// resolves them.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Buffer(Buffer),
    Window(Window),
    Tabpage(Tabpage),
    Ext(i8, Vec<u8>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter().any(|(other_key, other_value)| {
                            key == other_key && value == other_value
                        })
                    })
            }
            (Value::Buffer(a), Value::Buffer(b)) => a == b,
            (Value::Window(a), Value::Window(b)) => a == b,
            (Value::Tabpage(a), Value::Tabpage(b)) => a == b,
            (Value::Ext(ta, da), Value::Ext(tb, db)) => ta == tb && da == db,
            _ => false,
        }
    }
}

impl Value {
    /// Build a map value from string keys
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(key, value)| (Value::String(key.into()), value))
                .collect(),
        )
    }

    /// Empty map, used for option dictionaries
    pub fn empty_map() -> Self {
        Value::Map(Vec::new())
    }

    /// Short name of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Buffer(_) => "buffer",
            Value::Window(_) => "window",
            Value::Tabpage(_) => "tabpage",
            Value::Ext(..) => "extension",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Buffer handle, accepting a bare integer as the remote sometimes does
    pub fn as_buffer(&self) -> Option<Buffer> {
        match self {
            Value::Buffer(handle) => Some(*handle),
            Value::Integer(id) => Some(Buffer(*id)),
            _ => None,
        }
    }

    pub fn as_window(&self) -> Option<Window> {
        match self {
            Value::Window(handle) => Some(*handle),
            Value::Integer(id) => Some(Window(*id)),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a string key in a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// Recursively replace opaque extension values whose payload is itself
    /// an encoded value with the decoded value
    ///
    /// Unpacked payloads count against the decoder's nesting limit at the
    /// position they replace, so the result is never deeper than a decoded
    /// value can be.
    pub fn unpack_extensions(self) -> Value {
        self.unpack_at(0)
    }

    fn unpack_at(self, depth: usize) -> Value {
        if depth > MAX_DEPTH {
            return self;
        }
        match self {
            Value::Ext(ty, data) => match decode_within(&data, MAX_DEPTH - depth) {
                Ok(inner) => inner.unpack_at(depth),
                Err(_) => Value::Ext(ty, data),
            },
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| item.unpack_at(depth + 1))
                    .collect(),
            ),
            Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.unpack_at(depth + 1), v.unpack_at(depth + 1)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Buffer(h) => write!(f, "{h}"),
            Value::Window(h) => write!(f, "{h}"),
            Value::Tabpage(h) => write!(f, "{h}"),
            Value::Ext(ty, data) => write!(f, "ext({ty}, {} bytes)", data.len()),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<usize> for Value {
    fn from(i: usize) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}
