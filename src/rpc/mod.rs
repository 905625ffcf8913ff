//! MessagePack-RPC layer
//!
//! - **Value / codec**: the self-describing wire value and its binary form
//! - **Message**: request, response and notification envelopes
//! - **Framing**: value stream over a byte stream
//! - **Session**: request correlation, inbound dispatch and closure

pub mod codec;
pub mod error;
pub mod framing;
pub mod message;
pub mod session;
pub mod value;

#[cfg(test)]
pub mod testing;

pub use error::{CodecError, DecodeError, EncodeError, RemoteError, RemoteErrorKind, RpcError};
pub use message::Message;
pub use session::RpcSession;
pub use value::{Buffer, Tabpage, Value, Window};
