//! Typed API facade
//!
//! Strongly-typed wrappers over the remote method set plus the atomic
//! transaction primitive.

pub mod client;
pub mod error;
pub mod types;

pub use client::NvimApi;
pub use error::ApiError;
pub use types::{ApiInfo, AutocmdOptions, BytePosition, ModeInfo, PastePhase};
