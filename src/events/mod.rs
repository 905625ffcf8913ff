//! Event layer - Fan-out of remote notifications
//!
//! - **Dispatcher**: per-event receivers with lazy remote (un)subscription
//! - **Autocmd**: publisher variant backed by a server-side autocmd

pub mod autocmd;
pub mod dispatcher;

pub use autocmd::AutocmdInterest;
pub use dispatcher::{
    EventDispatcher, NoRemoteInterest, RemoteInterest, SubscribeInterest, Subscription,
};
