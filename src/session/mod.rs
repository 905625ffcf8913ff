//! Mirror session layer
//!
//! - **State**: lifecycle state machine
//! - **Mediator**: one remote buffer bound to the host surface
//! - **Coordinator**: process, session, dispatcher and host observers

pub mod coordinator;
pub mod error;
pub mod mediator;
pub mod state;

pub use coordinator::{HostEvent, Mirror, MirrorEvent};
pub use error::MirrorError;
pub use mediator::BufferMediator;
pub use state::{SessionAction, SessionEvent, SessionMachine, SessionState};
