//! I/O layer - Process management and transport
//!
//! - **Transport**: duplex byte streams to the remote process
//! - **Process**: editor process lifecycle with stdio integration
//!
//! Neither knows anything about the RPC protocol spoken over the streams.

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager,
    ProcessState, StderrMonitor, StopMode,
};
pub use transport::{MemoryTransport, StdioTransport, Transport};
