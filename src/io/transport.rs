//! Transport layer - Duplex byte streams to the remote process
//!
//! A transport is a pair of async byte streams: one carrying bytes from the
//! remote process, one carrying bytes to it. The RPC session splits the
//! transport once and hands the halves to its reader task and its
//! lock-guarded writer.

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadHalf, WriteHalf};
use tokio::process::{ChildStdin, ChildStdout};

// ============================================================================
// Constants
// ============================================================================

/// Default buffer capacity for in-memory transports
pub const MEMORY_TRANSPORT_CAPACITY: usize = 64 * 1024;

/// Boxed inbound half of a transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed outbound half of a transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Core transport trait for bidirectional byte exchange
pub trait Transport: Send + 'static {
    /// Bytes coming from the remote process
    type Reader: AsyncRead + Send + Unpin + 'static;

    /// Bytes going to the remote process
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// Split into independently owned halves
    fn into_split(self) -> (Self::Reader, Self::Writer);

    /// Split into type-erased halves
    fn into_boxed(self) -> (BoxedReader, BoxedWriter)
    where
        Self: Sized,
    {
        let (reader, writer) = self.into_split();
        (Box::new(reader), Box::new(writer))
    }
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Transport over a child process' stdin/stdout
#[derive(Debug)]
pub struct StdioTransport {
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl StdioTransport {
    /// Create a new StdioTransport from child process streams
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self { stdin, stdout }
    }
}

impl Transport for StdioTransport {
    type Reader = ChildStdout;
    type Writer = ChildStdin;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        (self.stdout, self.stdin)
    }
}

// ============================================================================
// Memory Transport Implementation
// ============================================================================

/// In-process transport backed by `tokio::io::duplex`
///
/// The peer end returned by [`MemoryTransport::pair`] plays the remote
/// process: bytes written to it arrive at the reader half, bytes written to
/// the writer half can be read from it.
#[derive(Debug)]
pub struct MemoryTransport {
    stream: DuplexStream,
}

impl MemoryTransport {
    /// Create a transport and the peer stream connected to it
    pub fn pair() -> (Self, DuplexStream) {
        Self::with_capacity(MEMORY_TRANSPORT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, DuplexStream) {
        let (local, peer) = tokio::io::duplex(capacity);
        (Self { stream: local }, peer)
    }
}

impl Transport for MemoryTransport {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self.stream)
    }
}

// ============================================================================
// Tests
// ============================================================================
