//! Transport abstraction
//!
//! A uniform send/receive/close capability. The directory, router and
//! negotiator only ever hold a [`TransportHandle`], so upgrading a peer from
//! the relay to a direct link is a pure substitution at the directory.
//!
//! Variants:
//! - [`LineTransport`] - newline-delimited JSON over a TCP stream (the relay link)
//! - [`RelayTransport`] - a peer reached through the relay link
//! - [`DirectTransport`] - framed peer-to-peer TCP link
//! - [`MemoryTransport`] - in-process pair for simulation

use std::sync::Arc;

pub mod direct;
pub mod line;
pub mod memory;
pub mod relay;

pub use direct::DirectTransport;
pub use line::LineTransport;
pub use memory::MemoryTransport;
pub use relay::RelayTransport;

/// Which path a transport takes to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Through the relay server
    Relay,
    /// Point-to-point, bypassing the relay
    Direct,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Relay => write!(f, "relay"),
            TransportKind::Direct => write!(f, "direct"),
        }
    }
}

/// Inbound event delivered to a receive callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One complete frame (a wire line without its newline)
    Frame(Vec<u8>),
    /// The transport reached end-of-stream or failed; no more frames follow
    Closed,
}

/// Receive callback, invoked from the transport's reader task
pub type ReceiveCallback = Box<dyn FnMut(Received) + Send>;

/// Shared capability to a transport
pub type TransportHandle = Arc<dyn Transport>;

/// Send/receive/close capability shared by every transport variant
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send one frame. Blocks until written or failed.
    fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Close the transport. Idempotent; unblocks any pending read.
    fn close(&self);

    /// Start delivering inbound frames to `callback`.
    ///
    /// Only the first registration takes effect.
    fn on_receive(&self, callback: ReceiveCallback);

    fn is_closed(&self) -> bool;
}

/// Compare two handles by identity
pub fn same_transport(a: &TransportHandle, b: &TransportHandle) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Errors from transport operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Transport already closed
    Closed,
    /// Underlying I/O failed
    Io(String),
    /// Frame could not be encoded
    Encode(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(e) => write!(f, "I/O error: {}", e),
            TransportError::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}
