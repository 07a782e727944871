//! Peer Link
//!
//! Peer directory, relay routing and relay-to-direct session negotiation
//! for a multi-user relay chat service:
//! - Transport abstraction (relay line, relay-backed peer, direct TCP, in-memory)
//! - Directory of connected identities and their current transport
//! - Relay router for content messages
//! - Session negotiator upgrading a pair from relay to a direct link
//! - Peer-side client driving all of the above over one relay connection

// ============================================================================
// Modules
// ============================================================================

/// Peer-side client over one relay connection
pub mod client;

/// Registry of connected identities
pub mod directory;

/// Notifications for the UI collaborator
pub mod events;

/// Frames on a direct peer-to-peer link
pub mod framing;

/// Offer/answer/candidate state machine
pub mod negotiator;

/// Content routing through the directory
pub mod router;

/// Send/receive/close capability and its variants
pub mod transport;

/// Relay wire messages (JSON lines)
pub mod wire;

pub use client::{ClientError, PeerClient, PeerOptions, ServerConnection};
pub use directory::{BroadcastReport, Directory, DirectoryError, PeerRecord};
pub use events::{ChannelEvents, InboundSink, NoEvents, PeerEvent, PeerEvents};
pub use negotiator::{
    DirectConnector, MemoryConnector, NegotiationError, Negotiator, SessionState, TcpRendezvous,
    DEFAULT_HANDSHAKE_TIMEOUT,
};
pub use router::{RouteError, Router};
pub use transport::{Received, Transport, TransportError, TransportHandle, TransportKind};
pub use wire::{Message, SignalType, WireMessage};
