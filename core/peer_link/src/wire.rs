//! Relay wire protocol
//!
//! Every message exchanged with the relay server is a single JSON object
//! terminated by a newline. Objects are tagged by `type`:
//!
//! ```text
//! {"type":"login","username":"alice","password":"..."}
//! {"type":"text","from":"alice","to":"bob","content":"hi","timestamp":1700000000000}
//! {"type":"signal","signalType":"offer","from":"alice","to":"bob","payload":"..."}
//! {"type":"error","message":"NoSuchPeer","peer":"ghost"}
//! ```
//!
//! The same line encoding is carried inside direct-link `Data` frames, so a
//! content message looks identical whichever transport delivered it.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Maximum encoded line length (64 KB)
pub const MAX_LINE_LEN: usize = 65536;

/// Error message reported when a recipient is not in the directory
pub const NO_SUCH_PEER: &str = "NoSuchPeer";

/// Error message reported when the recipient's transport failed
pub const TRANSPORT_ERROR: &str = "TransportError";

// ============================================================================
// Wire Messages
// ============================================================================

/// Signaling sub-kinds used to negotiate a direct transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Offer,
    Answer,
    Candidate,
    Reject,
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalType::Offer => write!(f, "offer"),
            SignalType::Answer => write!(f, "answer"),
            SignalType::Candidate => write!(f, "candidate"),
            SignalType::Reject => write!(f, "reject"),
        }
    }
}

/// A message on the relay wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Create an account
    Register { username: String, password: String },
    RegisterSuccess,

    /// Authenticate and join the directory
    Login { username: String, password: String },
    LoginSuccess,
    LoginFailed {
        #[serde(default)]
        message: String,
    },

    /// Request the list of connected identities
    ListUsers,
    UserList { users: Vec<String> },

    /// Chat content
    Text {
        from: String,
        to: String,
        content: String,
        timestamp: u64,
    },

    /// Acknowledgement that a text was written to the recipient's transport
    Delivered { to: String, timestamp: u64 },

    /// Negotiation control message, never carries chat content
    Signal {
        #[serde(rename = "signalType")]
        signal_type: SignalType,
        from: String,
        to: String,
        #[serde(default)]
        payload: String,
    },

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer: Option<String>,
    },
}

impl WireMessage {
    /// Create an error message
    pub fn error(message: impl Into<String>, peer: Option<&str>) -> Self {
        WireMessage::Error {
            message: message.into(),
            peer: peer.map(str::to_string),
        }
    }

    /// Short name of the message kind, for logging
    pub fn kind_name(&self) -> &'static str {
        match self {
            WireMessage::Register { .. } => "register",
            WireMessage::RegisterSuccess => "register-success",
            WireMessage::Login { .. } => "login",
            WireMessage::LoginSuccess => "login-success",
            WireMessage::LoginFailed { .. } => "login-failed",
            WireMessage::ListUsers => "list-users",
            WireMessage::UserList { .. } => "user-list",
            WireMessage::Text { .. } => "text",
            WireMessage::Delivered { .. } => "delivered",
            WireMessage::Signal { .. } => "signal",
            WireMessage::Error { .. } => "error",
        }
    }
}

// ============================================================================
// Routed Messages
// ============================================================================

/// What a routed message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Content,
    Signal(SignalType),
}

/// A message addressed from one identity to another
///
/// This is the unit the relay router moves; it maps onto the `text` and
/// `signal` wire kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub body: String,
    pub kind: MessageKind,
    pub timestamp: u64,
}

impl Message {
    /// Create a content message stamped with the current time
    pub fn text(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Message {
            from: from.into(),
            to: to.into(),
            body: body.into(),
            kind: MessageKind::Content,
            timestamp: now_millis(),
        }
    }

    /// Create a signaling message stamped with the current time
    pub fn signal(
        signal_type: SignalType,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Message {
            from: from.into(),
            to: to.into(),
            body: payload.into(),
            kind: MessageKind::Signal(signal_type),
            timestamp: now_millis(),
        }
    }

    /// Convert to the wire representation
    pub fn to_wire(&self) -> WireMessage {
        match self.kind {
            MessageKind::Content => WireMessage::Text {
                from: self.from.clone(),
                to: self.to.clone(),
                content: self.body.clone(),
                timestamp: self.timestamp,
            },
            MessageKind::Signal(signal_type) => WireMessage::Signal {
                signal_type,
                from: self.from.clone(),
                to: self.to.clone(),
                payload: self.body.clone(),
            },
        }
    }

    /// Extract a routable message from a wire message
    ///
    /// Returns None for kinds that are not addressed to a peer.
    pub fn from_wire(msg: &WireMessage) -> Option<Self> {
        match msg {
            WireMessage::Text {
                from,
                to,
                content,
                timestamp,
            } => Some(Message {
                from: from.clone(),
                to: to.clone(),
                body: content.clone(),
                kind: MessageKind::Content,
                timestamp: *timestamp,
            }),
            WireMessage::Signal {
                signal_type,
                from,
                to,
                payload,
            } => Some(Message {
                from: from.clone(),
                to: to.clone(),
                body: payload.clone(),
                kind: MessageKind::Signal(*signal_type),
                timestamp: now_millis(),
            }),
            _ => None,
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Line Encoding/Decoding
// ============================================================================

/// Encode a wire message as a newline-terminated JSON line
pub fn encode_line(msg: &WireMessage) -> Result<Vec<u8>, LineError> {
    let mut buf = serde_json::to_vec(msg).map_err(|e| LineError::Serialization(e.to_string()))?;
    if buf.len() >= MAX_LINE_LEN {
        return Err(LineError::TooLong(buf.len()));
    }
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one line (with or without its trailing newline)
pub fn decode_line(line: &[u8]) -> Result<WireMessage, LineError> {
    let trimmed = trim_line(line);
    if trimmed.len() >= MAX_LINE_LEN {
        return Err(LineError::TooLong(trimmed.len()));
    }
    serde_json::from_slice(trimmed).map_err(|e| LineError::Deserialization(e.to_string()))
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Errors from line encoding or decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineError {
    Serialization(String),
    Deserialization(String),
    TooLong(usize),
}

impl std::fmt::Display for LineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineError::Serialization(e) => write!(f, "serialization error: {}", e),
            LineError::Deserialization(e) => write!(f, "deserialization error: {}", e),
            LineError::TooLong(len) => {
                write!(f, "line too long: {} bytes (max {})", len, MAX_LINE_LEN)
            }
        }
    }
}

impl std::error::Error for LineError {}

// ============================================================================
// Tests
// ============================================================================
