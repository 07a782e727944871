//! Direct link framing
//!
//! Frames exchanged on a direct peer-to-peer link once the relay has been
//! bypassed.
//!
//! # Message Framing
//!
//! Frames are length-prefixed with a 4-byte big-endian length header:
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```
//!
//! # Link Handshake
//!
//! ```text
//! Dialer                               Listener
//!   │──── Hello { token, identity } ────►│
//!   │◄─── Welcome { identity } ──────────│
//!   │◄═══ Data / Goodbye ═══════════════►│
//! ```

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::wire::MAX_LINE_LEN;

// ============================================================================
// Constants
// ============================================================================

/// Room for the bincode enum tag and length fields around a payload
pub const FRAME_OVERHEAD: usize = 64;

/// Maximum frame payload size: one full wire line plus overhead
pub const MAX_FRAME_SIZE: u32 = (MAX_LINE_LEN + FRAME_OVERHEAD) as u32;

/// Length of the frame header (4 bytes for length)
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Frames
// ============================================================================

/// A frame on a direct link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    /// Dialer introduces itself with the session token from signaling
    Hello { token: String, identity: String },
    /// Listener accepts the token
    Welcome { identity: String },
    /// One encoded wire line
    Data(Vec<u8>),
    /// Orderly close
    Goodbye,
}

// ============================================================================
// Frame Encoding
// ============================================================================

/// Encode a frame with 4-byte length prefix
pub fn encode_frame(frame: &LinkFrame) -> Result<Vec<u8>, EncodeError> {
    let payload = bincode::serialize(frame).map_err(|e| EncodeError::Serialization(e.to_string()))?;

    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(EncodeError::FrameTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during frame encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Serialization failed
    Serialization(String),
    /// Frame exceeds maximum size
    FrameTooLarge(usize),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::Serialization(e) => write!(f, "serialization error: {}", e),
            EncodeError::FrameTooLarge(size) => {
                write!(f, "frame too large: {} bytes (max {})", size, MAX_FRAME_SIZE)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

// ============================================================================
// Stream-based I/O
// ============================================================================

/// Write a frame to a writer with length prefix
pub fn write_frame<W: Write>(writer: &mut W, frame: &LinkFrame) -> io::Result<()> {
    let encoded = encode_frame(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read a frame from a reader
///
/// Blocks until a complete frame is received
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<LinkFrame> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", length),
        ));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload)?;

    bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
