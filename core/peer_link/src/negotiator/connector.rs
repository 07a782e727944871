//! Direct-link connector seam
//!
//! The negotiator drives the handshake without knowing how a direct link
//! is actually built. A [`DirectConnector`] turns offer/answer payloads and
//! address fragments into a [`TransportHandle`], reported through the
//! context's ready callback. Two implementations ship:
//! - [`TcpRendezvous`](super::rendezvous::TcpRendezvous): listener plus host candidates
//! - [`MemoryConnector`]: in-process, for simulation and tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::transport::{MemoryTransport, TransportHandle, TransportKind};

/// Reports the outcome of a link build; invoked at most once
pub type ReadyCallback = Box<dyn FnOnce(Result<TransportHandle, ConnectorError>) + Send>;

/// Everything a connector needs to start building a link
pub struct LinkContext {
    pub local: String,
    pub remote: String,
    /// Give up once this passes
    pub deadline: Instant,
    /// Must never be invoked from inside a builder or connector call
    pub ready: ReadyCallback,
}

/// Builds direct links between peers
pub trait DirectConnector: Send + Sync {
    /// Start an outgoing handshake; returns the offer payload
    fn offer(&self, ctx: LinkContext) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError>;

    /// Answer a peer's offer; returns the answer payload
    fn answer(
        &self,
        ctx: LinkContext,
        offer: &str,
    ) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError>;
}

/// One in-progress link build
pub trait LinkBuilder: Send {
    /// Fragments to send to the peer once establishing begins
    fn local_fragments(&mut self) -> Vec<String>;

    /// Apply the peer's answer (offering side only)
    fn apply_answer(&mut self, answer: &str) -> Result<(), ConnectorError>;

    /// Apply one fragment from the peer, in any order
    fn apply_fragment(&mut self, fragment: &str) -> Result<(), ConnectorError>;

    /// Stop building; the ready callback will not report success afterwards
    fn abort(&mut self);
}

/// Errors from building a direct link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Payload or fragment could not be parsed
    InvalidPayload(String),
    /// No usable address for this side
    NoCandidates,
    /// Socket-level failure
    Io(String),
    /// The build was aborted
    Aborted,
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectorError::InvalidPayload(e) => write!(f, "invalid payload: {}", e),
            ConnectorError::NoCandidates => write!(f, "no usable candidates"),
            ConnectorError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectorError::Aborted => write!(f, "aborted"),
        }
    }
}

impl std::error::Error for ConnectorError {}

impl From<std::io::Error> for ConnectorError {
    fn from(e: std::io::Error) -> Self {
        ConnectorError::Io(e.to_string())
    }
}

// ============================================================================
// In-Process Connector
// ============================================================================

#[derive(Default)]
struct Rendezvous {
    offerer: Option<ReadyCallback>,
    answerer: Option<ReadyCallback>,
    /// Whether each side has applied a fragment from the other
    offerer_heard: bool,
    answerer_heard: bool,
}

#[derive(Default)]
struct Switchboard {
    pending: Mutex<HashMap<String, Rendezvous>>,
    next_token: AtomicU64,
}

/// Connects peers through an in-process switchboard
///
/// Clones share the switchboard. A link comes up once both sides have
/// applied one fragment from the other; each side then receives its end of
/// a [`MemoryTransport`] pair.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    board: Arc<Switchboard>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of builds still waiting for a link
    pub fn pending(&self) -> usize {
        self.board.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Offerer,
    Answerer,
}

impl DirectConnector for MemoryConnector {
    fn offer(&self, ctx: LinkContext) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError> {
        let token = format!(
            "mem-{}-{}",
            ctx.local,
            self.board.next_token.fetch_add(1, Ordering::Relaxed)
        );
        let mut pending = self.board.pending.lock().map_err(|_| ConnectorError::Aborted)?;
        pending.insert(
            token.clone(),
            Rendezvous {
                offerer: Some(ctx.ready),
                ..Default::default()
            },
        );

        let builder = MemoryBuilder {
            board: self.board.clone(),
            token: token.clone(),
            side: Side::Offerer,
        };
        Ok((token, Box::new(builder)))
    }

    fn answer(
        &self,
        ctx: LinkContext,
        offer: &str,
    ) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError> {
        let mut pending = self.board.pending.lock().map_err(|_| ConnectorError::Aborted)?;
        let slot = pending
            .get_mut(offer)
            .ok_or_else(|| ConnectorError::InvalidPayload(format!("unknown offer {}", offer)))?;
        slot.answerer = Some(ctx.ready);

        let builder = MemoryBuilder {
            board: self.board.clone(),
            token: offer.to_string(),
            side: Side::Answerer,
        };
        Ok((offer.to_string(), Box::new(builder)))
    }
}

struct MemoryBuilder {
    board: Arc<Switchboard>,
    token: String,
    side: Side,
}

impl MemoryBuilder {
    fn fragment_name(&self) -> String {
        match self.side {
            Side::Offerer => format!("{}/offerer", self.token),
            Side::Answerer => format!("{}/answerer", self.token),
        }
    }
}

impl LinkBuilder for MemoryBuilder {
    fn local_fragments(&mut self) -> Vec<String> {
        vec![self.fragment_name()]
    }

    fn apply_answer(&mut self, answer: &str) -> Result<(), ConnectorError> {
        if answer == self.token {
            Ok(())
        } else {
            Err(ConnectorError::InvalidPayload(format!("answer for {}", answer)))
        }
    }

    fn apply_fragment(&mut self, fragment: &str) -> Result<(), ConnectorError> {
        let expected = match self.side {
            Side::Offerer => format!("{}/answerer", self.token),
            Side::Answerer => format!("{}/offerer", self.token),
        };
        if fragment != expected {
            return Err(ConnectorError::InvalidPayload(fragment.to_string()));
        }

        let mut pending = self.board.pending.lock().map_err(|_| ConnectorError::Aborted)?;
        let complete = match pending.get_mut(&self.token) {
            Some(slot) => {
                match self.side {
                    Side::Offerer => slot.offerer_heard = true,
                    Side::Answerer => slot.answerer_heard = true,
                }
                slot.offerer_heard && slot.answerer_heard
            }
            None => return Err(ConnectorError::Aborted),
        };
        if !complete {
            return Ok(());
        }

        let Some(slot) = pending.remove(&self.token) else {
            return Ok(());
        };
        drop(pending);

        let (offerer_end, answerer_end) = MemoryTransport::pair(TransportKind::Direct);
        let offerer_end: TransportHandle = offerer_end;
        let answerer_end: TransportHandle = answerer_end;
        thread::Builder::new()
            .name("memory-connector".to_string())
            .spawn(move || {
                if let Some(ready) = slot.offerer {
                    ready(Ok(offerer_end));
                }
                if let Some(ready) = slot.answerer {
                    ready(Ok(answerer_end));
                }
            })
            .map(|_| ())
            .map_err(ConnectorError::from)
    }

    fn abort(&mut self) {
        let slot = self
            .board
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&self.token));

        // The other side hears about it; our own callback is dropped unused
        let other = slot.and_then(|slot| match self.side {
            Side::Offerer => slot.answerer,
            Side::Answerer => slot.offerer,
        });
        if let Some(ready) = other {
            let _ = thread::Builder::new()
                .name("memory-connector".to_string())
                .spawn(move || ready(Err(ConnectorError::Aborted)));
        }
    }
}
