//! Per-pair handshake state
//!
//! # State Machine
//!
//! ```text
//!            initiate                  answer
//! Idle ───────────────► OfferSent ───────────┐
//!   │                                        ▼
//!   │  offer                    accept   Accepted ──► Establishing ──► Active
//!   └──────────► OfferReceived ──────────────┘              ready
//!
//! any non-terminal ──► Rejected | TimedOut | Closed
//! ```

use std::fmt;
use std::time::Instant;

use super::connector::LinkBuilder;
use super::timer::Deadline;

/// Handshake state of one peer pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No handshake in progress
    Idle,
    /// Our offer is on its way to the peer
    OfferSent,
    /// The peer's offer awaits accept or reject
    OfferReceived,
    /// Offer and answer agreed
    Accepted,
    /// Fragments are being exchanged and the direct link is being built
    Establishing,
    /// The direct link is installed
    Active,
    /// One side declined
    Rejected,
    /// The deadline passed
    TimedOut,
    /// Session state discarded
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Active | SessionState::Rejected | SessionState::TimedOut | SessionState::Closed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::OfferSent => "offer-sent",
            SessionState::OfferReceived => "offer-received",
            SessionState::Accepted => "accepted",
            SessionState::Establishing => "establishing",
            SessionState::Active => "active",
            SessionState::Rejected => "rejected",
            SessionState::TimedOut => "timed-out",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// In-progress handshake between the local peer and one remote peer
pub struct SessionRequest {
    /// Distinguishes successive sessions of the same pair
    pub id: u64,
    pub initiator: String,
    pub responder: String,
    pub state: SessionState,
    /// The peer's offer payload, held until accept
    pub pending_offer: Option<String>,
    /// Fragments that arrived before the builder existed, in arrival order
    pub queued_fragments: Vec<String>,
    pub builder: Option<Box<dyn LinkBuilder>>,
    pub deadline: Instant,
    pub timer: Option<Deadline>,
}

impl SessionRequest {
    pub fn new(id: u64, initiator: &str, responder: &str, deadline: Instant) -> Self {
        SessionRequest {
            id,
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            state: SessionState::Idle,
            pending_offer: None,
            queued_fragments: Vec::new(),
            builder: None,
            deadline,
            timer: None,
        }
    }

    /// Move to `next`, logging the transition
    pub fn transition(&mut self, next: SessionState) {
        log::info!(
            "Session {} ({} -> {}): {} -> {}",
            self.id,
            self.initiator,
            self.responder,
            self.state,
            next
        );
        self.state = next;
    }

    /// Stop the timer and abort any builder
    pub fn release(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        if let Some(mut builder) = self.builder.take() {
            builder.abort();
        }
        self.pending_offer = None;
        self.queued_fragments.clear();
    }
}

impl fmt::Debug for SessionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRequest")
            .field("id", &self.id)
            .field("initiator", &self.initiator)
            .field("responder", &self.responder)
            .field("state", &self.state)
            .field("queued_fragments", &self.queued_fragments.len())
            .field("has_builder", &self.builder.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::OfferSent.is_terminal());
        assert!(!SessionState::OfferReceived.is_terminal());
        assert!(!SessionState::Accepted.is_terminal());
        assert!(!SessionState::Establishing.is_terminal());
        assert!(SessionState::Active.is_terminal());
        assert!(SessionState::Rejected.is_terminal());
        assert!(SessionState::TimedOut.is_terminal());
        assert!(SessionState::Closed.is_terminal());
    }

    #[test]
    fn test_release_clears_pending_work() {
        let mut session = SessionRequest::new(1, "alice", "bob", Instant::now() + Duration::from_secs(60));
        session.pending_offer = Some("offer".to_string());
        session.queued_fragments.push("fragment".to_string());

        session.release();

        assert!(session.pending_offer.is_none());
        assert!(session.queued_fragments.is_empty());
        assert!(session.builder.is_none());
    }
}
