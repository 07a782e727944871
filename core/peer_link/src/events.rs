//! Peer-side notifications
//!
//! The UI collaborator implements [`PeerEvents`] to hear about offers,
//! completed or failed upgrades, inbound chat and presence. Every method
//! has a no-op default so an adapter only overrides what it renders.
//! [`ChannelEvents`] forwards everything into an mpsc channel, which is how
//! the line adapter and the tests consume them.

use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::time::Instant;

use crate::transport::TransportKind;

/// Callbacks raised by the peer core
///
/// Called from reader and timer threads; implementations must not block
/// for long.
pub trait PeerEvents: Send + Sync {
    /// `peer` offered a direct link; answer with accept or reject before `deadline`
    fn offer_received(&self, _peer: &str, _deadline: Instant) {}

    /// The direct link to `peer` is up
    fn ready(&self, _peer: &str) {}

    /// `peer` declined our offer, or abandoned the handshake
    fn rejected(&self, _peer: &str) {}

    /// The handshake with `peer` aged out
    fn timed_out(&self, _peer: &str) {}

    /// The direct link or handshake with `peer` failed; traffic uses the relay
    fn transport_error(&self, _peer: &str, _reason: &str) {}

    /// Chat content arrived
    fn message(&self, _from: &str, _content: &str, _via: TransportKind) {}

    /// The server delivered our message to `to`
    fn delivered(&self, _to: &str) {}

    /// Presence snapshot from the server
    fn user_list(&self, _users: &[String]) {}

    /// The server reported an error, optionally concerning `peer`
    fn server_error(&self, _message: &str, _peer: Option<&str>) {}

    /// Connection to the relay server was lost
    fn disconnected(&self) {}
}

/// Events that do nothing
pub struct NoEvents;

impl PeerEvents for NoEvents {}

/// Owned form of every [`PeerEvents`] callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    OfferReceived { peer: String, deadline: Instant },
    Ready { peer: String },
    Rejected { peer: String },
    TimedOut { peer: String },
    TransportError { peer: String, reason: String },
    Message { from: String, content: String, via: TransportKind },
    Delivered { to: String },
    UserList { users: Vec<String> },
    ServerError { message: String, peer: Option<String> },
    Disconnected,
}

/// Forwards events into a channel
pub struct ChannelEvents {
    tx: Mutex<Sender<PeerEvent>>,
}

impl ChannelEvents {
    pub fn new(tx: Sender<PeerEvent>) -> Self {
        ChannelEvents { tx: Mutex::new(tx) }
    }

    fn emit(&self, event: PeerEvent) {
        if let Ok(tx) = self.tx.lock() {
            // Receiver gone means nobody is listening any more
            let _ = tx.send(event);
        }
    }
}

impl PeerEvents for ChannelEvents {
    fn offer_received(&self, peer: &str, deadline: Instant) {
        self.emit(PeerEvent::OfferReceived {
            peer: peer.to_string(),
            deadline,
        });
    }

    fn ready(&self, peer: &str) {
        self.emit(PeerEvent::Ready {
            peer: peer.to_string(),
        });
    }

    fn rejected(&self, peer: &str) {
        self.emit(PeerEvent::Rejected {
            peer: peer.to_string(),
        });
    }

    fn timed_out(&self, peer: &str) {
        self.emit(PeerEvent::TimedOut {
            peer: peer.to_string(),
        });
    }

    fn transport_error(&self, peer: &str, reason: &str) {
        self.emit(PeerEvent::TransportError {
            peer: peer.to_string(),
            reason: reason.to_string(),
        });
    }

    fn message(&self, from: &str, content: &str, via: TransportKind) {
        self.emit(PeerEvent::Message {
            from: from.to_string(),
            content: content.to_string(),
            via,
        });
    }

    fn delivered(&self, to: &str) {
        self.emit(PeerEvent::Delivered { to: to.to_string() });
    }

    fn user_list(&self, users: &[String]) {
        self.emit(PeerEvent::UserList {
            users: users.to_vec(),
        });
    }

    fn server_error(&self, message: &str, peer: Option<&str>) {
        self.emit(PeerEvent::ServerError {
            message: message.to_string(),
            peer: peer.map(str::to_string),
        });
    }

    fn disconnected(&self) {
        self.emit(PeerEvent::Disconnected);
    }
}

/// Receives frames that arrived over a direct link
pub trait InboundSink: Send + Sync {
    fn deliver(&self, from: &str, frame: &[u8], via: TransportKind);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_channel_events_forward_in_order() {
        let (tx, rx) = mpsc::channel();
        let events = ChannelEvents::new(tx);

        events.ready("bob");
        events.message("bob", "hi", TransportKind::Direct);
        events.server_error("NoSuchPeer", Some("ghost"));

        assert_eq!(rx.try_recv().unwrap(), PeerEvent::Ready { peer: "bob".into() });
        assert_eq!(
            rx.try_recv().unwrap(),
            PeerEvent::Message {
                from: "bob".into(),
                content: "hi".into(),
                via: TransportKind::Direct
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            PeerEvent::ServerError {
                message: "NoSuchPeer".into(),
                peer: Some("ghost".into())
            }
        );
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = mpsc::channel();
        let events = ChannelEvents::new(tx);
        drop(rx);
        events.disconnected();
    }
}
