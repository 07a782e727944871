//! Relay router
//!
//! Forwards a message addressed `to` a peer by looking it up in the
//! directory and writing it to that peer's current transport, relay or
//! direct. The router never holds the directory lock while writing.
//!
//! Failure handling:
//! - recipient absent: `NoSuchPeer`, the directory is untouched
//! - frame the transport cannot encode: `Encode`, the transport is kept
//! - direct transport fails: the peer falls back to its relay transport and
//!   the frame is retried there once
//! - relay transport fails: the record is marked for removal (reaped
//!   lazily) and `Transport` is reported to the caller

use std::sync::Arc;

use crate::directory::Directory;
use crate::transport::{TransportError, TransportKind};
use crate::wire::{encode_line, Message};

/// Routes addressed messages through the directory
pub struct Router {
    directory: Arc<Directory>,
}

impl Router {
    pub fn new(directory: Arc<Directory>) -> Self {
        Router { directory }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Write `msg` to the recipient's current transport
    ///
    /// Returns the kind of transport that carried it.
    pub fn route(&self, msg: &Message) -> Result<TransportKind, RouteError> {
        let record = self
            .directory
            .lookup(&msg.to)
            .filter(|r| r.active)
            .ok_or_else(|| RouteError::NoSuchPeer(msg.to.clone()))?;

        let line = encode_line(&msg.to_wire())
            .map_err(|e| RouteError::Encode(e.to_string()))?;

        match record.transport.send(&line) {
            Ok(()) => {
                log::trace!(
                    "Routed {:?} {} -> {} over {}",
                    msg.kind,
                    msg.from,
                    msg.to,
                    record.transport.kind()
                );
                Ok(record.transport.kind())
            }
            Err(TransportError::Encode(e)) => Err(RouteError::Encode(e)),
            Err(e) if record.transport.kind() == TransportKind::Direct => {
                log::warn!("Direct send to '{}' failed ({}), retrying over relay", msg.to, e);
                if let Some(displaced) = self.directory.fallback_to_relay(&msg.to, Some(record.version)) {
                    displaced.close();
                }
                self.send_on_relay(&record.identity, &record.relay, record.version, &line)
            }
            Err(e) => {
                log::warn!("Relay send to '{}' failed: {}", msg.to, e);
                self.directory.mark_failed(&msg.to, record.version);
                Err(RouteError::Transport {
                    peer: msg.to.clone(),
                    error: e,
                })
            }
        }
    }

    /// Write `msg` to the recipient's relay transport, whatever its current one
    ///
    /// Signaling always travels over the relay.
    pub fn route_via_relay(&self, msg: &Message) -> Result<TransportKind, RouteError> {
        let record = self
            .directory
            .lookup(&msg.to)
            .filter(|r| r.active)
            .ok_or_else(|| RouteError::NoSuchPeer(msg.to.clone()))?;

        let line = encode_line(&msg.to_wire())
            .map_err(|e| RouteError::Encode(e.to_string()))?;

        self.send_on_relay(&record.identity, &record.relay, record.version, &line)
    }

    fn send_on_relay(
        &self,
        identity: &str,
        relay: &crate::transport::TransportHandle,
        version: u64,
        line: &[u8],
    ) -> Result<TransportKind, RouteError> {
        match relay.send(line) {
            Ok(()) => Ok(TransportKind::Relay),
            Err(TransportError::Encode(e)) => Err(RouteError::Encode(e)),
            Err(e) => {
                log::warn!("Relay send to '{}' failed: {}", identity, e);
                // Fallback may have bumped the version; mark whatever is current
                let current = self
                    .directory
                    .lookup(identity)
                    .map(|r| r.version)
                    .unwrap_or(version);
                self.directory.mark_failed(identity, current);
                Err(RouteError::Transport {
                    peer: identity.to_string(),
                    error: e,
                })
            }
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from routing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// Recipient is not in the directory
    NoSuchPeer(String),
    /// Recipient's transport failed; its record was marked for removal
    Transport { peer: String, error: TransportError },
    /// Message could not be encoded
    Encode(String),
}

impl RouteError {
    /// Peer the error concerns, if any
    pub fn peer(&self) -> Option<&str> {
        match self {
            RouteError::NoSuchPeer(peer) => Some(peer),
            RouteError::Transport { peer, .. } => Some(peer),
            RouteError::Encode(_) => None,
        }
    }
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::NoSuchPeer(peer) => write!(f, "no such peer '{}'", peer),
            RouteError::Transport { peer, error } => {
                write!(f, "transport to '{}' failed: {}", peer, error)
            }
            RouteError::Encode(e) => write!(f, "encode error: {}", e),
        }
    }
}

impl std::error::Error for RouteError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Received, Transport};
    use crate::wire::{decode_line, WireMessage};
    use std::sync::mpsc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(1);

    /// Direct transport that cannot encode anything
    struct Unencodable {
        closed: std::sync::atomic::AtomicBool,
    }

    impl Transport for Unencodable {
        fn kind(&self) -> TransportKind {
            TransportKind::Direct
        }

        fn send(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Encode("frame too large".to_string()))
        }

        fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::Release);
        }

        fn on_receive(&self, _callback: crate::transport::ReceiveCallback) {}

        fn is_closed(&self) -> bool {
            self.closed.load(std::sync::atomic::Ordering::Acquire)
        }
    }

    fn collect(end: &MemoryTransport) -> mpsc::Receiver<Received> {
        let (tx, rx) = mpsc::channel();
        end.on_receive(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx
    }

    fn expect_text(rx: &mpsc::Receiver<Received>) -> String {
        match rx.recv_timeout(TIMEOUT).unwrap() {
            Received::Frame(line) => match decode_line(&line).unwrap() {
                WireMessage::Text { content, .. } => content,
                other => panic!("Expected Text, got {:?}", other),
            },
            Received::Closed => panic!("Expected frame, got Closed"),
        }
    }

    #[test]
    fn test_route_to_absent_peer_leaves_directory_unchanged() {
        let directory = Arc::new(Directory::new());
        let (alice, _) = MemoryTransport::pair(TransportKind::Relay);
        directory.register("alice", alice).unwrap();
        let router = Router::new(directory.clone());

        let result = router.route(&Message::text("alice", "ghost", "boo"));

        assert_eq!(result, Err(RouteError::NoSuchPeer("ghost".to_string())));
        assert_eq!(directory.list(), vec!["alice"]);
    }

    #[test]
    fn test_route_writes_to_current_transport() {
        let directory = Arc::new(Directory::new());
        let (bob, bob_remote) = MemoryTransport::pair(TransportKind::Relay);
        directory.register("bob", bob).unwrap();
        let rx = collect(&bob_remote);
        let router = Router::new(directory);

        let via = router.route(&Message::text("alice", "bob", "hello")).unwrap();

        assert_eq!(via, TransportKind::Relay);
        assert_eq!(expect_text(&rx), "hello");
    }

    #[test]
    fn test_failed_relay_send_marks_record() {
        let directory = Arc::new(Directory::new());
        let (bob, _bob_remote) = MemoryTransport::pair(TransportKind::Relay);
        bob.set_failing(true);
        directory.register("bob", bob).unwrap();
        let router = Router::new(directory.clone());

        let result = router.route(&Message::text("alice", "bob", "hello"));

        assert!(matches!(result, Err(RouteError::Transport { ref peer, .. }) if peer == "bob"));
        assert!(directory.list().is_empty());
        assert_eq!(directory.reap_failed(), vec!["bob".to_string()]);
    }

    #[test]
    fn test_failed_direct_send_falls_back_to_relay() {
        let directory = Arc::new(Directory::new());
        let (relay, relay_remote) = MemoryTransport::pair(TransportKind::Relay);
        let (direct, _direct_remote) = MemoryTransport::pair(TransportKind::Direct);
        directory.register("bob", relay).unwrap();
        directory.replace_transport("bob", direct.clone()).unwrap();
        let rx = collect(&relay_remote);
        direct.set_failing(true);
        let router = Router::new(directory.clone());

        let via = router.route(&Message::text("alice", "bob", "still there?")).unwrap();

        assert_eq!(via, TransportKind::Relay);
        assert_eq!(expect_text(&rx), "still there?");
        assert!(direct.is_closed());
        assert_eq!(directory.lookup("bob").unwrap().kind(), TransportKind::Relay);
    }

    #[test]
    fn test_route_via_relay_skips_direct() {
        let directory = Arc::new(Directory::new());
        let (relay, relay_remote) = MemoryTransport::pair(TransportKind::Relay);
        let (direct, direct_remote) = MemoryTransport::pair(TransportKind::Direct);
        directory.register("bob", relay).unwrap();
        directory.replace_transport("bob", direct).unwrap();
        let relay_rx = collect(&relay_remote);
        let direct_rx = collect(&direct_remote);
        let router = Router::new(directory);

        let via = router
            .route_via_relay(&Message::signal(
                crate::wire::SignalType::Candidate,
                "alice",
                "bob",
                "fragment",
            ))
            .unwrap();

        assert_eq!(via, TransportKind::Relay);
        assert!(matches!(relay_rx.recv_timeout(TIMEOUT), Ok(Received::Frame(_))));
        assert!(direct_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_encode_failure_keeps_direct_link() {
        let directory = Arc::new(Directory::new());
        let (relay, relay_remote) = MemoryTransport::pair(TransportKind::Relay);
        directory.register("bob", relay).unwrap();
        let direct = Arc::new(Unencodable {
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        directory.replace_transport("bob", direct.clone()).unwrap();
        let relay_rx = collect(&relay_remote);
        let router = Router::new(directory.clone());

        let result = router.route(&Message::text("alice", "bob", "big"));

        assert!(matches!(result, Err(RouteError::Encode(_))));
        assert!(!direct.is_closed());
        assert_eq!(directory.lookup("bob").unwrap().kind(), TransportKind::Direct);
        assert!(directory.reap_failed().is_empty());
        assert!(relay_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
