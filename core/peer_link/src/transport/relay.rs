//! Relay-backed transport to one peer
//!
//! Wraps the shared relay link. Outbound frames are already-encoded wire
//! lines addressed to the peer, so sending is a write to the relay link;
//! the server routes them by their `to` field. Inbound lines from the peer
//! arrive on the shared link and are handed over with [`RelayTransport::deliver`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{ReceiveCallback, Received, Transport, TransportError, TransportHandle, TransportKind};

/// A peer reached through the relay server
pub struct RelayTransport {
    /// Peer identity this transport addresses
    peer: String,
    /// Shared link to the relay server
    link: TransportHandle,
    callback: Mutex<Option<ReceiveCallback>>,
    closed: AtomicBool,
}

impl RelayTransport {
    pub fn new(peer: impl Into<String>, link: TransportHandle) -> Self {
        RelayTransport {
            peer: peer.into(),
            link,
            callback: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Hand an inbound line from this peer to the receive callback
    ///
    /// Returns false if no callback is registered or the transport is closed.
    pub fn deliver(&self, line: &[u8]) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.callback.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(callback) => {
                    callback(Received::Frame(line.to_vec()));
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.link.send(bytes)
    }

    /// Closes this peer's view only; the shared relay link stays up
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let callback = self.callback.lock().ok().and_then(|mut g| g.take());
            if let Some(mut callback) = callback {
                callback(Received::Closed);
            }
        }
    }

    fn on_receive(&self, callback: ReceiveCallback) {
        if let Ok(mut guard) = self.callback.lock() {
            if guard.is_none() {
                *guard = Some(callback);
            } else {
                log::warn!("Receive callback already registered for relay to {}", self.peer);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.link.is_closed()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_send_goes_through_shared_link() {
        let (link, server) = MemoryTransport::pair(TransportKind::Relay);
        let (tx, rx) = mpsc::channel();
        server.on_receive(Box::new(move |r| {
            let _ = tx.send(r);
        }));

        let relay = RelayTransport::new("bob", link.clone());
        relay.send(b"line-for-bob").unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            Received::Frame(b"line-for-bob".to_vec())
        );
    }

    #[test]
    fn test_close_keeps_shared_link_open() {
        let (link, _server) = MemoryTransport::pair(TransportKind::Relay);
        let relay = RelayTransport::new("bob", link.clone());
        let (tx, rx) = mpsc::channel();
        relay.on_receive(Box::new(move |r| {
            let _ = tx.send(r);
        }));

        assert!(relay.deliver(b"from-bob"));
        relay.close();
        relay.close();

        assert_eq!(rx.try_recv().unwrap(), Received::Frame(b"from-bob".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), Received::Closed);
        assert!(rx.try_recv().is_err());
        assert!(!relay.deliver(b"late"));
        assert_eq!(relay.send(b"late"), Err(TransportError::Closed));
        assert!(!link.is_closed());
    }
}
