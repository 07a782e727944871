//! In-process transport pair
//!
//! Two connected ends backed by channels. Lets the directory, router and
//! negotiator be driven without sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use super::{ReceiveCallback, Received, Transport, TransportError, TransportKind};

/// One end of an in-process transport pair
pub struct MemoryTransport {
    kind: TransportKind,
    /// Feeds the other end's inbox
    outbound: Mutex<Option<Sender<Received>>>,
    /// Feeds our own inbox (used to wake our reader on close)
    loopback: Mutex<Option<Sender<Received>>>,
    inbox: Mutex<Option<Receiver<Received>>>,
    closed: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
    /// When set, every send fails with an I/O error
    failing: AtomicBool,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair(kind: TransportKind) -> (Arc<MemoryTransport>, Arc<MemoryTransport>) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        let a_closed = Arc::new(AtomicBool::new(false));
        let b_closed = Arc::new(AtomicBool::new(false));

        let a = MemoryTransport {
            kind,
            outbound: Mutex::new(Some(b_tx.clone())),
            loopback: Mutex::new(Some(a_tx.clone())),
            inbox: Mutex::new(Some(a_rx)),
            closed: a_closed.clone(),
            peer_closed: b_closed.clone(),
            failing: AtomicBool::new(false),
        };
        let b = MemoryTransport {
            kind,
            outbound: Mutex::new(Some(a_tx)),
            loopback: Mutex::new(Some(b_tx)),
            inbox: Mutex::new(Some(b_rx)),
            closed: b_closed,
            peer_closed: a_closed,
            failing: AtomicBool::new(false),
        };

        (Arc::new(a), Arc::new(b))
    }

    /// Make every subsequent send fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(TransportError::Io("injected send failure".to_string()));
        }

        let guard = self.outbound.lock().map_err(|_| TransportError::Closed)?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(Received::Frame(bytes.to_vec()))
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.peer_closed.store(true, Ordering::Release);

        if let Some(tx) = self.outbound.lock().ok().and_then(|mut g| g.take()) {
            let _ = tx.send(Received::Closed);
        }
        if let Some(tx) = self.loopback.lock().ok().and_then(|mut g| g.take()) {
            let _ = tx.send(Received::Closed);
        }
    }

    fn on_receive(&self, mut callback: ReceiveCallback) {
        let inbox = self.inbox.lock().ok().and_then(|mut g| g.take());
        let Some(inbox) = inbox else {
            log::warn!("Receive callback already registered for memory transport");
            return;
        };

        let closed = self.closed.clone();
        let spawned = thread::Builder::new()
            .name("memory-transport".to_string())
            .spawn(move || {
                for received in inbox {
                    if received == Received::Closed {
                        break;
                    }
                    callback(received);
                }
                closed.store(true, Ordering::Release);
                callback(Received::Closed);
            });

        if let Err(e) = spawned {
            log::error!("Failed to spawn memory transport reader: {}", e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_pair_delivers_in_order() {
        let (a, b) = MemoryTransport::pair(TransportKind::Direct);
        a.send(b"one").unwrap();
        a.send(b"two").unwrap();

        let (tx, rx) = mpsc::channel();
        b.on_receive(Box::new(move |r| {
            let _ = tx.send(r);
        }));

        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Received::Frame(b"one".to_vec()));
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Received::Frame(b"two".to_vec()));
    }

    #[test]
    fn test_close_reaches_both_ends() {
        let (a, b) = MemoryTransport::pair(TransportKind::Direct);
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        a.on_receive(Box::new(move |r| {
            let _ = a_tx.send(r);
        }));
        b.on_receive(Box::new(move |r| {
            let _ = b_tx.send(r);
        }));

        a.close();

        assert_eq!(a_rx.recv_timeout(TIMEOUT).unwrap(), Received::Closed);
        assert_eq!(b_rx.recv_timeout(TIMEOUT).unwrap(), Received::Closed);
        assert!(b.is_closed());
        assert_eq!(b.send(b"late"), Err(TransportError::Closed));
    }

    #[test]
    fn test_injected_failure() {
        let (a, _b) = MemoryTransport::pair(TransportKind::Relay);
        a.set_failing(true);
        assert!(matches!(a.send(b"x"), Err(TransportError::Io(_))));
        a.set_failing(false);
        assert!(a.send(b"x").is_ok());
    }
}
