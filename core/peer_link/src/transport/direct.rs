//! Direct peer-to-peer transport
//!
//! A TCP stream between two peers carrying length-prefixed [`LinkFrame`]s.
//! The stream is authenticated by the `Hello`/`Welcome` exchange using the
//! session token agreed over signaling.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{ReceiveCallback, Received, Transport, TransportError, TransportKind};
use crate::framing::{encode_frame, read_frame, write_frame, LinkFrame};

/// Established direct link to one peer
pub struct DirectTransport {
    /// Identity of the remote peer
    peer: String,
    writer: Mutex<BufWriter<TcpStream>>,
    stream: TcpStream,
    reader: Mutex<Option<TcpStream>>,
    closed: Arc<AtomicBool>,
}

impl DirectTransport {
    fn from_stream(stream: TcpStream, peer: String) -> std::io::Result<Self> {
        stream.set_read_timeout(None)?;
        stream.set_nodelay(true)?;
        if let Ok(addr) = stream.peer_addr() {
            log::debug!("Direct link to {} at {}", peer, addr);
        }
        let writer = stream.try_clone()?;
        let reader = stream.try_clone()?;

        Ok(DirectTransport {
            peer,
            writer: Mutex::new(BufWriter::new(writer)),
            stream,
            reader: Mutex::new(Some(reader)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Dial `addr` and complete the dialer side of the handshake
    pub fn dial(
        addr: SocketAddr,
        token: &str,
        local: &str,
        expected_peer: &str,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        write_frame(
            &mut stream,
            &LinkFrame::Hello {
                token: token.to_string(),
                identity: local.to_string(),
            },
        )?;

        match read_frame(&mut stream)? {
            LinkFrame::Welcome { identity } if identity == expected_peer => {
                stream.set_write_timeout(None)?;
                Self::from_stream(stream, identity)
            }
            LinkFrame::Welcome { identity } => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("expected {} but {} answered", expected_peer, identity),
            )),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected handshake frame: {:?}", other),
            )),
        }
    }

    /// Complete the listener side of the handshake on an accepted stream
    pub fn accept(
        mut stream: TcpStream,
        token: &str,
        local: &str,
        expected_peer: &str,
        timeout: Duration,
    ) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        match read_frame(&mut stream)? {
            LinkFrame::Hello {
                token: offered,
                identity,
            } if offered == token && identity == expected_peer => {
                write_frame(
                    &mut stream,
                    &LinkFrame::Welcome {
                        identity: local.to_string(),
                    },
                )?;
                stream.set_write_timeout(None)?;
                Self::from_stream(stream, identity)
            }
            LinkFrame::Hello { identity, .. } => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("rejected hello from {}", identity),
            )),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected handshake frame: {:?}", other),
            )),
        }
    }

    /// Identity of the remote peer
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        // An unencodable frame says nothing about the link
        let encoded = encode_frame(&LinkFrame::Data(bytes.to_vec()))
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut writer = self.writer.lock().map_err(|_| TransportError::Closed)?;
        writer.write_all(&encoded)?;
        writer.flush()?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("Closing direct link to {}", self.peer);
            // A sender stalled on a full socket holds the writer; skip the
            // goodbye then, the shutdown below unblocks it
            if let Ok(mut writer) = self.writer.try_lock() {
                let _ = write_frame(&mut *writer, &LinkFrame::Goodbye);
            }
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn on_receive(&self, mut callback: ReceiveCallback) {
        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(reader) = reader else {
            log::warn!("Receive callback already registered for direct link to {}", self.peer);
            return;
        };

        let peer = self.peer.clone();
        let closed = self.closed.clone();
        let spawned = thread::Builder::new()
            .name(format!("direct-{}", peer))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                loop {
                    match read_frame(&mut reader) {
                        Ok(LinkFrame::Data(bytes)) => callback(Received::Frame(bytes)),
                        Ok(LinkFrame::Goodbye) => {
                            log::info!("Direct link to {} closed by peer", peer);
                            break;
                        }
                        Ok(other) => {
                            log::debug!("Ignoring {:?} on established link to {}", other, peer);
                        }
                        Err(e) => {
                            if !closed.load(Ordering::Acquire) {
                                log::warn!("Direct link to {} failed: {}", peer, e);
                            }
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::Release);
                callback(Received::Closed);
            });

        if let Err(e) = spawned {
            log::error!("Failed to spawn direct reader for {}: {}", self.peer, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn handshake(token_seen_by_listener: &'static str) -> (std::io::Result<DirectTransport>, std::io::Result<DirectTransport>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            DirectTransport::accept(stream, token_seen_by_listener, "bob", "alice", TIMEOUT)
        });

        let dialed = DirectTransport::dial(addr, "tok-1", "alice", "bob", TIMEOUT);
        (dialed, acceptor.join().unwrap())
    }

    #[test]
    fn test_handshake_and_data() {
        let (alice, bob) = handshake("tok-1");
        let alice = alice.unwrap();
        let bob = bob.unwrap();
        assert_eq!(alice.peer(), "bob");
        assert_eq!(bob.peer(), "alice");

        let (tx, rx) = mpsc::channel();
        bob.on_receive(Box::new(move |r| {
            let _ = tx.send(r);
        }));

        alice.send(b"hello over direct").unwrap();
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Received::Frame(b"hello over direct".to_vec())
        );

        alice.close();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Received::Closed);
        assert!(bob.is_closed());
    }

    #[test]
    fn test_longest_wire_line_crosses_link() {
        let (alice, bob) = handshake("tok-1");
        let alice = alice.unwrap();
        let bob = bob.unwrap();

        let (tx, rx) = mpsc::channel();
        bob.on_receive(Box::new(move |r| {
            let _ = tx.send(r);
        }));

        let line = vec![b'x'; crate::wire::MAX_LINE_LEN];
        alice.send(&line).unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Received::Frame(line));
        assert!(!alice.is_closed());
    }

    #[test]
    fn test_unencodable_frame_keeps_link_open() {
        let (alice, bob) = handshake("tok-1");
        let alice = alice.unwrap();
        let bob = bob.unwrap();

        let (tx, rx) = mpsc::channel();
        bob.on_receive(Box::new(move |r| {
            let _ = tx.send(r);
        }));

        let oversized = vec![b'x'; crate::framing::MAX_FRAME_SIZE as usize + 1];
        assert!(matches!(alice.send(&oversized), Err(TransportError::Encode(_))));
        assert!(!alice.is_closed());

        alice.send(b"still up").unwrap();
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Received::Frame(b"still up".to_vec())
        );
    }

    #[test]
    fn test_wrong_token_is_rejected() {
        let (dialed, accepted) = handshake("other-token");
        assert_eq!(
            accepted.err().map(|e| e.kind()),
            Some(std::io::ErrorKind::PermissionDenied)
        );
        assert!(dialed.is_err());
    }
}
