//! Newline-delimited transport over a TCP stream
//!
//! Used for the relay link on both ends: the server holds one per connected
//! peer, and each peer holds one to the server.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{ReceiveCallback, Received, Transport, TransportError, TransportKind};
use crate::wire::MAX_LINE_LEN;

/// Relay link carrying one wire line per frame
pub struct LineTransport {
    /// Remote address, for logs and thread names
    label: String,
    /// Write half (serialises concurrent senders)
    writer: Mutex<TcpStream>,
    /// Handle used to shut the socket down
    stream: TcpStream,
    /// Read half, taken by the first `on_receive`
    reader: Mutex<Option<TcpStream>>,
    /// Longest accepted inbound line
    max_line: usize,
    closed: Arc<AtomicBool>,
}

impl LineTransport {
    /// Wrap an established stream
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let reader = stream.try_clone()?;

        Ok(LineTransport {
            label,
            writer: Mutex::new(writer),
            stream,
            reader: Mutex::new(Some(reader)),
            max_line: MAX_LINE_LEN,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Close the link when a peer sends a line longer than `max_line` bytes
    pub fn with_max_line_len(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Connect to a relay server
    pub fn connect(addr: SocketAddr, timeout: Duration) -> std::io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Self::new(stream)
    }

    /// Remote address of the stream
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Transport for LineTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().map_err(|_| TransportError::Closed)?;
        writer.write_all(bytes)?;
        if !bytes.ends_with(b"\n") {
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("Closing line transport to {}", self.label);
            // Wakes the reader thread with end-of-stream
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn on_receive(&self, mut callback: ReceiveCallback) {
        let reader = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(reader) = reader else {
            log::warn!("Receive callback already registered for {}", self.label);
            return;
        };

        let label = self.label.clone();
        let closed = self.closed.clone();
        let max_line = self.max_line;
        let spawned = thread::Builder::new()
            .name(format!("line-{}", label))
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut line = Vec::new();
                loop {
                    line.clear();
                    let limit = max_line as u64 + 1;
                    match (&mut reader).take(limit).read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(n) if n as u64 >= limit && !line.ends_with(b"\n") => {
                            log::warn!("Line from {} exceeds {} bytes, closing", label, max_line);
                            break;
                        }
                        Ok(_) => {
                            while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                                line.pop();
                            }
                            if !line.is_empty() {
                                callback(Received::Frame(line.clone()));
                            }
                        }
                        Err(e) => {
                            if !closed.load(Ordering::Acquire) {
                                log::debug!("Read error from {}: {}", label, e);
                            }
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::Release);
                callback(Received::Closed);
            });

        if let Err(e) = spawned {
            log::error!("Failed to spawn reader for {}: {}", self.label, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
