//! Relay server
//!
//! Accepts TCP connections from chat peers, authenticates them, keeps the
//! [`Directory`] of logged-in identities and relays `text` and `signal`
//! messages between them.
//!
//! The accept loop is a mio poll over the listener plus a [`Waker`] used for
//! shutdown. Each accepted connection is a [`LineTransport`] whose reader
//! thread runs the per-connection protocol, so a slow or faulty peer only
//! ever stalls its own thread.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mio::{Events, Interest, Poll, Token, Waker};
use peer_link::directory::{Directory, DirectoryError};
use peer_link::router::{RouteError, Router};
use peer_link::transport::{LineTransport, Received, Transport, TransportHandle};
use peer_link::wire::{
    decode_line, encode_line, Message, WireMessage, NO_SUCH_PEER, TRANSPORT_ERROR,
};

use crate::auth::Authenticator;
use crate::config::ServerConfig;

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// mio token for the shutdown waker
const WAKE_TOKEN: Token = Token(1);

// ============================================================================
// Shared State
// ============================================================================

/// State shared by the accept loop and every connection thread
struct Shared {
    config: ServerConfig,
    directory: Arc<Directory>,
    router: Router,
    auth: Arc<dyn Authenticator>,
    /// Every open connection, logged in or not
    connections: Mutex<HashMap<u64, Arc<LineTransport>>>,
    stopping: AtomicBool,
}

impl Shared {
    /// Push the current user list to everyone
    fn broadcast_presence(&self) {
        if !self.config.broadcast_presence || self.stopping.load(Ordering::Acquire) {
            return;
        }
        let update = WireMessage::UserList {
            users: self.directory.list(),
        };
        let line = match encode_line(&update) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Cannot encode user list: {}", e);
                return;
            }
        };
        let report = self.directory.broadcast(&line);
        log::debug!(
            "Presence sent to {} peer(s), {} failed",
            report.delivered,
            report.failed.len()
        );
        // Failed recipients drop out of the next snapshot
        self.reap();
    }

    /// Remove records whose transport failed, then tell everyone else
    fn reap(&self) {
        let removed = self.directory.reap_failed();
        if !removed.is_empty() {
            log::info!("Removed unreachable peer(s): {}", removed.join(", "));
            self.broadcast_presence();
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Stops a running [`RelayServer`] from another thread
#[derive(Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Ask the accept loop to exit; `run` closes every connection on the way out
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::error!("Failed to wake accept loop: {}", e);
        }
    }

    /// Directory of logged-in identities
    pub fn directory(&self) -> Arc<Directory> {
        self.shared.directory.clone()
    }
}

pub struct RelayServer {
    poll: Poll,
    /// Accepts on the std listener; mio only watches a clone of it
    listener: TcpListener,
    _watched: mio::net::TcpListener,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl RelayServer {
    /// Bind the listener. Failing to bind is fatal at startup.
    pub fn bind(config: ServerConfig, auth: Arc<dyn Authenticator>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        let mut watched = mio::net::TcpListener::from_std(listener.try_clone()?);
        poll.registry()
            .register(&mut watched, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        let directory = Arc::new(Directory::new());
        let shared = Arc::new(Shared {
            config,
            router: Router::new(directory.clone()),
            directory,
            auth,
            connections: Mutex::new(HashMap::new()),
            stopping: AtomicBool::new(false),
        });

        log::info!("Relay server listening on {}", local_addr);
        Ok(RelayServer {
            poll,
            listener,
            _watched: watched,
            local_addr,
            waker,
            shared,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: self.waker.clone(),
            shared: self.shared.clone(),
        }
    }

    /// Accept connections until [`ServerHandle::shutdown`]
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(64);

        'serve: loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {
                        if self.shared.stopping.load(Ordering::Acquire) {
                            break 'serve;
                        }
                    }
                    LISTENER_TOKEN => self.accept_pending(),
                    _ => {}
                }
            }
        }

        self.close_everything();
        Ok(())
    }

    /// Accept until the listener would block
    fn accept_pending(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.start_connection(stream) {
                        log::warn!("Dropping connection from {}: {}", addr, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // e.g. the peer reset before accept
                    log::warn!("Accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn start_connection(&self, stream: std::net::TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        let link = Arc::new(
            LineTransport::new(stream)?.with_max_line_len(self.shared.config.max_line_bytes),
        );
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::info!("Connection {} from {}", id, link.label());

        if let Ok(mut connections) = self.shared.connections.lock() {
            connections.insert(id, link.clone());
        }

        let mut connection = Connection {
            id,
            link: link.clone(),
            shared: self.shared.clone(),
            identity: None,
        };
        link.on_receive(Box::new(move |received| match received {
            Received::Frame(line) => connection.handle_line(&line),
            Received::Closed => connection.handle_closed(),
        }));
        Ok(())
    }

    fn close_everything(&self) {
        log::info!("Relay server shutting down");
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.directory.close_all();
        let connections: Vec<Arc<LineTransport>> = match self.shared.connections.lock() {
            Ok(mut connections) => connections.drain().map(|(_, link)| link).collect(),
            Err(_) => Vec::new(),
        };
        for link in connections {
            link.close();
        }
    }
}

// ============================================================================
// Per-Connection Protocol
// ============================================================================

/// One peer's connection, driven from its reader thread
struct Connection {
    id: u64,
    link: Arc<LineTransport>,
    shared: Arc<Shared>,
    /// Set once login succeeds
    identity: Option<String>,
}

impl Connection {
    fn handle(&self) -> TransportHandle {
        self.link.clone()
    }

    fn reply(&self, msg: &WireMessage) {
        let sent = encode_line(msg)
            .map_err(|e| e.to_string())
            .and_then(|line| self.link.send(&line).map_err(|e| e.to_string()));
        if let Err(e) = sent {
            log::debug!("Reply {} to connection {} failed: {}", msg.kind_name(), self.id, e);
        }
    }

    fn handle_line(&mut self, line: &[u8]) {
        let msg = match decode_line(line) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Malformed line on connection {}: {}", self.id, e);
                self.reply(&WireMessage::error("malformed message", None));
                return;
            }
        };
        log::trace!("Connection {} sent {}", self.id, msg.kind_name());

        match msg {
            WireMessage::Register { username, password } => self.register(&username, &password),
            WireMessage::Login { username, password } => self.login(&username, &password),
            WireMessage::ListUsers => {
                if self.require_login() {
                    self.reply(&WireMessage::UserList {
                        users: self.shared.directory.list(),
                    });
                }
            }
            WireMessage::Text { to, content, .. } => {
                if let Some(from) = self.logged_in() {
                    self.relay_text(Message::text(from, to, content));
                }
            }
            WireMessage::Signal {
                signal_type,
                to,
                payload,
                ..
            } => {
                if let Some(from) = self.logged_in() {
                    self.relay_signal(Message::signal(signal_type, from, to, payload));
                }
            }
            other => {
                self.reply(&WireMessage::error(
                    format!("unexpected {}", other.kind_name()),
                    None,
                ));
            }
        }
    }

    /// Sender identity, or an error reply if not logged in
    fn logged_in(&self) -> Option<String> {
        if self.identity.is_none() {
            self.reply(&WireMessage::error("not logged in", None));
        }
        self.identity.clone()
    }

    fn require_login(&self) -> bool {
        self.logged_in().is_some()
    }

    fn register(&self, username: &str, password: &str) {
        match self.shared.auth.register(username, password) {
            Ok(()) => self.reply(&WireMessage::RegisterSuccess),
            Err(e) => {
                log::info!("Registration of '{}' refused: {}", username, e);
                self.reply(&WireMessage::error(e.to_string(), None));
            }
        }
    }

    fn login(&mut self, username: &str, password: &str) {
        if let Some(current) = &self.identity {
            self.reply(&WireMessage::LoginFailed {
                message: format!("already logged in as {}", current),
            });
            return;
        }

        if let Err(e) = self.shared.auth.verify(username, password) {
            log::info!("Login for '{}' failed on connection {}: {}", username, self.id, e);
            self.reply(&WireMessage::LoginFailed {
                message: e.to_string(),
            });
            return;
        }

        match self.shared.directory.register(username, self.handle()) {
            Ok(()) => {
                self.identity = Some(username.to_string());
                log::info!("'{}' logged in on connection {}", username, self.id);
                self.reply(&WireMessage::LoginSuccess);
                self.shared.broadcast_presence();
            }
            Err(DirectoryError::DuplicateIdentity(_)) => {
                self.reply(&WireMessage::LoginFailed {
                    message: format!("{} is already logged in", username),
                });
            }
            Err(e) => {
                self.reply(&WireMessage::LoginFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn relay_text(&self, msg: Message) {
        match self.shared.router.route(&msg) {
            Ok(_) => self.reply(&WireMessage::Delivered {
                to: msg.to.clone(),
                timestamp: msg.timestamp,
            }),
            Err(e) => self.report_route_error(e),
        }
    }

    fn relay_signal(&self, msg: Message) {
        if let Err(e) = self.shared.router.route_via_relay(&msg) {
            self.report_route_error(e);
        }
    }

    fn report_route_error(&self, error: RouteError) {
        match &error {
            RouteError::NoSuchPeer(peer) => {
                self.reply(&WireMessage::error(NO_SUCH_PEER, Some(peer)));
            }
            RouteError::Transport { peer, .. } => {
                log::warn!("Relay to '{}' failed: {}", peer, error);
                self.reply(&WireMessage::error(TRANSPORT_ERROR, Some(peer)));
                self.shared.reap();
            }
            RouteError::Encode(e) => {
                log::error!("Cannot encode relayed message: {}", e);
                self.reply(&WireMessage::error("internal error", None));
            }
        }
    }

    fn handle_closed(&mut self) {
        log::info!("Connection {} closed", self.id);
        if let Ok(mut connections) = self.shared.connections.lock() {
            connections.remove(&self.id);
        }
        if let Some(identity) = self.identity.take() {
            if self
                .shared
                .directory
                .deregister_owned(&identity, &self.handle())
                .is_some()
            {
                log::info!("'{}' left", identity);
                self.shared.broadcast_presence();
            }
        }
    }
}
