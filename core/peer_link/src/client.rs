//! Peer-side core
//!
//! [`ServerConnection`] opens the relay link and handles account
//! registration and login. A successful login yields a [`PeerClient`],
//! the single interface every UI adapter drives: `send`, `list`,
//! `initiate`, `accept`, `reject`, `close_direct`, plus [`PeerEvents`]
//! callbacks.
//!
//! Each peer keeps its own [`Directory`] of remote identities. Every remote
//! starts out reached through a [`RelayTransport`] over the shared server
//! link; the negotiator swaps in a direct transport when an upgrade
//! succeeds, so `send` never needs to know which path a peer is on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::directory::Directory;
use crate::events::{InboundSink, PeerEvents};
use crate::negotiator::{
    DirectConnector, NegotiationError, Negotiator, SessionState, DEFAULT_HANDSHAKE_TIMEOUT,
};
use crate::router::{RouteError, Router};
use crate::transport::{
    LineTransport, Received, RelayTransport, Transport, TransportError, TransportHandle,
    TransportKind,
};
use crate::wire::{
    decode_line, encode_line, LineError, Message, WireMessage, NO_SUCH_PEER, TRANSPORT_ERROR,
};

/// How long to wait for the server to answer register or login
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Collaborators a logged-in peer needs
pub struct PeerOptions {
    pub connector: Arc<dyn DirectConnector>,
    pub events: Arc<dyn PeerEvents>,
    pub handshake_timeout: Duration,
}

impl PeerOptions {
    pub fn new(connector: Arc<dyn DirectConnector>, events: Arc<dyn PeerEvents>) -> Self {
        PeerOptions {
            connector,
            events,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

// ============================================================================
// Server Connection
// ============================================================================

/// Where inbound server lines go
enum Inbound {
    /// Before login: replies queue for the caller waiting on them
    Pending(Sender<WireMessage>),
    /// After login
    Ready(Weak<PeerClient>),
    Closed,
}

/// A relay link that has not logged in yet
pub struct ServerConnection {
    link: Arc<LineTransport>,
    inbound: Arc<Mutex<Inbound>>,
    replies: Receiver<WireMessage>,
}

impl ServerConnection {
    /// Connect to the relay server at `addr`
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, ClientError> {
        let link = Arc::new(LineTransport::connect(addr, timeout)?);
        let (tx, replies) = mpsc::channel();
        let inbound = Arc::new(Mutex::new(Inbound::Pending(tx)));

        let state = inbound.clone();
        link.on_receive(Box::new(move |received| {
            let mut state = lock(&state);
            match received {
                Received::Frame(line) => match &*state {
                    Inbound::Pending(tx) => match decode_line(&line) {
                        Ok(msg) => {
                            let _ = tx.send(msg);
                        }
                        Err(e) => log::warn!("Undecodable line from server: {}", e),
                    },
                    Inbound::Ready(client) => {
                        if let Some(client) = client.upgrade() {
                            client.handle_server_line(&line);
                        }
                    }
                    Inbound::Closed => {}
                },
                Received::Closed => {
                    let previous = std::mem::replace(&mut *state, Inbound::Closed);
                    drop(state);
                    if let Inbound::Ready(client) = previous {
                        if let Some(client) = client.upgrade() {
                            client.on_server_closed();
                        }
                    }
                }
            }
        }));

        log::info!("Connected to relay server at {}", addr);
        Ok(ServerConnection {
            link,
            inbound,
            replies,
        })
    }

    fn send(&self, msg: &WireMessage) -> Result<(), ClientError> {
        self.link.send(&encode_line(msg)?)?;
        Ok(())
    }

    /// Wait for the first reply `pick` recognises, skipping anything else
    fn await_reply<T>(
        &self,
        mut pick: impl FnMut(WireMessage) -> Option<Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        let give_up = Instant::now() + REPLY_TIMEOUT;
        loop {
            let remaining = give_up.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(msg) => {
                    if let Some(result) = pick(msg) {
                        return result;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Err(ClientError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(ClientError::Disconnected),
            }
        }
    }

    /// Create an account
    pub fn register(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.send(&WireMessage::Register {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        self.await_reply(|msg| match msg {
            WireMessage::RegisterSuccess => Some(Ok(())),
            WireMessage::Error { message, .. } => Some(Err(ClientError::Rejected(message))),
            other => {
                log::debug!("Skipping {} while registering", other.kind_name());
                None
            }
        })
    }

    /// Log in and hand the link over to a [`PeerClient`]
    ///
    /// On failure the connection stays usable for another attempt.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        options: PeerOptions,
    ) -> Result<Arc<PeerClient>, ClientError> {
        self.send(&WireMessage::Login {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        self.await_reply(|msg| match msg {
            WireMessage::LoginSuccess => Some(Ok(())),
            WireMessage::LoginFailed { message } => Some(Err(ClientError::LoginFailed(message))),
            WireMessage::Error { message, .. } => Some(Err(ClientError::LoginFailed(message))),
            other => {
                log::debug!("Skipping {} while logging in", other.kind_name());
                None
            }
        })?;

        let link: TransportHandle = self.link.clone();
        let client = PeerClient::new(username, link, options);

        // Lines that raced in after the login reply are handled in order
        // before the reader starts handing lines over directly
        let mut state = lock(&self.inbound);
        while let Ok(msg) = self.replies.try_recv() {
            client.handle_server_message(&msg);
        }
        if matches!(*state, Inbound::Closed) {
            return Err(ClientError::Disconnected);
        }
        *state = Inbound::Ready(Arc::downgrade(&client));
        drop(state);

        log::info!("Logged in as {}", username);
        Ok(client)
    }
}

// ============================================================================
// Peer Client
// ============================================================================

/// Routes frames from direct links back into the client
struct DirectInbound {
    client: Weak<PeerClient>,
}

impl InboundSink for DirectInbound {
    fn deliver(&self, from: &str, frame: &[u8], via: TransportKind) {
        if let Some(client) = self.client.upgrade() {
            client.handle_peer_frame(from, frame, via);
        }
    }
}

/// A logged-in peer
pub struct PeerClient {
    identity: String,
    /// Shared link to the relay server
    link: TransportHandle,
    directory: Arc<Directory>,
    router: Arc<Router>,
    negotiator: Arc<Negotiator>,
    relays: Mutex<HashMap<String, Arc<RelayTransport>>>,
    events: Arc<dyn PeerEvents>,
    closed: AtomicBool,
    me: Weak<PeerClient>,
}

impl PeerClient {
    fn new(identity: &str, link: TransportHandle, options: PeerOptions) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<PeerClient>| {
            let directory = Arc::new(Directory::new());
            let router = Arc::new(Router::new(directory.clone()));
            let negotiator = Negotiator::new(
                identity,
                router.clone(),
                options.connector,
                options.events.clone(),
                Arc::new(DirectInbound { client: me.clone() }),
                options.handshake_timeout,
            );

            PeerClient {
                identity: identity.to_string(),
                link,
                directory,
                router,
                negotiator,
                relays: Mutex::new(HashMap::new()),
                events: options.events,
                closed: AtomicBool::new(false),
                me: me.clone(),
            }
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Send chat content to `to`, over whichever transport it currently has
    pub fn send(&self, to: &str, content: &str) -> Result<TransportKind, ClientError> {
        if to == self.identity {
            return Err(ClientError::InvalidPeer(to.to_string()));
        }
        self.ensure_peer(to);
        let routed = self.router.route(&Message::text(self.identity.as_str(), to, content));
        if let Err(e) = &routed {
            if let RouteError::Transport { error, .. } = e {
                self.negotiator.on_transport_error(to, &error.to_string());
            }
            for peer in self.directory.reap_failed() {
                self.forget_peer(&peer);
            }
        }
        let via = routed?;
        log::debug!("Sent message to {} via {}", to, via);
        Ok(via)
    }

    /// Ask the server for the connected users; the answer arrives as `user_list`
    pub fn request_user_list(&self) -> Result<(), ClientError> {
        self.send_to_server(&WireMessage::ListUsers)
    }

    /// Offer `peer` a direct link
    pub fn initiate(&self, peer: &str) -> Result<(), ClientError> {
        if peer == self.identity {
            return Err(ClientError::InvalidPeer(peer.to_string()));
        }
        self.ensure_peer(peer);
        Ok(self.negotiator.initiate(peer)?)
    }

    pub fn accept(&self, peer: &str) -> Result<(), ClientError> {
        Ok(self.negotiator.accept(peer)?)
    }

    pub fn reject(&self, peer: &str) -> Result<(), ClientError> {
        Ok(self.negotiator.reject(peer)?)
    }

    /// Drop the direct link to `peer` and go back to the relay
    pub fn close_direct(&self, peer: &str) -> Result<(), ClientError> {
        Ok(self.negotiator.close(peer)?)
    }

    pub fn session_state(&self, peer: &str) -> SessionState {
        self.negotiator.state(peer)
    }

    /// Transport currently used for `peer`, if it is known
    pub fn transport_kind(&self, peer: &str) -> Option<TransportKind> {
        self.directory.lookup(peer).map(|r| r.kind())
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.link.is_closed()
    }

    /// Close every link. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("Shutting down peer {}", self.identity);
        self.negotiator.shutdown();
        self.directory.close_all();
        lock(&self.relays).clear();
        self.link.close();
    }

    fn send_to_server(&self, msg: &WireMessage) -> Result<(), ClientError> {
        self.link.send(&encode_line(msg)?)?;
        Ok(())
    }

    /// Directory record for `peer`, creating its relay transport on first use
    fn ensure_peer(&self, peer: &str) {
        self.directory.register_if_absent(peer, || {
            let relay = Arc::new(RelayTransport::new(peer, self.link.clone()));
            let client = self.me.clone();
            let from = peer.to_string();
            relay.on_receive(Box::new(move |received| {
                if let (Received::Frame(line), Some(client)) = (received, client.upgrade()) {
                    client.handle_peer_frame(&from, &line, TransportKind::Relay);
                }
            }));
            lock(&self.relays).insert(peer.to_string(), relay.clone());
            let handle: TransportHandle = relay;
            handle
        });
    }

    /// Drop all state about `peer`
    fn forget_peer(&self, peer: &str) {
        self.negotiator.on_peer_disconnect(peer);
        let relay = lock(&self.relays).remove(peer);
        if self.directory.deregister(peer).is_some() || relay.is_some() {
            log::info!("Forgot peer {}", peer);
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    fn handle_server_line(&self, line: &[u8]) {
        match decode_line(line) {
            Ok(msg) => self.handle_server_message(&msg),
            Err(e) => log::warn!("Undecodable line from server: {}", e),
        }
    }

    fn handle_server_message(&self, msg: &WireMessage) {
        match msg {
            WireMessage::Text { from, .. } => {
                self.ensure_peer(from);
                let relay = lock(&self.relays).get(from).cloned();
                let delivered = match (relay, encode_line(msg)) {
                    (Some(relay), Ok(line)) => relay.deliver(&line),
                    _ => false,
                };
                if !delivered {
                    log::warn!("Dropped relayed message from {}", from);
                }
            }
            WireMessage::Signal { from, .. } => {
                self.ensure_peer(from);
                if let Some(signal) = Message::from_wire(msg) {
                    if let Err(e) = self.negotiator.handle_signal(&signal) {
                        log::debug!("Signal from {} not applied: {}", from, e);
                    }
                }
            }
            WireMessage::Delivered { to, .. } => self.events.delivered(to),
            WireMessage::UserList { users } => {
                let known: Vec<String> = self.directory.list();
                for peer in known.iter().filter(|p| !users.contains(p)) {
                    log::info!("{} left", peer);
                    self.forget_peer(peer);
                }
                self.events.user_list(users);
            }
            WireMessage::Error { message, peer } => {
                if let Some(peer) = peer {
                    if message == NO_SUCH_PEER || message == TRANSPORT_ERROR {
                        self.forget_peer(peer);
                    }
                }
                self.events.server_error(message, peer.as_deref());
            }
            other => log::debug!("Ignoring {} from server", other.kind_name()),
        }
    }

    /// A content line from `from`, via the relay or a direct link
    fn handle_peer_frame(&self, from: &str, frame: &[u8], via: TransportKind) {
        match decode_line(frame) {
            Ok(WireMessage::Text {
                from: sender,
                content,
                ..
            }) => {
                if sender != from {
                    log::warn!("Message on {}'s {} transport claims to be from {}", from, via, sender);
                }
                self.events.message(from, &content, via);
            }
            Ok(other) => log::debug!("Ignoring {} from {} via {}", other.kind_name(), from, via),
            Err(e) => log::warn!("Undecodable frame from {} via {}: {}", from, via, e),
        }
    }

    fn on_server_closed(&self) {
        if !self.closed.load(Ordering::Acquire) {
            log::warn!("Relay server closed the connection");
            self.events.disconnected();
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Io(String),
    Encode(String),
    /// No reply from the server in time
    Timeout,
    /// The server connection is gone
    Disconnected,
    /// The server refused a registration
    Rejected(String),
    LoginFailed(String),
    /// Not a valid peer for this operation (e.g. ourselves)
    InvalidPeer(String),
    Route(RouteError),
    Negotiation(NegotiationError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
            ClientError::Encode(e) => write!(f, "encode error: {}", e),
            ClientError::Timeout => write!(f, "no reply from server"),
            ClientError::Disconnected => write!(f, "disconnected from server"),
            ClientError::Rejected(message) => write!(f, "rejected: {}", message),
            ClientError::LoginFailed(message) => write!(f, "login failed: {}", message),
            ClientError::InvalidPeer(peer) => write!(f, "invalid peer '{}'", peer),
            ClientError::Route(e) => write!(f, "{}", e),
            ClientError::Negotiation(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Closed => ClientError::Disconnected,
            other => ClientError::Io(other.to_string()),
        }
    }
}

impl From<LineError> for ClientError {
    fn from(e: LineError) -> Self {
        ClientError::Encode(e.to_string())
    }
}

impl From<RouteError> for ClientError {
    fn from(e: RouteError) -> Self {
        ClientError::Route(e)
    }
}

impl From<NegotiationError> for ClientError {
    fn from(e: NegotiationError) -> Self {
        ClientError::Negotiation(e)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEvents, PeerEvent};
    use crate::negotiator::MemoryConnector;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};

    const WAIT: Duration = Duration::from_secs(3);

    /// A scripted relay server holding one connection
    struct FakeServer {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl FakeServer {
        fn read(&mut self) -> WireMessage {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            decode_line(line.as_bytes()).unwrap()
        }

        fn write(&mut self, msg: &WireMessage) {
            self.writer.write_all(&encode_line(msg).unwrap()).unwrap();
        }
    }

    fn connect() -> (ServerConnection, FakeServer) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connection = ServerConnection::connect(addr, WAIT).unwrap();
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let server = FakeServer {
            reader: BufReader::new(stream.try_clone().unwrap()),
            writer: stream,
        };
        (connection, server)
    }

    fn options(tx: mpsc::Sender<PeerEvent>) -> PeerOptions {
        PeerOptions::new(
            Arc::new(MemoryConnector::new()),
            Arc::new(ChannelEvents::new(tx)),
        )
    }

    fn login(
        connection: &ServerConnection,
        server: &mut FakeServer,
    ) -> (Arc<PeerClient>, Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel();

        let client = std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(matches!(server.read(), WireMessage::Login { ref username, .. } if username == "alice"));
                server.write(&WireMessage::LoginSuccess);
                server.write(&WireMessage::UserList {
                    users: vec!["alice".into(), "bob".into()],
                });
            });
            connection.login("alice", "pw", options(tx)).unwrap()
        });
        (client, rx)
    }

    #[test]
    fn test_register_reports_server_error() {
        let (connection, mut server) = connect();

        let result = std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(matches!(server.read(), WireMessage::Register { .. }));
                server.write(&WireMessage::error("username taken", None));
            });
            connection.register("alice", "pw")
        });
        assert_eq!(result, Err(ClientError::Rejected("username taken".into())));
    }

    #[test]
    fn test_failed_login_can_retry() {
        let (connection, mut server) = connect();
        let (tx, _rx) = mpsc::channel();

        let result = std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(matches!(server.read(), WireMessage::Login { .. }));
                server.write(&WireMessage::LoginFailed {
                    message: "bad credentials".into(),
                });
            });
            connection.login("alice", "wrong", options(tx))
        });
        assert_eq!(
            result.err(),
            Some(ClientError::LoginFailed("bad credentials".into()))
        );

        let (_client, events) = login(&connection, &mut server);
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            PeerEvent::UserList {
                users: vec!["alice".into(), "bob".into()]
            }
        );
    }

    #[test]
    fn test_send_goes_through_relay_and_ack_is_reported() {
        let (connection, mut server) = connect();
        let (client, events) = login(&connection, &mut server);
        let _ = events.recv_timeout(WAIT);

        assert_eq!(client.send("bob", "hello").unwrap(), TransportKind::Relay);
        match server.read() {
            WireMessage::Text { from, to, content, .. } => {
                assert_eq!((from.as_str(), to.as_str(), content.as_str()), ("alice", "bob", "hello"));
            }
            other => panic!("Expected Text, got {:?}", other),
        }

        server.write(&WireMessage::Delivered {
            to: "bob".into(),
            timestamp: 1,
        });
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            PeerEvent::Delivered { to: "bob".into() }
        );
    }

    #[test]
    fn test_relayed_text_becomes_message_event() {
        let (connection, mut server) = connect();
        let (_client, events) = login(&connection, &mut server);
        let _ = events.recv_timeout(WAIT);

        server.write(&WireMessage::Text {
            from: "bob".into(),
            to: "alice".into(),
            content: "hey".into(),
            timestamp: 1,
        });
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            PeerEvent::Message {
                from: "bob".into(),
                content: "hey".into(),
                via: TransportKind::Relay
            }
        );
    }

    #[test]
    fn test_no_such_peer_forgets_the_peer() {
        let (connection, mut server) = connect();
        let (client, events) = login(&connection, &mut server);
        let _ = events.recv_timeout(WAIT);

        client.send("ghost", "boo").unwrap();
        let _ = server.read();
        assert_eq!(client.transport_kind("ghost"), Some(TransportKind::Relay));

        server.write(&WireMessage::error(NO_SUCH_PEER, Some("ghost")));
        assert_eq!(
            events.recv_timeout(WAIT).unwrap(),
            PeerEvent::ServerError {
                message: NO_SUCH_PEER.into(),
                peer: Some("ghost".into())
            }
        );
        assert_eq!(client.transport_kind("ghost"), None);
    }

    #[test]
    fn test_server_close_is_reported() {
        let (connection, mut server) = connect();
        let (client, events) = login(&connection, &mut server);
        let _ = events.recv_timeout(WAIT);

        drop(server);
        assert_eq!(events.recv_timeout(WAIT).unwrap(), PeerEvent::Disconnected);
        assert!(!client.is_connected());
        assert!(matches!(client.request_user_list(), Err(ClientError::Disconnected)));
    }

    #[test]
    fn test_send_after_server_close_drops_the_peer() {
        let (connection, mut server) = connect();
        let (client, events) = login(&connection, &mut server);
        let _ = events.recv_timeout(WAIT);

        drop(server);
        assert_eq!(events.recv_timeout(WAIT).unwrap(), PeerEvent::Disconnected);

        for _ in 0..3 {
            assert!(matches!(
                client.send("bob", "anyone?"),
                Err(ClientError::Route(RouteError::Transport { .. }))
            ));
            assert_eq!(client.transport_kind("bob"), None);
            assert!(lock(&client.relays).is_empty());
            assert!(client.directory.reap_failed().is_empty());
        }
    }

    #[test]
    fn test_cannot_message_self() {
        let (connection, mut server) = connect();
        let (client, _events) = login(&connection, &mut server);

        assert_eq!(
            client.send("alice", "me"),
            Err(ClientError::InvalidPeer("alice".into()))
        );
        assert_eq!(
            client.initiate("alice"),
            Err(ClientError::InvalidPeer("alice".into()))
        );
    }
}
