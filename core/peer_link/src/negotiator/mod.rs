//! Session negotiator
//!
//! Drives the per-pair handshake that upgrades a peer from the relay
//! transport to a direct one: offer, accept or reject, fragment exchange,
//! ready. On success the peer's directory entry is swapped to the direct
//! transport; on any later failure it falls back to the relay.
//!
//! # Concurrency
//!
//! Each pair's [`SessionRequest`] sits behind its own mutex, so handshakes
//! with different peers never contend. The session map itself is locked only
//! to look up, insert or remove an entry. A session lock may be held while
//! taking the map lock, never the other way round.
//!
//! Every session carries an id. Timer and ready callbacks are tagged with
//! the id they were started for, so a callback from a superseded session is
//! ignored.
//!
//! # Dueling Offers
//!
//! If both peers initiate at once, the offer from the lexicographically
//! smaller identity wins. The larger side drops its own offer, adopts the
//! incoming one and accepts it without asking (its user already asked for
//! the upgrade).

pub mod candidate;
pub mod connector;
pub mod rendezvous;
pub mod session;
pub mod timer;

pub use connector::{
    ConnectorError, DirectConnector, LinkBuilder, LinkContext, MemoryConnector, ReadyCallback,
};
pub use rendezvous::TcpRendezvous;
pub use session::{SessionRequest, SessionState};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::directory::{Directory, DirectoryError};
use crate::events::{InboundSink, PeerEvents};
use crate::router::{RouteError, Router};
use crate::transport::{Received, TransportHandle, TransportKind};
use crate::wire::{Message, MessageKind, SignalType};
use timer::Deadline;

/// Default handshake deadline
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

type SessionEntry = Arc<Mutex<SessionRequest>>;

/// An installed direct link
struct LinkInfo {
    /// Directory version of the install
    version: u64,
    transport: TransportHandle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Negotiates direct links between the local peer and its remotes
pub struct Negotiator {
    local: String,
    router: Arc<Router>,
    connector: Arc<dyn DirectConnector>,
    events: Arc<dyn PeerEvents>,
    inbound: Arc<dyn InboundSink>,
    timeout: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    links: Mutex<HashMap<String, LinkInfo>>,
    next_id: AtomicU64,
    me: Weak<Negotiator>,
}

impl Negotiator {
    pub fn new(
        local: &str,
        router: Arc<Router>,
        connector: Arc<dyn DirectConnector>,
        events: Arc<dyn PeerEvents>,
        inbound: Arc<dyn InboundSink>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Negotiator {
            local: local.to_string(),
            router,
            connector,
            events,
            inbound,
            timeout,
            sessions: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            me: me.clone(),
        })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn directory(&self) -> &Arc<Directory> {
        self.router.directory()
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Offer a direct link to `remote`
    pub fn initiate(&self, remote: &str) -> Result<(), NegotiationError> {
        if remote == self.local {
            return Err(NegotiationError::InvalidPeer(remote.to_string()));
        }
        if lock(&self.links).contains_key(remote) {
            return Err(NegotiationError::AlreadyActive(remote.to_string()));
        }
        if !self.directory().lookup(remote).is_some_and(|r| r.active) {
            return Err(RouteError::NoSuchPeer(remote.to_string()).into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;
        let entry: SessionEntry = Arc::new(Mutex::new(SessionRequest::new(
            id,
            &self.local,
            remote,
            deadline,
        )));
        let mut session = lock(&entry);
        {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(remote) {
                return Err(NegotiationError::AlreadyPending(remote.to_string()));
            }
            sessions.insert(remote.to_string(), entry.clone());
        }

        let result = self.send_offer(remote, &mut session);
        if let Err(e) = &result {
            log::warn!("Offer to {} failed: {}", remote, e);
            self.retire(remote, &entry, &mut session, SessionState::Closed);
        }
        result
    }

    fn send_offer(&self, remote: &str, session: &mut SessionRequest) -> Result<(), NegotiationError> {
        let ctx = self.link_context(remote, session.id, session.deadline);
        let (offer, builder) = self.connector.offer(ctx)?;
        session.builder = Some(builder);
        session.timer = Some(self.start_timer(remote, session.id, session.deadline)?);
        session.transition(SessionState::OfferSent);
        self.signal(SignalType::Offer, remote, &offer)?;
        Ok(())
    }

    /// Accept the pending offer from `remote`
    pub fn accept(&self, remote: &str) -> Result<(), NegotiationError> {
        self.with_live(remote, |entry, session| {
            if session.state != SessionState::OfferReceived {
                return Err(NegotiationError::InvalidState {
                    peer: remote.to_string(),
                    state: session.state,
                });
            }
            self.accept_locked(remote, entry, session)
        })
        .unwrap_or_else(|| Err(NegotiationError::NoSession(remote.to_string())))
    }

    fn accept_locked(
        &self,
        remote: &str,
        entry: &SessionEntry,
        session: &mut SessionRequest,
    ) -> Result<(), NegotiationError> {
        let Some(offer) = session.pending_offer.take() else {
            self.retire(remote, entry, session, SessionState::Closed);
            return Err(NegotiationError::InvalidState {
                peer: remote.to_string(),
                state: SessionState::OfferReceived,
            });
        };

        let ctx = self.link_context(remote, session.id, session.deadline);
        let (answer, builder) = match self.connector.answer(ctx, &offer) {
            Ok(answered) => answered,
            Err(e) => {
                log::warn!("Cannot answer offer from {}: {}", remote, e);
                self.send_reject(remote);
                self.retire(remote, entry, session, SessionState::Closed);
                return Err(e.into());
            }
        };
        session.builder = Some(builder);
        session.transition(SessionState::Accepted);

        if let Err(e) = self.signal(SignalType::Answer, remote, &answer) {
            self.retire(remote, entry, session, SessionState::Closed);
            return Err(e.into());
        }
        self.begin_establishing(remote, session);
        Ok(())
    }

    /// Decline the pending offer from `remote`, or abandon our own
    pub fn reject(&self, remote: &str) -> Result<(), NegotiationError> {
        self.with_live(remote, |entry, session| {
            self.send_reject(remote);
            self.retire(remote, entry, session, SessionState::Rejected);
        })
        .ok_or_else(|| NegotiationError::NoSession(remote.to_string()))
    }

    /// Send one address fragment to `remote`
    pub fn exchange_fragment(&self, remote: &str, fragment: &str) -> Result<(), NegotiationError> {
        self.with_live(remote, |_, session| {
            if session.state != SessionState::Establishing {
                return Err(NegotiationError::InvalidState {
                    peer: remote.to_string(),
                    state: session.state,
                });
            }
            self.signal(SignalType::Candidate, remote, fragment)
                .map_err(NegotiationError::from)
        })
        .unwrap_or_else(|| Err(NegotiationError::NoSession(remote.to_string())))
    }

    /// Tear down the direct link to `remote` (or the handshake in progress)
    pub fn close(&self, remote: &str) -> Result<(), NegotiationError> {
        let link = lock(&self.links).remove(remote);
        if let Some(link) = link {
            log::info!("Closing direct link to {}", remote);
            self.revert(remote, link);
            return Ok(());
        }
        self.reject(remote)
    }

    /// Handshake state with `remote`
    pub fn state(&self, remote: &str) -> SessionState {
        if lock(&self.links).contains_key(remote) {
            return SessionState::Active;
        }
        let entry = lock(&self.sessions).get(remote).cloned();
        entry
            .map(|e| lock(&e).state)
            .filter(|s| !s.is_terminal())
            .unwrap_or(SessionState::Idle)
    }

    pub fn is_active(&self, remote: &str) -> bool {
        lock(&self.links).contains_key(remote)
    }

    /// Peers with an installed direct link, sorted
    pub fn active_links(&self) -> Vec<String> {
        let mut peers: Vec<String> = lock(&self.links).keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Abort every handshake and drop every direct link
    pub fn shutdown(&self) {
        let sessions: Vec<(String, SessionEntry)> = lock(&self.sessions).drain().collect();
        for (_, entry) in sessions {
            let mut session = lock(&entry);
            if !session.state.is_terminal() {
                session.release();
                session.transition(SessionState::Closed);
            }
        }

        let links: Vec<(String, LinkInfo)> = lock(&self.links).drain().collect();
        for (remote, link) in links {
            self.revert(&remote, link);
        }
    }

    // ========================================================================
    // Inbound Signaling
    // ========================================================================

    /// Dispatch one relayed signaling message
    pub fn handle_signal(&self, msg: &Message) -> Result<(), NegotiationError> {
        let MessageKind::Signal(signal_type) = msg.kind else {
            log::debug!("Ignoring non-signal message from {}", msg.from);
            return Ok(());
        };
        if msg.to != self.local {
            log::warn!("Ignoring signal for {} addressed to us", msg.to);
            return Ok(());
        }

        let remote = msg.from.as_str();
        match signal_type {
            SignalType::Offer => self.on_offer(remote, &msg.body),
            SignalType::Answer => self.on_answer(remote, &msg.body),
            SignalType::Candidate => {
                self.on_fragment(remote, &msg.body);
                Ok(())
            }
            SignalType::Reject => {
                self.on_reject(remote);
                Ok(())
            }
        }
    }

    fn on_offer(&self, remote: &str, offer: &str) -> Result<(), NegotiationError> {
        if remote == self.local {
            return Err(NegotiationError::InvalidPeer(remote.to_string()));
        }

        let link = lock(&self.links).remove(remote);
        if let Some(link) = link {
            log::info!("New offer from {} replaces the direct link", remote);
            self.revert(remote, link);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;

        let prompt = loop {
            let existing = lock(&self.sessions).get(remote).cloned();
            let Some(entry) = existing else {
                let entry: SessionEntry = Arc::new(Mutex::new(SessionRequest::new(
                    id,
                    remote,
                    &self.local,
                    deadline,
                )));
                let mut session = lock(&entry);
                {
                    let mut sessions = lock(&self.sessions);
                    if sessions.contains_key(remote) {
                        continue;
                    }
                    sessions.insert(remote.to_string(), entry.clone());
                }
                break self.adopt_offer(remote, &entry, &mut session, offer, false)?;
            };

            let mut session = lock(&entry);
            if session.state.is_terminal() {
                // Retired while we waited; it is out of the map now
                continue;
            }

            let dueling = session.state == SessionState::OfferSent;
            if dueling && self.local.as_str() < remote {
                log::info!("Dueling offers with {}: keeping ours", remote);
                break None;
            }
            if dueling {
                log::info!("Dueling offers with {}: adopting theirs", remote);
            } else {
                log::info!("Offer from {} replaces session in state {}", remote, session.state);
            }

            session.release();
            *session = SessionRequest::new(id, remote, &self.local, deadline);
            break self.adopt_offer(remote, &entry, &mut session, offer, dueling)?;
        };

        if let Some(deadline) = prompt {
            self.events.offer_received(remote, deadline);
        }
        Ok(())
    }

    /// Install `offer` as the pending offer; returns the deadline if the user must decide
    fn adopt_offer(
        &self,
        remote: &str,
        entry: &SessionEntry,
        session: &mut SessionRequest,
        offer: &str,
        auto_accept: bool,
    ) -> Result<Option<Instant>, NegotiationError> {
        session.pending_offer = Some(offer.to_string());
        match self.start_timer(remote, session.id, session.deadline) {
            Ok(timer) => session.timer = Some(timer),
            Err(e) => {
                self.retire(remote, entry, session, SessionState::Closed);
                return Err(e);
            }
        }
        session.transition(SessionState::OfferReceived);

        if auto_accept {
            self.accept_locked(remote, entry, session)?;
            return Ok(None);
        }
        Ok(Some(session.deadline))
    }

    fn on_answer(&self, remote: &str, answer: &str) -> Result<(), NegotiationError> {
        let outcome = self.with_live(remote, |entry, session| {
            if session.state != SessionState::OfferSent {
                return Err(NegotiationError::InvalidState {
                    peer: remote.to_string(),
                    state: session.state,
                });
            }

            let applied = match session.builder.as_mut() {
                Some(builder) => builder.apply_answer(answer),
                None => Err(ConnectorError::Aborted),
            };
            if let Err(e) = applied {
                log::warn!("Unusable answer from {}: {}", remote, e);
                self.send_reject(remote);
                self.retire(remote, entry, session, SessionState::Closed);
                return Err(e.into());
            }

            session.transition(SessionState::Accepted);
            self.begin_establishing(remote, session);
            Ok(())
        });

        match outcome {
            None => {
                log::debug!("Dropping answer from {}: no session", remote);
                Err(NegotiationError::NoSession(remote.to_string()))
            }
            Some(Err(NegotiationError::Connector(e))) => {
                self.events.transport_error(remote, &e.to_string());
                Err(NegotiationError::Connector(e))
            }
            Some(result) => result,
        }
    }

    fn on_fragment(&self, remote: &str, fragment: &str) {
        let known = self.with_live(remote, |_, session| {
            if session.state == SessionState::Establishing {
                if let Some(builder) = session.builder.as_mut() {
                    if let Err(e) = builder.apply_fragment(fragment) {
                        log::debug!("Discarding fragment from {}: {}", remote, e);
                    }
                }
            } else {
                log::debug!("Queueing fragment from {} while {}", remote, session.state);
                session.queued_fragments.push(fragment.to_string());
            }
        });
        if known.is_none() {
            log::debug!("Dropping late fragment from {}", remote);
        }
    }

    fn on_reject(&self, remote: &str) {
        let known = self
            .with_live(remote, |entry, session| {
                self.retire(remote, entry, session, SessionState::Rejected);
            })
            .is_some();

        if known {
            self.events.rejected(remote);
        } else {
            log::debug!("Dropping reject from {}: no session", remote);
        }
    }

    // ========================================================================
    // Link Lifecycle
    // ========================================================================

    /// The connector finished building (or failed to build) the link for session `id`
    fn on_ready(&self, remote: &str, id: u64, result: Result<TransportHandle, ConnectorError>) {
        enum Outcome {
            Ready,
            Failed(String),
            Stale,
        }

        let outcome = self
            .with_live(remote, |entry, session| {
                if session.id != id || session.state != SessionState::Establishing {
                    return Outcome::Stale;
                }
                let installed = match &result {
                    Ok(transport) => self
                        .install(remote, transport.clone())
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                match installed {
                    Ok(()) => {
                        self.retire(remote, entry, session, SessionState::Active);
                        Outcome::Ready
                    }
                    Err(reason) => {
                        log::warn!("Direct link to {} failed: {}", remote, reason);
                        self.send_reject(remote);
                        self.retire(remote, entry, session, SessionState::Closed);
                        Outcome::Failed(reason)
                    }
                }
            })
            .unwrap_or(Outcome::Stale);

        match outcome {
            Outcome::Ready => self.events.ready(remote),
            Outcome::Failed(reason) => {
                if let Ok(transport) = result {
                    transport.close();
                }
                self.events.transport_error(remote, &reason);
            }
            Outcome::Stale => {
                if let Ok(transport) = result {
                    log::debug!("Closing link to {} from a superseded session", remote);
                    transport.close();
                }
            }
        }
    }

    /// Swap the directory entry to `transport` and start reading from it
    fn install(&self, remote: &str, transport: TransportHandle) -> Result<(), DirectoryError> {
        let version = self.directory().replace_transport(remote, transport.clone())?;
        let previous = lock(&self.links).insert(
            remote.to_string(),
            LinkInfo {
                version,
                transport: transport.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.transport.close();
        }

        let me = self.me.clone();
        let peer = remote.to_string();
        transport.on_receive(Box::new(move |received| {
            let Some(negotiator) = me.upgrade() else {
                return;
            };
            match received {
                Received::Frame(frame) => {
                    negotiator
                        .inbound
                        .deliver(&peer, &frame, TransportKind::Direct)
                }
                Received::Closed => negotiator.on_link_closed(&peer, version),
            }
        }));
        Ok(())
    }

    fn on_timeout(&self, remote: &str, id: u64) {
        let expired = self
            .with_live(remote, |entry, session| {
                if session.id != id {
                    return false;
                }
                self.retire(remote, entry, session, SessionState::TimedOut);
                true
            })
            .unwrap_or(false);

        if expired {
            self.events.timed_out(remote);
        }
    }

    fn on_link_closed(&self, remote: &str, version: u64) {
        let link = {
            let mut links = lock(&self.links);
            let current = links.get(remote).is_some_and(|l| l.version == version);
            if current {
                links.remove(remote)
            } else {
                None
            }
        };
        // Absent means it was closed on purpose or already replaced
        let Some(link) = link else {
            return;
        };

        log::warn!("Direct link to {} closed, falling back to relay", remote);
        self.revert(remote, link);
        self.events.transport_error(remote, "direct link closed");
    }

    /// The transport to `remote` failed while establishing or active
    pub fn on_transport_error(&self, remote: &str, reason: &str) {
        if self.teardown(remote) {
            self.events.transport_error(remote, reason);
        }
    }

    /// `remote` left the relay
    pub fn on_peer_disconnect(&self, remote: &str) {
        if self.teardown(remote) {
            self.events.transport_error(remote, "peer disconnected");
        }
    }

    /// Close any session and link with `remote`; true if there was one
    fn teardown(&self, remote: &str) -> bool {
        let had_session = self
            .with_live(remote, |entry, session| {
                self.retire(remote, entry, session, SessionState::Closed);
            })
            .is_some();

        let link = lock(&self.links).remove(remote);
        let had_link = link.is_some();
        if let Some(link) = link {
            self.revert(remote, link);
        }
        had_session || had_link
    }

    /// Put the relay back for `remote` and close the direct transport
    fn revert(&self, remote: &str, link: LinkInfo) {
        if self
            .directory()
            .fallback_to_relay(remote, Some(link.version))
            .is_none()
        {
            log::debug!("Directory entry for {} already moved on", remote);
        }
        link.transport.close();
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Run `f` on the live session with `remote`, if there is one
    fn with_live<R>(
        &self,
        remote: &str,
        f: impl FnOnce(&SessionEntry, &mut SessionRequest) -> R,
    ) -> Option<R> {
        let entry = lock(&self.sessions).get(remote).cloned()?;
        let mut session = lock(&entry);
        if session.state.is_terminal() {
            return None;
        }
        Some(f(&entry, &mut session))
    }

    /// End a session: stop its timer and builder and drop it from the map
    fn retire(
        &self,
        remote: &str,
        entry: &SessionEntry,
        session: &mut SessionRequest,
        through: SessionState,
    ) {
        session.release();
        session.transition(through);
        if through != SessionState::Active && through != SessionState::Closed {
            session.transition(SessionState::Closed);
        }

        let mut sessions = lock(&self.sessions);
        if sessions.get(remote).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            sessions.remove(remote);
        }
    }

    fn begin_establishing(&self, remote: &str, session: &mut SessionRequest) {
        session.transition(SessionState::Establishing);
        let queued = std::mem::take(&mut session.queued_fragments);
        let Some(builder) = session.builder.as_mut() else {
            return;
        };

        for fragment in queued {
            if let Err(e) = builder.apply_fragment(&fragment) {
                log::debug!("Discarding queued fragment from {}: {}", remote, e);
            }
        }
        for fragment in builder.local_fragments() {
            if let Err(e) = self.signal(SignalType::Candidate, remote, &fragment) {
                log::warn!("Cannot send fragment to {}: {}", remote, e);
                break;
            }
        }
    }

    fn signal(&self, signal_type: SignalType, remote: &str, payload: &str) -> Result<(), RouteError> {
        self.router
            .route_via_relay(&Message::signal(signal_type, self.local.as_str(), remote, payload))
            .map(|_| ())
    }

    fn send_reject(&self, remote: &str) {
        if let Err(e) = self.signal(SignalType::Reject, remote, "") {
            log::debug!("Cannot send reject to {}: {}", remote, e);
        }
    }

    fn link_context(&self, remote: &str, id: u64, deadline: Instant) -> LinkContext {
        let me = self.me.clone();
        let peer = remote.to_string();
        LinkContext {
            local: self.local.clone(),
            remote: remote.to_string(),
            deadline,
            ready: Box::new(move |result| {
                if let Some(negotiator) = me.upgrade() {
                    negotiator.on_ready(&peer, id, result);
                }
            }),
        }
    }

    fn start_timer(&self, remote: &str, id: u64, at: Instant) -> Result<Deadline, NegotiationError> {
        let me = self.me.clone();
        let peer = remote.to_string();
        Deadline::start(remote, at, move || {
            if let Some(negotiator) = me.upgrade() {
                negotiator.on_timeout(&peer, id);
            }
        })
        .map_err(|e| NegotiationError::Timer(e.to_string()))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from negotiating a direct link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// A handshake with this peer is already in progress
    AlreadyPending(String),
    /// A direct link with this peer is already up
    AlreadyActive(String),
    /// No handshake with this peer
    NoSession(String),
    /// The operation does not apply in the session's current state
    InvalidState { peer: String, state: SessionState },
    /// Peer cannot take part (e.g. ourselves)
    InvalidPeer(String),
    Route(RouteError),
    Connector(ConnectorError),
    /// Deadline timer could not be started
    Timer(String),
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationError::AlreadyPending(peer) => {
                write!(f, "handshake with '{}' already pending", peer)
            }
            NegotiationError::AlreadyActive(peer) => {
                write!(f, "direct link with '{}' already active", peer)
            }
            NegotiationError::NoSession(peer) => write!(f, "no handshake with '{}'", peer),
            NegotiationError::InvalidState { peer, state } => {
                write!(f, "handshake with '{}' is {}", peer, state)
            }
            NegotiationError::InvalidPeer(peer) => write!(f, "cannot negotiate with '{}'", peer),
            NegotiationError::Route(e) => write!(f, "signaling failed: {}", e),
            NegotiationError::Connector(e) => write!(f, "link build failed: {}", e),
            NegotiationError::Timer(e) => write!(f, "cannot start deadline timer: {}", e),
        }
    }
}

impl std::error::Error for NegotiationError {}

impl From<RouteError> for NegotiationError {
    fn from(e: RouteError) -> Self {
        NegotiationError::Route(e)
    }
}

impl From<ConnectorError> for NegotiationError {
    fn from(e: ConnectorError) -> Self {
        NegotiationError::Connector(e)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEvents, PeerEvent};
    use crate::transport::{MemoryTransport, Transport};
    use crate::wire::{decode_line, WireMessage};
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(3);

    struct Inbox(Mutex<mpsc::Sender<(String, Vec<u8>)>>);

    impl InboundSink for Inbox {
        fn deliver(&self, from: &str, frame: &[u8], _via: TransportKind) {
            let _ = lock(&self.0).send((from.to_string(), frame.to_vec()));
        }
    }

    /// Records applied fragments and hands ready callbacks to the test
    #[derive(Clone, Default)]
    struct Scripted {
        applied: Arc<Mutex<Vec<String>>>,
        ready: Arc<Mutex<Vec<ReadyCallback>>>,
    }

    struct ScriptedBuilder {
        side: &'static str,
        applied: Arc<Mutex<Vec<String>>>,
    }

    impl DirectConnector for Scripted {
        fn offer(&self, ctx: LinkContext) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError> {
            lock(&self.ready).push(ctx.ready);
            let builder = ScriptedBuilder {
                side: "offerer",
                applied: self.applied.clone(),
            };
            Ok(("scripted-offer".to_string(), Box::new(builder)))
        }

        fn answer(
            &self,
            ctx: LinkContext,
            _offer: &str,
        ) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError> {
            lock(&self.ready).push(ctx.ready);
            let builder = ScriptedBuilder {
                side: "answerer",
                applied: self.applied.clone(),
            };
            Ok(("scripted-answer".to_string(), Box::new(builder)))
        }
    }

    impl LinkBuilder for ScriptedBuilder {
        fn local_fragments(&mut self) -> Vec<String> {
            vec![format!("frag-{}", self.side)]
        }

        fn apply_answer(&mut self, _answer: &str) -> Result<(), ConnectorError> {
            Ok(())
        }

        fn apply_fragment(&mut self, fragment: &str) -> Result<(), ConnectorError> {
            lock(&self.applied).push(fragment.to_string());
            Ok(())
        }

        fn abort(&mut self) {}
    }

    struct Side {
        negotiator: Arc<Negotiator>,
        directory: Arc<Directory>,
        events: mpsc::Receiver<PeerEvent>,
        inbox: mpsc::Receiver<(String, Vec<u8>)>,
    }

    impl Side {
        fn new(
            name: &str,
            peer: &str,
            relay: TransportHandle,
            connector: Arc<dyn DirectConnector>,
            timeout: Duration,
        ) -> Side {
            let directory = Arc::new(Directory::new());
            directory.register(peer, relay).unwrap();
            let (events_tx, events) = mpsc::channel();
            let (inbox_tx, inbox) = mpsc::channel();
            let negotiator = Negotiator::new(
                name,
                Arc::new(Router::new(directory.clone())),
                connector,
                Arc::new(ChannelEvents::new(events_tx)),
                Arc::new(Inbox(Mutex::new(inbox_tx))),
                timeout,
            );
            Side {
                negotiator,
                directory,
                events,
                inbox,
            }
        }

        fn next_event(&self) -> PeerEvent {
            self.events.recv_timeout(WAIT).expect("no event")
        }

        fn kind_of(&self, peer: &str) -> TransportKind {
            self.directory.lookup(peer).unwrap().kind()
        }
    }

    /// Alice and Bob joined by an in-process relay
    struct Harness {
        alice: Side,
        bob: Side,
        relays: Vec<(Arc<MemoryTransport>, Arc<Negotiator>)>,
    }

    impl Harness {
        fn with(alice_connector: Arc<dyn DirectConnector>, bob_connector: Arc<dyn DirectConnector>, timeout: Duration) -> Self {
            let (alice_to_bob, bob_from_alice) = MemoryTransport::pair(TransportKind::Relay);
            let (bob_to_alice, alice_from_bob) = MemoryTransport::pair(TransportKind::Relay);
            let alice = Side::new("alice", "bob", alice_to_bob, alice_connector, timeout);
            let bob = Side::new("bob", "alice", bob_to_alice, bob_connector, timeout);
            let relays = vec![
                (bob_from_alice, bob.negotiator.clone()),
                (alice_from_bob, alice.negotiator.clone()),
            ];
            Harness { alice, bob, relays }
        }

        fn memory(timeout: Duration) -> Self {
            let connector = MemoryConnector::new();
            Self::with(Arc::new(connector.clone()), Arc::new(connector), timeout)
        }

        /// Start delivering relayed signals; until then they queue up
        fn start(&self) {
            for (end, negotiator) in &self.relays {
                let negotiator = negotiator.clone();
                end.on_receive(Box::new(move |received| {
                    if let Received::Frame(line) = received {
                        let msg = Message::from_wire(&decode_line(&line).unwrap()).unwrap();
                        let _ = negotiator.handle_signal(&msg);
                    }
                }));
            }
        }

        fn upgrade(&self) {
            self.alice.negotiator.initiate("bob").unwrap();
            assert!(matches!(self.bob.next_event(), PeerEvent::OfferReceived { ref peer, .. } if peer == "alice"));
            self.bob.negotiator.accept("alice").unwrap();
            assert_eq!(self.alice.next_event(), PeerEvent::Ready { peer: "bob".into() });
            assert_eq!(self.bob.next_event(), PeerEvent::Ready { peer: "alice".into() });
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let give_up = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < give_up, "condition not reached");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_full_handshake_moves_both_entries_to_direct() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::OfferSent);
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { ref peer, .. } if peer == "alice"));
        assert_eq!(h.bob.negotiator.state("alice"), SessionState::OfferReceived);

        h.bob.negotiator.accept("alice").unwrap();
        assert_eq!(h.alice.next_event(), PeerEvent::Ready { peer: "bob".into() });
        assert_eq!(h.bob.next_event(), PeerEvent::Ready { peer: "alice".into() });

        assert_eq!(h.alice.kind_of("bob"), TransportKind::Direct);
        assert_eq!(h.bob.kind_of("alice"), TransportKind::Direct);
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Active);
        assert_eq!(h.bob.negotiator.active_links(), vec!["alice".to_string()]);

        let via = Router::new(h.alice.directory.clone())
            .route(&Message::text("alice", "bob", "hi"))
            .unwrap();
        assert_eq!(via, TransportKind::Direct);

        let (from, frame) = h.bob.inbox.recv_timeout(WAIT).unwrap();
        assert_eq!(from, "alice");
        match decode_line(&frame).unwrap() {
            WireMessage::Text { content, .. } => assert_eq!(content, "hi"),
            other => panic!("Expected Text, got {:?}", other),
        }
    }

    #[test]
    fn test_dueling_offers_yield_one_link() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);

        // Both offers are in flight before either side sees the other's
        h.alice.negotiator.initiate("bob").unwrap();
        h.bob.negotiator.initiate("alice").unwrap();
        h.start();

        assert_eq!(h.alice.next_event(), PeerEvent::Ready { peer: "bob".into() });
        assert_eq!(h.bob.next_event(), PeerEvent::Ready { peer: "alice".into() });
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Direct);
        assert_eq!(h.bob.kind_of("alice"), TransportKind::Direct);

        assert!(h.alice.events.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(h.bob.events.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_second_initiate_is_already_pending() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);

        h.alice.negotiator.initiate("bob").unwrap();
        assert_eq!(
            h.alice.negotiator.initiate("bob"),
            Err(NegotiationError::AlreadyPending("bob".into()))
        );
    }

    #[test]
    fn test_initiate_checks_peer() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);

        assert_eq!(
            h.alice.negotiator.initiate("alice"),
            Err(NegotiationError::InvalidPeer("alice".into()))
        );
        assert_eq!(
            h.alice.negotiator.initiate("carol"),
            Err(NegotiationError::Route(RouteError::NoSuchPeer("carol".into())))
        );
        assert_eq!(h.alice.negotiator.state("carol"), SessionState::Idle);
    }

    #[test]
    fn test_timeout_frees_the_pair() {
        let h = Harness::memory(Duration::from_millis(150));
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { .. }));

        assert_eq!(h.alice.next_event(), PeerEvent::TimedOut { peer: "bob".into() });
        assert_eq!(h.bob.next_event(), PeerEvent::TimedOut { peer: "alice".into() });
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Idle);
        assert_eq!(h.bob.negotiator.state("alice"), SessionState::Idle);
        assert_eq!(
            h.bob.negotiator.accept("alice"),
            Err(NegotiationError::NoSession("alice".into()))
        );

        h.alice.negotiator.initiate("bob").unwrap();
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { .. }));
    }

    #[test]
    fn test_reject_clears_both_sides() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { .. }));
        h.bob.negotiator.reject("alice").unwrap();

        assert_eq!(h.alice.next_event(), PeerEvent::Rejected { peer: "bob".into() });
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Idle);
        assert_eq!(h.bob.negotiator.state("alice"), SessionState::Idle);
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Relay);

        h.alice.negotiator.initiate("bob").unwrap();
    }

    #[test]
    fn test_fragments_before_builder_are_queued() {
        let bob_connector = Scripted::default();
        let h = Harness::with(
            Arc::new(Scripted::default()),
            Arc::new(bob_connector.clone()),
            DEFAULT_HANDSHAKE_TIMEOUT,
        );
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { .. }));

        h.bob
            .negotiator
            .handle_signal(&Message::signal(SignalType::Candidate, "alice", "bob", "early"))
            .unwrap();
        assert!(lock(&bob_connector.applied).is_empty());

        h.bob.negotiator.accept("alice").unwrap();
        assert_eq!(h.bob.negotiator.state("alice"), SessionState::Establishing);
        wait_until(|| lock(&bob_connector.applied).len() == 2);
        assert_eq!(
            *lock(&bob_connector.applied),
            vec!["early".to_string(), "frag-offerer".to_string()]
        );
    }

    #[test]
    fn test_late_fragment_is_dropped() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);

        let late = Message::signal(SignalType::Candidate, "alice", "bob", "mem-alice-0/offerer");
        assert_eq!(h.bob.negotiator.handle_signal(&late), Ok(()));
        assert_eq!(h.bob.negotiator.state("alice"), SessionState::Idle);
        assert!(h.bob.events.try_recv().is_err());
    }

    #[test]
    fn test_exchange_fragment_needs_establishing() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);

        assert_eq!(
            h.alice.negotiator.exchange_fragment("bob", "x"),
            Err(NegotiationError::NoSession("bob".into()))
        );
        h.alice.negotiator.initiate("bob").unwrap();
        assert_eq!(
            h.alice.negotiator.exchange_fragment("bob", "x"),
            Err(NegotiationError::InvalidState {
                peer: "bob".into(),
                state: SessionState::OfferSent
            })
        );
    }

    #[test]
    fn test_exchanged_fragments_reach_peer_builders() {
        let alice_connector = Scripted::default();
        let bob_connector = Scripted::default();
        let h = Harness::with(
            Arc::new(alice_connector.clone()),
            Arc::new(bob_connector.clone()),
            DEFAULT_HANDSHAKE_TIMEOUT,
        );
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { .. }));
        h.bob.negotiator.accept("alice").unwrap();
        wait_until(|| h.alice.negotiator.state("bob") == SessionState::Establishing);

        h.alice.negotiator.exchange_fragment("bob", "from-alice").unwrap();
        h.bob.negotiator.exchange_fragment("alice", "from-bob").unwrap();
        wait_until(|| lock(&bob_connector.applied).iter().any(|f| f == "from-alice"));
        wait_until(|| lock(&alice_connector.applied).iter().any(|f| f == "from-bob"));

        let (alice_end, bob_end) = MemoryTransport::pair(TransportKind::Direct);
        let alice_end: TransportHandle = alice_end;
        let bob_end: TransportHandle = bob_end;
        let alice_ready = lock(&alice_connector.ready).pop().unwrap();
        let bob_ready = lock(&bob_connector.ready).pop().unwrap();
        alice_ready(Ok(alice_end));
        bob_ready(Ok(bob_end));

        assert_eq!(h.alice.next_event(), PeerEvent::Ready { peer: "bob".into() });
        assert_eq!(h.bob.next_event(), PeerEvent::Ready { peer: "alice".into() });
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Direct);
        assert_eq!(h.bob.kind_of("alice"), TransportKind::Direct);
    }

    #[test]
    fn test_transport_error_while_establishing() {
        let alice_connector = Scripted::default();
        let h = Harness::with(
            Arc::new(alice_connector.clone()),
            Arc::new(Scripted::default()),
            DEFAULT_HANDSHAKE_TIMEOUT,
        );
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { .. }));
        h.bob.negotiator.accept("alice").unwrap();
        wait_until(|| h.alice.negotiator.state("bob") == SessionState::Establishing);

        h.alice.negotiator.on_transport_error("bob", "connection reset");

        assert_eq!(
            h.alice.next_event(),
            PeerEvent::TransportError {
                peer: "bob".into(),
                reason: "connection reset".into()
            }
        );
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Idle);
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Relay);

        // The builder's late success is discarded
        let (late, _other) = MemoryTransport::pair(TransportKind::Direct);
        let handle: TransportHandle = late.clone();
        let ready = lock(&alice_connector.ready).pop().unwrap();
        ready(Ok(handle));
        assert!(late.is_closed());
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Relay);
    }

    #[test]
    fn test_transport_error_on_active_link() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);
        h.start();
        h.upgrade();

        h.alice.negotiator.on_transport_error("bob", "write failed");

        assert_eq!(
            h.alice.next_event(),
            PeerEvent::TransportError {
                peer: "bob".into(),
                reason: "write failed".into()
            }
        );
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Idle);
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Relay);
        assert!(matches!(h.bob.next_event(), PeerEvent::TransportError { .. }));
        wait_until(|| h.bob.kind_of("alice") == TransportKind::Relay);

        h.alice.negotiator.on_transport_error("bob", "write failed");
        assert!(h.alice.events.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_failed_build_reports_and_rejects() {
        let alice_connector = Scripted::default();
        let h = Harness::with(
            Arc::new(alice_connector.clone()),
            Arc::new(Scripted::default()),
            DEFAULT_HANDSHAKE_TIMEOUT,
        );
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        assert!(matches!(h.bob.next_event(), PeerEvent::OfferReceived { .. }));
        h.bob.negotiator.accept("alice").unwrap();
        wait_until(|| h.alice.negotiator.state("bob") == SessionState::Establishing);

        let ready = lock(&alice_connector.ready).pop().unwrap();
        ready(Err(ConnectorError::Io("connection refused".into())));

        assert!(matches!(h.alice.next_event(), PeerEvent::TransportError { ref peer, .. } if peer == "bob"));
        assert_eq!(h.bob.next_event(), PeerEvent::Rejected { peer: "alice".into() });
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Idle);
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Relay);
    }

    #[test]
    fn test_link_failure_falls_back_to_relay() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);
        h.start();
        h.upgrade();

        h.alice.directory.lookup("bob").unwrap().transport.close();

        assert!(matches!(h.alice.next_event(), PeerEvent::TransportError { .. }));
        assert!(matches!(h.bob.next_event(), PeerEvent::TransportError { .. }));
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Relay);
        wait_until(|| h.bob.kind_of("alice") == TransportKind::Relay);
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Idle);

        let via = Router::new(h.alice.directory.clone())
            .route(&Message::text("alice", "bob", "still here"))
            .unwrap();
        assert_eq!(via, TransportKind::Relay);

        h.alice.negotiator.initiate("bob").unwrap();
    }

    #[test]
    fn test_active_pair_refuses_initiate_until_closed() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);
        h.start();
        h.upgrade();

        assert_eq!(
            h.alice.negotiator.initiate("bob"),
            Err(NegotiationError::AlreadyActive("bob".into()))
        );

        h.alice.negotiator.close("bob").unwrap();
        assert_eq!(h.alice.kind_of("bob"), TransportKind::Relay);
        assert!(h.alice.events.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(matches!(h.bob.next_event(), PeerEvent::TransportError { .. }));
        wait_until(|| h.bob.kind_of("alice") == TransportKind::Relay);

        h.alice.negotiator.initiate("bob").unwrap();
    }

    #[test]
    fn test_peer_disconnect_tears_down_handshake() {
        let h = Harness::memory(DEFAULT_HANDSHAKE_TIMEOUT);
        h.start();

        h.alice.negotiator.initiate("bob").unwrap();
        h.alice.negotiator.on_peer_disconnect("bob");

        assert!(matches!(h.alice.next_event(), PeerEvent::TransportError { .. }));
        assert_eq!(h.alice.negotiator.state("bob"), SessionState::Idle);

        h.alice.negotiator.on_peer_disconnect("bob");
        assert!(h.alice.events.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
