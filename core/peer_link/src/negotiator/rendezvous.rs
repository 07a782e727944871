//! TCP rendezvous connector
//!
//! The plain-socket way to build a direct link:
//!
//! ```text
//! Offerer                                   Answerer
//!   │  offer {token, listening}                │
//!   │─────────────────────────────────────────►│  binds, listens if it can
//!   │  answer {token, listening}               │
//!   │◄─────────────────────────────────────────│
//!   │  fragments: listener candidates ◄───────►│
//!   │                                          │
//!   │─── Hello{token} ──► (dialer → listener)  │
//!   │◄── Welcome ───────                       │
//! ```
//!
//! The answerer listens whenever it could bind; otherwise the offerer's
//! listener is used. The listening side sends its candidates, the other
//! side dials each one and the first authenticated connection wins.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use super::candidate::{gather_candidates, Candidate};
use super::connector::{ConnectorError, DirectConnector, LinkBuilder, LinkContext, ReadyCallback};
use crate::transport::{DirectTransport, TransportHandle};

const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);

/// Default per-attempt connect and handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Offer and answer payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Shared secret the dialer presents in its `Hello`
    pub token: String,
    /// Whether this side accepts the connection
    pub listening: bool,
}

impl SessionDescriptor {
    fn encode(&self) -> Result<String, ConnectorError> {
        serde_json::to_string(self).map_err(|e| ConnectorError::InvalidPayload(e.to_string()))
    }

    fn decode(payload: &str) -> Result<Self, ConnectorError> {
        serde_json::from_str(payload).map_err(|e| ConnectorError::InvalidPayload(e.to_string()))
    }
}

/// Random 128-bit session token, hex encoded
fn generate_token() -> Result<String, ConnectorError> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; 16];
    rng.fill(&mut buf)
        .map_err(|_| ConnectorError::Io("random source unavailable".to_string()))?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}

// ============================================================================
// Connector
// ============================================================================

/// Builds direct links by listening on one side and dialing from the other
#[derive(Debug, Clone)]
pub struct TcpRendezvous {
    bind_ip: IpAddr,
    advertise: Vec<IpAddr>,
    connect_timeout: Duration,
}

impl TcpRendezvous {
    /// Listen on `bind_ip` (port chosen by the OS), advertising `advertise` as well
    pub fn new(bind_ip: IpAddr, advertise: Vec<IpAddr>) -> Self {
        TcpRendezvous {
            bind_ip,
            advertise,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn bind(&self) -> Option<TcpListener> {
        match TcpListener::bind(SocketAddr::new(self.bind_ip, 0)) {
            Ok(listener) => Some(listener),
            Err(e) => {
                log::warn!("Cannot listen for direct links on {}: {}", self.bind_ip, e);
                None
            }
        }
    }

    fn builder(
        &self,
        ctx: LinkContext,
        token: String,
        listener: Option<TcpListener>,
    ) -> Result<RendezvousBuilder, ConnectorError> {
        let candidates = match &listener {
            Some(l) => gather_candidates(l.local_addr()?, &self.advertise),
            None => Vec::new(),
        };
        Ok(RendezvousBuilder {
            local: ctx.local,
            remote: ctx.remote,
            token,
            deadline: ctx.deadline,
            connect_timeout: self.connect_timeout,
            role: Role::Pending,
            listener,
            candidates,
            early: Vec::new(),
            waker: None,
            outcome: Arc::new(Outcome {
                ready: Mutex::new(Some(ctx.ready)),
                aborted: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for TcpRendezvous {
    fn default() -> Self {
        TcpRendezvous::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), Vec::new())
    }
}

impl DirectConnector for TcpRendezvous {
    fn offer(&self, ctx: LinkContext) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError> {
        let token = generate_token()?;
        let listener = self.bind();
        let offer = SessionDescriptor {
            token: token.clone(),
            listening: listener.is_some(),
        }
        .encode()?;

        let builder = self.builder(ctx, token, listener)?;
        Ok((offer, Box::new(builder)))
    }

    fn answer(
        &self,
        ctx: LinkContext,
        offer: &str,
    ) -> Result<(String, Box<dyn LinkBuilder>), ConnectorError> {
        let offer = SessionDescriptor::decode(offer)?;
        let listener = self.bind();
        if listener.is_none() && !offer.listening {
            return Err(ConnectorError::NoCandidates);
        }

        let answer = SessionDescriptor {
            token: offer.token.clone(),
            listening: listener.is_some(),
        }
        .encode()?;

        let mut builder = self.builder(ctx, offer.token, listener)?;
        if builder.listener.is_some() {
            builder.start_accepting()?;
        } else {
            builder.role = Role::Dialer;
        }
        Ok((answer, Box::new(builder)))
    }
}

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Offerer before the answer arrives
    Pending,
    Dialer,
    Acceptor,
}

/// Reports the first link exactly once
struct Outcome {
    ready: Mutex<Option<ReadyCallback>>,
    aborted: AtomicBool,
}

impl Outcome {
    fn is_over(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
            || self.ready.lock().map(|r| r.is_none()).unwrap_or(true)
    }

    fn succeed(&self, transport: TransportHandle) {
        let ready = if self.aborted.load(Ordering::Acquire) {
            None
        } else {
            self.ready.lock().ok().and_then(|mut r| r.take())
        };
        match ready {
            Some(ready) => ready(Ok(transport)),
            None => {
                log::debug!("Discarding surplus direct connection");
                transport.close();
            }
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        let dropped = self.ready.lock().ok().and_then(|mut r| r.take());
        drop(dropped);
    }
}

struct RendezvousBuilder {
    local: String,
    remote: String,
    token: String,
    deadline: Instant,
    connect_timeout: Duration,
    role: Role,
    listener: Option<TcpListener>,
    /// Our listener's candidates
    candidates: Vec<Candidate>,
    /// Remote candidates that arrived before the role was known
    early: Vec<Candidate>,
    waker: Option<Arc<Waker>>,
    outcome: Arc<Outcome>,
}

impl RendezvousBuilder {
    fn attempt_timeout(&self) -> Duration {
        self.deadline
            .saturating_duration_since(Instant::now())
            .min(self.connect_timeout)
    }

    fn start_accepting(&mut self) -> Result<(), ConnectorError> {
        let listener = self.listener.take().ok_or(ConnectorError::NoCandidates)?;
        listener.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let mut watched = mio::net::TcpListener::from_std(listener.try_clone()?);
        poll.registry()
            .register(&mut watched, LISTENER_TOKEN, Interest::READABLE)?;

        let acceptor = Acceptor {
            poll,
            watched,
            listener,
            token: self.token.clone(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            deadline: self.deadline,
            handshake_timeout: self.attempt_timeout(),
            outcome: self.outcome.clone(),
        };
        thread::Builder::new()
            .name(format!("rendezvous-accept-{}", self.remote))
            .spawn(move || acceptor.run())?;

        self.waker = Some(waker);
        self.role = Role::Acceptor;
        Ok(())
    }

    fn dial(&self, candidate: Candidate) {
        if self.outcome.is_over() {
            return;
        }
        let token = self.token.clone();
        let local = self.local.clone();
        let remote = self.remote.clone();
        let timeout = self.attempt_timeout();
        let outcome = self.outcome.clone();

        let spawned = thread::Builder::new()
            .name(format!("rendezvous-dial-{}", remote))
            .spawn(move || {
                if timeout.is_zero() || outcome.is_over() {
                    return;
                }
                match DirectTransport::dial(candidate.address, &token, &local, &remote, timeout) {
                    Ok(transport) => {
                        log::info!("Direct link to {} via {}", remote, candidate);
                        outcome.succeed(Arc::new(transport));
                    }
                    Err(e) => log::debug!("Dial to {} ({}) failed: {}", remote, candidate, e),
                }
            });
        if let Err(e) = spawned {
            log::warn!("Cannot spawn dialer for {}: {}", self.remote, e);
        }
    }
}

impl LinkBuilder for RendezvousBuilder {
    fn local_fragments(&mut self) -> Vec<String> {
        if self.role != Role::Acceptor {
            return Vec::new();
        }
        self.candidates
            .iter()
            .filter_map(|c| c.to_fragment().ok())
            .collect()
    }

    fn apply_answer(&mut self, answer: &str) -> Result<(), ConnectorError> {
        let answer = SessionDescriptor::decode(answer)?;
        if answer.token != self.token {
            return Err(ConnectorError::InvalidPayload("answer token mismatch".to_string()));
        }

        if answer.listening {
            // Theirs is used; ours is not needed
            self.listener = None;
            self.candidates.clear();
            self.role = Role::Dialer;
            for candidate in std::mem::take(&mut self.early) {
                self.dial(candidate);
            }
            Ok(())
        } else {
            self.start_accepting()
        }
    }

    fn apply_fragment(&mut self, fragment: &str) -> Result<(), ConnectorError> {
        let candidate = Candidate::from_fragment(fragment)
            .map_err(|e| ConnectorError::InvalidPayload(e.to_string()))?;

        match self.role {
            Role::Dialer => self.dial(candidate),
            Role::Pending => self.early.push(candidate),
            Role::Acceptor => log::debug!("Ignoring candidate {} while listening", candidate),
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.outcome.abort();
        self.listener = None;
        if let Some(waker) = self.waker.take() {
            let _ = waker.wake();
        }
    }
}

impl Drop for RendezvousBuilder {
    fn drop(&mut self) {
        self.abort();
    }
}

// ============================================================================
// Accept Loop
// ============================================================================

struct Acceptor {
    poll: Poll,
    /// Registered copy of `listener`
    watched: mio::net::TcpListener,
    listener: TcpListener,
    token: String,
    local: String,
    remote: String,
    deadline: Instant,
    handshake_timeout: Duration,
    outcome: Arc<Outcome>,
}

impl Acceptor {
    fn run(mut self) {
        let mut events = Events::with_capacity(8);

        loop {
            if self.outcome.is_over() {
                break;
            }
            let now = Instant::now();
            if now >= self.deadline {
                log::debug!("Stopped listening for {}: deadline passed", self.remote);
                break;
            }

            if let Err(e) = self.poll.poll(&mut events, Some(self.deadline - now)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("Accept poll for {} failed: {}", self.remote, e);
                break;
            }

            if events.iter().any(|e| e.token() == LISTENER_TOKEN) && self.accept_ready() {
                break;
            }
        }

        let _ = self.poll.registry().deregister(&mut self.watched);
    }

    /// Accept until the backlog is drained; true once a link is up
    fn accept_ready(&self) -> bool {
        loop {
            match self.listener.accept() {
                Ok((stream, from)) => {
                    match DirectTransport::accept(
                        stream,
                        &self.token,
                        &self.local,
                        &self.remote,
                        self.handshake_timeout,
                    ) {
                        Ok(transport) => {
                            log::info!("Direct link from {} at {}", self.remote, from);
                            self.outcome.succeed(Arc::new(transport));
                            return true;
                        }
                        Err(e) => log::debug!("Refused direct connection from {}: {}", from, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    log::warn!("Accept for {} failed: {}", self.remote, e);
                    return false;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
