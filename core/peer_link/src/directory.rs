//! Peer directory
//!
//! The single source of truth for who is reachable and how. Maps an
//! identity to its current transport. Every record also keeps the relay
//! transport it was registered with, so an upgraded peer can always fall
//! back to the relay.
//!
//! # Lock Discipline
//!
//! Reads (`lookup`, `list`) take the shared lock; mutations take the
//! exclusive lock only for the map edit. Transports are copied out under
//! the lock and used after it is released, so a stalled peer never holds up
//! the registry.
//!
//! # Versions
//!
//! Every install of a transport (registration, swap, fallback) gets a fresh
//! version. Senders remember the version they saw; a failure report tagged
//! with an old version is ignored, so a send that was in flight on a
//! replaced transport can never evict the record that replaced it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::transport::{same_transport, TransportHandle, TransportKind};

// ============================================================================
// Records
// ============================================================================

/// One directory entry
#[derive(Clone)]
pub struct PeerRecord {
    pub identity: String,
    /// Transport currently used to reach the peer
    pub transport: TransportHandle,
    /// Relay transport the peer was registered with
    pub relay: TransportHandle,
    /// Version of the current transport install
    pub version: u64,
    /// False once a send failure marked the record for removal
    pub active: bool,
}

impl PeerRecord {
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("identity", &self.identity)
            .field("kind", &self.transport.kind())
            .field("version", &self.version)
            .field("active", &self.active)
            .finish()
    }
}

/// Outcome of a best-effort broadcast
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of peers the frame was written to
    pub delivered: usize,
    /// Peers whose send failed (marked for removal)
    pub failed: Vec<String>,
}

// ============================================================================
// Directory
// ============================================================================

/// Concurrent registry of connected identities
pub struct Directory {
    peers: RwLock<BTreeMap<String, PeerRecord>>,
    /// Records marked by failed sends, reaped lazily: (identity, version)
    failed: Mutex<Vec<(String, u64)>>,
    next_version: AtomicU64,
}

impl Directory {
    pub fn new() -> Self {
        Directory {
            peers: RwLock::new(BTreeMap::new()),
            failed: Mutex::new(Vec::new()),
            next_version: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, PeerRecord>> {
        // A panicking writer leaves the map itself consistent
        self.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PeerRecord>> {
        self.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an identity with its relay transport
    ///
    /// Fails if an active record with that identity exists. An inactive
    /// record (marked by a failed send) is replaced and its transport closed.
    pub fn register(&self, identity: &str, transport: TransportHandle) -> Result<(), DirectoryError> {
        let displaced = {
            let mut peers = self.write();
            if peers.get(identity).is_some_and(|r| r.active) {
                return Err(DirectoryError::DuplicateIdentity(identity.to_string()));
            }
            let record = PeerRecord {
                identity: identity.to_string(),
                transport: transport.clone(),
                relay: transport,
                version: self.bump(),
                active: true,
            };
            peers.insert(identity.to_string(), record)
        };

        if let Some(old) = displaced {
            log::debug!("Replacing inactive record for '{}'", identity);
            close_record(&old);
        }
        log::info!("Registered '{}'", identity);
        Ok(())
    }

    /// Return the record for `identity`, registering one built by `make` if absent
    pub fn register_if_absent<F>(&self, identity: &str, make: F) -> PeerRecord
    where
        F: FnOnce() -> TransportHandle,
    {
        if let Some(record) = self.lookup(identity) {
            if record.active {
                return record;
            }
        }

        let (record, displaced) = {
            let mut peers = self.write();
            let existing = peers.get(identity).filter(|r| r.active).cloned();
            match existing {
                Some(existing) => (existing, None),
                None => {
                    let transport = make();
                    let record = PeerRecord {
                        identity: identity.to_string(),
                        transport: transport.clone(),
                        relay: transport,
                        version: self.bump(),
                        active: true,
                    };
                    let displaced = peers.insert(identity.to_string(), record.clone());
                    (record, displaced)
                }
            }
        };

        if let Some(old) = displaced {
            close_record(&old);
        }
        record
    }

    /// Remove a record and close its transports. No-op if absent.
    pub fn deregister(&self, identity: &str) -> Option<PeerRecord> {
        let removed = self.write().remove(identity);
        if let Some(record) = &removed {
            close_record(record);
            log::info!("Deregistered '{}'", identity);
        }
        removed
    }

    /// Remove a record only if it was registered with `relay`
    ///
    /// Used by connection teardown so a stale connection cannot evict a
    /// newer login of the same identity.
    pub fn deregister_owned(&self, identity: &str, relay: &TransportHandle) -> Option<PeerRecord> {
        let removed = {
            let mut peers = self.write();
            let owned = peers
                .get(identity)
                .is_some_and(|record| same_transport(&record.relay, relay));
            if owned {
                peers.remove(identity)
            } else {
                None
            }
        };
        if let Some(record) = &removed {
            close_record(record);
            log::info!("Deregistered '{}'", identity);
        }
        removed
    }

    /// Point read
    pub fn lookup(&self, identity: &str) -> Option<PeerRecord> {
        self.read().get(identity).cloned()
    }

    /// Sorted snapshot of active identities
    pub fn list(&self) -> Vec<String> {
        self.read()
            .values()
            .filter(|r| r.active)
            .map(|r| r.identity.clone())
            .collect()
    }

    /// Number of active records
    pub fn len(&self) -> usize {
        self.read().values().filter(|r| r.active).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort send to every active transport
    ///
    /// A failing send is recorded and marks that record; delivery to the
    /// rest continues.
    pub fn broadcast(&self, bytes: &[u8]) -> BroadcastReport {
        let targets: Vec<(String, TransportHandle, u64)> = self
            .read()
            .values()
            .filter(|r| r.active)
            .map(|r| (r.identity.clone(), r.transport.clone(), r.version))
            .collect();

        let mut report = BroadcastReport::default();
        for (identity, transport, version) in targets {
            match transport.send(bytes) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("Broadcast to '{}' failed: {}", identity, e);
                    self.mark_failed(&identity, version);
                    report.failed.push(identity);
                }
            }
        }
        report
    }

    /// Atomically install a new current transport for `identity`
    ///
    /// Sends that already copied the old handle complete on it; sends issued
    /// after the swap see the new one. The old transport is not closed.
    /// Returns the new version.
    pub fn replace_transport(
        &self,
        identity: &str,
        transport: TransportHandle,
    ) -> Result<u64, DirectoryError> {
        let mut peers = self.write();
        let record = peers
            .get_mut(identity)
            .filter(|r| r.active)
            .ok_or_else(|| DirectoryError::NotFound(identity.to_string()))?;

        record.transport = transport;
        record.version = self.bump();
        log::info!(
            "Transport for '{}' is now {} (version {})",
            identity,
            record.transport.kind(),
            record.version
        );
        Ok(record.version)
    }

    /// Restore the relay transport for `identity`
    ///
    /// With `expected_version`, only acts if the current install is still
    /// that version. Returns the transport that was displaced, if any.
    pub fn fallback_to_relay(
        &self,
        identity: &str,
        expected_version: Option<u64>,
    ) -> Option<TransportHandle> {
        let mut peers = self.write();
        let record = peers.get_mut(identity)?;
        if expected_version.is_some_and(|v| v != record.version) {
            return None;
        }
        if same_transport(&record.transport, &record.relay) {
            return None;
        }

        let displaced = std::mem::replace(&mut record.transport, record.relay.clone());
        record.version = self.bump();
        log::info!("Transport for '{}' fell back to relay", identity);
        Some(displaced)
    }

    /// Mark a record for removal after a failed send on `version`
    ///
    /// The record stops appearing in `list` immediately; it is removed by
    /// the next `reap_failed`.
    pub fn mark_failed(&self, identity: &str, version: u64) {
        {
            let mut peers = self.write();
            match peers.get_mut(identity) {
                Some(record) if record.version == version && record.active => record.active = false,
                _ => return,
            }
        }
        if let Ok(mut failed) = self.failed.lock() {
            failed.push((identity.to_string(), version));
        }
    }

    /// Remove every record marked by `mark_failed` that was not replaced since
    ///
    /// Returns the identities removed.
    pub fn reap_failed(&self) -> Vec<String> {
        let marked = match self.failed.lock() {
            Ok(mut failed) => std::mem::take(&mut *failed),
            Err(_) => return Vec::new(),
        };
        if marked.is_empty() {
            return Vec::new();
        }

        let removed: Vec<PeerRecord> = {
            let mut peers = self.write();
            marked
                .into_iter()
                .filter_map(|(identity, version)| {
                    let stale = peers
                        .get(&identity)
                        .is_some_and(|r| r.version == version && !r.active);
                    if stale {
                        peers.remove(&identity)
                    } else {
                        None
                    }
                })
                .collect()
        };

        for record in &removed {
            log::info!("Reaped '{}' after transport failure", record.identity);
            close_record(record);
        }
        removed.into_iter().map(|r| r.identity).collect()
    }

    /// Close every transport and empty the registry. Idempotent.
    pub fn close_all(&self) {
        let drained = std::mem::take(&mut *self.write());
        if let Ok(mut failed) = self.failed.lock() {
            failed.clear();
        }
        if !drained.is_empty() {
            log::info!("Closing {} peer transport(s)", drained.len());
        }
        for record in drained.values() {
            close_record(record);
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

fn close_record(record: &PeerRecord) {
    record.transport.close();
    if !same_transport(&record.transport, &record.relay) {
        record.relay.close();
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from directory mutations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// An active record with this identity already exists
    DuplicateIdentity(String),
    /// No active record with this identity
    NotFound(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::DuplicateIdentity(id) => write!(f, "identity '{}' is already active", id),
            DirectoryError::NotFound(id) => write!(f, "no active peer '{}'", id),
        }
    }
}

impl std::error::Error for DirectoryError {}

// ============================================================================
// Tests
// ============================================================================
