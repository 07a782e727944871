//! Address candidates for the TCP rendezvous
//!
//! A candidate is one address at which a listening peer may be reachable.
//! Candidates travel as signaling fragments (one JSON object each) and the
//! dialing side tries them in priority order. Priorities follow RFC 8445.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

// ============================================================================
// Constants (RFC 8445 Section 5.1.2.1)
// ============================================================================

/// Type preference for host candidates (highest priority)
const HOST_TYPE_PREF: u32 = 126;

/// Type preference for operator-advertised addresses
const ADVERTISED_TYPE_PREF: u32 = 100;

/// Local preference for IPv4 addresses
const IPV4_LOCAL_PREF: u32 = 65535;

/// Local preference for IPv6 addresses
const IPV6_LOCAL_PREF: u32 = 65534;

/// We only ever use one component
const COMPONENT_ID: u32 = 1;

// ============================================================================
// Candidate Types
// ============================================================================

/// Where a candidate address came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Address of a local interface
    Host,
    /// Address supplied with `--advertise` (e.g. a forwarded public address)
    Advertised,
}

impl CandidateType {
    pub fn type_preference(&self) -> u32 {
        match self {
            CandidateType::Host => HOST_TYPE_PREF,
            CandidateType::Advertised => ADVERTISED_TYPE_PREF,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateType::Host => write!(f, "host"),
            CandidateType::Advertised => write!(f, "advertised"),
        }
    }
}

// ============================================================================
// Candidate
// ============================================================================

/// One address the listening side may be reached at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    pub address: SocketAddr,
    /// Higher is tried first
    pub priority: u32,
}

impl Candidate {
    pub fn new(candidate_type: CandidateType, address: SocketAddr) -> Self {
        let priority = calculate_priority(
            candidate_type.type_preference(),
            local_preference(&address),
            COMPONENT_ID,
        );
        Candidate {
            candidate_type,
            address,
            priority,
        }
    }

    pub fn host(address: SocketAddr) -> Self {
        Self::new(CandidateType::Host, address)
    }

    pub fn advertised(address: SocketAddr) -> Self {
        Self::new(CandidateType::Advertised, address)
    }

    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }

    /// Encode as a signaling fragment
    pub fn to_fragment(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode a signaling fragment
    pub fn from_fragment(fragment: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(fragment)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} priority {}", self.candidate_type, self.address, self.priority)
    }
}

// ============================================================================
// Priority Calculation (RFC 8445 Section 5.1.2.1)
// ============================================================================

/// priority = (2^24 * type_preference) + (2^8 * local_preference) + (256 - component_id)
pub fn calculate_priority(type_pref: u32, local_pref: u32, component_id: u32) -> u32 {
    let type_pref = type_pref.min(126);
    let local_pref = local_pref.min(65535);
    let component_id = component_id.clamp(1, 256);

    (type_pref << 24) | (local_pref << 8) | (256 - component_id)
}

fn local_preference(addr: &SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(_) => IPV4_LOCAL_PREF,
        IpAddr::V6(_) => IPV6_LOCAL_PREF,
    }
}

// ============================================================================
// Candidate Gathering
// ============================================================================

/// Candidates for a listener bound to `bound`
///
/// A listener on a specific address yields just that address. A wildcard
/// listener yields every interface address (or loopback if there are none),
/// plus any advertised addresses, all on the listener's port.
pub fn gather_candidates(bound: SocketAddr, advertise: &[IpAddr]) -> Vec<Candidate> {
    let port = bound.port();
    let mut candidates: Vec<Candidate> = if bound.ip().is_unspecified() {
        let local = enumerate_local_addresses(port);
        if local.is_empty() {
            vec![Candidate::host(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))]
        } else {
            local.into_iter().map(Candidate::host).collect()
        }
    } else {
        vec![Candidate::host(bound)]
    };

    candidates.extend(
        advertise
            .iter()
            .map(|ip| Candidate::advertised(SocketAddr::new(*ip, port))),
    );
    sort_candidates_by_priority(&mut candidates);
    let mut seen = HashSet::new();
    candidates.retain(|c| seen.insert(c.address));
    candidates
}

/// Sort candidates by priority (highest first)
pub fn sort_candidates_by_priority(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
}

// ============================================================================
// Platform-specific Interface Enumeration
// ============================================================================

/// Enumerate IPv4 addresses of non-loopback interfaces
#[cfg(unix)]
pub fn enumerate_local_addresses(port: u16) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();

    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return addrs;
        }

        let mut current = ifaddrs;
        while !current.is_null() {
            let ifa = &*current;

            if !ifa.ifa_addr.is_null() && (*ifa.ifa_addr).sa_family as i32 == libc::AF_INET {
                let sockaddr_in = ifa.ifa_addr as *const libc::sockaddr_in;
                let ip_bytes = (*sockaddr_in).sin_addr.s_addr.to_ne_bytes();
                let ip = Ipv4Addr::new(ip_bytes[0], ip_bytes[1], ip_bytes[2], ip_bytes[3]);

                if !ip.is_loopback() && !addrs.iter().any(|a: &SocketAddr| a.ip() == IpAddr::V4(ip)) {
                    addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
                }
            }

            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
    }

    addrs
}

#[cfg(not(unix))]
pub fn enumerate_local_addresses(_port: u16) -> Vec<SocketAddr> {
    Vec::new()
}

// ============================================================================
// Tests
// ============================================================================
