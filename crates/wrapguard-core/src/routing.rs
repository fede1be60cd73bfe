// ============================================
// File: crates/wrapguard-core/src/routing.rs
// ============================================
//! # Routing Engine
//!
//! ## Creation Reason
//! Decides which WireGuard peer should carry a packet, combining
//! declarative routing policies with the peers' allowed prefixes.
//!
//! ## Main Functionality
//! - `RoutingPolicy`: destination CIDR + transport filter + port range +
//!   priority, parsed from `<CIDR>[:<protocol>[:<port_or_range>]]`
//! - `RoutingEngine`: lookup over the flattened policy set
//!
//! ## Lookup Algorithm
//! 1. Collect policies whose prefix contains the destination and whose
//!    transport filter and port range accept the packet
//! 2. Pick the maximum of (prefix length, declared priority); remaining
//!    ties go to the earliest-declared policy
//! 3. With no matching policy, fall back to the first peer whose allowed
//!    prefixes contain the destination
//! 4. Otherwise: no route
//!
//! ## Usage
//! ```
//! use wrapguard_core::routing::{PeerRouting, RoutingEngine, RoutingPolicy};
//! use wrapguard_common::types::TransportKind;
//!
//! let peers = vec![PeerRouting {
//!     allowed_prefixes: vec!["0.0.0.0/0".parse().unwrap()],
//!     policies: vec![RoutingPolicy::parse("10.0.0.0/8:tcp:1-65535", 0).unwrap()],
//! }];
//! let engine = RoutingEngine::new(peers);
//! let peer = engine.lookup("10.1.2.3".parse().unwrap(), TransportKind::Stream, 80);
//! assert_eq!(peer, Some(0));
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The policy set is immutable after construction; rebuild the engine
//!   to change routes
//! - Priority only breaks ties between equally specific prefixes
//!
//! ## Last Modified
//! v0.1.0 - Initial routing engine

use std::net::IpAddr;

use ipnet::IpNet;

use wrapguard_common::types::TransportKind;

use crate::error::{CoreError, Result};

// ============================================
// PortRange
// ============================================

/// Inclusive port range `[lo, hi]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    /// Lowest matching port.
    pub lo: u16,
    /// Highest matching port.
    pub hi: u16,
}

impl PortRange {
    /// The full port space, `1-65535`.
    pub const ANY: Self = Self { lo: 1, hi: 65535 };

    /// Whether `port` falls inside the range.
    #[must_use]
    pub const fn contains(self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }

    /// Parses `"80"`, `"8080-9000"`, `"any"` or `""`.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() || value == "any" {
            return Ok(Self::ANY);
        }

        let (lo, hi) = match value.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_port(lo)?;
                let hi = parse_port(hi)?;
                (lo, hi)
            }
            None => {
                let port = parse_port(value)?;
                (port, port)
            }
        };
        if lo > hi {
            return Err(CoreError::invalid_policy(value, "empty port range"));
        }
        Ok(Self { lo, hi })
    }
}

fn parse_port(value: &str) -> Result<u16> {
    let port: u16 = value
        .trim()
        .parse()
        .map_err(|_| CoreError::invalid_policy(value, "invalid port"))?;
    if port == 0 {
        return Err(CoreError::invalid_policy(value, "port 0 is not routable"));
    }
    Ok(port)
}

// ============================================
// TransportFilter
// ============================================

/// Which transports a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFilter {
    /// Stream traffic only.
    Stream,
    /// Datagram traffic only.
    Datagram,
    /// Both transports.
    Any,
}

impl TransportFilter {
    /// Whether the filter accepts a packet of `kind`.
    #[must_use]
    pub const fn accepts(self, kind: TransportKind) -> bool {
        matches!(
            (self, kind),
            (Self::Any, _)
                | (Self::Stream, TransportKind::Stream)
                | (Self::Datagram, TransportKind::Datagram)
        )
    }

    /// Parses `"tcp"`, `"udp"` or `"any"`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Stream),
            "udp" => Ok(Self::Datagram),
            "any" => Ok(Self::Any),
            other => Err(CoreError::invalid_policy(other, "unknown protocol")),
        }
    }

    /// The configuration-file spelling of the filter.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "tcp",
            Self::Datagram => "udp",
            Self::Any => "any",
        }
    }
}

impl std::fmt::Display for TransportFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// RoutingPolicy
// ============================================

/// A declarative routing rule bound to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicy {
    /// Destination prefix this policy captures.
    pub destination: IpNet,
    /// Transport filter.
    pub transport: TransportFilter,
    /// Destination port range.
    pub ports: PortRange,
    /// Declared priority; higher wins among equally specific prefixes.
    pub priority: u32,
}

impl RoutingPolicy {
    /// Parses `<CIDR>[:<protocol>[:<port_or_range>]]`.
    ///
    /// Examples: `192.168.1.0/24`, `0.0.0.0/0:tcp:80-443`,
    /// `10.0.0.0/8:any:8080-9000`.
    pub fn parse(value: &str, priority: u32) -> Result<Self> {
        let mut parts = value.trim().splitn(3, ':');
        let cidr = parts.next().unwrap_or_default();
        if cidr.is_empty() {
            return Err(CoreError::invalid_policy(value, "empty routing policy"));
        }

        let destination: IpNet = cidr
            .trim()
            .parse()
            .map_err(|_| CoreError::invalid_policy(value, format!("invalid CIDR '{cidr}'")))?;

        let transport = match parts.next() {
            Some(proto) => TransportFilter::parse(proto)?,
            None => TransportFilter::Any,
        };
        let ports = match parts.next() {
            Some(ports) => PortRange::parse(ports)?,
            None => PortRange::ANY,
        };

        Ok(Self {
            destination,
            transport,
            ports,
            priority,
        })
    }

    /// Whether this policy captures the given packet.
    #[must_use]
    pub fn matches(&self, destination: IpAddr, transport: TransportKind, port: u16) -> bool {
        self.destination.contains(&destination)
            && self.transport.accepts(transport)
            && self.ports.contains(port)
    }
}

impl std::fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}-{}",
            self.destination, self.transport, self.ports.lo, self.ports.hi
        )
    }
}

// ============================================
// RoutingEngine
// ============================================

/// The routing view of one peer.
#[derive(Debug, Clone, Default)]
pub struct PeerRouting {
    /// Prefixes the peer is allowed to carry; doubles as the fallback
    /// routing table.
    pub allowed_prefixes: Vec<IpNet>,
    /// Declared policies, in declaration order.
    pub policies: Vec<RoutingPolicy>,
}

struct PolicyEntry {
    policy: RoutingPolicy,
    peer: usize,
}

/// Chooses a peer for a (destination, transport, port) triple.
pub struct RoutingEngine {
    entries: Vec<PolicyEntry>,
    peers: Vec<PeerRouting>,
}

impl RoutingEngine {
    /// Builds the engine from per-peer routing views. Policies keep their
    /// declaration order, which breaks final ties.
    #[must_use]
    pub fn new(peers: Vec<PeerRouting>) -> Self {
        let entries = peers
            .iter()
            .enumerate()
            .flat_map(|(peer, routing)| {
                routing
                    .policies
                    .iter()
                    .cloned()
                    .map(move |policy| PolicyEntry { policy, peer })
            })
            .collect();
        Self { entries, peers }
    }

    /// Returns the index of the peer that should carry the packet, or
    /// `None` when there is no route.
    #[must_use]
    pub fn lookup(
        &self,
        destination: IpAddr,
        transport: TransportKind,
        port: u16,
    ) -> Option<usize> {
        let mut best: Option<(u8, u32, usize)> = None;
        for entry in &self.entries {
            if !entry.policy.matches(destination, transport, port) {
                continue;
            }
            let candidate = (entry.policy.destination.prefix_len(), entry.policy.priority);
            // Strict comparison keeps the earliest-declared policy on ties.
            if best.map_or(true, |(len, prio, _)| candidate > (len, prio)) {
                best = Some((candidate.0, candidate.1, entry.peer));
            }
        }
        if let Some((_, _, peer)) = best {
            return Some(peer);
        }

        self.peers.iter().position(|peer| {
            peer.allowed_prefixes
                .iter()
                .any(|prefix| prefix.contains(&destination))
        })
    }

    /// Number of flattened policies.
    #[must_use]
    pub fn policy_count(&self) -> usize {
        self.entries.len()
    }

    /// Number of peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("peers", &self.peers.len())
            .field("policies", &self.entries.len())
            .finish()
    }
}

// ============================================
// Tests
// ============================================
