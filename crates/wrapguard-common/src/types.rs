// ============================================
// File: crates/wrapguard-common/src/types.rs
// ============================================
//! # Core Type Definitions
//!
//! ## Creation Reason
//! Centralizes the fundamental types used throughout WrapGuard so the
//! virtual stack, the control channel and the shim all agree on what a
//! connection is and where traffic goes.
//!
//! ## Main Functionality
//! - `ConnectionId`: opaque 32-bit identifier for virtual connections
//! - `TransportKind`: stream vs datagram transport
//! - `Endpoint`: an (address, port) pair
//! - `ConnectionState`: the connection lifecycle
//! - `AddressFamily`: v4/v6 socket domain on the wire
//!
//! ## Main Logical Flow
//! 1. The supervisor allocates `ConnectionId`s monotonically from a counter
//! 2. Ids cross the control channel and are mapped to synthesized
//!    descriptors inside the child process
//! 3. `Endpoint`s key the listener table and connection matching
//!
//! ## ⚠️ Important Note for Next Developer
//! - `ConnectionId` is opaque: it is NOT a file descriptor and ids do not
//!   densely populate a range
//! - `ConnectionState::Closed` is terminal; see `can_transition_to`
//!
//! ## Last Modified
//! v0.1.0 - Initial type definitions

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

// ============================================
// ConnectionId
// ============================================

/// Opaque identifier for a virtual connection.
///
/// Allocated monotonically by the supervisor. Holders must not assume ids
/// are dense or related to descriptor numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Wraps a raw id received over the wire.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw 32-bit value for wire encoding.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================
// TransportKind
// ============================================

/// The transport a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Ordered byte stream (TCP-like).
    Stream,
    /// Unordered datagrams (UDP-like).
    Datagram,
}

impl TransportKind {
    /// IP protocol number used on the wire (6 for stream, 17 for datagram).
    #[must_use]
    pub const fn protocol_number(self) -> u8 {
        match self {
            Self::Stream => 6,
            Self::Datagram => 17,
        }
    }

    /// Inverse of [`protocol_number`](Self::protocol_number).
    #[must_use]
    pub const fn from_protocol_number(protocol: u8) -> Option<Self> {
        match protocol {
            6 => Some(Self::Stream),
            17 => Some(Self::Datagram),
            _ => None,
        }
    }

    /// Lowercase name, matching the wire encoding.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Datagram => "datagram",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// AddressFamily
// ============================================

/// Socket domain carried in `socket` requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    /// IPv4 (`AF_INET`).
    V4,
    /// IPv6 (`AF_INET6`).
    V6,
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("v4"),
            Self::V6 => f.write_str("v6"),
        }
    }
}

// ============================================
// Endpoint
// ============================================

/// An (address, port) pair identifying one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address, v4 or v6.
    pub addr: IpAddr,
    /// Port number.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint from parts.
    #[must_use]
    pub const fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Converts to a `SocketAddr`.
    #[must_use]
    pub const fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    /// Whether the address is IPv4.
    #[must_use]
    pub const fn is_v4(self) -> bool {
        self.addr.is_ipv4()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> Self {
        ep.to_socket_addr()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

// ============================================
// ConnectionState
// ============================================

/// Lifecycle of a virtual connection.
///
/// ```text
/// created ──► bound ──► listening
///    │          │
///    └──────────┴─────► connected ──► closed
/// ```
///
/// `closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Freshly created, no local endpoint.
    Created,
    /// Bound to a local endpoint.
    Bound,
    /// Accepting inbound connections at its local endpoint.
    Listening,
    /// Exchanging payloads with a remote endpoint.
    Connected,
    /// Finished; no further transitions.
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Bound)
                | (Self::Bound, Self::Listening)
                | (Self::Created | Self::Bound, Self::Connected)
                | (
                    Self::Created | Self::Bound | Self::Listening | Self::Connected,
                    Self::Closed
                )
        )
    }

    /// Lowercase name for diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Bound => "bound",
            Self::Listening => "listening",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Tests
// ============================================
