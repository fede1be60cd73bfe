// ============================================
// File: crates/wrapguard-core/src/error.rs
// ============================================
//! # Core Error Types
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use wrapguard_common::error::CommonError;
use wrapguard_common::types::{ConnectionId, ConnectionState, Endpoint};

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the packet codec, the virtual stack and the
/// routing engine.
#[derive(Error, Debug)]
pub enum CoreError {
    // ========================================
    // Stack Errors
    // ========================================
    /// No connection with the given id.
    #[error("Unknown connection {id}")]
    UnknownConnection {
        /// The id that wasn't found
        id: ConnectionId,
    },

    /// Local endpoint already claimed by another connection or listener.
    #[error("Address {endpoint} already in use")]
    AddressInUse {
        /// The contested endpoint
        endpoint: Endpoint,
    },

    /// Operation requires a bound connection.
    #[error("Connection {id} is not bound to a local endpoint")]
    NotBound {
        /// The offending connection
        id: ConnectionId,
    },

    /// No listener at the given endpoint.
    #[error("No listener at {endpoint}")]
    NoListener {
        /// Where a listener was expected
        endpoint: Endpoint,
    },

    /// Operation requires a connected connection.
    #[error("Connection {id} is not connected")]
    NotConnected {
        /// The offending connection
        id: ConnectionId,
    },

    /// Operation invalid for the connection's current state.
    #[error("Cannot {operation} a connection in state '{state}'")]
    InvalidState {
        /// What was attempted
        operation: &'static str,
        /// The state it was attempted in
        state: ConnectionState,
    },

    /// A bounded queue rejected a payload.
    #[error("Queue full: {resource}")]
    QueueFull {
        /// Which queue overflowed
        resource: &'static str,
    },

    /// The connection table is at capacity.
    #[error("Connection limit reached: {limit}")]
    ConnectionLimit {
        /// The configured limit
        limit: usize,
    },

    // ========================================
    // Packet Errors
    // ========================================
    /// Packet bytes could not be parsed.
    #[error("Malformed packet: {reason}")]
    MalformedPacket {
        /// Why parsing failed
        reason: String,
    },

    /// Packet carries a transport this stack does not handle.
    #[error("Unsupported transport protocol {protocol}")]
    UnsupportedProtocol {
        /// The IP protocol number
        protocol: u8,
    },

    /// A well-formed packet matched no connection or listener.
    #[error("No matching endpoint for packet to {destination}")]
    NoMatchingEndpoint {
        /// Where the packet was addressed
        destination: Endpoint,
    },

    // ========================================
    // Routing Errors
    // ========================================
    /// A routing policy string could not be parsed.
    #[error("Invalid routing policy '{value}': {reason}")]
    InvalidPolicy {
        /// The offending policy text
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Error from the common crate.
    #[error(transparent)]
    Common(#[from] CommonError),
}

impl CoreError {
    /// Creates a `MalformedPacket` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPacket {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidPolicy` error.
    pub fn invalid_policy(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error is the sender's fault: a malformed or
    /// unroutable packet that should be dropped and counted, not surfaced.
    #[must_use]
    pub const fn is_packet_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedPacket { .. }
                | Self::UnsupportedProtocol { .. }
                | Self::NoMatchingEndpoint { .. }
        )
    }

    /// Returns `true` if this error reports transient exhaustion.
    #[must_use]
    pub const fn is_resource_error(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::ConnectionLimit { .. })
    }
}
