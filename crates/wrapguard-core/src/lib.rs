// ============================================
// File: crates/wrapguard-core/src/lib.rs
// ============================================
//! # WrapGuard Core Library
//!
//! ## Creation Reason
//! Implements the heart of the userspace data plane: synthesizing and
//! parsing IP packets, tracking virtual connections, and deciding which
//! WireGuard peer a packet should travel through.
//!
//! ## Main Functionality
//! - [`packet`]: IPv4/IPv6 + stream/datagram header codec
//! - [`stack`]: the virtual network stack (connection and listener
//!   tables, bounded payload queues, packet delivery)
//! - [`routing`]: policy-based peer selection
//! - [`error`]: `CoreError`
//!
//! ## Data Flow
//! ```text
//! control channel ──► stack ──► packet codec ──► outgoing queue ──► tunnel
//! tunnel ──► stack.deliver ──► connection inbound queue ──► control channel
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Stack operations never block; blocking semantics are emulated by the
//!   callers using the readiness signals the stack exposes
//! - The stack is a thin facilitator, not a conformant TCP implementation:
//!   there are no sequence numbers and no retransmission
//!
//! ## Last Modified
//! v0.1.0 - Initial core library

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod packet;
pub mod routing;
pub mod stack;

// Re-export primary types
pub use error::{CoreError, Result};
pub use routing::{PeerRouting, PortRange, RoutingEngine, RoutingPolicy, TransportFilter};
pub use stack::VirtualNetworkStack;
