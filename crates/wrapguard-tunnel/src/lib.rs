// ============================================
// File: crates/wrapguard-tunnel/src/lib.rs
// ============================================
//! # WrapGuard Tunnel Library
//!
//! ## Creation Reason
//! Connects the virtual network stack to a WireGuard peer without any
//! kernel interface: an in-memory tunnel device stands in for a TUN, a
//! driver task runs the WireGuard data plane over it, and adapter pumps
//! couple the device to the stack.
//!
//! ## Main Functionality
//! - [`device`]: `MemoryTunnel`, two bounded packet queues plus an
//!   up/down lifecycle signal
//! - [`engine`]: `WireGuardEngine`, the boringtun-backed data-plane
//!   driver (encapsulation, decapsulation, handshake timers, peer UDP)
//! - [`adapter`]: `TunnelAdapter`, the inbound and outbound pumps
//!
//! ## Data Flow
//! ```text
//! stack outgoing ──► adapter ──► device(app→engine) ──► engine ──► UDP peer
//! UDP peer ──► engine ──► device(engine→app) ──► adapter ──► stack.deliver
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Engine failures are terminal for the adapter but never crash the
//!   supervisor: the device goes down and outbound packets are counted
//!   as dropped
//! - Peer indices in the routing engine and in `EngineConfig::peers`
//!   must refer to the same declaration order
//!
//! ## Last Modified
//! v0.1.0 - Initial tunnel library

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod device;
pub mod engine;
pub mod error;

// Re-export primary types
pub use adapter::TunnelAdapter;
pub use device::{DeviceState, MemoryTunnel};
pub use engine::{EngineConfig, PeerConfig, WireGuardEngine};
pub use error::{Result, TunnelError};

// Key material types are part of the engine's configuration surface.
pub use boringtun::x25519;
