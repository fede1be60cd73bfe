// ============================================
// File: crates/wrapguard-server/src/lib.rs
// ============================================
//! # WrapGuard Supervisor Library
//!
//! ## Creation Reason
//! The supervisor process wires everything together: it parses the
//! WireGuard configuration, runs the userspace data plane, serves the
//! control channel and the SOCKS5 proxy, mirrors child listeners through
//! the port forwarder, and launches the wrapped child process.
//!
//! ## Main Functionality
//! - [`config`]: WireGuard INI configuration parsing and CLI overrides
//! - [`control`]: the Unix-domain control channel server
//! - [`socks`]: the loopback SOCKS5 proxy
//! - [`forwarder`]: tunnel-side listener mirroring
//! - [`launcher`]: child process launch and signal forwarding
//! - [`server`]: the `Supervisor` orchestrator
//! - [`error`]: `ServerError`
//!
//! ## Process Topology
//! ```text
//! ┌──────────────────────────── supervisor ───────────────────────────┐
//! │ control channel ─┐                                                │
//! │ SOCKS5 proxy ────┼─► virtual stack ◄─► adapter ◄─► device ◄─► WG │
//! │ port forwarder ──┘                                                │
//! └───────────────────────────────▲───────────────────────────────────┘
//!                                 │ unix socket / loopback
//! ┌──────────────────────────── child ────────────────────────────────┐
//! │ unmodified application + preloaded shim                           │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The supervisor exits with the child's exit code; 1 is reserved for
//!   configuration and startup failures
//! - No root, no kernel TUN, no namespaces: everything here must keep
//!   working as an unprivileged process
//!
//! ## Last Modified
//! v0.1.0 - Initial supervisor library

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod control;
pub mod error;
pub mod forwarder;
pub mod launcher;
pub mod server;
pub mod socks;

// Re-export primary types
pub use config::WireGuardConfig;
pub use error::{Result, ServerError};
pub use server::{ProxyMode, Supervisor, SupervisorOptions};
