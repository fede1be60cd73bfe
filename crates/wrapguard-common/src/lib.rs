// ============================================
// File: crates/wrapguard-common/src/lib.rs
// ============================================
//! # WrapGuard Common Library
//!
//! ## Creation Reason
//! Provides the shared vocabulary of the WrapGuard workspace: connection
//! identifiers, endpoint and transport types, the control-channel wire
//! records, and the base error type.
//!
//! ## Main Functionality
//! - [`types`]: Connection ids, transport kinds, endpoints, lifecycle states
//! - [`protocol`]: Control-channel request/response records (the
//!   compatibility surface between the supervisor and the preloaded shim)
//! - [`error`]: `CommonError` and the shared `Result` alias
//!
//! ## Design Philosophy
//! - No async, no I/O - this crate is pure data
//! - Both the supervisor and the shim link against it, so it stays small
//! - Wire encodings live here because they are shared, not because they
//!   are "common" in the utility-crate sense
//!
//! ## ⚠️ Important Note for Next Developer
//! - Changing `protocol` changes the wire format the shim speaks; the
//!   supervisor and shim binaries must always come from the same build
//! - Keep this crate free of heavyweight dependencies (the shim is a
//!   `cdylib` injected into arbitrary processes)
//!
//! ## Last Modified
//! v0.1.0 - Initial library structure

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod protocol;
pub mod types;

// Re-export primary types
pub use error::{CommonError, Result};
pub use types::{AddressFamily, ConnectionId, ConnectionState, Endpoint, TransportKind};
