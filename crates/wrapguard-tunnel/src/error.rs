// ============================================
// File: crates/wrapguard-tunnel/src/error.rs
// ============================================
//! # Tunnel Error Types
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use std::io;

use thiserror::Error;

/// Result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors from the memory device and the WireGuard engine driver.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The memory tunnel device has been closed.
    #[error("Tunnel device is closed")]
    DeviceClosed,

    /// The WireGuard engine could not be constructed.
    #[error("Engine initialization failed: {reason}")]
    EngineInit {
        /// Why initialization failed
        reason: String,
    },

    /// A configured key was rejected.
    #[error("Invalid key material: {reason}")]
    InvalidKey {
        /// Why the key was rejected
        reason: String,
    },

    /// I/O error from the peer-facing socket.
    #[error("I/O error: {context}")]
    Io {
        /// What was happening when the error occurred
        context: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl TunnelError {
    /// Creates an `EngineInit` error.
    pub fn engine_init(reason: impl Into<String>) -> Self {
        Self::EngineInit {
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidKey` error.
    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Returns `true` if this error should take the data plane down.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::EngineInit { .. } | Self::InvalidKey { .. } | Self::Io { .. }
        )
    }
}

impl From<io::Error> for TunnelError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "unspecified I/O operation".into(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::engine_init("bad peer index");
        assert!(err.to_string().contains("bad peer index"));
    }

    #[test]
    fn test_error_classification() {
        assert!(TunnelError::engine_init("x").is_fatal());
        assert!(!TunnelError::DeviceClosed.is_fatal());
    }
}
