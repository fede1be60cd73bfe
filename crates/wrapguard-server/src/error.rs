// ============================================
// File: crates/wrapguard-server/src/error.rs
// ============================================
//! # Supervisor Error Types
//!
//! ## Last Modified
//! v0.1.0 - Initial error definitions

use thiserror::Error;

use wrapguard_common::error::CommonError;
use wrapguard_core::error::CoreError;
use wrapguard_tunnel::error::TunnelError;

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Supervisor error types.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad {
        path: String,
        reason: String,
    },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        field: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    ConfigMissing {
        field: String,
    },

    #[error("No peer can route to {peer_ip}")]
    UnknownRoutePeer {
        peer_ip: String,
    },

    #[error("Supervisor failed to start: {reason}")]
    StartupFailed {
        reason: String,
    },

    #[error("Failed to launch child process: {reason}")]
    ChildLaunch {
        reason: String,
    },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn config_missing(field: impl Into<String>) -> Self {
        Self::ConfigMissing {
            field: field.into(),
        }
    }

    pub fn startup_failed(reason: impl Into<String>) -> Self {
        Self::StartupFailed {
            reason: reason.into(),
        }
    }

    pub fn child_launch(reason: impl Into<String>) -> Self {
        Self::ChildLaunch {
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigMissing { .. }
                | Self::UnknownRoutePeer { .. }
        )
    }

    /// Fatal errors abort startup with exit code 1.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. }
                | Self::ConfigInvalid { .. }
                | Self::ConfigMissing { .. }
                | Self::UnknownRoutePeer { .. }
                | Self::StartupFailed { .. }
                | Self::ChildLaunch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServerError::config_load("/etc/wg0.conf", "file not found");
        assert!(err.to_string().contains("/etc/wg0.conf"));
    }

    #[test]
    fn test_error_classification() {
        let err = ServerError::config_invalid("interface.address", "missing prefix");
        assert!(err.is_config_error());
        assert!(err.is_fatal());

        let err = ServerError::UnknownRoutePeer {
            peer_ip: "10.0.0.3".into(),
        };
        assert!(err.is_config_error());
    }
}
