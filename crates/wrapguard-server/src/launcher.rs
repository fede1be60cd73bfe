// ============================================
// File: crates/wrapguard-server/src/launcher.rs
// ============================================
//! # Child Launcher
//!
//! ## Creation Reason
//! The whole point of the supervisor is to run an unmodified command
//! with its network transparently tunneled. This module launches that
//! command with the shim preloaded and keeps signal behavior sane.
//!
//! ## Main Functionality
//! - Spawns the child with inherited stdio and the WrapGuard
//!   environment (`LD_PRELOAD`, `WRAPGUARD_IPC_PATH`, optionally
//!   `WRAPGUARD_SOCKS_PORT`)
//! - Forwards SIGINT/SIGTERM to the child
//! - On a forwarded signal, grants a grace period before SIGKILL
//! - Propagates the child's exit code
//!
//! ## ⚠️ Important Note for Next Developer
//! - The shim library is looked up next to the supervisor binary;
//!   `WRAPGUARD_SHIM_PATH` overrides the location for development
//!
//! ## Last Modified
//! v0.1.0 - Initial launcher implementation

use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};

/// Name of the shim library placed next to the supervisor binary.
pub const SHIM_LIBRARY_NAME: &str = "libwrapguard_shim.so";

/// How long a signalled child gets before SIGKILL.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================
// Shim Discovery
// ============================================

/// Locates the shim library to preload into the child.
pub fn shim_library_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("WRAPGUARD_SHIM_PATH") {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()
        .map_err(|e| ServerError::startup_failed(format!("cannot locate own binary: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| ServerError::startup_failed("binary has no parent directory"))?;
    Ok(dir.join(SHIM_LIBRARY_NAME))
}

// ============================================
// Child Execution
// ============================================

/// Runs `command` with `env` added, forwarding signals, and returns the
/// exit code to propagate.
pub async fn run_child(command: &[String], env: &[(String, String)]) -> Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| ServerError::child_launch("no command specified"))?;

    info!(command = %command.join(" "), "launching child process");
    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .spawn()
        .map_err(|e| ServerError::child_launch(format!("'{program}': {e}")))?;
    let pid = child.id();

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| ServerError::child_launch(format!("signal handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ServerError::child_launch(format!("signal handler: {e}")))?;

    let forwarded = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| ServerError::child_launch(e.to_string()))?;
            let code = status.code().unwrap_or(1);
            debug!(code, "child exited");
            return Ok(code);
        }
        _ = sigint.recv() => libc::SIGINT,
        _ = sigterm.recv() => libc::SIGTERM,
    };

    info!(signal = forwarded, "forwarding signal to child");
    forward_signal(pid, forwarded);

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(_) => debug!("child exited after signal"),
        Err(_) => {
            warn!("child did not exit within grace period, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
    Ok(1)
}

/// Sends `signo` to the child, if it is still running.
fn forward_signal(pid: Option<u32>, signo: i32) {
    if let Some(pid) = pid {
        // The child may already be gone; delivery is best-effort.
        unsafe {
            libc::kill(pid as libc::pid_t, signo);
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let code = run_child(
            &["/bin/sh".to_string(), "-c".to_string(), "exit 7".to_string()],
            &[],
        )
        .await
        .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn test_success_is_zero() {
        let code = run_child(&["/bin/true".to_string()], &[]).await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_environment_reaches_child() {
        let code = run_child(
            &[
                "/bin/sh".to_string(),
                "-c".to_string(),
                r#"test "$WRAPGUARD_IPC_PATH" = /tmp/test.sock"#.to_string(),
            ],
            &[("WRAPGUARD_IPC_PATH".to_string(), "/tmp/test.sock".to_string())],
        )
        .await
        .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let err = run_child(&["/nonexistent/program".to_string()], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::ChildLaunch { .. }));

        let err = run_child(&[], &[]).await.unwrap_err();
        assert!(matches!(err, ServerError::ChildLaunch { .. }));
    }

    #[test]
    fn test_shim_path_override() {
        std::env::set_var("WRAPGUARD_SHIM_PATH", "/opt/wg/libwrapguard_shim.so");
        let path = shim_library_path().unwrap();
        std::env::remove_var("WRAPGUARD_SHIM_PATH");
        assert_eq!(path, PathBuf::from("/opt/wg/libwrapguard_shim.so"));
    }
}
