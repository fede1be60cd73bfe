// ============================================
// File: crates/wrapguard-server/src/server.rs
// ============================================
//! # Supervisor Orchestrator
//!
//! ## Creation Reason
//! Wires the stack, the tunnel, the control channel, the SOCKS5 proxy
//! and the port forwarder together, launches the child, and tears
//! everything down in order when the child exits.
//!
//! ## Main Functionality
//! - `Supervisor`: component construction and task lifecycle
//! - `ProxyMode`: which lowering the shim should use
//! - Graceful shutdown: broadcast signal, device close, bounded joins
//!
//! ## Task Inventory
//! ```text
//! engine          WireGuard data plane over the memory device
//! outbound pump   stack outgoing queue → device
//! inbound pump    device → stack delivery
//! control         Unix-domain request/response server
//! socks           loopback SOCKS5 proxy
//! forwarder       tunnel-side listener mirroring
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The supervisor returns the child's exit code; the caller turns it
//!   into the process exit status
//! - Shutdown order matters: signal first, then close the device so the
//!   engine and pumps unblock
//!
//! ## Last Modified
//! v0.1.0 - Initial supervisor implementation

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wrapguard_core::routing::RoutingEngine;
use wrapguard_core::stack::VirtualNetworkStack;
use wrapguard_tunnel::{MemoryTunnel, TunnelAdapter, WireGuardEngine};

use crate::config::WireGuardConfig;
use crate::control::ControlChannelServer;
use crate::error::{Result, ServerError};
use crate::forwarder::PortForwarder;
use crate::launcher::{self, run_child};
use crate::socks::SocksProxy;

/// Name given to the in-memory tunnel device.
const DEVICE_NAME: &str = "wg0";

/// How long each background task gets to finish at shutdown.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================
// Options
// ============================================

/// Which lowering the preloaded shim uses for outbound connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProxyMode {
    /// Kernel sockets with `connect` redirected through the SOCKS5
    /// proxy; `bind` is still announced over the control channel.
    Socks,
    /// Every socket call proxied through the control channel against
    /// the virtual stack.
    Emulate,
}

/// Supervisor run options.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Shim lowering for outbound connections.
    pub proxy_mode: ProxyMode,
    /// The command to run, program first.
    pub command: Vec<String>,
    /// Explicit shim library location; discovered next to the binary
    /// when absent.
    pub shim_path: Option<std::path::PathBuf>,
}

// ============================================
// Supervisor
// ============================================

/// The WrapGuard supervisor.
pub struct Supervisor {
    config: WireGuardConfig,
    options: SupervisorOptions,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    /// Creates a supervisor from a validated configuration.
    #[must_use]
    pub fn new(config: WireGuardConfig, options: SupervisorOptions) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            options,
            shutdown_tx,
        }
    }

    /// Runs the data plane and the child; returns the child's exit code.
    pub async fn run(&self) -> Result<i32> {
        info!("starting WrapGuard v{}", env!("CARGO_PKG_VERSION"));

        // Virtual stack, addressed like the tunnel interface.
        let stack = VirtualNetworkStack::new();
        stack.set_local_addresses(self.config.addresses().collect());
        let routing = Arc::new(RoutingEngine::new(self.config.peer_routing()));

        // Data plane: device, engine, pumps.
        let device = MemoryTunnel::new(DEVICE_NAME, self.config.interface.mtu);
        let engine = WireGuardEngine::new(
            self.config.to_engine_config(),
            Arc::clone(&routing),
            Arc::clone(&device),
        )
        .map_err(|e| ServerError::startup_failed(format!("engine: {e}")))?;
        info!(
            port = engine.listen_port().map_err(ServerError::from)?,
            peers = engine.peer_count(),
            "WireGuard engine configured"
        );
        for (i, peer) in self.config.peers.iter().enumerate() {
            debug!(
                peer = i,
                public_key = %hex::encode(peer.public_key),
                endpoint = ?peer.endpoint,
                "peer configured"
            );
        }

        let mut tasks: Vec<(&str, JoinHandle<()>)> = Vec::new();
        tasks.push(("engine", engine.spawn(self.shutdown_tx.subscribe())));

        let adapter = TunnelAdapter::new(Arc::clone(&stack), Arc::clone(&device));
        let outgoing = stack
            .take_outgoing()
            .ok_or_else(|| ServerError::internal("outgoing queue already taken"))?;
        tasks.push((
            "outbound-pump",
            adapter.spawn_outbound(outgoing, self.shutdown_tx.subscribe()),
        ));
        tasks.push((
            "inbound-pump",
            adapter.spawn_inbound(self.shutdown_tx.subscribe()),
        ));

        // Child-facing services.
        let (control, notices) = ControlChannelServer::bind(Arc::clone(&stack))?;
        let ipc_path = control.socket_path().to_path_buf();
        tasks.push(("control", control.spawn(self.shutdown_tx.subscribe())));

        let socks = SocksProxy::bind(Arc::clone(&stack), Arc::clone(&routing)).await?;
        let socks_port = socks.port();
        tasks.push(("socks", socks.spawn(self.shutdown_tx.subscribe())));

        let forwarder = PortForwarder::new(self.config.interface_ip());
        tasks.push((
            "forwarder",
            forwarder.spawn(notices, self.shutdown_tx.subscribe()),
        ));

        // Child environment.
        let shim = match &self.options.shim_path {
            Some(path) => path.clone(),
            None => launcher::shim_library_path()?,
        };
        let mut env = vec![
            ("LD_PRELOAD".to_string(), shim.display().to_string()),
            (
                "WRAPGUARD_IPC_PATH".to_string(),
                ipc_path.display().to_string(),
            ),
        ];
        if self.options.proxy_mode == ProxyMode::Socks {
            env.push(("WRAPGUARD_SOCKS_PORT".to_string(), socks_port.to_string()));
        }

        info!(
            interface = %self
                .config
                .interface_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            peers = self.config.peers.len(),
            mode = ?self.options.proxy_mode,
            "supervisor ready"
        );

        let code = run_child(&self.options.command, &env).await;

        // Tear down regardless of how the child went.
        self.shutdown_tx.send(()).ok();
        device.close();
        for (name, task) in tasks {
            match tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!(task = name, "task finished"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task failed"),
                Err(_) => warn!(task = name, "task did not finish in time"),
            }
        }
        info!("supervisor shutdown complete");

        code
    }

    /// Triggers shutdown programmatically.
    pub fn shutdown(&self) {
        self.shutdown_tx.send(()).ok();
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("peers", &self.config.peers.len())
            .field("mode", &self.options.proxy_mode)
            .finish()
    }
}

// ============================================
// Tests
// ============================================
