// ============================================
// File: crates/wrapguard-server/src/main.rs
// ============================================
//! # WrapGuard Entry Point
//!
//! ## Creation Reason
//! The `wrapguard` binary: parse the CLI, set up structured logging,
//! load the WireGuard configuration, run the supervisor, and exit with
//! the child's status.
//!
//! ## Usage
//! ```bash
//! # Check your tunneled IP address
//! wrapguard --config wg0.conf -- curl https://icanhazip.com
//!
//! # Run a web server reachable through WireGuard
//! wrapguard --config wg0.conf -- python3 -m http.server 8080
//!
//! # Route everything through one peer
//! wrapguard --config wg0.conf --exit-node 10.150.0.1 -- bash
//! ```
//!
//! ## Exit Codes
//! - the child's exit code on completion
//! - 1 on configuration or startup failure
//!
//! ## Last Modified
//! v0.1.0 - Initial CLI implementation

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wrapguard_server::{ProxyMode, Supervisor, SupervisorOptions, WireGuardConfig};

// ============================================
// CLI Definition
// ============================================

/// Userspace WireGuard proxy for transparent network tunneling.
///
/// Runs an unmodified command with its TCP and UDP traffic carried over
/// a WireGuard tunnel - no root, no kernel modules, no TUN device.
#[derive(Parser, Debug)]
#[command(name = "wrapguard")]
#[command(author, version, about)]
struct Cli {
    /// Path to the WireGuard configuration file.
    #[arg(long, value_name = "PATH")]
    config: PathBuf,

    /// Route all traffic through the peer owning this address.
    #[arg(long, value_name = "PEER_IP")]
    exit_node: Option<String>,

    /// Add a routing policy (repeatable).
    #[arg(long, value_name = "CIDR:PEER_IP")]
    route: Vec<String>,

    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to a file instead of stderr.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// How the shim lowers outbound connections.
    #[arg(long, value_enum, default_value_t = ProxyMode::Socks)]
    proxy_mode: ProxyMode,

    /// The command to run, after `--`.
    #[arg(last = true, required = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    const fn as_filter(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

// ============================================
// Main
// ============================================

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_level, cli.log_file.as_deref()) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(cli)).unwrap_or_else(|e| {
        error!("{e}");
        1
    });
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = WireGuardConfig::load(&cli.config)?;
    config.apply_cli_routes(cli.exit_node.as_deref(), &cli.route)?;

    info!(config = %cli.config.display(), "configuration loaded");
    if let Some(peer) = config.peers.first() {
        if let Some(endpoint) = peer.endpoint {
            info!(%endpoint, "first peer endpoint");
        }
    }

    let supervisor = Supervisor::new(
        config,
        SupervisorOptions {
            proxy_mode: cli.proxy_mode,
            command: cli.command,
            shim_path: None,
        },
    );
    Ok(supervisor.run().await?)
}

// ============================================
// Logging
// ============================================

/// One JSON record per line: RFC 3339 UTC timestamp, level, message,
/// structured fields.
fn init_logging(level: LogLevel, log_file: Option<&std::path::Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let registry = tracing_subscriber::registry().with(filter);
    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(fmt::layer().json().with_writer(Arc::new(file)))
                .try_init()
                .ok();
        }
        None => {
            registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .ok();
        }
    }
    Ok(())
}
