// ============================================
// File: crates/wrapguard-server/src/forwarder.rs
// ============================================
//! # Port Forwarder
//!
//! ## Creation Reason
//! When the child binds a listener, tunnel-side peers need a way to
//! reach it. For each stream bind notification the forwarder opens a
//! mirror listener and relays accepted connections to the child's real
//! listener on loopback.
//!
//! ## Main Functionality
//! - Consumes `BindNotice`s from the control channel
//! - Tries the tunnel interface address first, falls back to loopback
//! - Relays each accepted connection byte-for-byte to
//!   `127.0.0.1:<port>`
//!
//! ## ⚠️ Important Note for Next Developer
//! - One mirror listener per port, kept for the supervisor's lifetime
//! - Datagram listeners are not mirrored
//!
//! ## Last Modified
//! v0.1.0 - Initial port forwarder

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wrapguard_common::types::TransportKind;

use crate::control::BindNotice;

// ============================================
// PortForwarder
// ============================================

/// Mirrors child listeners toward the tunnel side.
pub struct PortForwarder {
    interface_addr: Option<IpAddr>,
    active: Arc<DashMap<u16, JoinHandle<()>>>,
}

impl PortForwarder {
    /// Creates a forwarder that prefers listening on the tunnel
    /// interface address.
    #[must_use]
    pub fn new(interface_addr: Option<IpAddr>) -> Self {
        Self {
            interface_addr,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Number of active mirror listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.active.len()
    }

    /// Consumes bind notifications until shutdown, then aborts every
    /// mirror listener.
    pub fn spawn(
        self,
        mut notices: mpsc::Receiver<BindNotice>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("forwarder received shutdown signal");
                        break;
                    }
                    notice = notices.recv() => {
                        let Some(notice) = notice else { break };
                        if notice.transport != TransportKind::Stream {
                            debug!(port = notice.port, "datagram bind not mirrored");
                            continue;
                        }
                        self.ensure_listener(notice.port).await;
                    }
                }
            }
            for entry in self.active.iter() {
                entry.value().abort();
            }
            debug!("forwarder exited");
        })
    }

    async fn ensure_listener(&self, port: u16) {
        if self.active.contains_key(&port) {
            return;
        }

        let listener = match self.bind_mirror(port).await {
            Some(listener) => listener,
            None => return,
        };

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((conn, peer)) => {
                        debug!(%peer, port, "forwarding tunnel-side connection");
                        tokio::spawn(relay_to_child(conn, port));
                    }
                    Err(e) => {
                        debug!(port, error = %e, "mirror listener closed");
                        break;
                    }
                }
            }
        });
        self.active.insert(port, handle);
    }

    /// Tries the tunnel interface address, then loopback.
    async fn bind_mirror(&self, port: u16) -> Option<TcpListener> {
        if let Some(addr) = self.interface_addr {
            match TcpListener::bind((addr, port)).await {
                Ok(listener) => {
                    info!(%addr, port, "forwarder listening on tunnel address");
                    return Some(listener);
                }
                Err(e) => {
                    debug!(%addr, port, error = %e, "tunnel address bind failed, trying loopback");
                }
            }
        }
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                info!(port, "forwarder listening on loopback");
                Some(listener)
            }
            Err(e) => {
                warn!(port, error = %e, "forwarder could not bind mirror listener");
                None
            }
        }
    }
}

/// Relays one tunnel-side connection to the child's real listener.
async fn relay_to_child(mut inbound: TcpStream, port: u16) {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(mut child_side) => {
            let _ = tokio::io::copy_bidirectional(&mut inbound, &mut child_side).await;
        }
        Err(e) => {
            warn!(port, error = %e, "child listener unreachable");
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Reserves a free port by binding and immediately dropping.
    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_mirror_listener_relays_to_child() {
        let port = free_port().await;

        // The "child" listener sits on loopback at the bound port.
        let child = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = child.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            conn.write_all(b"world").await.unwrap();
        });

        // The child's port is taken, so the mirror falls back... to the
        // same loopback port, which is in use. Use a second loopback
        // address as the tunnel interface instead.
        let forwarder = PortForwarder::new(Some("127.0.0.2".parse().unwrap()));
        let (notice_tx, notice_rx) = mpsc::channel(8);
        let (shutdown, _) = broadcast::channel(1);
        forwarder.spawn(notice_rx, shutdown.subscribe());

        notice_tx
            .send(BindNotice {
                address: "0.0.0.0".parse().unwrap(),
                port,
                transport: TransportKind::Stream,
            })
            .await
            .unwrap();

        // Give the forwarder a moment to bind the mirror.
        let mut mirror = None;
        for _ in 0..50 {
            match TcpStream::connect(("127.0.0.2", port)).await {
                Ok(conn) => {
                    mirror = Some(conn);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        let mut mirror = mirror.expect("mirror listener came up");

        mirror.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        mirror.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_datagram_binds_not_mirrored() {
        let forwarder = PortForwarder::new(None);
        let active = Arc::clone(&forwarder.active);
        let (notice_tx, notice_rx) = mpsc::channel(8);
        let (shutdown, _) = broadcast::channel(1);
        forwarder.spawn(notice_rx, shutdown.subscribe());

        notice_tx
            .send(BindNotice {
                address: "0.0.0.0".parse().unwrap(),
                port: free_port().await,
                transport: TransportKind::Datagram,
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(active.len(), 0);
    }
}
