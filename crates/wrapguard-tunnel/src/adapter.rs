// ============================================
// File: crates/wrapguard-tunnel/src/adapter.rs
// ============================================
//! # Tunnel Adapter
//!
//! ## Creation Reason
//! The virtual stack and the memory device know nothing about each
//! other; the adapter runs the two pumps that couple them.
//!
//! ## Main Functionality
//! - Outbound pump: stack outgoing queue → device (app-to-engine)
//! - Inbound pump: device (engine-to-app) → `stack.deliver`
//! - Terminal `down` handling: once the engine marks the device down,
//!   outbound packets are dropped with a counter increment
//!
//! ## Failure Policy
//! Malformed inbound packets are logged and dropped; they never stop the
//! pump. Device closure ends both pumps cleanly.
//!
//! ## Last Modified
//! v0.1.0 - Initial adapter implementation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use wrapguard_core::stack::VirtualNetworkStack;

use crate::device::{DeviceState, MemoryTunnel};

// ============================================
// TunnelAdapter
// ============================================

/// Couples the virtual stack to the memory tunnel device.
pub struct TunnelAdapter {
    stack: Arc<VirtualNetworkStack>,
    device: Arc<MemoryTunnel>,
    down_drops: Arc<AtomicU64>,
}

impl TunnelAdapter {
    /// Creates an adapter over a stack and a device.
    #[must_use]
    pub fn new(stack: Arc<VirtualNetworkStack>, device: Arc<MemoryTunnel>) -> Self {
        Self {
            stack,
            device,
            down_drops: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Outbound packets dropped because the engine was down.
    #[must_use]
    pub fn down_drop_count(&self) -> u64 {
        self.down_drops.load(Ordering::Relaxed)
    }

    /// Spawns the outbound pump: stack outgoing queue → device.
    pub fn spawn_outbound(
        &self,
        mut outgoing: mpsc::Receiver<Vec<u8>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let device = Arc::clone(&self.device);
        let down_drops = Arc::clone(&self.down_drops);
        let state = device.state();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("outbound pump received shutdown signal");
                        break;
                    }
                    packet = outgoing.recv() => {
                        let Some(packet) = packet else {
                            debug!("stack outgoing queue closed");
                            break;
                        };
                        if *state.borrow() == DeviceState::Down {
                            down_drops.fetch_add(1, Ordering::Relaxed);
                            trace!("engine down, outbound packet dropped");
                            continue;
                        }
                        if device.send(packet).is_err() {
                            debug!("device closed, outbound pump exiting");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Spawns the inbound pump: device → `stack.deliver`.
    pub fn spawn_inbound(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let stack = Arc::clone(&self.stack);
        let device = Arc::clone(&self.device);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("inbound pump received shutdown signal");
                        break;
                    }
                    packet = device.recv() => {
                        let Some(packet) = packet else {
                            debug!("device closed, inbound pump exiting");
                            break;
                        };
                        if let Err(e) = stack.deliver(&packet) {
                            debug!(error = %e, "inbound packet dropped");
                        }
                    }
                }
            }
        })
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use wrapguard_common::types::{Endpoint, TransportKind};
    use wrapguard_core::packet::{self, StreamFlags, TransportHeader};

    async fn recv_within(
        stack: &Arc<VirtualNetworkStack>,
        id: wrapguard_common::types::ConnectionId,
        budget: Duration,
    ) -> Vec<u8> {
        tokio::time::timeout(budget, async {
            loop {
                if let Some(payload) = stack.recv(id).unwrap() {
                    return payload;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("payload delivered")
    }

    fn wired() -> (
        Arc<VirtualNetworkStack>,
        Arc<MemoryTunnel>,
        TunnelAdapter,
        broadcast::Sender<()>,
    ) {
        let stack = VirtualNetworkStack::new();
        stack.set_local_addresses(vec!["10.0.0.2".parse().unwrap()]);
        let device = MemoryTunnel::new("wg0", 1420);
        let adapter = TunnelAdapter::new(Arc::clone(&stack), Arc::clone(&device));
        let (shutdown_tx, _) = broadcast::channel(1);
        (stack, device, adapter, shutdown_tx)
    }

    #[tokio::test]
    async fn test_outbound_pump_moves_stack_packets() {
        let (stack, device, adapter, shutdown_tx) = wired();
        let outgoing = stack.take_outgoing().unwrap();
        let _pump = adapter.spawn_outbound(outgoing, shutdown_tx.subscribe());

        let id = stack.create(TransportKind::Stream).unwrap();
        stack
            .connect(id, Endpoint::new("10.0.0.3".parse().unwrap(), 80))
            .unwrap();

        // The SYN crosses the pump and shows up on the engine side.
        let packet = device.read().await.unwrap();
        let meta = packet::decode(&packet).unwrap();
        assert_eq!(meta.protocol, 6);
        assert_eq!(meta.dst, "10.0.0.3".parse::<std::net::IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_inbound_pump_delivers_to_stack() {
        let (stack, device, adapter, shutdown_tx) = wired();
        let _pump = adapter.spawn_inbound(shutdown_tx.subscribe());

        let id = stack.create(TransportKind::Datagram).unwrap();
        stack
            .bind(id, Endpoint::new("10.0.0.2".parse().unwrap(), 5000))
            .unwrap();

        let inbound = packet::encode_v4(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(10, 0, 0, 2),
            &TransportHeader::Datagram {
                src_port: 777,
                dst_port: 5000,
            },
            b"ping",
        );
        device.write(inbound).unwrap();

        let payload = recv_within(&stack, id, Duration::from_secs(1)).await;
        assert_eq!(payload, b"ping".to_vec());
    }

    #[tokio::test]
    async fn test_engine_down_drops_outbound() {
        let (stack, device, adapter, shutdown_tx) = wired();
        let outgoing = stack.take_outgoing().unwrap();
        let _pump = adapter.spawn_outbound(outgoing, shutdown_tx.subscribe());

        device.mark_down();

        let id = stack.create(TransportKind::Stream).unwrap();
        stack
            .connect(id, Endpoint::new("10.0.0.3".parse().unwrap(), 80))
            .unwrap();

        // The SYN reaches the pump and is dropped there, counted.
        tokio::time::timeout(Duration::from_secs(1), async {
            while adapter.down_drop_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("drop counted");
        assert_eq!(device.pending_for_engine(), 0);
    }

    #[tokio::test]
    async fn test_inbound_pump_survives_malformed_packets() {
        let (stack, device, adapter, shutdown_tx) = wired();
        let _pump = adapter.spawn_inbound(shutdown_tx.subscribe());

        device.write(vec![0xde, 0xad]).unwrap();

        // A good packet after a bad one still arrives.
        let id = stack.create(TransportKind::Datagram).unwrap();
        stack
            .bind(id, Endpoint::new("10.0.0.2".parse().unwrap(), 5000))
            .unwrap();
        let inbound = packet::encode_v4(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(10, 0, 0, 2),
            &TransportHeader::Datagram {
                src_port: 777,
                dst_port: 5000,
            },
            b"still alive",
        );
        device.write(inbound).unwrap();

        let payload = recv_within(&stack, id, Duration::from_secs(1)).await;
        assert_eq!(payload, b"still alive".to_vec());
    }
}
