// ============================================
// File: crates/wrapguard-tunnel/src/engine.rs
// ============================================
//! # WireGuard Engine Driver
//!
//! ## Creation Reason
//! Translates the declarative peer configuration into per-peer boringtun
//! tunnels and drives the data plane: cleartext packets read from the
//! memory device are encapsulated and sent to the routed peer's UDP
//! endpoint; inbound datagrams are decapsulated and written back to the
//! device.
//!
//! ## Main Functionality
//! - `EngineConfig` / `PeerConfig`: declarative configuration
//! - `WireGuardEngine`: owns the peer tunnels, the UDP socket and the
//!   engine side of the memory device
//! - `spawn`: the select loop (UDP inbound, device outbound, timers)
//!
//! ## Peer Selection
//! - Outbound: the routing engine picks the peer from (destination,
//!   transport, destination port); peer indices follow declaration order
//! - Inbound: handshake initiations are matched by static public key,
//!   everything else by the 24-bit session index
//!
//! ## Failure Policy
//! Malformed inbound datagrams are dropped quietly. Socket errors are
//! fatal for the engine: it logs, marks the device down and exits. The
//! supervisor keeps running; subsequent outbound packets are dropped by
//! the adapter with a counter increment.
//!
//! ## ⚠️ Important Note for Next Developer
//! - The cryptographic handshake and AEAD live entirely inside boringtun;
//!   this driver only moves bytes and timers
//! - Peer endpoints roam: the source of the last valid datagram wins
//!
//! ## Last Modified
//! v0.1.0 - Initial engine driver

use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use boringtun::noise::handshake::parse_handshake_anon;
use boringtun::noise::rate_limiter::RateLimiter;
use boringtun::noise::{HandshakeResponse, Packet, PacketCookieReply, PacketData, Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use wrapguard_core::packet;
use wrapguard_core::routing::RoutingEngine;

use crate::device::MemoryTunnel;
use crate::error::{Result, TunnelError};

/// Size of the datagram and scratch buffers.
const BUFFER_SIZE: usize = u16::MAX as usize;

/// How often peer timers are advanced.
const TIMER_INTERVAL: Duration = Duration::from_millis(100);

/// Timer ticks between rate-limiter resets (once per second).
const RATE_LIMITER_RESET_TICKS: u32 = 10;

// ============================================
// Configuration
// ============================================

/// Declarative configuration of one remote peer.
#[derive(Clone)]
pub struct PeerConfig {
    /// The peer's static public key.
    pub public_key: PublicKey,
    /// Optional preshared key.
    pub preshared_key: Option<[u8; 32]>,
    /// Where to send tunneled traffic; learned from inbound traffic when
    /// absent.
    pub endpoint: Option<SocketAddr>,
    /// Prefixes the peer may source or sink.
    pub allowed_ips: Vec<IpNet>,
    /// Keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    fn allows(&self, addr: impl Into<IpAddr>) -> bool {
        let addr = addr.into();
        self.allowed_ips.iter().any(|net| net.contains(&addr))
    }
}

/// Declarative configuration of the local interface.
pub struct EngineConfig {
    /// Local static private key.
    pub private_key: StaticSecret,
    /// UDP port for tunneled traffic; random when absent.
    pub listen_port: Option<u16>,
    /// Remote peers, in declaration order (the routing engine's peer
    /// indices refer to this order).
    pub peers: Vec<PeerConfig>,
}

// ============================================
// WireGuardEngine
// ============================================

struct PeerState {
    config: PeerConfig,
    tunn: Tunn,
    index: u32,
}

/// The WireGuard data-plane driver.
pub struct WireGuardEngine {
    keypair: (StaticSecret, PublicKey),
    peers: Vec<PeerState>,
    rate_limiter: Arc<RateLimiter>,
    socket: UdpSocket,
    device: Arc<MemoryTunnel>,
    routing: Arc<RoutingEngine>,
}

impl WireGuardEngine {
    /// Builds the engine: binds the peer-facing UDP socket and creates
    /// one boringtun tunnel per configured peer.
    ///
    /// # Errors
    /// `Io` if the socket cannot be bound, `EngineInit` if a peer tunnel
    /// is rejected.
    pub fn new(
        config: EngineConfig,
        routing: Arc<RoutingEngine>,
        device: Arc<MemoryTunnel>,
    ) -> Result<Self> {
        let private_key = config.private_key;
        let public_key = PublicKey::from(&private_key);
        let rate_limiter = Arc::new(RateLimiter::new(&public_key, 64));

        let socket = bind_dual_stack(config.listen_port.unwrap_or(0))?;

        let mut engine = Self {
            keypair: (private_key, public_key),
            peers: Vec::with_capacity(config.peers.len()),
            rate_limiter,
            socket,
            device,
            routing,
        };
        for peer in config.peers {
            engine.add_peer(peer)?;
        }
        Ok(engine)
    }

    /// The local UDP port tunneled traffic uses.
    pub fn listen_port(&self) -> Result<u16> {
        Ok(self
            .socket
            .local_addr()
            .map_err(|e| TunnelError::io("query engine socket address", e))?
            .port())
    }

    /// Number of configured peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn add_peer(&mut self, config: PeerConfig) -> Result<()> {
        let mut rng = rand::thread_rng();
        let index = loop {
            let candidate: u32 = rng.gen::<u32>() >> 8;
            if !self.peers.iter().any(|p| p.index == candidate) {
                break candidate;
            }
        };

        let tunn = Tunn::new(
            self.keypair.0.clone(),
            config.public_key,
            config.preshared_key,
            config.persistent_keepalive,
            index,
            Some(Arc::clone(&self.rate_limiter)),
        )
        .map_err(TunnelError::engine_init)?;

        self.peers.push(PeerState {
            config,
            tunn,
            index,
        });
        Ok(())
    }

    /// Runs the engine until shutdown or a fatal error, then marks the
    /// device down.
    pub fn spawn(mut self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let device = Arc::clone(&self.device);
            let mut datagram_buf = vec![0u8; BUFFER_SIZE];
            let mut scratch = vec![0u8; BUFFER_SIZE];

            let mut timers = time::interval(TIMER_INTERVAL);
            timers.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = 0u32;

            info!(peers = self.peers.len(), "WireGuard engine running");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("engine received shutdown signal");
                        break;
                    }
                    received = self.socket.recv_from(&mut datagram_buf) => {
                        match received {
                            Ok((len, source)) => {
                                self.handle_inbound(len, source, &datagram_buf, &mut scratch).await;
                            }
                            Err(e) => {
                                error!(error = %e, "engine socket failed");
                                break;
                            }
                        }
                    }
                    outbound = device.read() => {
                        match outbound {
                            Some(packet) => self.handle_outbound(&packet, &mut scratch).await,
                            None => {
                                debug!("device closed, engine exiting");
                                break;
                            }
                        }
                    }
                    _ = timers.tick() => {
                        ticks = ticks.wrapping_add(1);
                        if ticks % RATE_LIMITER_RESET_TICKS == 0 {
                            self.rate_limiter.reset_count();
                        }
                        self.advance_timers(&mut scratch).await;
                    }
                }
            }

            self.device.mark_down();
            debug!("engine exited");
        })
    }

    /// Decapsulates one inbound datagram and delivers the cleartext to
    /// the device.
    async fn handle_inbound(
        &mut self,
        len: usize,
        source: SocketAddr,
        datagram_buf: &[u8],
        scratch: &mut [u8],
    ) {
        let Self {
            keypair: (private, public),
            peers,
            socket,
            device,
            ..
        } = self;

        let datagram = &datagram_buf[..len];
        let parsed = match Tunn::parse_incoming_packet(datagram) {
            Ok(parsed) => parsed,
            Err(_) => {
                trace!(%source, "unparseable datagram dropped");
                return;
            }
        };

        let peer = match parsed {
            Packet::HandshakeInit(init) => {
                let Ok(handshake) = parse_handshake_anon(private, public, &init) else {
                    trace!(%source, "anonymous handshake rejected");
                    return;
                };
                peers
                    .iter_mut()
                    .find(|p| p.config.public_key.as_bytes() == &handshake.peer_static_public)
            }
            Packet::HandshakeResponse(HandshakeResponse { receiver_idx, .. })
            | Packet::PacketCookieReply(PacketCookieReply { receiver_idx, .. })
            | Packet::PacketData(PacketData { receiver_idx, .. }) => {
                peers.iter_mut().find(|p| p.index == receiver_idx >> 8)
            }
        };
        let Some(peer) = peer else {
            trace!(%source, "datagram for unknown peer dropped");
            return;
        };

        match peer.tunn.decapsulate(Some(source.ip()), datagram, scratch) {
            TunnResult::Done => {
                peer.config.endpoint = Some(source);
            }
            TunnResult::Err(e) => {
                debug!(%source, error = ?e, "decapsulation failed");
            }
            TunnResult::WriteToNetwork(response) => {
                // Handshake traffic; flush everything the tunnel queued.
                socket.send_to(response, source).await.ok();
                let mut flush = vec![0u8; BUFFER_SIZE];
                while let TunnResult::WriteToNetwork(more) =
                    peer.tunn.decapsulate(None, &[], &mut flush)
                {
                    socket.send_to(more, source).await.ok();
                }
                peer.config.endpoint = Some(source);
            }
            TunnResult::WriteToTunnelV4(cleartext, addr) => {
                if peer.config.allows(addr) {
                    peer.config.endpoint = Some(source);
                    deliver(device, cleartext);
                } else {
                    debug!(%addr, "source outside peer allowed prefixes, dropped");
                }
            }
            TunnResult::WriteToTunnelV6(cleartext, addr) => {
                if peer.config.allows(addr) {
                    peer.config.endpoint = Some(source);
                    deliver(device, cleartext);
                } else {
                    debug!(%addr, "source outside peer allowed prefixes, dropped");
                }
            }
        }
    }

    /// Routes one cleartext packet to a peer and sends the ciphertext.
    async fn handle_outbound(&mut self, cleartext: &[u8], scratch: &mut [u8]) {
        let Some((destination, transport, port)) = packet::route_key(cleartext) else {
            trace!("unroutable outbound packet dropped");
            return;
        };
        let Some(peer_idx) = self.routing.lookup(destination, transport, port) else {
            debug!(%destination, %transport, port, "no route, packet dropped");
            return;
        };
        let Some(peer) = self.peers.get_mut(peer_idx) else {
            warn!(peer_idx, "routing produced unknown peer index");
            return;
        };
        let Some(endpoint) = peer.config.endpoint else {
            debug!(%destination, "peer has no endpoint yet, packet dropped");
            return;
        };

        match peer.tunn.encapsulate(cleartext, scratch) {
            TunnResult::WriteToNetwork(ciphertext) => {
                self.socket
                    .send_to(ciphertext, mapped_endpoint(endpoint))
                    .await
                    .ok();
            }
            TunnResult::Err(e) => debug!(error = ?e, "encapsulation failed"),
            _ => {}
        }
    }

    /// Advances handshake retries and keepalives for every peer.
    async fn advance_timers(&mut self, scratch: &mut [u8]) {
        let Self { peers, socket, .. } = self;
        for peer in peers.iter_mut() {
            let Some(endpoint) = peer.config.endpoint else {
                continue;
            };
            if let TunnResult::WriteToNetwork(datagram) = peer.tunn.update_timers(scratch) {
                socket.send_to(datagram, mapped_endpoint(endpoint)).await.ok();
            }
        }
    }
}

/// Hands one decrypted packet to the application side of the device.
fn deliver(device: &MemoryTunnel, cleartext: &[u8]) {
    if device.write(cleartext.to_vec()).is_err() {
        trace!("device closed, inbound packet discarded");
    }
}

/// The engine socket is v6 with dual-stack enabled; v4 endpoints are
/// addressed through their mapped form.
fn mapped_endpoint(endpoint: SocketAddr) -> SocketAddr {
    match endpoint {
        SocketAddr::V4(v4) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        v6 => v6,
    }
}

fn bind_dual_stack(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TunnelError::io("create engine socket", e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| TunnelError::io("configure engine socket", e))?;
    socket
        .set_only_v6(false)
        .map_err(|e| TunnelError::io("configure engine socket", e))?;

    let address: socket2::SockAddr =
        SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into();
    socket
        .bind(&address)
        .map_err(|e| TunnelError::io(format!("bind engine socket on port {port}"), e))?;

    UdpSocket::from_std(socket.into()).map_err(|e| TunnelError::io("register engine socket", e))
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use wrapguard_core::routing::PeerRouting;

    fn test_config(peers: Vec<PeerConfig>) -> EngineConfig {
        EngineConfig {
            private_key: StaticSecret::from([0x11u8; 32]),
            listen_port: None,
            peers,
        }
    }

    fn test_peer(endpoint: Option<SocketAddr>) -> PeerConfig {
        PeerConfig {
            public_key: PublicKey::from(&StaticSecret::from([0x22u8; 32])),
            preshared_key: None,
            endpoint,
            allowed_ips: vec!["10.150.0.0/24".parse().unwrap()],
            persistent_keepalive: Some(25),
        }
    }

    fn test_routing() -> Arc<RoutingEngine> {
        Arc::new(RoutingEngine::new(vec![PeerRouting {
            allowed_prefixes: vec!["10.150.0.0/24".parse().unwrap()],
            policies: vec![],
        }]))
    }

    #[tokio::test]
    async fn test_engine_construction() {
        let device = MemoryTunnel::new("wg0", 1420);
        let engine = WireGuardEngine::new(
            test_config(vec![test_peer(Some("127.0.0.1:51820".parse().unwrap()))]),
            test_routing(),
            device,
        )
        .unwrap();

        assert_eq!(engine.peer_count(), 1);
        assert_ne!(engine.listen_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_indices_are_distinct() {
        let device = MemoryTunnel::new("wg0", 1420);
        let peers = (0u8..8)
            .map(|i| PeerConfig {
                public_key: PublicKey::from(&StaticSecret::from([i + 1; 32])),
                preshared_key: None,
                endpoint: None,
                allowed_ips: vec![],
                persistent_keepalive: None,
            })
            .collect();
        let engine = WireGuardEngine::new(test_config(peers), test_routing(), device).unwrap();

        let mut indices: Vec<u32> = engine.peers.iter().map(|p| p.index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), 8);
    }

    #[tokio::test]
    async fn test_engine_exits_on_device_close() {
        let device = MemoryTunnel::new("wg0", 1420);
        let engine = WireGuardEngine::new(
            test_config(vec![test_peer(None)]),
            test_routing(),
            Arc::clone(&device),
        )
        .unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = engine.spawn(shutdown_tx.subscribe());

        let mut state = device.state();
        device.close();
        handle.await.unwrap();
        assert_eq!(*state.borrow_and_update(), crate::device::DeviceState::Down);
    }

    #[test]
    fn test_mapped_endpoint() {
        let v4: SocketAddr = "192.0.2.1:51820".parse().unwrap();
        let mapped = mapped_endpoint(v4);
        assert_eq!(mapped.port(), 51820);
        assert!(mapped.is_ipv6());

        let v6: SocketAddr = "[2001:db8::2]:51820".parse().unwrap();
        assert_eq!(mapped_endpoint(v6), v6);
    }
}
