// ============================================
// File: crates/wrapguard-server/src/socks.rs
// ============================================
//! # SOCKS5 Proxy
//!
//! ## Creation Reason
//! In the default shim mode, `connect` calls inside the child are
//! transparently redirected to this loopback proxy. Destinations the
//! routing engine knows travel the virtual stack and the tunnel;
//! everything else is dialed directly so non-tunneled traffic keeps
//! working.
//!
//! ## Main Functionality
//! - Minimal RFC 1928 server: no-auth method, CONNECT command only
//! - ATYP 1 (IPv4), 3 (domain, resolved preferring IPv4), 4 (IPv6)
//! - Tunneled destinations: create → connect → relay over the stack
//! - Unrouted destinations: direct TCP dial, bidirectional copy
//!
//! ## ⚠️ Important Note for Next Developer
//! - The proxy binds 127.0.0.1:0; the port reaches the shim via
//!   `WRAPGUARD_SOCKS_PORT`
//! - BIND and UDP-ASSOCIATE are answered with "command not supported"
//!
//! ## Last Modified
//! v0.1.0 - Initial SOCKS5 implementation

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use wrapguard_common::types::{ConnectionId, ConnectionState, Endpoint, TransportKind};
use wrapguard_core::error::CoreError;
use wrapguard_core::routing::RoutingEngine;
use wrapguard_core::stack::VirtualNetworkStack;

use crate::error::{Result, ServerError};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Relay read buffer size.
const RELAY_BUFFER: usize = 16 * 1024;

/// Backoff while the stack's outbound queue is full.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(5);

// ============================================
// SocksProxy
// ============================================

/// The loopback SOCKS5 proxy in front of the virtual stack.
pub struct SocksProxy {
    listener: TcpListener,
    port: u16,
    stack: Arc<VirtualNetworkStack>,
    routing: Arc<RoutingEngine>,
}

impl SocksProxy {
    /// Binds the proxy on an ephemeral loopback port.
    pub async fn bind(
        stack: Arc<VirtualNetworkStack>,
        routing: Arc<RoutingEngine>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| ServerError::startup_failed(format!("SOCKS5 bind: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| ServerError::startup_failed(format!("SOCKS5 local addr: {e}")))?
            .port();
        info!(port, "SOCKS5 proxy listening");
        Ok(Self {
            listener,
            port,
            stack,
            routing,
        })
    }

    /// Loopback port the shim redirects `connect` calls to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Runs the accept loop until shutdown.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("SOCKS5 proxy received shutdown signal");
                        break;
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                trace!(%peer, "SOCKS5 client connected");
                                let stack = Arc::clone(&self.stack);
                                let routing = Arc::clone(&self.routing);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stack, routing, stream).await {
                                        debug!(error = %e, "SOCKS5 session ended");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "SOCKS5 accept failed");
                                break;
                            }
                        }
                    }
                }
            }
            debug!("SOCKS5 proxy exited");
        })
    }
}

// ============================================
// Session Handling
// ============================================

async fn handle_client(
    stack: Arc<VirtualNetworkStack>,
    routing: Arc<RoutingEngine>,
    mut stream: TcpStream,
) -> std::io::Result<()> {
    // Method negotiation.
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "not SOCKS5",
        ));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, 0x00]).await?;

    // Request.
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != CMD_CONNECT {
        reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }

    let destination = match read_destination(&mut stream, header[3]).await? {
        Some(destination) => destination,
        None => {
            reply(&mut stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Ok(());
        }
    };

    let routed = routing
        .lookup(destination.addr, TransportKind::Stream, destination.port)
        .is_some();
    debug!(%destination, routed, "SOCKS5 connect request");

    if routed {
        tunnel_relay(&stack, stream, destination).await
    } else {
        direct_relay(stream, destination).await
    }
}

/// Reads the destination endpoint for the given address type. `None`
/// means the address type is unsupported.
async fn read_destination(
    stream: &mut TcpStream,
    atyp: u8,
) -> std::io::Result<Option<Endpoint>> {
    let addr = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets)
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            IpAddr::from(octets)
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            let name = String::from_utf8_lossy(&name).into_owned();

            let mut port_buf = [0u8; 2];
            stream.read_exact(&mut port_buf).await?;
            let port = u16::from_be_bytes(port_buf);

            let mut addrs: Vec<SocketAddr> =
                tokio::net::lookup_host((name.as_str(), port)).await?.collect();
            addrs.sort_by_key(|a| !a.is_ipv4());
            return Ok(addrs.first().map(|a| Endpoint::from(*a)));
        }
        _ => return Ok(None),
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    Ok(Some(Endpoint::new(addr, u16::from_be_bytes(port_buf))))
}

async fn reply(stream: &mut TcpStream, code: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0])
        .await
}

/// Dials the destination directly and splices bytes.
async fn direct_relay(mut client: TcpStream, destination: Endpoint) -> std::io::Result<()> {
    match TcpStream::connect(destination.to_socket_addr()).await {
        Ok(mut upstream) => {
            reply(&mut client, REP_SUCCESS).await?;
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            Ok(())
        }
        Err(e) => {
            debug!(%destination, error = %e, "direct dial failed");
            reply(&mut client, REP_CONNECTION_REFUSED).await?;
            Ok(())
        }
    }
}

/// Carries the session over the virtual stack and the tunnel.
async fn tunnel_relay(
    stack: &Arc<VirtualNetworkStack>,
    mut client: TcpStream,
    destination: Endpoint,
) -> std::io::Result<()> {
    let id = match open_tunnel_connection(stack, destination) {
        Ok(id) => id,
        Err(e) => {
            debug!(%destination, error = %e, "tunnel connect failed");
            reply(&mut client, REP_GENERAL_FAILURE).await?;
            return Ok(());
        }
    };
    reply(&mut client, REP_SUCCESS).await?;

    let ready = match stack.inbound_ready(id) {
        Ok(ready) => ready,
        Err(_) => return Ok(()),
    };
    let (mut read_half, mut write_half) = client.split();
    let mut buf = vec![0u8; RELAY_BUFFER];

    'relay: loop {
        tokio::select! {
            read = read_half.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break 'relay,
                    Ok(n) => {
                        if push_payload(stack, id, &buf[..n]).await.is_err() {
                            break 'relay;
                        }
                    }
                }
            }
            _ = ready.notified() => {
                loop {
                    match stack.recv(id) {
                        Ok(Some(payload)) => {
                            if write_half.write_all(&payload).await.is_err() {
                                break 'relay;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break 'relay,
                    }
                }
                if matches!(stack.state_of(id), Ok(ConnectionState::Closed) | Err(_)) {
                    break 'relay;
                }
            }
        }
    }

    let _ = stack.close(id);
    Ok(())
}

fn open_tunnel_connection(
    stack: &Arc<VirtualNetworkStack>,
    destination: Endpoint,
) -> wrapguard_core::error::Result<ConnectionId> {
    let id = stack.create(TransportKind::Stream)?;
    if let Err(e) = stack.connect(id, destination) {
        let _ = stack.close(id);
        return Err(e);
    }
    Ok(id)
}

/// Queues one chunk on the stack, backing off briefly while the
/// outbound queue is full.
async fn push_payload(
    stack: &Arc<VirtualNetworkStack>,
    id: ConnectionId,
    chunk: &[u8],
) -> wrapguard_core::error::Result<()> {
    loop {
        match stack.send(id, chunk.to_vec()) {
            Ok(()) => return Ok(()),
            Err(CoreError::QueueFull { .. }) => {
                tokio::time::sleep(SEND_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    use wrapguard_core::packet::{self, StreamFlags, TransportHeader};
    use wrapguard_core::routing::{PeerRouting, RoutingPolicy};

    async fn socks_handshake(port: u16, destination: Endpoint) -> TcpStream {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        match destination.addr {
            IpAddr::V4(ip) => request.extend_from_slice(&ip.octets()),
            IpAddr::V6(_) => unreachable!("tests use v4"),
        }
        request.extend_from_slice(&destination.port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REP_SUCCESS);
        client
    }

    fn tunnel_routing() -> Arc<RoutingEngine> {
        Arc::new(RoutingEngine::new(vec![PeerRouting {
            allowed_prefixes: vec!["10.0.0.0/8".parse().unwrap()],
            policies: vec![RoutingPolicy::parse("10.0.0.0/8", 0).unwrap()],
        }]))
    }

    #[tokio::test]
    async fn test_direct_relay_for_unrouted_destination() {
        // A real local listener stands in for the outside world.
        let upstream = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            conn.write_all(b"pong").await.unwrap();
        });

        let stack = VirtualNetworkStack::new();
        let proxy = SocksProxy::bind(Arc::clone(&stack), tunnel_routing())
            .await
            .unwrap();
        let port = proxy.port();
        let (shutdown, _) = broadcast::channel(1);
        proxy.spawn(shutdown.subscribe());

        let mut client = socks_handshake(port, Endpoint::from(upstream_addr)).await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_tunnel_relay_for_routed_destination() {
        let stack = VirtualNetworkStack::new();
        stack.set_local_addresses(vec!["10.0.0.2".parse().unwrap()]);
        let mut outgoing = stack.take_outgoing().unwrap();

        let proxy = SocksProxy::bind(Arc::clone(&stack), tunnel_routing())
            .await
            .unwrap();
        let port = proxy.port();
        let (shutdown, _) = broadcast::channel(1);
        proxy.spawn(shutdown.subscribe());

        let destination = Endpoint::new("10.0.0.3".parse().unwrap(), 80);
        let mut client = socks_handshake(port, destination).await;

        // The stack emitted a SYN toward the destination.
        let syn = outgoing.recv().await.unwrap();
        let meta = packet::decode(&syn).unwrap();
        assert_eq!(meta.dst, destination.addr);

        // Client bytes become stack payloads.
        client.write_all(b"GET / \r\n\r\n").await.unwrap();
        let data = outgoing.recv().await.unwrap();
        let meta = packet::decode(&data).unwrap();
        let (header, payload_off) = packet::decode_transport(&data, &meta).unwrap();
        assert_eq!(header.dst_port(), 80);
        assert_eq!(&data[payload_off..], b"GET / \r\n\r\n");

        // Tunnel payloads come back to the client.
        let local = Endpoint::new(meta.src, header.src_port());
        let response = packet::encode_v4(
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 2),
            &TransportHeader::Stream {
                src_port: 80,
                dst_port: local.port,
                flags: StreamFlags::ACK,
            },
            b"HTTP/1.1 200 OK\r\n",
        );
        stack.deliver(&response).unwrap();

        let mut buf = [0u8; 17];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HTTP/1.1 200 OK\r\n");
    }

    #[tokio::test]
    async fn test_unsupported_command_rejected() {
        let stack = VirtualNetworkStack::new();
        let proxy = SocksProxy::bind(stack, tunnel_routing()).await.unwrap();
        let port = proxy.port();
        let (shutdown, _) = broadcast::channel(1);
        proxy.spawn(shutdown.subscribe());

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        // BIND is not supported.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REP_COMMAND_NOT_SUPPORTED);
    }
}
