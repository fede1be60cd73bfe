// ============================================
// File: crates/wrapguard-core/src/stack/mod.rs
// ============================================
//! # Virtual Network Stack
//!
//! ## Creation Reason
//! Applications inside the wrapped child never get kernel sockets for
//! tunneled traffic; this stack simulates just enough endpoint behavior
//! to carry stream and datagram payloads over the tunnel.
//!
//! ## Main Functionality
//! - `VirtualNetworkStack`: connection table, listener table, stack-wide
//!   outgoing packet queue
//! - Non-blocking operations: `create`, `bind`, `listen`, `accept`,
//!   `connect`, `send`, `recv`, `close`, `deliver`
//! - Readiness signals per connection / listener for blocking emulation
//!
//! ## Connection Lifecycle
//! ```text
//! create ──► bind ──► listen ──► (inbound SYN materializes peers)
//!    │         │
//!    └─────────┴────► connect ──► send/recv ──► close
//! ```
//!
//! ## Concurrency Model
//! One stack-wide lock guards the connection and listener tables, held
//! only for short critical sections (no I/O, no packet encoding under the
//! lock). Per-connection payload queues are single-producer single-consumer
//! and carry their own internal locks. Each connection gets a small pump
//! task that turns queued outbound payloads into packets.
//!
//! ## ⚠️ Important Note for Next Developer
//! - This is a thin facilitator, NOT a conformant TCP implementation:
//!   no sequence numbers, no retransmission. Applications that depend on
//!   precise TCP behavior over lossy links will not work.
//! - Queue overflow policy is silent drop, counted in `StackCounters`
//! - Endpoint matching is exact; there is no wildcard-address matching
//!
//! ## Last Modified
//! v0.1.0 - Initial stack implementation

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use wrapguard_common::types::{ConnectionId, ConnectionState, Endpoint, TransportKind};

use crate::error::{CoreError, Result};
use crate::packet::{self, StreamFlags, TransportHeader};

mod connection;

pub use connection::{
    StackCounters, ACCEPT_QUEUE_CAPACITY, INBOUND_QUEUE_CAPACITY, OUTBOUND_QUEUE_CAPACITY,
    OUTGOING_PACKET_CAPACITY,
};

use connection::{AcceptQueue, ConnectionEntry, ListenerEntry, PayloadQueue};

/// Upper bound on simultaneously live connections.
pub const MAX_CONNECTIONS: usize = 4096;

/// Base of the ephemeral port range auto-assigned on `connect`.
const EPHEMERAL_PORT_BASE: u32 = 30000;

/// Width of the ephemeral port range.
const EPHEMERAL_PORT_SPAN: u32 = 30000;

// ============================================
// VirtualNetworkStack
// ============================================

struct Tables {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    listeners: HashMap<(Endpoint, TransportKind), ListenerEntry>,
}

/// The virtual network stack.
pub struct VirtualNetworkStack {
    tables: RwLock<Tables>,
    next_id: AtomicU32,
    local_addrs: RwLock<Vec<IpAddr>>,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    counters: StackCounters,
}

impl VirtualNetworkStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_PACKET_CAPACITY);
        Arc::new(Self {
            tables: RwLock::new(Tables {
                connections: HashMap::new(),
                listeners: HashMap::new(),
            }),
            next_id: AtomicU32::new(1),
            local_addrs: RwLock::new(Vec::new()),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            counters: StackCounters::default(),
        })
    }

    /// Sets the tunnel-side addresses of this host, used when assigning
    /// local endpoints to unbound connections.
    pub fn set_local_addresses(&self, addrs: Vec<IpAddr>) {
        *self.local_addrs.write() = addrs;
    }

    /// Takes the receiving side of the stack-wide outgoing packet queue.
    /// There is exactly one consumer; subsequent calls return `None`.
    pub fn take_outgoing(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.outgoing_rx.lock().take()
    }

    /// Drop accounting.
    #[must_use]
    pub fn counters(&self) -> &StackCounters {
        &self.counters
    }

    // ========================================
    // Operations
    // ========================================

    /// Creates a connection of the given transport kind.
    ///
    /// # Errors
    /// `ConnectionLimit` when the table is at capacity.
    pub fn create(self: &Arc<Self>, transport: TransportKind) -> Result<ConnectionId> {
        let id = ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = ConnectionEntry::new(transport);
        let outbound = Arc::clone(&entry.outbound);

        {
            let mut tables = self.tables.write();
            if tables.connections.len() >= MAX_CONNECTIONS {
                return Err(CoreError::ConnectionLimit {
                    limit: MAX_CONNECTIONS,
                });
            }
            tables.connections.insert(id, entry);
        }

        self.spawn_outbound_pump(id, outbound);
        trace!(%id, %transport, "connection created");
        Ok(id)
    }

    /// Binds a connection to a local endpoint.
    ///
    /// # Errors
    /// `UnknownConnection`, `AddressInUse`, or `InvalidState` if the
    /// connection is past `created`.
    pub fn bind(&self, id: ConnectionId, local: Endpoint) -> Result<()> {
        let mut tables = self.tables.write();

        let (state, transport) = {
            let entry = tables
                .connections
                .get(&id)
                .ok_or(CoreError::UnknownConnection { id })?;
            (entry.state, entry.transport)
        };
        if !state.can_transition_to(ConnectionState::Bound) {
            return Err(CoreError::InvalidState {
                operation: "bind",
                state,
            });
        }

        let claimed = tables.connections.iter().any(|(other, entry)| {
            *other != id && entry.transport == transport && entry.local == Some(local)
        });
        if claimed || tables.listeners.contains_key(&(local, transport)) {
            return Err(CoreError::AddressInUse { endpoint: local });
        }

        let entry = tables
            .connections
            .get_mut(&id)
            .ok_or(CoreError::UnknownConnection { id })?;
        entry.local = Some(local);
        entry.state = ConnectionState::Bound;
        Ok(())
    }

    /// Puts a bound connection into the listening state, creating a
    /// listener at its local endpoint.
    ///
    /// # Errors
    /// `UnknownConnection`, `NotBound`, or `AddressInUse` when a listener
    /// already exists at that endpoint.
    pub fn listen(&self, id: ConnectionId) -> Result<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .connections
            .get(&id)
            .ok_or(CoreError::UnknownConnection { id })?;

        if entry.state != ConnectionState::Bound {
            return match entry.state {
                ConnectionState::Created => Err(CoreError::NotBound { id }),
                state => Err(CoreError::InvalidState {
                    operation: "listen",
                    state,
                }),
            };
        }
        let local = entry.local.ok_or(CoreError::NotBound { id })?;
        let transport = entry.transport;

        if tables.listeners.contains_key(&(local, transport)) {
            return Err(CoreError::AddressInUse { endpoint: local });
        }
        tables.listeners.insert(
            (local, transport),
            ListenerEntry {
                queue: AcceptQueue::new(),
            },
        );
        if let Some(entry) = tables.connections.get_mut(&id) {
            entry.state = ConnectionState::Listening;
        }
        debug!(%id, %local, "listener registered");
        Ok(())
    }

    /// Takes one pending connection off the listener at `local`.
    ///
    /// # Errors
    /// `NoListener` when nothing is listening there.
    pub fn accept(
        &self,
        local: Endpoint,
        transport: TransportKind,
    ) -> Result<Option<ConnectionId>> {
        let queue = {
            let tables = self.tables.read();
            let listener = tables
                .listeners
                .get(&(local, transport))
                .ok_or(CoreError::NoListener { endpoint: local })?;
            Arc::clone(&listener.queue)
        };
        Ok(queue.pop())
    }

    /// Connects to a remote endpoint, auto-assigning an ephemeral local
    /// endpoint when unbound. Stream connections emit a SYN.
    ///
    /// # Errors
    /// `UnknownConnection` or `InvalidState`.
    pub fn connect(&self, id: ConnectionId, remote: Endpoint) -> Result<()> {
        let auto_local = Endpoint::new(self.local_addr_for(remote.addr), ephemeral_port(id));

        let (transport, local) = {
            let mut tables = self.tables.write();
            let entry = tables
                .connections
                .get_mut(&id)
                .ok_or(CoreError::UnknownConnection { id })?;

            if !entry.state.can_transition_to(ConnectionState::Connected) {
                return Err(CoreError::InvalidState {
                    operation: "connect",
                    state: entry.state,
                });
            }

            let local = *entry.local.get_or_insert(auto_local);
            entry.remote = Some(remote);
            entry.state = ConnectionState::Connected;
            (entry.transport, local)
        };

        if transport == TransportKind::Stream {
            self.emit_control_packet(local, remote, StreamFlags::SYN);
        }
        debug!(%id, %remote, "connection established");
        Ok(())
    }

    /// Queues a payload for sending.
    ///
    /// # Errors
    /// `UnknownConnection`, `NotConnected`, or `QueueFull` when the
    /// connection's outbound queue is at capacity.
    pub fn send(&self, id: ConnectionId, payload: Vec<u8>) -> Result<()> {
        let outbound = {
            let tables = self.tables.read();
            let entry = tables
                .connections
                .get(&id)
                .ok_or(CoreError::UnknownConnection { id })?;
            if entry.state != ConnectionState::Connected {
                return Err(CoreError::NotConnected { id });
            }
            Arc::clone(&entry.outbound)
        };
        if outbound.push(payload) {
            Ok(())
        } else {
            Err(CoreError::QueueFull {
                resource: "connection outbound queue",
            })
        }
    }

    /// Dequeues the next inbound payload, if any.
    ///
    /// # Errors
    /// `UnknownConnection`.
    pub fn recv(&self, id: ConnectionId) -> Result<Option<Vec<u8>>> {
        let inbound = {
            let tables = self.tables.read();
            let entry = tables
                .connections
                .get(&id)
                .ok_or(CoreError::UnknownConnection { id })?;
            Arc::clone(&entry.inbound)
        };
        Ok(inbound.pop())
    }

    /// Closes a connection, removing it from the table. Connected stream
    /// connections emit a FIN.
    ///
    /// # Errors
    /// `UnknownConnection` — including on a second close of the same id.
    pub fn close(&self, id: ConnectionId) -> Result<()> {
        let entry = {
            let mut tables = self.tables.write();
            let entry = tables
                .connections
                .remove(&id)
                .ok_or(CoreError::UnknownConnection { id })?;
            if entry.state == ConnectionState::Listening {
                if let Some(local) = entry.local {
                    if let Some(listener) = tables.listeners.remove(&(local, entry.transport)) {
                        listener.queue.wake_all();
                    }
                }
            }
            entry
        };

        entry.inbound.close();
        entry.outbound.close();

        if entry.transport == TransportKind::Stream && entry.state == ConnectionState::Connected {
            if let (Some(local), Some(remote)) = (entry.local, entry.remote) {
                self.emit_control_packet(local, remote, StreamFlags::FIN);
            }
        }
        debug!(%id, "connection closed");
        Ok(())
    }

    /// Delivers a raw IP packet arriving from the tunnel.
    ///
    /// # Errors
    /// `MalformedPacket`, `UnsupportedProtocol`, or `NoMatchingEndpoint`.
    /// Queue overflow is not an error: the payload is dropped and counted.
    pub fn deliver(self: &Arc<Self>, raw: &[u8]) -> Result<()> {
        let meta = packet::decode(raw)?;
        let (header, payload_offset) = packet::decode_transport(raw, &meta)?;
        let local = Endpoint::new(meta.dst, header.dst_port());
        let remote = Endpoint::new(meta.src, header.src_port());
        let payload = &raw[payload_offset..];

        match header {
            TransportHeader::Stream { flags, .. } => {
                self.deliver_stream(local, remote, flags, payload)
            }
            TransportHeader::Datagram { .. } => self.deliver_datagram(local, remote, payload),
        }
    }

    // ========================================
    // Readiness & Introspection
    // ========================================

    /// Signal notified when the connection's inbound queue gains a
    /// payload or the connection closes.
    pub fn inbound_ready(&self, id: ConnectionId) -> Result<Arc<Notify>> {
        let tables = self.tables.read();
        let entry = tables
            .connections
            .get(&id)
            .ok_or(CoreError::UnknownConnection { id })?;
        Ok(entry.inbound.ready())
    }

    /// Signal notified when the listener at `local` gains a pending
    /// connection.
    pub fn accept_ready(&self, local: Endpoint, transport: TransportKind) -> Result<Arc<Notify>> {
        let tables = self.tables.read();
        let listener = tables
            .listeners
            .get(&(local, transport))
            .ok_or(CoreError::NoListener { endpoint: local })?;
        Ok(listener.queue.ready())
    }

    /// Local endpoint of a connection, if assigned.
    pub fn local_endpoint(&self, id: ConnectionId) -> Result<Option<Endpoint>> {
        let tables = self.tables.read();
        let entry = tables
            .connections
            .get(&id)
            .ok_or(CoreError::UnknownConnection { id })?;
        Ok(entry.local)
    }

    /// Remote endpoint of a connection, if assigned.
    pub fn remote_endpoint(&self, id: ConnectionId) -> Result<Option<Endpoint>> {
        let tables = self.tables.read();
        let entry = tables
            .connections
            .get(&id)
            .ok_or(CoreError::UnknownConnection { id })?;
        Ok(entry.remote)
    }

    /// Source endpoint of the most recent inbound datagram.
    pub fn last_peer(&self, id: ConnectionId) -> Result<Option<Endpoint>> {
        let tables = self.tables.read();
        let entry = tables
            .connections
            .get(&id)
            .ok_or(CoreError::UnknownConnection { id })?;
        Ok(entry.last_peer)
    }

    /// Transport kind of a connection.
    pub fn transport_of(&self, id: ConnectionId) -> Result<TransportKind> {
        let tables = self.tables.read();
        let entry = tables
            .connections
            .get(&id)
            .ok_or(CoreError::UnknownConnection { id })?;
        Ok(entry.transport)
    }

    /// Lifecycle state of a connection.
    pub fn state_of(&self, id: ConnectionId) -> Result<ConnectionState> {
        let tables = self.tables.read();
        let entry = tables
            .connections
            .get(&id)
            .ok_or(CoreError::UnknownConnection { id })?;
        Ok(entry.state)
    }

    // ========================================
    // Delivery Internals
    // ========================================

    fn deliver_stream(
        self: &Arc<Self>,
        local: Endpoint,
        remote: Endpoint,
        flags: StreamFlags,
        payload: &[u8],
    ) -> Result<()> {
        // A SYN addressed to a listener materializes a new connection.
        if flags.syn && !flags.ack {
            let queue = {
                let tables = self.tables.read();
                tables
                    .listeners
                    .get(&(local, TransportKind::Stream))
                    .map(|l| Arc::clone(&l.queue))
            };
            if let Some(queue) = queue {
                return self.materialize_inbound(local, remote, &queue);
            }
        }

        let (inbound, id) = {
            let tables = self.tables.read();
            let found = tables.connections.iter().find(|(_, entry)| {
                entry.transport == TransportKind::Stream
                    && entry.local == Some(local)
                    && entry.remote == Some(remote)
            });
            match found {
                Some((id, entry)) => (Arc::clone(&entry.inbound), *id),
                None => return Err(CoreError::NoMatchingEndpoint { destination: local }),
            }
        };

        if !payload.is_empty() && !inbound.push(payload.to_vec()) {
            self.counters.record_inbound_drop();
            trace!(%id, "inbound payload dropped, queue full");
        }

        if flags.fin {
            let mut tables = self.tables.write();
            if let Some(entry) = tables.connections.get_mut(&id) {
                entry.state = ConnectionState::Closed;
                entry.inbound.close();
                entry.outbound.close();
            }
            debug!(%id, "remote half-close");
        }
        Ok(())
    }

    fn materialize_inbound(
        self: &Arc<Self>,
        local: Endpoint,
        remote: Endpoint,
        queue: &AcceptQueue,
    ) -> Result<()> {
        let id = self.create(TransportKind::Stream)?;
        {
            let mut tables = self.tables.write();
            if let Some(entry) = tables.connections.get_mut(&id) {
                entry.local = Some(local);
                entry.remote = Some(remote);
                entry.state = ConnectionState::Connected;
            }
        }

        if !queue.push(id) {
            self.counters.record_accept_drop();
            let mut tables = self.tables.write();
            if let Some(entry) = tables.connections.remove(&id) {
                entry.inbound.close();
                entry.outbound.close();
            }
            debug!(%local, "pending connection dropped, accept queue full");
            return Ok(());
        }

        self.emit_control_packet(local, remote, StreamFlags::SYN_ACK);
        debug!(%id, %remote, "inbound connection queued for accept");
        Ok(())
    }

    fn deliver_datagram(&self, local: Endpoint, remote: Endpoint, payload: &[u8]) -> Result<()> {
        let (inbound, id) = {
            let tables = self.tables.read();
            let found = tables.connections.iter().find(|(_, entry)| {
                entry.transport == TransportKind::Datagram && entry.local == Some(local)
            });
            match found {
                Some((id, entry)) => (Arc::clone(&entry.inbound), *id),
                None => return Err(CoreError::NoMatchingEndpoint { destination: local }),
            }
        };

        {
            let mut tables = self.tables.write();
            if let Some(entry) = tables.connections.get_mut(&id) {
                entry.last_peer = Some(remote);
            }
        }

        if !inbound.push(payload.to_vec()) {
            self.counters.record_inbound_drop();
            trace!(%id, "inbound datagram dropped, queue full");
        }
        Ok(())
    }

    // ========================================
    // Packet Emission
    // ========================================

    fn spawn_outbound_pump(self: &Arc<Self>, id: ConnectionId, outbound: Arc<PayloadQueue>) {
        let stack = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(payload) = outbound.pop_wait().await {
                stack.emit_data_packet(id, &payload);
            }
            trace!(%id, "outbound pump finished");
        });
    }

    fn emit_data_packet(&self, id: ConnectionId, payload: &[u8]) {
        let (transport, local, remote) = {
            let tables = self.tables.read();
            let Some(entry) = tables.connections.get(&id) else {
                return;
            };
            let (Some(local), Some(remote)) = (entry.local, entry.remote) else {
                return;
            };
            (entry.transport, local, remote)
        };

        let header = match transport {
            TransportKind::Stream => TransportHeader::Stream {
                src_port: local.port,
                dst_port: remote.port,
                flags: StreamFlags::ACK,
            },
            TransportKind::Datagram => TransportHeader::Datagram {
                src_port: local.port,
                dst_port: remote.port,
            },
        };
        self.emit_packet(local, remote, &header, payload);
    }

    fn emit_control_packet(&self, local: Endpoint, remote: Endpoint, flags: StreamFlags) {
        let header = TransportHeader::Stream {
            src_port: local.port,
            dst_port: remote.port,
            flags,
        };
        self.emit_packet(local, remote, &header, &[]);
    }

    fn emit_packet(
        &self,
        local: Endpoint,
        remote: Endpoint,
        header: &TransportHeader,
        payload: &[u8],
    ) {
        let encoded = match (local.addr, remote.addr) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => packet::encode_v4(src, dst, header, payload),
            (IpAddr::V6(src), IpAddr::V6(dst)) => packet::encode_v6(src, dst, header, payload),
            _ => {
                debug!(%local, %remote, "mixed-family endpoints, packet dropped");
                return;
            }
        };
        if self.outgoing_tx.try_send(encoded).is_err() {
            self.counters.record_outgoing_drop();
        }
    }

    /// The local address to pair with `remote` when auto-assigning.
    fn local_addr_for(&self, remote: IpAddr) -> IpAddr {
        let addrs = self.local_addrs.read();
        addrs
            .iter()
            .find(|a| a.is_ipv4() == remote.is_ipv4())
            .copied()
            .unwrap_or(match remote {
                IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
            })
    }
}

/// Ephemeral port for an unbound connecting connection. Deterministic in
/// the connection id: `30000 + (id % 30000)`.
fn ephemeral_port(id: ConnectionId) -> u16 {
    (EPHEMERAL_PORT_BASE + (id.as_raw() % EPHEMERAL_PORT_SPAN)) as u16
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port)
    }

    fn stack_at(addr: &str) -> Arc<VirtualNetworkStack> {
        let stack = VirtualNetworkStack::new();
        stack.set_local_addresses(vec![addr.parse().unwrap()]);
        stack
    }

    #[tokio::test]
    async fn test_connect_emits_syn_then_payload() {
        let stack = stack_at("10.0.0.2");
        let mut outgoing = stack.take_outgoing().unwrap();

        let id = stack.create(TransportKind::Stream).unwrap();
        stack.connect(id, ep("10.0.0.3", 80)).unwrap();
        stack.send(id, b"GET / \r\n\r\n".to_vec()).unwrap();

        let syn = outgoing.recv().await.unwrap();
        let meta = packet::decode(&syn).unwrap();
        assert_eq!(meta.protocol, 6);
        assert_eq!(meta.dst, "10.0.0.3".parse::<IpAddr>().unwrap());
        let (header, _) = packet::decode_transport(&syn, &meta).unwrap();
        assert!(matches!(
            header,
            TransportHeader::Stream {
                flags: StreamFlags { syn: true, ack: false, fin: false },
                dst_port: 80,
                ..
            }
        ));

        let data = outgoing.recv().await.unwrap();
        let meta = packet::decode(&data).unwrap();
        assert_eq!(meta.protocol, 6);
        assert_eq!(meta.dst, "10.0.0.3".parse::<IpAddr>().unwrap());
        let (header, payload_off) = packet::decode_transport(&data, &meta).unwrap();
        assert_eq!(header.dst_port(), 80);
        assert_eq!(&data[payload_off..], b"GET / \r\n\r\n");

        // Exactly one data packet for one send.
        assert!(outgoing.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ephemeral_port_is_deterministic() {
        let stack = stack_at("10.0.0.2");
        let id = stack.create(TransportKind::Stream).unwrap();
        stack.connect(id, ep("10.0.0.3", 80)).unwrap();

        let local = stack.local_endpoint(id).unwrap().unwrap();
        assert_eq!(u32::from(local.port), 30000 + (id.as_raw() % 30000));
        assert_eq!(local.addr, "10.0.0.2".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_listener_accepts_inbound_syn() {
        let stack = stack_at("10.150.0.2");
        let mut outgoing = stack.take_outgoing().unwrap();

        let id = stack.create(TransportKind::Stream).unwrap();
        stack.bind(id, ep("10.150.0.2", 8080)).unwrap();
        stack.listen(id).unwrap();

        let syn = packet::encode_v4(
            Ipv4Addr::new(10, 150, 0, 99),
            Ipv4Addr::new(10, 150, 0, 2),
            &TransportHeader::Stream {
                src_port: 45000,
                dst_port: 8080,
                flags: StreamFlags::SYN,
            },
            &[],
        );
        stack.deliver(&syn).unwrap();

        let accepted = stack
            .accept(ep("10.150.0.2", 8080), TransportKind::Stream)
            .unwrap()
            .expect("one pending connection");
        assert_eq!(
            stack.remote_endpoint(accepted).unwrap(),
            Some(ep("10.150.0.99", 45000))
        );
        assert_eq!(
            stack.state_of(accepted).unwrap(),
            ConnectionState::Connected
        );

        // Exactly one pending connection per SYN.
        assert!(stack
            .accept(ep("10.150.0.2", 8080), TransportKind::Stream)
            .unwrap()
            .is_none());

        // A SYN+ACK went out.
        let synack = outgoing.recv().await.unwrap();
        let meta = packet::decode(&synack).unwrap();
        let (header, _) = packet::decode_transport(&synack, &meta).unwrap();
        assert!(matches!(
            header,
            TransportHeader::Stream {
                flags: StreamFlags { syn: true, ack: true, fin: false },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_removes_connection() {
        let stack = stack_at("10.0.0.2");
        let id = stack.create(TransportKind::Stream).unwrap();
        stack.close(id).unwrap();
        assert!(matches!(
            stack.close(id),
            Err(CoreError::UnknownConnection { .. })
        ));
        assert!(matches!(
            stack.recv(id),
            Err(CoreError::UnknownConnection { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_emits_fin_when_connected() {
        let stack = stack_at("10.0.0.2");
        let mut outgoing = stack.take_outgoing().unwrap();

        let id = stack.create(TransportKind::Stream).unwrap();
        stack.connect(id, ep("10.0.0.3", 80)).unwrap();
        let _syn = outgoing.recv().await.unwrap();

        stack.close(id).unwrap();
        let fin = outgoing.recv().await.unwrap();
        let meta = packet::decode(&fin).unwrap();
        let (header, _) = packet::decode_transport(&fin, &meta).unwrap();
        assert!(matches!(
            header,
            TransportHeader::Stream {
                flags: StreamFlags { fin: true, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_inbound_overflow_drops_and_counts() {
        let stack = stack_at("10.0.0.2");
        let id = stack.create(TransportKind::Stream).unwrap();
        stack.connect(id, ep("10.0.0.3", 80)).unwrap();

        let local = stack.local_endpoint(id).unwrap().unwrap();
        for i in 0..=INBOUND_QUEUE_CAPACITY {
            let payload = format!("payload-{i}");
            let packet = packet::encode_v4(
                Ipv4Addr::new(10, 0, 0, 3),
                Ipv4Addr::new(10, 0, 0, 2),
                &TransportHeader::Stream {
                    src_port: 80,
                    dst_port: local.port,
                    flags: StreamFlags::ACK,
                },
                payload.as_bytes(),
            );
            stack.deliver(&packet).unwrap();
        }

        assert_eq!(stack.counters().inbound_dropped(), 1);
        for i in 0..INBOUND_QUEUE_CAPACITY {
            let payload = stack.recv(id).unwrap().expect("queued payload");
            assert_eq!(payload, format!("payload-{i}").into_bytes());
        }
        assert_eq!(stack.recv(id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_fin_closes_after_drain() {
        let stack = stack_at("10.0.0.2");
        let id = stack.create(TransportKind::Stream).unwrap();
        stack.connect(id, ep("10.0.0.3", 80)).unwrap();
        let local = stack.local_endpoint(id).unwrap().unwrap();

        let fin = packet::encode_v4(
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 2),
            &TransportHeader::Stream {
                src_port: 80,
                dst_port: local.port,
                flags: StreamFlags {
                    fin: true,
                    ack: true,
                    syn: false,
                },
            },
            b"tail",
        );
        stack.deliver(&fin).unwrap();

        assert_eq!(stack.state_of(id).unwrap(), ConnectionState::Closed);
        // Queued data remains drainable after the half-close.
        assert_eq!(stack.recv(id).unwrap(), Some(b"tail".to_vec()));
        assert_eq!(stack.recv(id).unwrap(), None);
    }

    #[tokio::test]
    async fn test_datagram_delivery_updates_last_peer() {
        let stack = stack_at("10.0.0.2");
        let id = stack.create(TransportKind::Datagram).unwrap();
        stack.bind(id, ep("10.0.0.2", 9999)).unwrap();

        for (src_port, body) in [(1111u16, "one"), (2222, "two")] {
            let packet = packet::encode_v4(
                Ipv4Addr::new(10, 0, 0, 50),
                Ipv4Addr::new(10, 0, 0, 2),
                &TransportHeader::Datagram {
                    src_port,
                    dst_port: 9999,
                },
                body.as_bytes(),
            );
            stack.deliver(&packet).unwrap();
        }

        assert_eq!(stack.recv(id).unwrap(), Some(b"one".to_vec()));
        assert_eq!(stack.recv(id).unwrap(), Some(b"two".to_vec()));
        assert_eq!(stack.last_peer(id).unwrap(), Some(ep("10.0.0.50", 2222)));
    }

    #[tokio::test]
    async fn test_state_errors() {
        let stack = stack_at("10.0.0.2");
        let id = stack.create(TransportKind::Stream).unwrap();

        // send before connect
        assert!(matches!(
            stack.send(id, vec![1]),
            Err(CoreError::NotConnected { .. })
        ));
        // listen before bind
        assert!(matches!(stack.listen(id), Err(CoreError::NotBound { .. })));
        // connect twice
        stack.connect(id, ep("10.0.0.3", 80)).unwrap();
        assert!(matches!(
            stack.connect(id, ep("10.0.0.4", 80)),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_bind_conflicts() {
        let stack = stack_at("10.0.0.2");
        let first = stack.create(TransportKind::Stream).unwrap();
        let second = stack.create(TransportKind::Stream).unwrap();

        stack.bind(first, ep("10.0.0.2", 8080)).unwrap();
        assert!(matches!(
            stack.bind(second, ep("10.0.0.2", 8080)),
            Err(CoreError::AddressInUse { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let stack = stack_at("10.0.0.2");
        let ghost = ConnectionId::from_raw(4040);
        assert!(matches!(
            stack.bind(ghost, ep("10.0.0.2", 1)),
            Err(CoreError::UnknownConnection { .. })
        ));
        assert!(matches!(
            stack.connect(ghost, ep("10.0.0.3", 1)),
            Err(CoreError::UnknownConnection { .. })
        ));
        assert!(matches!(
            stack.recv(ghost),
            Err(CoreError::UnknownConnection { .. })
        ));
    }

    #[tokio::test]
    async fn test_deliver_rejects_garbage() {
        let stack = stack_at("10.0.0.2");
        assert!(matches!(
            stack.deliver(&[0u8; 3]),
            Err(CoreError::MalformedPacket { .. })
        ));

        // Well-formed packet, nobody listening.
        let stray = packet::encode_v4(
            Ipv4Addr::new(10, 0, 0, 3),
            Ipv4Addr::new(10, 0, 0, 2),
            &TransportHeader::Datagram {
                src_port: 1,
                dst_port: 2,
            },
            b"?",
        );
        assert!(matches!(
            stack.deliver(&stray),
            Err(CoreError::NoMatchingEndpoint { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_send_queue_full_fails_fast() {
        let stack = stack_at("10.0.0.2");
        let id = stack.create(TransportKind::Stream).unwrap();
        stack.connect(id, ep("10.0.0.3", 80)).unwrap();

        // On a current-thread runtime the pump cannot run between pushes.
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            stack.send(id, vec![0]).unwrap();
        }
        assert!(matches!(
            stack.send(id, vec![0]),
            Err(CoreError::QueueFull { .. })
        ));
    }
}
