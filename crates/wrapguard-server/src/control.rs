// ============================================
// File: crates/wrapguard-server/src/control.rs
// ============================================
//! # Control Channel Server
//!
//! ## Creation Reason
//! The preloaded shim inside the child has no access to the virtual
//! stack; it speaks newline-delimited records over a Unix-domain socket
//! and this server dispatches them to stack operations.
//!
//! ## Main Functionality
//! - `ControlChannelServer`: accept loop plus one task per shim
//!   connection; requests on a connection are handled strictly in order,
//!   connections proceed in parallel
//! - Blocking emulation: `accept` waits on the listener's readiness
//!   signal for up to 10 s, `recv` on the connection's for up to 1 s;
//!   past the budget the shim gets `timeout` / `no_data` and translates
//!   to the right BSD error itself
//! - `bind_notify` records are relayed to the port forwarder
//!
//! ## Request Handling
//! ```text
//! shim ──line──► Request::from_line ──► stack op ──► Response ──line──► shim
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Malformed records answer `error {protocol}` and the connection
//!   stays open; the shim may have queued more requests behind it
//! - The socket path carries the supervisor pid so concurrent
//!   supervisors never collide
//!
//! ## Last Modified
//! v0.1.0 - Initial control channel server

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use wrapguard_common::protocol::{
    decode_payload, encode_payload, AcceptedResponse, CreatedResponse, DataResponse, ErrorKind,
    Request, Response,
};
use wrapguard_common::types::{ConnectionId, ConnectionState, Endpoint, TransportKind};
use wrapguard_core::error::CoreError;
use wrapguard_core::stack::VirtualNetworkStack;

use crate::error::{Result, ServerError};

/// Capacity of the bind-notification channel to the port forwarder.
const NOTICE_CHANNEL_CAPACITY: usize = 100;

// ============================================
// BindNotice
// ============================================

/// A child-side `bind` the port forwarder should mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindNotice {
    /// Address the child bound.
    pub address: IpAddr,
    /// Port the child bound.
    pub port: u16,
    /// Listener transport.
    pub transport: TransportKind,
}

// ============================================
// BlockingBudgets
// ============================================

/// Total time the server will wait before reporting `timeout` /
/// `no_data`. These budgets are the observable contract; the waiting
/// itself is signal-driven, not polled.
#[derive(Debug, Clone, Copy)]
pub struct BlockingBudgets {
    /// Budget for `accept`.
    pub accept: Duration,
    /// Budget for `recv`.
    pub recv: Duration,
}

impl Default for BlockingBudgets {
    fn default() -> Self {
        Self {
            accept: Duration::from_secs(10),
            recv: Duration::from_secs(1),
        }
    }
}

// ============================================
// ControlChannelServer
// ============================================

/// The Unix-domain request/response server the shim talks to.
pub struct ControlChannelServer {
    listener: UnixListener,
    path: PathBuf,
    stack: Arc<VirtualNetworkStack>,
    notices: mpsc::Sender<BindNotice>,
    budgets: BlockingBudgets,
}

impl ControlChannelServer {
    /// Binds the server socket under `$TMPDIR` and returns the
    /// receiving side of the bind-notification channel.
    pub fn bind(
        stack: Arc<VirtualNetworkStack>,
    ) -> Result<(Self, mpsc::Receiver<BindNotice>)> {
        Self::bind_with_budgets(stack, BlockingBudgets::default())
    }

    /// Like [`bind`](Self::bind) with explicit waiting budgets.
    pub fn bind_with_budgets(
        stack: Arc<VirtualNetworkStack>,
        budgets: BlockingBudgets,
    ) -> Result<(Self, mpsc::Receiver<BindNotice>)> {
        // The sequence number keeps servers created within one process
        // (a recycled pid, tests) from unlinking each other's socket.
        static SEQUENCE: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);
        let seq = SEQUENCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "wrapguard-{}-{}.sock",
            std::process::id(),
            seq
        ));
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path)
            .map_err(|e| ServerError::startup_failed(format!("control socket bind: {e}")))?;
        info!(path = %path.display(), "control channel listening");

        let (notices, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
        Ok((
            Self {
                listener,
                path,
                stack,
                notices,
                budgets,
            },
            notice_rx,
        ))
    }

    /// Path the child must be pointed at via `WRAPGUARD_IPC_PATH`.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Runs the accept loop until shutdown, then removes the socket.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("control channel received shutdown signal");
                        break;
                    }
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let stack = Arc::clone(&self.stack);
                                let notices = self.notices.clone();
                                let budgets = self.budgets;
                                tokio::spawn(async move {
                                    handle_client(stack, notices, budgets, stream).await;
                                });
                            }
                            Err(e) => {
                                warn!(error = %e, "control channel accept failed");
                                break;
                            }
                        }
                    }
                }
            }
            let _ = std::fs::remove_file(&self.path);
            debug!("control channel exited");
        })
    }
}

/// Serves one shim connection: many request/response pairs in sequence.
async fn handle_client(
    stack: Arc<VirtualNetworkStack>,
    notices: mpsc::Sender<BindNotice>,
    budgets: BlockingBudgets,
    stream: UnixStream,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "control connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatch(&stack, &notices, budgets, &line).await;
        let mut encoded = response.to_line();
        encoded.push('\n');
        if let Err(e) = write_half.write_all(encoded.as_bytes()).await {
            debug!(error = %e, "control connection write failed");
            break;
        }
    }
    trace!("control connection closed");
}

/// Handles one request record.
async fn dispatch(
    stack: &Arc<VirtualNetworkStack>,
    notices: &mpsc::Sender<BindNotice>,
    budgets: BlockingBudgets,
    line: &str,
) -> Response {
    let request = match Request::from_line(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "malformed control record");
            return Response::error(ErrorKind::Protocol);
        }
    };
    trace!(request = request.tag(), "control request");

    match request {
        Request::Socket(r) => match stack.create(r.transport) {
            Ok(id) => Response::Created(CreatedResponse {
                conn_id: id.as_raw(),
            }),
            Err(e) => error_response(&e),
        },
        Request::Bind(r) => {
            let id = ConnectionId::from_raw(r.conn_id);
            match stack.bind(id, Endpoint::new(r.address, r.port)) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::Listen(r) => match stack.listen(ConnectionId::from_raw(r.conn_id)) {
            Ok(()) => Response::Ok,
            Err(e) => error_response(&e),
        },
        Request::Accept(r) => {
            handle_accept(stack, ConnectionId::from_raw(r.conn_id), budgets.accept).await
        }
        Request::Connect(r) => {
            let id = ConnectionId::from_raw(r.conn_id);
            match stack.connect(id, Endpoint::new(r.address, r.port)) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::Send(r) => {
            let id = ConnectionId::from_raw(r.conn_id);
            let payload = match decode_payload(&r.payload) {
                Ok(payload) => payload,
                Err(_) => return Response::error(ErrorKind::Protocol),
            };
            match stack.send(id, payload) {
                Ok(()) => Response::Ok,
                Err(e) => error_response(&e),
            }
        }
        Request::Recv(r) => {
            handle_recv(stack, ConnectionId::from_raw(r.conn_id), budgets.recv).await
        }
        Request::Close(r) => match stack.close(ConnectionId::from_raw(r.conn_id)) {
            Ok(()) => Response::Ok,
            Err(e) => error_response(&e),
        },
        Request::BindNotify(r) => {
            let notice = BindNotice {
                address: r.address,
                port: r.port,
                transport: r.transport,
            };
            if notices.try_send(notice).is_err() {
                warn!(port = r.port, "bind notice dropped, forwarder backlog full");
            }
            Response::Ok
        }
    }
}

/// Waits for a pending connection on the listener backing `id`, up to
/// the accept budget.
async fn handle_accept(
    stack: &Arc<VirtualNetworkStack>,
    id: ConnectionId,
    budget: Duration,
) -> Response {
    let local = match stack.local_endpoint(id) {
        Ok(Some(local)) => local,
        Ok(None) => return Response::error(ErrorKind::NotBound),
        Err(e) => return error_response(&e),
    };
    let transport = match stack.transport_of(id) {
        Ok(transport) => transport,
        Err(e) => return error_response(&e),
    };

    let deadline = Instant::now() + budget;
    loop {
        match stack.accept(local, transport) {
            Ok(Some(accepted)) => {
                let remote = stack.remote_endpoint(accepted).ok().flatten();
                let (address, port) = match remote {
                    Some(remote) => (remote.addr, remote.port),
                    None => (IpAddr::from([0u8, 0, 0, 0]), 0),
                };
                return Response::Accepted(AcceptedResponse {
                    conn_id: accepted.as_raw(),
                    address,
                    port,
                });
            }
            Ok(None) => {
                let Ok(signal) = stack.accept_ready(local, transport) else {
                    return Response::error(ErrorKind::NotListening);
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Response::error(ErrorKind::Timeout);
                }
                let _ = tokio::time::timeout(remaining, signal.notified()).await;
                if Instant::now() >= deadline {
                    // One last non-blocking look before giving up.
                    if let Ok(Some(accepted)) = stack.accept(local, transport) {
                        let remote = stack.remote_endpoint(accepted).ok().flatten();
                        let (address, port) = match remote {
                            Some(remote) => (remote.addr, remote.port),
                            None => (IpAddr::from([0u8, 0, 0, 0]), 0),
                        };
                        return Response::Accepted(AcceptedResponse {
                            conn_id: accepted.as_raw(),
                            address,
                            port,
                        });
                    }
                    return Response::error(ErrorKind::Timeout);
                }
            }
            Err(e) => return error_response(&e),
        }
    }
}

/// Waits for an inbound payload on `id`, up to the recv budget.
async fn handle_recv(
    stack: &Arc<VirtualNetworkStack>,
    id: ConnectionId,
    budget: Duration,
) -> Response {
    let deadline = Instant::now() + budget;
    loop {
        match stack.recv(id) {
            Ok(Some(payload)) => {
                return Response::Data(DataResponse {
                    payload: encode_payload(&payload),
                })
            }
            Ok(None) => {
                // A drained half-closed connection will never produce
                // more data; answer immediately.
                if matches!(stack.state_of(id), Ok(ConnectionState::Closed)) {
                    return Response::error(ErrorKind::NoData);
                }
                let Ok(signal) = stack.inbound_ready(id) else {
                    return Response::error(ErrorKind::UnknownId);
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Response::error(ErrorKind::NoData);
                }
                let _ = tokio::time::timeout(remaining, signal.notified()).await;
                if Instant::now() >= deadline {
                    if let Ok(Some(payload)) = stack.recv(id) {
                        return Response::Data(DataResponse {
                            payload: encode_payload(&payload),
                        });
                    }
                    return Response::error(ErrorKind::NoData);
                }
            }
            Err(e) => return error_response(&e),
        }
    }
}

/// Maps a stack error onto the wire error kinds.
fn error_response(error: &CoreError) -> Response {
    let kind = match error {
        CoreError::UnknownConnection { .. } => ErrorKind::UnknownId,
        CoreError::AddressInUse { .. } => ErrorKind::AddressInUse,
        CoreError::NotBound { .. } => ErrorKind::NotBound,
        CoreError::NoListener { .. } => ErrorKind::NotListening,
        CoreError::NotConnected { .. } => ErrorKind::NotConnected,
        CoreError::InvalidState { .. } => ErrorKind::InvalidState,
        CoreError::QueueFull { .. } | CoreError::ConnectionLimit { .. } => ErrorKind::QueueFull,
        CoreError::MalformedPacket { .. } | CoreError::Common(_) => ErrorKind::Protocol,
        CoreError::UnsupportedProtocol { .. } | CoreError::InvalidPolicy { .. } => {
            ErrorKind::Unsupported
        }
        CoreError::NoMatchingEndpoint { .. } => ErrorKind::NoRoute,
    };
    Response::error(kind)
}

// ============================================
// Tests
// ============================================
