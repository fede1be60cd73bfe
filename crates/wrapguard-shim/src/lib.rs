// ============================================
// File: crates/wrapguard-shim/src/lib.rs
// ============================================
//! # WrapGuard Syscall Shim
//!
//! ## Creation Reason
//! Loaded into the child via `LD_PRELOAD`, this library interposes the
//! BSD socket surface so an unmodified application's traffic can be
//! carried over the supervisor's userspace tunnel.
//!
//! ## Main Functionality
//! - Interposes `socket`, `bind`, `listen`, `accept`, `connect`,
//!   `send`, `recv`, `sendto`, `recvfrom`, `close`
//! - Emulate mode: internet sockets become virtual connections behind
//!   synthesized descriptors; every call is forwarded over the control
//!   channel
//! - SOCKS mode (`WRAPGUARD_SOCKS_PORT` set): kernel sockets stay,
//!   `connect` is rerouted through the loopback proxy and `bind` is
//!   announced so the supervisor can mirror the listener
//! - Anything not ours defers to the real libc symbol
//!
//! ## Decision Rule
//! ```text
//! descriptor ≥ 1_000_000 and in the table ──► forward to supervisor
//! otherwise                                ──► real libc call
//! ```
//!
//! ## Error Translation
//! Supervisor error kinds are translated exactly once, here, into BSD
//! error codes (`EADDRINUSE`, `EAGAIN`, `ECONNREFUSED`, ...). When the
//! control channel itself fails, `socket` falls back to the kernel
//! (the application keeps working, untunneled); calls on descriptors
//! that only exist virtually fail with `EIO`.
//!
//! ## Known Limitations
//! - `recvfrom` does not reconstruct the datagram source address; the
//!   virtual stack treats datagram sockets as loosely-connected
//! - Calls outside the interposed surface (`setsockopt`, `poll`, ...)
//!   on synthesized descriptors reach the kernel and fail with `EBADF`
//!
//! ## Last Modified
//! v0.1.0 - Initial shim implementation

#![warn(clippy::all)]
// The exported symbols intentionally shadow libc; their contracts are
// the POSIX ones.
#![allow(clippy::missing_safety_doc)]

use libc::{c_int, c_void, size_t, sockaddr as libc_sockaddr, socklen_t, ssize_t};

use wrapguard_common::protocol::{
    decode_payload, encode_payload, AcceptRequest, BindNotifyRequest, BindRequest, CloseRequest,
    ConnectRequest, ErrorKind, ListenRequest, RecvRequest, Request, Response, SendRequest,
    SocketRequest,
};
use wrapguard_common::types::{AddressFamily, TransportKind};

pub mod channel;
pub mod sockaddr;
pub mod socks;
pub mod state;

use state::{DescriptorEntry, ShimMode, DESCRIPTORS};

// ============================================
// Real Symbols
// ============================================

pub(crate) mod real {
    use libc::{c_char, c_int, c_void, size_t, sockaddr, socklen_t, ssize_t};
    use once_cell::sync::Lazy;

    type SocketFn = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
    type BindFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
    type ListenFn = unsafe extern "C" fn(c_int, c_int) -> c_int;
    type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
    type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
    type SendFn = unsafe extern "C" fn(c_int, *const c_void, size_t, c_int) -> ssize_t;
    type RecvFn = unsafe extern "C" fn(c_int, *mut c_void, size_t, c_int) -> ssize_t;
    type SendToFn = unsafe extern "C" fn(
        c_int,
        *const c_void,
        size_t,
        c_int,
        *const sockaddr,
        socklen_t,
    ) -> ssize_t;
    type RecvFromFn = unsafe extern "C" fn(
        c_int,
        *mut c_void,
        size_t,
        c_int,
        *mut sockaddr,
        *mut socklen_t,
    ) -> ssize_t;
    type CloseFn = unsafe extern "C" fn(c_int) -> c_int;

    /// Resolves the next occurrence of `name` in link order. The libc
    /// symbols this shim shadows always exist; a null result means the
    /// process is unusable anyway.
    unsafe fn resolve<T: Copy>(name: &'static str) -> T {
        debug_assert!(name.ends_with('\0'));
        let ptr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast::<c_char>());
        if ptr.is_null() {
            libc::abort();
        }
        std::mem::transmute_copy(&ptr)
    }

    static SOCKET: Lazy<SocketFn> = Lazy::new(|| unsafe { resolve("socket\0") });
    static BIND: Lazy<BindFn> = Lazy::new(|| unsafe { resolve("bind\0") });
    static LISTEN: Lazy<ListenFn> = Lazy::new(|| unsafe { resolve("listen\0") });
    static ACCEPT: Lazy<AcceptFn> = Lazy::new(|| unsafe { resolve("accept\0") });
    static CONNECT: Lazy<ConnectFn> = Lazy::new(|| unsafe { resolve("connect\0") });
    static SEND: Lazy<SendFn> = Lazy::new(|| unsafe { resolve("send\0") });
    static RECV: Lazy<RecvFn> = Lazy::new(|| unsafe { resolve("recv\0") });
    static SENDTO: Lazy<SendToFn> = Lazy::new(|| unsafe { resolve("sendto\0") });
    static RECVFROM: Lazy<RecvFromFn> = Lazy::new(|| unsafe { resolve("recvfrom\0") });
    static CLOSE: Lazy<CloseFn> = Lazy::new(|| unsafe { resolve("close\0") });

    pub unsafe fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
        (*SOCKET)(domain, ty, protocol)
    }
    pub unsafe fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
        (*BIND)(fd, addr, len)
    }
    pub unsafe fn listen(fd: c_int, backlog: c_int) -> c_int {
        (*LISTEN)(fd, backlog)
    }
    pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
        (*ACCEPT)(fd, addr, len)
    }
    pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
        (*CONNECT)(fd, addr, len)
    }
    pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
        (*SEND)(fd, buf, len, flags)
    }
    pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
        (*RECV)(fd, buf, len, flags)
    }
    pub unsafe fn sendto(
        fd: c_int,
        buf: *const c_void,
        len: size_t,
        flags: c_int,
        addr: *const sockaddr,
        addrlen: socklen_t,
    ) -> ssize_t {
        (*SENDTO)(fd, buf, len, flags, addr, addrlen)
    }
    pub unsafe fn recvfrom(
        fd: c_int,
        buf: *mut c_void,
        len: size_t,
        flags: c_int,
        addr: *mut sockaddr,
        addrlen: *mut socklen_t,
    ) -> ssize_t {
        (*RECVFROM)(fd, buf, len, flags, addr, addrlen)
    }
    pub unsafe fn close(fd: c_int) -> c_int {
        (*CLOSE)(fd)
    }
}

// ============================================
// Error Translation
// ============================================

unsafe fn set_errno(errno: c_int) {
    *libc::__errno_location() = errno;
}

/// The one place supervisor error kinds become BSD error codes.
fn errno_for(kind: ErrorKind, nonblocking: bool) -> c_int {
    match kind {
        ErrorKind::Unsupported => libc::ENOTSUP,
        ErrorKind::UnknownId => libc::EBADF,
        ErrorKind::AddressInUse => libc::EADDRINUSE,
        ErrorKind::NotBound | ErrorKind::InvalidState => libc::EINVAL,
        ErrorKind::NotListening => libc::EOPNOTSUPP,
        ErrorKind::NotConnected => libc::ENOTCONN,
        ErrorKind::QueueFull => libc::EAGAIN,
        ErrorKind::NoData | ErrorKind::Timeout => {
            if nonblocking {
                libc::EAGAIN
            } else {
                libc::ECONNRESET
            }
        }
        ErrorKind::NoRoute => libc::ENETUNREACH,
        ErrorKind::ConnectFailed => libc::ECONNREFUSED,
        ErrorKind::SendFailed => libc::EPIPE,
        ErrorKind::Protocol => libc::EPROTO,
    }
}

/// Fails a call on a virtual descriptor: sets errno, returns -1.
unsafe fn fail(errno: c_int) -> c_int {
    set_errno(errno);
    -1
}

// ============================================
// Interposed Surface
// ============================================

/// Interposed `socket(2)`.
#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if state::mode() != ShimMode::Emulate || !sockaddr::is_internet_family(domain) {
        return real::socket(domain, ty, protocol);
    }

    let base_type = ty & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
    let transport = match base_type {
        libc::SOCK_STREAM => TransportKind::Stream,
        libc::SOCK_DGRAM => TransportKind::Datagram,
        _ => return real::socket(domain, ty, protocol),
    };
    let family = if domain == libc::AF_INET {
        AddressFamily::V4
    } else {
        AddressFamily::V6
    };

    match channel::request(&Request::Socket(SocketRequest {
        domain: family,
        transport,
    })) {
        Ok(Response::Created(created)) => {
            let entry = DescriptorEntry::new(
                created.conn_id,
                transport,
                ty & libc::SOCK_NONBLOCK != 0,
            );
            match DESCRIPTORS.lock().allocate(entry) {
                Some(fd) => {
                    state::debug_log(|| {
                        format!("socket: conn {} behind fd {fd}", created.conn_id)
                    });
                    fd
                }
                None => fail(libc::EMFILE),
            }
        }
        Ok(Response::Error(e)) => fail(errno_for(e.kind, false)),
        Ok(_) => fail(libc::EIO),
        // Without a supervisor the kernel socket still works, just
        // untunneled.
        Err(_) => real::socket(domain, ty, protocol),
    }
}

/// Interposed `bind(2)`.
#[no_mangle]
pub unsafe extern "C" fn bind(fd: c_int, addr: *const libc_sockaddr, len: socklen_t) -> c_int {
    let entry = DESCRIPTORS.lock().get(fd).cloned();
    let Some(entry) = entry else {
        announce_kernel_bind(fd, addr, len);
        return real::bind(fd, addr, len);
    };

    let Some((address, port)) = sockaddr::parse(addr, len) else {
        return fail(libc::EAFNOSUPPORT);
    };
    match channel::request(&Request::Bind(BindRequest {
        conn_id: entry.conn_id,
        address,
        port,
    })) {
        Ok(Response::Ok) => 0,
        Ok(Response::Error(e)) => fail(errno_for(e.kind, false)),
        Ok(_) => fail(libc::EIO),
        Err(_) => fail(libc::EIO),
    }
}

/// In SOCKS mode kernel binds are announced so the supervisor can
/// mirror the listener toward the tunnel.
unsafe fn announce_kernel_bind(fd: c_int, addr: *const libc_sockaddr, len: socklen_t) {
    if state::mode() != ShimMode::Socks {
        return;
    }
    let Some((address, port)) = sockaddr::parse(addr, len) else {
        return;
    };
    if port == 0 {
        return;
    }
    let Some(transport) = kernel_socket_transport(fd) else {
        return;
    };
    state::debug_log(|| format!("announcing bind {address}:{port}"));
    let _ = channel::request(&Request::BindNotify(BindNotifyRequest {
        address,
        port,
        transport,
    }));
}

/// Queries `SO_TYPE` of a kernel socket.
unsafe fn kernel_socket_transport(fd: c_int) -> Option<TransportKind> {
    let mut sock_type: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_TYPE,
        (&mut sock_type as *mut c_int).cast::<c_void>(),
        &mut len,
    );
    if rc != 0 {
        return None;
    }
    match sock_type {
        libc::SOCK_STREAM => Some(TransportKind::Stream),
        libc::SOCK_DGRAM => Some(TransportKind::Datagram),
        _ => None,
    }
}

/// Interposed `listen(2)`.
#[no_mangle]
pub unsafe extern "C" fn listen(fd: c_int, backlog: c_int) -> c_int {
    let entry = DESCRIPTORS.lock().get(fd).cloned();
    let Some(entry) = entry else {
        return real::listen(fd, backlog);
    };

    match channel::request(&Request::Listen(ListenRequest {
        conn_id: entry.conn_id,
    })) {
        Ok(Response::Ok) => 0,
        Ok(Response::Error(e)) => fail(errno_for(e.kind, false)),
        Ok(_) => fail(libc::EIO),
        Err(_) => fail(libc::EIO),
    }
}

/// Interposed `accept(2)`.
#[no_mangle]
pub unsafe extern "C" fn accept(
    fd: c_int,
    addr: *mut libc_sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let entry = DESCRIPTORS.lock().get(fd).cloned();
    let Some(entry) = entry else {
        return real::accept(fd, addr, addrlen);
    };

    match channel::request(&Request::Accept(AcceptRequest {
        conn_id: entry.conn_id,
    })) {
        Ok(Response::Accepted(accepted)) => {
            let new_entry =
                DescriptorEntry::new(accepted.conn_id, TransportKind::Stream, entry.nonblocking);
            match DESCRIPTORS.lock().allocate(new_entry) {
                Some(new_fd) => {
                    sockaddr::write(addr, addrlen, accepted.address, accepted.port);
                    state::debug_log(|| {
                        format!("accept: conn {} behind fd {new_fd}", accepted.conn_id)
                    });
                    new_fd
                }
                None => fail(libc::EMFILE),
            }
        }
        Ok(Response::Error(e)) => fail(errno_for(e.kind, entry.nonblocking)),
        Ok(_) => fail(libc::EIO),
        Err(_) => fail(libc::EIO),
    }
}

/// Interposed `connect(2)`.
#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const libc_sockaddr, len: socklen_t) -> c_int {
    let entry = DESCRIPTORS.lock().get(fd).cloned();
    if let Some(entry) = entry {
        let Some((address, port)) = sockaddr::parse(addr, len) else {
            return fail(libc::EAFNOSUPPORT);
        };
        return match channel::request(&Request::Connect(ConnectRequest {
            conn_id: entry.conn_id,
            address,
            port,
        })) {
            Ok(Response::Ok) => 0,
            Ok(Response::Error(e)) => fail(errno_for(e.kind, false)),
            Ok(_) => fail(libc::EIO),
            Err(_) => fail(libc::EIO),
        };
    }

    // SOCKS mode: reroute outbound stream connects through the proxy.
    if state::mode() == ShimMode::Socks {
        if let (Some(port), Some(dest)) =
            (state::config().socks_port, sockaddr::parse(addr, len))
        {
            let redirectable = !dest.0.is_loopback()
                && kernel_socket_transport(fd) == Some(TransportKind::Stream);
            if redirectable {
                return socks::redirect(fd, dest, port);
            }
        }
    }
    real::connect(fd, addr, len)
}

/// Interposed `send(2)`.
#[no_mangle]
pub unsafe extern "C" fn send(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
) -> ssize_t {
    let entry = DESCRIPTORS.lock().get(fd).cloned();
    let Some(entry) = entry else {
        return real::send(fd, buf, len, flags);
    };
    if buf.is_null() {
        return fail(libc::EFAULT) as ssize_t;
    }

    let payload = std::slice::from_raw_parts(buf.cast::<u8>(), len);
    match channel::request(&Request::Send(SendRequest {
        conn_id: entry.conn_id,
        payload: encode_payload(payload),
    })) {
        Ok(Response::Ok) => len as ssize_t,
        Ok(Response::Error(e)) => fail(errno_for(e.kind, false)) as ssize_t,
        Ok(_) => fail(libc::EIO) as ssize_t,
        Err(_) => fail(libc::EIO) as ssize_t,
    }
}

/// Interposed `recv(2)`.
#[no_mangle]
pub unsafe extern "C" fn recv(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
) -> ssize_t {
    let ours = DESCRIPTORS.lock().get(fd).is_some();
    if !ours {
        return real::recv(fd, buf, len, flags);
    }
    if buf.is_null() {
        return fail(libc::EFAULT) as ssize_t;
    }
    let out = std::slice::from_raw_parts_mut(buf.cast::<u8>(), len);

    // Serve bytes a previous undersized read left behind.
    let (conn_id, nonblocking) = {
        let mut table = DESCRIPTORS.lock();
        let Some(entry) = table.get_mut(fd) else {
            return fail(libc::EBADF) as ssize_t;
        };
        if !entry.pending.is_empty() {
            let n = entry.pending.len().min(out.len());
            out[..n].copy_from_slice(&entry.pending[..n]);
            entry.pending.drain(..n);
            return n as ssize_t;
        }
        (entry.conn_id, entry.nonblocking)
    };

    let nonblocking_hint = nonblocking || flags & libc::MSG_DONTWAIT != 0;
    match channel::request(&Request::Recv(RecvRequest { conn_id })) {
        Ok(Response::Data(data)) => {
            let Ok(payload) = decode_payload(&data.payload) else {
                return fail(libc::EPROTO) as ssize_t;
            };
            let n = payload.len().min(out.len());
            out[..n].copy_from_slice(&payload[..n]);
            if n < payload.len() {
                let mut table = DESCRIPTORS.lock();
                if let Some(entry) = table.get_mut(fd) {
                    entry.pending.extend_from_slice(&payload[n..]);
                }
            }
            n as ssize_t
        }
        Ok(Response::Error(e)) => fail(errno_for(e.kind, nonblocking_hint)) as ssize_t,
        Ok(_) => fail(libc::EIO) as ssize_t,
        Err(_) => fail(libc::EIO) as ssize_t,
    }
}

/// Interposed `sendto(2)`. The destination acts as an implicit
/// `connect`; the virtual stack treats datagram sockets as
/// loosely-connected.
#[no_mangle]
pub unsafe extern "C" fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc_sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    let entry = DESCRIPTORS.lock().get(fd).cloned();
    let Some(entry) = entry else {
        return real::sendto(fd, buf, len, flags, dest_addr, addrlen);
    };

    if let Some(dest) = sockaddr::parse(dest_addr, addrlen) {
        if entry.last_dest != Some(dest) {
            let response = channel::request(&Request::Connect(ConnectRequest {
                conn_id: entry.conn_id,
                address: dest.0,
                port: dest.1,
            }));
            match response {
                Ok(Response::Ok) => {
                    let mut table = DESCRIPTORS.lock();
                    if let Some(entry) = table.get_mut(fd) {
                        entry.last_dest = Some(dest);
                    }
                }
                Ok(Response::Error(e)) => {
                    return fail(errno_for(e.kind, false)) as ssize_t
                }
                _ => return fail(libc::EIO) as ssize_t,
            }
        }
    }
    send(fd, buf, len, flags)
}

/// Interposed `recvfrom(2)`. The source address is not reconstructed;
/// see the crate documentation.
#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc_sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    let ours = DESCRIPTORS.lock().get(fd).is_some();
    if !ours {
        return real::recvfrom(fd, buf, len, flags, src_addr, addrlen);
    }
    recv(fd, buf, len, flags)
}

/// Interposed `close(2)`. The table entry is cleared before the
/// supervisor is told, so no thread can observe a released id.
#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let removed = DESCRIPTORS.lock().remove(fd);
    let Some(entry) = removed else {
        return real::close(fd);
    };

    // Best-effort: the descriptor is gone locally either way.
    let _ = channel::request(&Request::Close(CloseRequest {
        conn_id: entry.conn_id,
    }));
    state::debug_log(|| format!("close: released conn {}", entry.conn_id));
    0
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno_for(ErrorKind::Unsupported, false), libc::ENOTSUP);
        assert_eq!(errno_for(ErrorKind::AddressInUse, false), libc::EADDRINUSE);
        assert_eq!(errno_for(ErrorKind::NotListening, false), libc::EOPNOTSUPP);
        assert_eq!(errno_for(ErrorKind::ConnectFailed, false), libc::ECONNREFUSED);
        assert_eq!(errno_for(ErrorKind::SendFailed, false), libc::EPIPE);
        assert_eq!(errno_for(ErrorKind::NotConnected, false), libc::ENOTCONN);
        assert_eq!(errno_for(ErrorKind::NotBound, false), libc::EINVAL);
        assert_eq!(errno_for(ErrorKind::UnknownId, false), libc::EBADF);
    }

    #[test]
    fn test_no_data_depends_on_blocking_hint() {
        assert_eq!(errno_for(ErrorKind::NoData, true), libc::EAGAIN);
        assert_eq!(errno_for(ErrorKind::NoData, false), libc::ECONNRESET);
        assert_eq!(errno_for(ErrorKind::Timeout, true), libc::EAGAIN);
        assert_eq!(errno_for(ErrorKind::Timeout, false), libc::ECONNRESET);
    }

    #[test]
    fn test_deferred_calls_reach_the_kernel() {
        // With no supervisor environment the shim is disabled and the
        // whole surface behaves like plain libc.
        assert_eq!(state::mode(), ShimMode::Disabled);

        unsafe {
            let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(fd >= 0);
            assert!(fd < state::FIRST_DESCRIPTOR);
            assert_eq!(close(fd), 0);
        }
        assert!(DESCRIPTORS.lock().is_empty());
    }

    #[test]
    fn test_close_on_unknown_high_fd_defers() {
        // A descriptor in the reserved range that we never issued is
        // not ours; the real close must see it (and fail with EBADF).
        unsafe {
            let rc = close(state::FIRST_DESCRIPTOR + 12345);
            assert_eq!(rc, -1);
        }
    }
}
