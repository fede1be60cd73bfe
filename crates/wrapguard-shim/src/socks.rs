// ============================================
// File: crates/wrapguard-shim/src/socks.rs
// ============================================
//! # SOCKS5 Client Redirect
//!
//! ## Creation Reason
//! In SOCKS mode the shim keeps kernel sockets but reroutes `connect`:
//! the socket is connected to the supervisor's loopback proxy and the
//! original destination travels inside a SOCKS5 CONNECT request. The
//! application never notices.
//!
//! ## Main Functionality
//! - `redirect`: connect the descriptor to the proxy, perform the
//!   no-auth greeting and CONNECT exchange, restore `O_NONBLOCK`
//! - Pure builders/parsers for the wire bytes (testable without a
//!   socket)
//!
//! ## ⚠️ Important Note for Next Developer
//! - The handshake runs with `O_NONBLOCK` temporarily cleared; a
//!   non-blocking caller simply sees `connect` succeed synchronously,
//!   which the interface permits
//!
//! ## Last Modified
//! v0.1.0 - Initial SOCKS5 client

use std::mem;
use std::net::{IpAddr, Ipv4Addr};

use libc::{c_int, sockaddr_in, socklen_t};

use crate::state;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_V6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

// ============================================
// Wire Builders
// ============================================

/// The method-negotiation greeting: no-auth only.
#[must_use]
pub fn greeting_bytes() -> [u8; 3] {
    [SOCKS_VERSION, 1, METHOD_NO_AUTH]
}

/// A CONNECT request for the original destination.
#[must_use]
pub fn connect_request_bytes(dest: (IpAddr, u16)) -> Vec<u8> {
    let (ip, port) = dest;
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match ip {
        IpAddr::V4(v4) => {
            request.push(ATYP_V4);
            request.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            request.push(ATYP_V6);
            request.extend_from_slice(&v6.octets());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    request
}

/// How many bound-address bytes follow a reply header with this
/// address type (excluding the 2 port bytes). `None` for a type we
/// cannot skip.
#[must_use]
pub fn reply_address_len(atyp: u8) -> Option<usize> {
    match atyp {
        ATYP_V4 => Some(4),
        ATYP_V6 => Some(16),
        _ => None,
    }
}

// ============================================
// Redirect
// ============================================

/// Connects `fd` to the loopback proxy and tunnels the CONNECT for the
/// original destination. Returns 0 on success, -1 with `errno` set
/// otherwise.
///
/// # Safety
/// `fd` must be a valid, unconnected internet stream socket.
pub unsafe fn redirect(fd: c_int, dest: (IpAddr, u16), socks_port: u16) -> c_int {
    state::debug_log(|| format!("redirecting connect fd={fd} to {}:{}", dest.0, dest.1));

    let flags = libc::fcntl(fd, libc::F_GETFL);
    let was_nonblocking = flags >= 0 && flags & libc::O_NONBLOCK != 0;
    if was_nonblocking {
        libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
    }

    let result = redirect_blocking(fd, dest, socks_port);

    if was_nonblocking {
        libc::fcntl(fd, libc::F_SETFL, flags);
    }
    result
}

unsafe fn redirect_blocking(fd: c_int, dest: (IpAddr, u16), socks_port: u16) -> c_int {
    let mut proxy: sockaddr_in = mem::zeroed();
    proxy.sin_family = libc::AF_INET as libc::sa_family_t;
    proxy.sin_port = socks_port.to_be();
    proxy.sin_addr.s_addr = u32::from(Ipv4Addr::LOCALHOST).to_be();

    let connected = crate::real::connect(
        fd,
        (&proxy as *const sockaddr_in).cast(),
        mem::size_of::<sockaddr_in>() as socklen_t,
    );
    if connected != 0 {
        // errno from the real connect stands.
        return -1;
    }

    if !write_all(fd, &greeting_bytes()) {
        return fail(libc::ECONNREFUSED);
    }
    let mut method = [0u8; 2];
    if !read_exact(fd, &mut method) || method != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return fail(libc::ECONNREFUSED);
    }

    if !write_all(fd, &connect_request_bytes(dest)) {
        return fail(libc::ECONNREFUSED);
    }
    let mut header = [0u8; 4];
    if !read_exact(fd, &mut header) || header[0] != SOCKS_VERSION {
        return fail(libc::ECONNREFUSED);
    }

    // Drain the bound address the proxy reports.
    let Some(addr_len) = reply_address_len(header[3]) else {
        return fail(libc::ECONNREFUSED);
    };
    let mut bound = [0u8; 18];
    if !read_exact(fd, &mut bound[..addr_len + 2]) {
        return fail(libc::ECONNREFUSED);
    }

    if header[1] != REP_SUCCESS {
        state::debug_log(|| format!("proxy refused connect: rep={}", header[1]));
        return fail(libc::ECONNREFUSED);
    }
    0
}

unsafe fn fail(errno: c_int) -> c_int {
    *libc::__errno_location() = errno;
    -1
}

unsafe fn write_all(fd: c_int, mut data: &[u8]) -> bool {
    while !data.is_empty() {
        let written = libc::write(fd, data.as_ptr().cast(), data.len());
        if written < 0 {
            if *libc::__errno_location() == libc::EINTR {
                continue;
            }
            return false;
        }
        if written == 0 {
            return false;
        }
        data = &data[written as usize..];
    }
    true
}

unsafe fn read_exact(fd: c_int, mut buf: &mut [u8]) -> bool {
    while !buf.is_empty() {
        let read = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
        if read < 0 {
            if *libc::__errno_location() == libc::EINTR {
                continue;
            }
            return false;
        }
        if read == 0 {
            return false;
        }
        buf = &mut buf[read as usize..];
    }
    true
}

// ============================================
// Tests
// ============================================
