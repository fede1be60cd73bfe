// ============================================
// File: crates/wrapguard-shim/src/sockaddr.rs
// ============================================
//! # Socket Address Conversion
//!
//! ## Creation Reason
//! The interposed calls receive and produce raw `sockaddr` pointers;
//! this module is the single place that reads and writes them.
//!
//! ## Main Functionality
//! - `parse`: `sockaddr*` → `(IpAddr, port)` for AF_INET / AF_INET6
//! - `write`: fill a caller-provided `sockaddr*` (for `accept`)
//! - `is_internet_family`
//!
//! ## ⚠️ Important Note for Next Developer
//! - All pointer access is bounds-checked against the caller's length;
//!   a short buffer gets a truncated copy, as the kernel would do
//!
//! ## Last Modified
//! v0.1.0 - Initial address conversion

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;

use libc::{c_int, sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, socklen_t, AF_INET, AF_INET6};

/// Whether the address family is internet-scoped.
#[must_use]
pub fn is_internet_family(family: c_int) -> bool {
    family == AF_INET || family == AF_INET6
}

/// Reads an internet socket address.
///
/// # Safety
/// `addr` must point to at least `len` readable bytes, or be null.
pub unsafe fn parse(addr: *const sockaddr, len: socklen_t) -> Option<(IpAddr, u16)> {
    if addr.is_null() {
        return None;
    }
    match c_int::from((*addr).sa_family) {
        AF_INET if len as usize >= mem::size_of::<sockaddr_in>() => {
            let sin = &*addr.cast::<sockaddr_in>();
            Some((
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                u16::from_be(sin.sin_port),
            ))
        }
        AF_INET6 if len as usize >= mem::size_of::<sockaddr_in6>() => {
            let sin6 = &*addr.cast::<sockaddr_in6>();
            Some((
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// Fills a caller-provided address buffer, truncating if it is short,
/// and stores the full length back as `accept(2)` does.
///
/// # Safety
/// `addr` must point to `*len` writable bytes and `len` must be a valid
/// pointer, or either may be null.
pub unsafe fn write(addr: *mut sockaddr, len: *mut socklen_t, ip: IpAddr, port: u16) {
    if addr.is_null() || len.is_null() {
        return;
    }
    let available = *len as usize;

    match ip {
        IpAddr::V4(v4) => {
            let mut sin: sockaddr_in = mem::zeroed();
            sin.sin_family = AF_INET as sa_family_t;
            sin.sin_port = port.to_be();
            sin.sin_addr.s_addr = u32::from(v4).to_be();

            let full = mem::size_of::<sockaddr_in>();
            ptr::copy_nonoverlapping(
                (&sin as *const sockaddr_in).cast::<u8>(),
                addr.cast::<u8>(),
                full.min(available),
            );
            *len = full as socklen_t;
        }
        IpAddr::V6(v6) => {
            let mut sin6: sockaddr_in6 = mem::zeroed();
            sin6.sin6_family = AF_INET6 as sa_family_t;
            sin6.sin6_port = port.to_be();
            sin6.sin6_addr.s6_addr = v6.octets();

            let full = mem::size_of::<sockaddr_in6>();
            ptr::copy_nonoverlapping(
                (&sin6 as *const sockaddr_in6).cast::<u8>(),
                addr.cast::<u8>(),
                full.min(available),
            );
            *len = full as socklen_t;
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v4() {
        let mut sin: sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = AF_INET as sa_family_t;
        sin.sin_port = 8080u16.to_be();
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::new(10, 150, 0, 2)).to_be();

        let parsed = unsafe {
            parse(
                (&sin as *const sockaddr_in).cast(),
                mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(
            parsed,
            Some((IpAddr::V4(Ipv4Addr::new(10, 150, 0, 2)), 8080))
        );
    }

    #[test]
    fn test_parse_v6() {
        let ip: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut sin6: sockaddr_in6 = unsafe { mem::zeroed() };
        sin6.sin6_family = AF_INET6 as sa_family_t;
        sin6.sin6_port = 51820u16.to_be();
        sin6.sin6_addr.s6_addr = ip.octets();

        let parsed = unsafe {
            parse(
                (&sin6 as *const sockaddr_in6).cast(),
                mem::size_of::<sockaddr_in6>() as socklen_t,
            )
        };
        assert_eq!(parsed, Some((IpAddr::V6(ip), 51820)));
    }

    #[test]
    fn test_parse_rejects_short_and_foreign() {
        let mut sin: sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = AF_INET as sa_family_t;

        // Short length
        let parsed = unsafe { parse((&sin as *const sockaddr_in).cast(), 4) };
        assert_eq!(parsed, None);

        // AF_UNIX is not ours
        sin.sin_family = libc::AF_UNIX as sa_family_t;
        let parsed = unsafe {
            parse(
                (&sin as *const sockaddr_in).cast(),
                mem::size_of::<sockaddr_in>() as socklen_t,
            )
        };
        assert_eq!(parsed, None);

        // Null pointer
        assert_eq!(unsafe { parse(std::ptr::null(), 16) }, None);
    }

    #[test]
    fn test_write_roundtrips_through_parse() {
        let mut buf: sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<sockaddr_in6>() as socklen_t;

        unsafe {
            write(
                (&mut buf as *mut sockaddr_in6).cast(),
                &mut len,
                IpAddr::V4(Ipv4Addr::new(10, 150, 0, 99)),
                45000,
            );
        }
        assert_eq!(len as usize, mem::size_of::<sockaddr_in>());

        let parsed = unsafe { parse((&buf as *const sockaddr_in6).cast(), len) };
        assert_eq!(
            parsed,
            Some((IpAddr::V4(Ipv4Addr::new(10, 150, 0, 99)), 45000))
        );
    }

    #[test]
    fn test_write_truncates_but_reports_full_length() {
        let mut buf = [0u8; 4];
        let mut len = buf.len() as socklen_t;

        unsafe {
            write(
                buf.as_mut_ptr().cast(),
                &mut len,
                IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
                80,
            );
        }
        // The reported length is the untruncated size.
        assert_eq!(len as usize, mem::size_of::<sockaddr_in>());
    }
}
