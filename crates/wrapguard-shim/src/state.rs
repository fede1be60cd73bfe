// ============================================
// File: crates/wrapguard-shim/src/state.rs
// ============================================
//! # Shim Process State
//!
//! ## Creation Reason
//! The shim lives inside a foreign process and may be entered from any
//! of its threads. Everything it remembers — the synthesized descriptor
//! table and the environment-derived configuration — lives here behind
//! process-wide guards.
//!
//! ## Main Functionality
//! - `ShimConfig`: environment snapshot (`WRAPGUARD_IPC_PATH`,
//!   `WRAPGUARD_SOCKS_PORT`, `WRAPGUARD_DEBUG`), read once
//! - `DescriptorTable`: synthesized descriptor → connection mapping
//! - Diagnostic output to the child's stderr when debugging is on
//!
//! ## Descriptor Synthesis
//! Synthesized descriptors start at 1_000_000 and increment, wrapping
//! back with an in-use check. Kernel descriptors are small integers, so
//! collision with a real descriptor is impossible by construction.
//!
//! ## ⚠️ Important Note for Next Developer
//! - The table mutex is held only for table reads and writes, never
//!   across a control-channel round-trip
//! - On `close`, remove the table entry BEFORE telling the supervisor;
//!   a concurrent thread must never observe a released id
//!
//! ## Last Modified
//! v0.1.0 - Initial shim state

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use libc::c_int;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use wrapguard_common::types::TransportKind;

/// First synthesized descriptor number.
pub const FIRST_DESCRIPTOR: c_int = 1_000_000;

/// Last synthesized descriptor number (inclusive).
pub const LAST_DESCRIPTOR: c_int = c_int::MAX - 1;

// ============================================
// Configuration
// ============================================

/// What the supervisor told us through the environment.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Control-channel socket path.
    pub ipc_path: Option<PathBuf>,
    /// Loopback SOCKS5 port; presence selects redirect mode.
    pub socks_port: Option<u16>,
    /// Emit diagnostics to the child's stderr.
    pub debug: bool,
}

/// How the shim lowers socket calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShimMode {
    /// Every socket call proxied over the control channel.
    Emulate,
    /// Kernel sockets; `connect` redirected through the SOCKS5 proxy,
    /// `bind` announced over the control channel.
    Socks,
    /// Not running under a supervisor; defer everything.
    Disabled,
}

static CONFIG: Lazy<ShimConfig> = Lazy::new(|| ShimConfig {
    ipc_path: std::env::var_os("WRAPGUARD_IPC_PATH").map(PathBuf::from),
    socks_port: std::env::var("WRAPGUARD_SOCKS_PORT")
        .ok()
        .and_then(|v| v.parse().ok()),
    debug: std::env::var("WRAPGUARD_DEBUG").map(|v| v == "1").unwrap_or(false),
});

/// The environment snapshot, taken on first use.
pub fn config() -> &'static ShimConfig {
    &CONFIG
}

/// The operating mode this process runs in.
pub fn mode() -> ShimMode {
    let config = config();
    if config.socks_port.is_some() {
        ShimMode::Socks
    } else if config.ipc_path.is_some() {
        ShimMode::Emulate
    } else {
        ShimMode::Disabled
    }
}

/// Prints a diagnostic line to the child's stderr when
/// `WRAPGUARD_DEBUG=1`.
pub fn debug_log(message: impl FnOnce() -> String) {
    if config().debug {
        eprintln!("[wrapguard-shim] {}", message());
    }
}

// ============================================
// DescriptorTable
// ============================================

/// State kept per synthesized descriptor.
#[derive(Debug, Clone)]
pub struct DescriptorEntry {
    /// The virtual connection this descriptor owns.
    pub conn_id: u32,
    /// Stream or datagram.
    pub transport: TransportKind,
    /// Whether the application asked for non-blocking behavior at
    /// `socket` time.
    pub nonblocking: bool,
    /// Destination of the last implicit connect issued by `sendto`.
    pub last_dest: Option<(IpAddr, u16)>,
    /// Payload bytes received from the supervisor but not yet consumed
    /// by the application's undersized buffer.
    pub pending: Vec<u8>,
}

impl DescriptorEntry {
    /// A fresh entry owning `conn_id`.
    #[must_use]
    pub fn new(conn_id: u32, transport: TransportKind, nonblocking: bool) -> Self {
        Self {
            conn_id,
            transport,
            nonblocking,
            last_dest: None,
            pending: Vec::new(),
        }
    }
}

/// Synthesized descriptor → connection mapping.
#[derive(Default)]
pub struct DescriptorTable {
    entries: HashMap<c_int, DescriptorEntry>,
    next: Option<c_int>,
}

impl DescriptorTable {
    /// Reserves a descriptor for `entry`. Returns `None` only when the
    /// whole reserved range is in use.
    pub fn allocate(&mut self, entry: DescriptorEntry) -> Option<c_int> {
        let start = self.next.unwrap_or(FIRST_DESCRIPTOR);
        let mut candidate = start;
        loop {
            if !self.entries.contains_key(&candidate) {
                self.entries.insert(candidate, entry);
                self.next = Some(if candidate >= LAST_DESCRIPTOR {
                    FIRST_DESCRIPTOR
                } else {
                    candidate + 1
                });
                return Some(candidate);
            }
            candidate = if candidate >= LAST_DESCRIPTOR {
                FIRST_DESCRIPTOR
            } else {
                candidate + 1
            };
            if candidate == start {
                return None;
            }
        }
    }

    /// Looks up a descriptor. Returns `None` for kernel descriptors.
    #[must_use]
    pub fn get(&self, fd: c_int) -> Option<&DescriptorEntry> {
        if fd < FIRST_DESCRIPTOR {
            return None;
        }
        self.entries.get(&fd)
    }

    /// Mutable lookup for updating `last_dest` and `pending`.
    pub fn get_mut(&mut self, fd: c_int) -> Option<&mut DescriptorEntry> {
        if fd < FIRST_DESCRIPTOR {
            return None;
        }
        self.entries.get_mut(&fd)
    }

    /// Clears a descriptor, returning the entry it owned.
    pub fn remove(&mut self, fd: c_int) -> Option<DescriptorEntry> {
        self.entries.remove(&fd)
    }

    /// Number of live synthesized descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no synthesized descriptors exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The process-wide descriptor table.
pub static DESCRIPTORS: Lazy<Mutex<DescriptorTable>> =
    Lazy::new(|| Mutex::new(DescriptorTable::default()));

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(conn_id: u32) -> DescriptorEntry {
        DescriptorEntry::new(conn_id, TransportKind::Stream, false)
    }

    #[test]
    fn test_descriptors_start_high() {
        let mut table = DescriptorTable::default();
        let fd = table.allocate(entry(1)).unwrap();
        assert_eq!(fd, FIRST_DESCRIPTOR);
        assert_eq!(table.allocate(entry(2)).unwrap(), FIRST_DESCRIPTOR + 1);
    }

    #[test]
    fn test_kernel_descriptors_never_match() {
        let mut table = DescriptorTable::default();
        table.allocate(entry(1)).unwrap();
        assert!(table.get(0).is_none());
        assert!(table.get(3).is_none());
        assert!(table.get(FIRST_DESCRIPTOR - 1).is_none());
        assert!(table.get(FIRST_DESCRIPTOR).is_some());
    }

    #[test]
    fn test_remove_clears_entry() {
        let mut table = DescriptorTable::default();
        let fd = table.allocate(entry(9)).unwrap();
        let removed = table.remove(fd).unwrap();
        assert_eq!(removed.conn_id, 9);
        assert!(table.get(fd).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_wrap_skips_in_use_descriptors() {
        let mut table = DescriptorTable::default();
        table.next = Some(LAST_DESCRIPTOR);

        let high = table.allocate(entry(1)).unwrap();
        assert_eq!(high, LAST_DESCRIPTOR);

        // Wrapped back to the bottom of the range.
        let wrapped = table.allocate(entry(2)).unwrap();
        assert_eq!(wrapped, FIRST_DESCRIPTOR);

        // Occupied slots are skipped on the way.
        table.next = Some(FIRST_DESCRIPTOR);
        let next = table.allocate(entry(3)).unwrap();
        assert_eq!(next, FIRST_DESCRIPTOR + 1);
        assert_eq!(table.len(), 3);
    }
}
