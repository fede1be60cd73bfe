// ============================================
// File: crates/wrapguard-tunnel/src/device.rs
// ============================================
//! # Memory Tunnel Device
//!
//! ## Creation Reason
//! The WireGuard engine expects a packet interface it can read cleartext
//! packets from and write decrypted packets to. Instead of a kernel TUN
//! device this is a pair of bounded in-memory queues behind a small
//! capability set: read, write, close, lifecycle events.
//!
//! ## Main Functionality
//! - `MemoryTunnel`: the two queues plus an up/down watch channel
//! - Engine side: `read` / `read_batch` (suspend until a packet or
//!   close), `write` (drops silently on overflow, counted)
//! - Application side: `send` / `recv`, the mirror image
//! - `close`: idempotent; queued packets are discarded and readers see
//!   end-of-stream
//!
//! ## Queue Layout
//! ```text
//!            send ──► [ app-to-engine, 1000 ] ──► read / read_batch
//! application                                            engine
//!            recv ◄── [ engine-to-app, 1000 ] ◄── write
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - `mtu` and `name` are immutable after construction
//! - The up/down watch is how the adapter learns about fatal engine
//!   errors; `mark_down` does not close the queues
//!
//! ## Last Modified
//! v0.1.0 - Initial device implementation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::error::{Result, TunnelError};

// ============================================
// Constants
// ============================================

/// Packets held per direction.
pub const DEVICE_QUEUE_CAPACITY: usize = 1000;

/// Most packets returned by a single `read_batch` call.
pub const READ_BATCH_LIMIT: usize = 128;

// ============================================
// DeviceState
// ============================================

/// Lifecycle signal observed by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Packets flow.
    Up,
    /// The data plane is gone; outbound packets should be dropped.
    Down,
}

// ============================================
// PacketQueue
// ============================================

enum PushOutcome {
    Queued,
    Full,
    Closed,
}

/// One direction of the device: bounded queue plus readiness signal.
struct PacketQueue {
    inner: Mutex<VecDeque<Vec<u8>>>,
    ready: Notify,
    closed: AtomicBool,
}

impl PacketQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(DEVICE_QUEUE_CAPACITY)),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, packet: Vec<u8>) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        {
            let mut inner = self.inner.lock();
            if inner.len() >= DEVICE_QUEUE_CAPACITY {
                return PushOutcome::Full;
            }
            inner.push_back(packet);
        }
        self.ready.notify_one();
        PushOutcome::Queued
    }

    async fn pop_wait(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.ready.notified();
            if let Some(packet) = self.inner.lock().pop_front() {
                return Some(packet);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    async fn pop_batch(&self, max: usize) -> Vec<Vec<u8>> {
        let first = match self.pop_wait().await {
            Some(packet) => packet,
            None => return Vec::new(),
        };
        let mut batch = Vec::with_capacity(max.min(READ_BATCH_LIMIT));
        batch.push(first);
        let mut inner = self.inner.lock();
        while batch.len() < max.min(READ_BATCH_LIMIT) {
            match inner.pop_front() {
                Some(packet) => batch.push(packet),
                None => break,
            }
        }
        batch
    }

    /// Closes the queue and discards anything still queued.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.lock().clear();
        self.ready.notify_waiters();
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

// ============================================
// MemoryTunnel
// ============================================

/// In-memory stand-in for a tunnel interface.
pub struct MemoryTunnel {
    name: String,
    mtu: u16,
    to_engine: PacketQueue,
    to_app: PacketQueue,
    state_tx: watch::Sender<DeviceState>,
    dropped: AtomicU64,
}

impl MemoryTunnel {
    /// Creates a device, initially up.
    #[must_use]
    pub fn new(name: impl Into<String>, mtu: u16) -> Arc<Self> {
        let (state_tx, _) = watch::channel(DeviceState::Up);
        Arc::new(Self {
            name: name.into(),
            mtu,
            to_engine: PacketQueue::new(),
            to_app: PacketQueue::new(),
            state_tx,
            dropped: AtomicU64::new(0),
        })
    }

    // ========================================
    // Engine Side
    // ========================================

    /// Takes the next application packet, suspending until one arrives.
    /// Returns `None` once the device is closed.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.to_engine.pop_wait().await
    }

    /// Takes up to `max` (at most [`READ_BATCH_LIMIT`]) application
    /// packets, suspending until at least one arrives. Returns an empty
    /// batch once the device is closed.
    pub async fn read_batch(&self, max: usize) -> Vec<Vec<u8>> {
        self.to_engine.pop_batch(max).await
    }

    /// Hands a decrypted packet to the application side. Overflow drops
    /// the packet silently and counts it.
    ///
    /// # Errors
    /// `DeviceClosed` once the device is closed.
    pub fn write(&self, packet: Vec<u8>) -> Result<()> {
        match self.to_app.push(packet) {
            PushOutcome::Queued => Ok(()),
            PushOutcome::Full => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            PushOutcome::Closed => Err(TunnelError::DeviceClosed),
        }
    }

    // ========================================
    // Application Side
    // ========================================

    /// Queues a cleartext packet for the engine. Overflow drops the
    /// packet silently and counts it.
    ///
    /// # Errors
    /// `DeviceClosed` once the device is closed.
    pub fn send(&self, packet: Vec<u8>) -> Result<()> {
        match self.to_engine.push(packet) {
            PushOutcome::Queued => Ok(()),
            PushOutcome::Full => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            PushOutcome::Closed => Err(TunnelError::DeviceClosed),
        }
    }

    /// Takes the next decrypted packet, suspending until one arrives.
    /// Returns `None` once the device is closed.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.to_app.pop_wait().await
    }

    // ========================================
    // Lifecycle & Configuration
    // ========================================

    /// Closes both queues. Idempotent; queued packets are discarded and
    /// pending readers observe end-of-stream.
    pub fn close(&self) {
        self.to_engine.close();
        self.to_app.close();
        self.state_tx.send_replace(DeviceState::Down);
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.to_engine.closed.load(Ordering::Acquire)
    }

    /// Signals the data plane is gone without closing the queues. Used
    /// by the engine on fatal errors.
    pub fn mark_down(&self) {
        self.state_tx.send_replace(DeviceState::Down);
    }

    /// Subscribes to up/down transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<DeviceState> {
        self.state_tx.subscribe()
    }

    /// Configured MTU, immutable after construction.
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Device name, immutable after construction.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Packets dropped by either queue's overflow policy.
    #[must_use]
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Packets currently queued toward the engine.
    #[must_use]
    pub fn pending_for_engine(&self) -> usize {
        self.to_engine.len()
    }

    /// Packets currently queued toward the application.
    #[must_use]
    pub fn pending_for_app(&self) -> usize {
        self.to_app.len()
    }
}

impl std::fmt::Debug for MemoryTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTunnel")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("closed", &self.is_closed())
            .field("pending_for_engine", &self.pending_for_engine())
            .field("pending_for_app", &self.pending_for_app())
            .finish()
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_device_basic() {
        let device = MemoryTunnel::new("wg0", 1420);
        assert_eq!(device.name(), "wg0");
        assert_eq!(device.mtu(), 1420);
        assert!(!device.is_closed());
    }

    #[tokio::test]
    async fn test_send_then_read() {
        let device = MemoryTunnel::new("wg0", 1420);
        device.send(b"packet".to_vec()).unwrap();
        assert_eq!(device.read().await, Some(b"packet".to_vec()));
    }

    #[tokio::test]
    async fn test_write_then_recv() {
        let device = MemoryTunnel::new("wg0", 1420);
        device.write(b"decrypted".to_vec()).unwrap();
        assert_eq!(device.recv().await, Some(b"decrypted".to_vec()));
    }

    #[tokio::test]
    async fn test_read_batch() {
        let device = MemoryTunnel::new("wg0", 1420);
        for i in 0..5u8 {
            device.send(vec![i]).unwrap();
        }
        let batch = device.read_batch(3).await;
        assert_eq!(batch, vec![vec![0], vec![1], vec![2]]);
        let rest = device.read_batch(READ_BATCH_LIMIT).await;
        assert_eq!(rest, vec![vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn test_overflow_drops_and_counts() {
        let device = MemoryTunnel::new("wg0", 1420);
        for _ in 0..DEVICE_QUEUE_CAPACITY {
            device.write(vec![0]).unwrap();
        }
        device.write(vec![1]).unwrap();
        assert_eq!(device.dropped_packets(), 1);
        assert_eq!(device.pending_for_app(), DEVICE_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drains_nothing() {
        let device = MemoryTunnel::new("wg0", 1420);
        device.send(b"stale".to_vec()).unwrap();
        device.close();
        device.close();

        // No packet is retained past close.
        assert_eq!(device.pending_for_engine(), 0);
        assert_eq!(device.read().await, None);
        assert_eq!(device.recv().await, None);
        assert!(device.write(vec![1]).is_err());
        assert!(device.send(vec![1]).is_err());
        assert!(device.read_batch(8).await.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_reader() {
        let device = MemoryTunnel::new("wg0", 1420);
        let reader = {
            let device = Arc::clone(&device);
            tokio::spawn(async move { device.read().await })
        };
        tokio::task::yield_now().await;
        device.close();
        assert_eq!(reader.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_watch() {
        let device = MemoryTunnel::new("wg0", 1420);
        let state = device.state();
        assert_eq!(*state.borrow(), DeviceState::Up);
        device.mark_down();
        assert_eq!(*state.borrow(), DeviceState::Down);
        // Queues survive mark_down, unlike close.
        device.send(vec![1]).unwrap();
        assert_eq!(device.read().await, Some(vec![1]));
    }
}
