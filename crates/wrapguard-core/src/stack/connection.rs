// ============================================
// File: crates/wrapguard-core/src/stack/connection.rs
// ============================================
//! # Connection State & Bounded Queues
//!
//! ## Creation Reason
//! Holds the per-connection pieces of the virtual stack: the bounded
//! payload queues, the listener accept queue, and the drop counters.
//!
//! ## Main Functionality
//! - `PayloadQueue`: bounded single-producer/single-consumer payload queue
//!   with a readiness signal
//! - `AcceptQueue`: bounded queue of half-formed connections awaiting
//!   `accept`
//! - `StackCounters`: drop accounting
//!
//! ## ⚠️ Important Note for Next Developer
//! - Queue operations never block; waiting happens through the `Notify`
//!   handles so callers can emulate blocking with a total time budget
//! - Closing a queue wakes every waiter exactly so they can observe the
//!   close; payloads already queued remain drainable
//!
//! ## Last Modified
//! v0.1.0 - Initial queue implementation

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use wrapguard_common::types::{ConnectionId, ConnectionState, Endpoint, TransportKind};

// ============================================
// Constants
// ============================================

/// Payloads queued toward the application, per connection.
pub const INBOUND_QUEUE_CAPACITY: usize = 100;

/// Payloads queued toward the tunnel, per connection.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 100;

/// Raw packets queued toward the tunnel, stack-wide.
pub const OUTGOING_PACKET_CAPACITY: usize = 1000;

/// Half-formed connections a listener will hold for `accept`.
pub const ACCEPT_QUEUE_CAPACITY: usize = 10;

// ============================================
// PayloadQueue
// ============================================

/// Bounded payload queue with a readiness signal.
///
/// Single producer, single consumer; the internal mutex only guards the
/// `VecDeque` itself and is never held across I/O or `.await`.
pub(crate) struct PayloadQueue {
    capacity: usize,
    inner: Mutex<VecDeque<Vec<u8>>>,
    ready: Arc<Notify>,
    closed: AtomicBool,
}

impl PayloadQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueues a payload. Returns `false` if the queue is full or closed;
    /// the payload is then the caller's to drop (and count).
    pub(crate) fn push(&self, payload: Vec<u8>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut inner = self.inner.lock();
            if inner.len() >= self.capacity {
                return false;
            }
            inner.push_back(payload);
        }
        self.ready.notify_one();
        true
    }

    /// Dequeues the next payload, if any. Payloads remain drainable after
    /// close.
    pub(crate) fn pop(&self) -> Option<Vec<u8>> {
        self.inner.lock().pop_front()
    }

    /// Dequeues the next payload, suspending until one arrives or the
    /// queue is closed and drained.
    pub(crate) async fn pop_wait(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.ready.notified();
            if let Some(payload) = self.pop() {
                return Some(payload);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Marks the queue closed and wakes every waiter.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Readiness signal: notified on push and on close.
    pub(crate) fn ready(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

// ============================================
// AcceptQueue
// ============================================

/// Bounded queue of connections awaiting `accept`.
pub(crate) struct AcceptQueue {
    inner: Mutex<VecDeque<ConnectionId>>,
    ready: Arc<Notify>,
}

impl AcceptQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(ACCEPT_QUEUE_CAPACITY)),
            ready: Arc::new(Notify::new()),
        })
    }

    /// Enqueues a pending connection. Returns `false` on overflow.
    pub(crate) fn push(&self, id: ConnectionId) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.len() >= ACCEPT_QUEUE_CAPACITY {
                return false;
            }
            inner.push_back(id);
        }
        self.ready.notify_one();
        true
    }

    pub(crate) fn pop(&self) -> Option<ConnectionId> {
        self.inner.lock().pop_front()
    }

    /// Readiness signal: notified whenever a connection is enqueued.
    pub(crate) fn ready(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    /// Wakes waiters so they can observe listener removal.
    pub(crate) fn wake_all(&self) {
        self.ready.notify_waiters();
    }
}

// ============================================
// Table Entries
// ============================================

/// A virtual connection as tracked by the stack-wide table.
pub(crate) struct ConnectionEntry {
    pub transport: TransportKind,
    pub state: ConnectionState,
    pub local: Option<Endpoint>,
    pub remote: Option<Endpoint>,
    /// Source endpoint of the most recent inbound datagram.
    pub last_peer: Option<Endpoint>,
    pub inbound: Arc<PayloadQueue>,
    pub outbound: Arc<PayloadQueue>,
}

impl ConnectionEntry {
    pub(crate) fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            state: ConnectionState::Created,
            local: None,
            remote: None,
            last_peer: None,
            inbound: PayloadQueue::new(INBOUND_QUEUE_CAPACITY),
            outbound: PayloadQueue::new(OUTBOUND_QUEUE_CAPACITY),
        }
    }
}

/// A listening endpoint and its accept queue.
pub(crate) struct ListenerEntry {
    pub queue: Arc<AcceptQueue>,
}

// ============================================
// StackCounters
// ============================================

/// Drop accounting for the bounded-queue overflow policy.
#[derive(Debug, Default)]
pub struct StackCounters {
    inbound_dropped: AtomicU64,
    outgoing_dropped: AtomicU64,
    accept_dropped: AtomicU64,
}

impl StackCounters {
    /// Payloads dropped because a connection's inbound queue was full.
    #[must_use]
    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped.load(Ordering::Relaxed)
    }

    /// Packets dropped because the stack-wide outgoing queue was full.
    #[must_use]
    pub fn outgoing_dropped(&self) -> u64 {
        self.outgoing_dropped.load(Ordering::Relaxed)
    }

    /// Inbound connections dropped because an accept queue was full.
    #[must_use]
    pub fn accept_dropped(&self) -> u64 {
        self.accept_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn record_inbound_drop(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outgoing_drop(&self) {
        self.outgoing_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept_drop(&self) {
        self.accept_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_queue_bounded() {
        let queue = PayloadQueue::new(2);
        assert!(queue.push(vec![1]));
        assert!(queue.push(vec![2]));
        assert!(!queue.push(vec![3]));
        assert_eq!(queue.pop(), Some(vec![1]));
        assert!(queue.push(vec![3]));
        assert_eq!(queue.pop(), Some(vec![2]));
        assert_eq!(queue.pop(), Some(vec![3]));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_payload_queue_drains_after_close() {
        let queue = PayloadQueue::new(4);
        assert!(queue.push(vec![1]));
        queue.close();
        assert!(!queue.push(vec![2]));
        assert_eq!(queue.pop(), Some(vec![1]));
        assert_eq!(queue.pop(), None);
    }

    #[tokio::test]
    async fn test_pop_wait_sees_push() {
        let queue = PayloadQueue::new(4);
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_wait().await })
        };
        tokio::task::yield_now().await;
        queue.push(vec![7]);
        assert_eq!(consumer.await.unwrap(), Some(vec![7]));
    }

    #[tokio::test]
    async fn test_pop_wait_ends_on_close() {
        let queue = PayloadQueue::new(4);
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop_wait().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }

    #[test]
    fn test_accept_queue_bounded() {
        let queue = AcceptQueue::new();
        for i in 0..ACCEPT_QUEUE_CAPACITY {
            assert!(queue.push(ConnectionId::from_raw(i as u32)));
        }
        assert!(!queue.push(ConnectionId::from_raw(99)));
        assert_eq!(queue.pop(), Some(ConnectionId::from_raw(0)));
    }
}
