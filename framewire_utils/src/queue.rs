//! A bounded, timeout-aware handoff queue.
//!
//! [`HandoffQueue`] passes items between any number of producing and consuming
//! threads. Storage is an [`rtrb`] ring buffer allocated once at construction; its
//! producer and consumer ends are each guarded by a lock so the queue as a whole can
//! be shared by reference, and a condition variable lets consumers wait for an item
//! with a deadline.
//!
//! The queue is meant to be sized to hold every item that can ever be in
//! circulation (e.g. every frame of a pool). Under that discipline a push can never
//! find the queue full, which is why the push operation does not block or wait.

use core::{num, time::Duration};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

pub use rtrb;

/// A bounded multi-producer, multi-consumer queue with timed waits on the consumer side.
pub struct HandoffQueue<T> {
    tx: Mutex<rtrb::Producer<T>>,
    rx: Mutex<rtrb::Consumer<T>>,
    // Signalled, with `rx` held, after every successful push.
    ready: Condvar,
    capacity: num::NonZeroUsize,
}

impl<T> HandoffQueue<T> {
    /// Creates an empty queue able to hold `capacity` items.
    pub fn with_capacity(capacity: num::NonZeroUsize) -> Self {
        let (tx, rx) = rtrb::RingBuffer::new(capacity.get());

        Self {
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// The maximum number of items the queue can hold.
    #[inline(always)]
    pub const fn capacity(&self) -> num::NonZeroUsize {
        self.capacity
    }

    /// The number of items currently in the queue.
    #[inline]
    pub fn len(&self) -> usize {
        self.rx.lock().slots()
    }

    /// Returns `true` if no item is currently queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pushes an item, assuming the queue has room for it. Never blocks.
    ///
    /// Callers are expected to size the queue so that it can hold every item in
    /// circulation. If that assumption is violated, the item is handed back as
    /// `Err(item)` and the violation is logged.
    pub fn push_assume_capacity(&self, item: T) -> Result<(), T> {
        let res = self.tx.lock().push(item);

        match res {
            Ok(()) => {
                // Taking the consumer lock orders this notification after any
                // consumer's emptiness check, so a waiter cannot miss it.
                let _rx = self.rx.lock();
                self.ready.notify_one();
                Ok(())
            }
            Err(rtrb::PushError::Full(item)) => {
                log::error!(
                    "handoff queue overflow: pushed past its capacity of {}",
                    self.capacity
                );
                Err(item)
            }
        }
    }

    /// Pops an item if one is available right now.
    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.rx.lock().pop().ok()
    }

    /// Pops an item, waiting at most `timeout` for one to become available.
    #[inline]
    pub fn pop_wait(&self, timeout: Duration) -> Option<T> {
        self.pop_until(crate::Deadline::after(timeout).instant())
    }

    /// Pops an item, waiting until `deadline` at the latest for one to become available.
    ///
    /// Returns `None` if the deadline passes first. A deadline in the past makes this
    /// equivalent to [`try_pop`](Self::try_pop), except that it does not wait on
    /// contention either.
    pub fn pop_until(&self, deadline: Instant) -> Option<T> {
        let mut rx = self.rx.try_lock_until(deadline)?;

        loop {
            if let Ok(item) = rx.pop() {
                return Some(item);
            }

            if self.ready.wait_until(&mut rx, deadline).timed_out() {
                return rx.pop().ok();
            }
        }
    }
}

impl<T> core::fmt::Debug for HandoffQueue<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandoffQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
