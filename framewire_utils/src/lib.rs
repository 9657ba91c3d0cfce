//! Utilities for building predictable, low-latency, allocation-free frame pipelines.
//!
//! This crate provides the two memory-management primitives a pooled datagram
//! transport is built on, along with a small timing helper:
//!
//! - [`arena`]: a single contiguous allocation carved into fixed-size frames, each
//!   independently owned once handed out.
//! - [`queue`]: a bounded, timeout-aware handoff queue used to circulate idle frames
//!   between the code that releases them and the code that acquires them.
//! - [`Deadline`]: a timeout budget shared by chained waits.
//!
//! Everything here allocates once, at construction. Steady-state operations only move
//! already-allocated frames around.

pub mod arena;
pub mod queue;

pub use arena::{Frame, FrameArena};
pub use queue::HandoffQueue;

use core::time::Duration;
use std::time::Instant;

/// Upper bound used when a caller asks for a timeout so large that `now + timeout`
/// is not representable. Roughly thirty years, which is as good as "forever".
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// A timeout budget, started when an operation is entered.
///
/// Blocking operations made of several waits (e.g. "wait for a free buffer, then wait
/// for the socket to become readable") create one `Deadline` up front and hand
/// [`remaining`](Self::remaining) to each step, so that the total time spent blocked
/// is bounded by the caller's single timeout rather than a multiple of it.
///
/// ```ignore
/// let deadline = Deadline::after(timeout);
///
/// let item = queue.pop_until(deadline.instant())?;
///
/// if !socket.wait_readable(deadline.remaining())? {
///     // the whole budget is spent
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// Creates a deadline `timeout` from now.
    ///
    /// Timeouts too large to be represented are clamped to a far-future instant.
    #[inline]
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self(
            now.checked_add(timeout)
                .unwrap_or_else(|| now + FAR_FUTURE),
        )
    }

    /// Returns the instant at which this deadline expires.
    #[inline(always)]
    pub const fn instant(&self) -> Instant {
        self.0
    }

    /// Returns how much of the budget is left, saturating at zero.
    #[inline(always)]
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// Returns `true` once the budget is spent.
    #[inline(always)]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}
