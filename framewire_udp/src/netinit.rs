//! Process-wide network subsystem state.
//!
//! Some platforms need the socket layer to be started once per process before any
//! socket is created, and cleaned up at exit. Every transport holds a
//! [`NetworkGuard`] for its whole lifetime: the first guard ever acquired performs
//! the one-time startup, and the live guard count is tracked for diagnostics.
//!
//! Teardown is left to process exit. On Windows, `socket2` performs the Winsock
//! startup when the first socket is created and the standard library registers the
//! matching cleanup at exit, so no platform call is made from here. Elsewhere there
//! is nothing to start.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

static STARTUP: Once = Once::new();
static LIVE: AtomicUsize = AtomicUsize::new(0);

/// Keeps the network subsystem accounted for while a transport is alive.
#[derive(Debug)]
pub struct NetworkGuard(());

/// Initializes the network subsystem on first use and returns a guard for it.
pub fn acquire() -> NetworkGuard {
    STARTUP.call_once(|| log::debug!("network subsystem initialized"));
    LIVE.fetch_add(1, Ordering::Relaxed);
    NetworkGuard(())
}

/// The number of guards currently alive.
#[inline]
pub fn live_transports() -> usize {
    LIVE.load(Ordering::Relaxed)
}

impl Drop for NetworkGuard {
    fn drop(&mut self) {
        LIVE.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_acquire_initializes() {
        let guard = acquire();
        assert!(STARTUP.is_completed());
        assert!(live_transports() >= 1);
        drop(guard);
        assert!(STARTUP.is_completed());
    }
}
