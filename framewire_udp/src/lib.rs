//! A zero-copy, buffer-pooled UDP datagram transport.
//!
//! [`UdpZeroCopy`] owns a connected UDP socket and two pools of fixed-size frames,
//! both allocated once, at construction:
//!
//! - a receive pool: [`get_recv_buff`](UdpZeroCopy::get_recv_buff) reads one datagram
//!   directly into an idle frame and lends it out as a [`RecvBuff`], which returns the
//!   frame to the pool when released or dropped.
//! - a send ring: [`get_send_buff`](UdpZeroCopy::get_send_buff) lends out the next
//!   frame of the ring as a [`SendBuff`], once the datagram last committed from it has
//!   been handed to the kernel. [`SendBuff::commit`] sends the written bytes without
//!   waiting for completion, and [`flush`](UdpZeroCopy::flush) pushes out datagrams the
//!   kernel could not take right away. Datagrams always leave in commit order.
//!
//! Every blocking operation takes a timeout, and an expired timeout is reported as
//! `Ok(None)`, never as an error. No steady-state operation allocates.
//!
//! ```no_run
//! use core::time::Duration;
//! use framewire_udp::{TransportConfig, UdpZeroCopy};
//!
//! let transport = UdpZeroCopy::connect("192.168.10.2", "49152", &TransportConfig::default())?;
//!
//! if let Some(mut buff) = transport.get_send_buff(Duration::from_millis(100))? {
//!     buff[..5].copy_from_slice(b"hello");
//!     buff.commit(5)?;
//! }
//!
//! if let Some(datagram) = transport.get_recv_buff(Duration::from_millis(100))? {
//!     println!("received {} bytes", datagram.len());
//! }
//! # Ok::<(), framewire_udp::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod netinit;
pub mod recv;
pub mod send;
pub mod socket;
pub mod transport;

pub use config::{DEFAULT_MTU, DEFAULT_NUM_FRAMES, MAX_SEND_FRAMES, TransportConfig};
pub use error::{ConfigError, Error, Result};
pub use recv::RecvBuff;
pub use send::SendBuff;
pub use socket::{DatagramSocket, UdpSocket};
pub use transport::UdpZeroCopy;

pub use framewire_utils;

use core::num;
use std::io;

#[inline(always)]
pub(crate) const fn nz(x: usize) -> num::NonZeroUsize {
    num::NonZeroUsize::new(x).unwrap()
}

/// Errors meaning "nothing happened, try again later", as opposed to a hard failure.
#[inline(always)]
pub(crate) fn io_err_is_transient(e: io::ErrorKind) -> bool {
    use io::ErrorKind::*;
    [WouldBlock, TimedOut, Interrupted].contains(&e)
}
