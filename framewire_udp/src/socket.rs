//! The socket layer used by the transport.
//!
//! The transport never blocks inside a socket call. It only needs four operations:
//! non-blocking reads and writes, and bounded waits for read or write readiness.
//! These are captured by the [`DatagramSocket`] trait, implemented here for a
//! connected UDP socket, [`UdpSocket`].

use core::{net::SocketAddr, num, time::Duration};
use std::io;

use crate::{Error, Result};

/// A connected, non-blocking datagram socket.
///
/// Every method must return promptly, except the `wait_*` methods, which may block
/// for at most the given timeout. A timeout of zero must not block at all.
pub trait DatagramSocket {
    /// Reads one datagram into `buf`, without blocking.
    ///
    /// Returns an error of kind [`WouldBlock`](io::ErrorKind::WouldBlock) if no
    /// datagram is queued. Datagrams larger than `buf` are truncated.
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Hands one datagram to the kernel, without blocking.
    ///
    /// Returns an error of kind [`WouldBlock`](io::ErrorKind::WouldBlock) if the
    /// kernel cannot take it right now.
    fn try_send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Waits until a datagram can be read, or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Waits until a datagram can be sent, or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout.
    fn wait_writable(&self, timeout: Duration) -> io::Result<bool>;
}

impl<T: DatagramSocket + ?Sized> DatagramSocket for &T {
    #[inline(always)]
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_recv(buf)
    }

    #[inline(always)]
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_send(buf)
    }

    #[inline(always)]
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_readable(timeout)
    }

    #[inline(always)]
    fn wait_writable(&self, timeout: Duration) -> io::Result<bool> {
        (**self).wait_writable(timeout)
    }
}

/// A UDP socket connected to exactly one peer, in non-blocking mode.
#[derive(Debug)]
pub struct UdpSocket {
    sock: std::net::UdpSocket,
}

impl UdpSocket {
    /// Creates a UDP socket, puts it in non-blocking mode, applies the requested
    /// kernel buffer sizes, and connects it to `peer`.
    ///
    /// Buffer resizing is best-effort: failures are logged and otherwise ignored.
    /// Any other failure closes the socket and is returned with the failing call.
    pub fn connect(
        peer: SocketAddr,
        recv_buff_size: Option<num::NonZeroUsize>,
        send_buff_size: Option<num::NonZeroUsize>,
    ) -> Result<Self> {
        use socket2::{Domain, Protocol, Socket, Type};

        let socket = Socket::new(Domain::for_address(peer), Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::os("socket", e))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| Error::os("set_nonblocking", e))?;

        if let Some(size) = recv_buff_size {
            match socket.set_recv_buffer_size(size.get()) {
                Ok(()) => log::debug!(
                    "requested {size} byte receive buffer, got {:?}",
                    socket.recv_buffer_size().ok()
                ),
                Err(e) => log::warn!("failed to resize receive buffer to {size} bytes: {e}"),
            }
        }

        if let Some(size) = send_buff_size {
            match socket.set_send_buffer_size(size.get()) {
                Ok(()) => log::debug!(
                    "requested {size} byte send buffer, got {:?}",
                    socket.send_buffer_size().ok()
                ),
                Err(e) => log::warn!("failed to resize send buffer to {size} bytes: {e}"),
            }
        }

        socket
            .connect(&peer.into())
            .map_err(|e| Error::os("connect", e))?;

        Ok(Self { sock: socket.into() })
    }

    /// The local address this socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// The address of the connected peer.
    #[inline]
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.sock.peer_addr()
    }

    /// The underlying standard library socket.
    #[inline(always)]
    pub fn as_std(&self) -> &std::net::UdpSocket {
        &self.sock
    }
}

impl DatagramSocket for UdpSocket {
    #[inline(always)]
    fn try_recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }

    #[inline(always)]
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send(buf)
    }

    #[inline]
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        sys::wait_readable(&self.sock, timeout)
    }

    #[inline]
    fn wait_writable(&self, timeout: Duration) -> io::Result<bool> {
        sys::wait_writable(&self.sock, timeout)
    }
}

/// Readiness waits. Neither backend touches the socket's blocking mode.
mod sys {
    use super::*;
    use framewire_utils::Deadline;

    pub(super) fn wait_readable(sock: &std::net::UdpSocket, timeout: Duration) -> io::Result<bool> {
        wait(sock, Interest::Read, timeout)
    }

    pub(super) fn wait_writable(sock: &std::net::UdpSocket, timeout: Duration) -> io::Result<bool> {
        wait(sock, Interest::Write, timeout)
    }

    #[derive(Debug, Clone, Copy)]
    enum Interest {
        Read,
        Write,
    }

    /// Rounds up to whole milliseconds, so a wait is never shorter than requested.
    fn timeout_ms(timeout: Duration) -> i32 {
        let ms = timeout.as_millis() + u128::from(timeout.subsec_nanos() % 1_000_000 != 0);
        i32::try_from(ms).unwrap_or(i32::MAX)
    }

    fn wait(sock: &std::net::UdpSocket, interest: Interest, timeout: Duration) -> io::Result<bool> {
        let deadline = Deadline::after(timeout);

        loop {
            match poll_once(sock, interest, timeout_ms(deadline.remaining())) {
                // error conditions (POLLERR...) count as ready, the next
                // socket call reports them
                Ok(ready) => return Ok(ready),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(unix)]
    fn poll_once(
        sock: &std::net::UdpSocket,
        interest: Interest,
        timeout_ms: i32,
    ) -> io::Result<bool> {
        use std::os::fd::AsRawFd;

        let mut pfd = libc::pollfd {
            fd: sock.as_raw_fd(),
            events: match interest {
                Interest::Read => libc::POLLIN,
                Interest::Write => libc::POLLOUT,
            },
            revents: 0,
        };

        // SAFETY: `pfd` is a valid, exclusively borrowed pollfd and we pass nfds = 1
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(ret > 0)
    }

    #[cfg(windows)]
    fn poll_once(
        sock: &std::net::UdpSocket,
        interest: Interest,
        timeout_ms: i32,
    ) -> io::Result<bool> {
        use std::os::windows::io::AsRawSocket;
        use windows_sys::Win32::Networking::WinSock::{
            POLLRDNORM, POLLWRNORM, SOCKET, SOCKET_ERROR, WSAPOLLFD, WSAPoll,
        };

        let mut pfd = WSAPOLLFD {
            fd: sock.as_raw_socket() as SOCKET,
            events: match interest {
                Interest::Read => POLLRDNORM as _,
                Interest::Write => POLLWRNORM as _,
            },
            revents: 0,
        };

        // SAFETY: `pfd` is a valid, exclusively borrowed WSAPOLLFD holding a live socket,
        // and we pass a count of 1
        let ret = unsafe { WSAPoll(&mut pfd, 1, timeout_ms) };

        if ret == SOCKET_ERROR {
            // WSAGetLastError() and GetLastError() report the same value
            return Err(io::Error::last_os_error());
        }

        Ok(ret > 0)
    }

    #[cfg(not(any(unix, windows)))]
    compile_error!("readiness waits are only implemented with poll(2) and WSAPoll");

}
