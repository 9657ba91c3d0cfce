//! The zero-copy UDP transport.

use core::{
    net::SocketAddr,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use std::{io, net::ToSocketAddrs};

use framewire_utils::{Deadline, FrameArena, HandoffQueue};

use crate::{
    DatagramSocket, Error, RecvBuff, Result, SendBuff, TransportConfig, UdpSocket,
    config::Geometry,
    io_err_is_transient,
    netinit::{self, NetworkGuard},
    recv::PendingRecvFrames,
    send::SendRing,
};

/// A datagram transport over a connected socket, with pre-allocated send and
/// receive frames.
///
/// # Threading
///
/// Receiving may be done from any number of threads, and [`RecvBuff`]s may be released
/// from any thread. Sending is single-writer: `get_send_buff`, [`SendBuff::commit`] and
/// `flush` must not be called concurrently on the same transport. The round-robin cursor
/// is not protected against concurrent advancement, so concurrent senders may be handed
/// slots out of order.
pub struct UdpZeroCopy<S = UdpSocket> {
    geometry: Geometry,
    pending_recv: PendingRecvFrames,
    send_ring: SendRing,
    next_send: AtomicUsize,
    socket: S,
    // dropped last, after the socket
    _net: Option<NetworkGuard>,
}

impl UdpZeroCopy {
    /// Resolves `addr:port`, opens a UDP socket connected to it, and builds a
    /// transport over it.
    ///
    /// The configuration is validated before anything else is done. IPv4 addresses
    /// are preferred when the host resolves to several. The port must be numeric.
    pub fn connect(addr: &str, port: &str, config: &TransportConfig) -> Result<Self> {
        let geometry = config.geometry()?;

        log::info!("Creating UDP zero-copy transport for {addr}:{port}");

        let peer = resolve(addr, port)?;
        let net = netinit::acquire();
        let socket = UdpSocket::connect(peer, config.recv_buff_size(), config.send_buff_size())?;

        log::debug!(
            "connected {} -> {peer}",
            socket
                .local_addr()
                .map_or_else(|_| "?".to_owned(), |a| a.to_string())
        );

        Ok(Self::build(socket, geometry, Some(net)))
    }

    /// The local address of the socket.
    #[inline]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The address of the peer this transport is connected to.
    #[inline]
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

impl<S: DatagramSocket> UdpZeroCopy<S> {
    /// Builds a transport over an already connected, non-blocking socket.
    pub fn with_socket(socket: S, config: &TransportConfig) -> Result<Self> {
        let geometry = config.geometry()?;
        Ok(Self::build(socket, geometry, None))
    }

    fn build(socket: S, geometry: Geometry, net: Option<NetworkGuard>) -> Self {
        let Geometry {
            recv_frame_size,
            num_recv_frames,
            send_frame_size,
            num_send_frames,
        } = geometry;

        log::info!(
            "frame geometry: {num_recv_frames} x {recv_frame_size} bytes (recv), \
            {num_send_frames} x {send_frame_size} bytes (send)"
        );

        let pending_recv = HandoffQueue::with_capacity(num_recv_frames);

        for frame in FrameArena::allocate(num_recv_frames, recv_frame_size).into_frames() {
            let res = pending_recv.push_assume_capacity(frame);
            debug_assert!(res.is_ok(), "receive pool sized for every frame");
        }

        // num_send_frames <= MAX_SEND_FRAMES was checked by `geometry`
        let send_ring =
            SendRing::new(FrameArena::allocate(num_send_frames, send_frame_size).into_frames());

        Self {
            geometry,
            pending_recv,
            send_ring,
            next_send: AtomicUsize::new(0),
            socket,
            _net: net,
        }
    }

    /// Receives one datagram, waiting at most `timeout` in total.
    ///
    /// Returns `Ok(None)` if no receive frame became free, or no datagram arrived,
    /// before the timeout. Datagrams longer than [`frame_size_recv`](Self::frame_size_recv)
    /// are truncated, and empty datagrams are discarded.
    pub fn get_recv_buff(&self, timeout: Duration) -> Result<Option<RecvBuff<'_>>> {
        let deadline = Deadline::after(timeout);

        let Some(mut frame) = self.pending_recv.pop_until(deadline.instant()) else {
            log::trace!("no free receive frame");
            return Ok(None);
        };

        match self.recv_into(&mut frame, &deadline) {
            Ok(Some(len)) => Ok(Some(RecvBuff::acquire(frame, len, &self.pending_recv))),
            res => {
                let pushed = self.pending_recv.push_assume_capacity(frame);
                debug_assert!(pushed.is_ok(), "receive frame returned twice");
                res.map(|_| None)
            }
        }
    }

    fn recv_into(&self, frame: &mut [u8], deadline: &Deadline) -> Result<Option<usize>> {
        if let Some(len) = self.try_recv(frame)? {
            log::trace!("received {len} bytes (fast path)");
            return Ok(Some(len));
        }

        let readable = self
            .socket
            .wait_readable(deadline.remaining())
            .map_err(|e| Error::os("poll", e))?;

        if !readable {
            return Ok(None);
        }

        let len = self.try_recv(frame)?;

        if let Some(len) = len {
            log::trace!("received {len} bytes (after wait)");
        }

        Ok(len)
    }

    #[inline]
    fn try_recv(&self, frame: &mut [u8]) -> Result<Option<usize>> {
        match self.socket.try_recv(frame) {
            Ok(0) => Ok(None),
            Ok(len) => Ok(Some(len)),
            Err(e) if io_err_is_transient(e.kind()) => Ok(None),
            Err(e) => Err(Error::os("recv", e)),
        }
    }

    /// Returns the next frame of the send ring, waiting at most `timeout` in total for
    /// the datagram last committed from it to be handed to the kernel.
    ///
    /// Returns `Ok(None)` on timeout, in which case the ring does not advance: the next
    /// call tries the same frame again.
    ///
    /// The frame at the cursor holds the oldest datagram of the ring, so retrying it
    /// never lets a newer datagram overtake an older one.
    pub fn get_send_buff(&self, timeout: Duration) -> Result<Option<SendBuff<'_, S>>> {
        let deadline = Deadline::after(timeout);
        let index = self.next_send.load(Ordering::Relaxed);

        // still locked if an earlier handle for this frame hasn't been committed yet
        let Some(mut slot) = self.send_ring.slot(index).try_lock_until(deadline.instant()) else {
            log::trace!("send frame {index} still checked out");
            return Ok(None);
        };

        if !slot
            .acquire(&self.socket, deadline.remaining())
            .map_err(|e| Error::os("send", e))?
        {
            log::trace!("send frame {index} still in flight");
            return Ok(None);
        }

        self.next_send
            .store((index + 1) % self.send_ring.len(), Ordering::Relaxed);

        Ok(Some(SendBuff::new(slot, &self.send_ring, &self.socket, index)))
    }

    /// Pushes the datagrams still waiting for the kernel, oldest first, waiting at most
    /// `timeout` in total for the socket to take them.
    ///
    /// Returns `Ok(true)` once every committed datagram has been handed to the kernel,
    /// `Ok(false)` if some are still waiting when the timeout expires. With a zero
    /// timeout, this never blocks.
    ///
    /// A hard OS error drops the datagram it hit and is returned, the ones after it are
    /// still pending.
    pub fn flush(&self, timeout: Duration) -> Result<bool> {
        let deadline = Deadline::after(timeout);

        loop {
            let flushed = self
                .send_ring
                .flush(self.next_send_index(), self.send_ring.len(), &self.socket);

            if let Some(e) = flushed.error {
                return Err(Error::os("send", e));
            }

            if flushed.clear {
                return Ok(true);
            }

            if deadline.is_expired()
                || !self
                    .socket
                    .wait_writable(deadline.remaining())
                    .map_err(|e| Error::os("poll", e))?
            {
                log::trace!("send ring not flushed before the timeout");
                return Ok(false);
            }
        }
    }

    #[inline(always)]
    pub fn frame_count_recv(&self) -> usize {
        self.geometry.num_recv_frames.get()
    }

    #[inline(always)]
    pub fn frame_size_recv(&self) -> usize {
        self.geometry.recv_frame_size.get()
    }

    #[inline(always)]
    pub fn frame_count_send(&self) -> usize {
        self.geometry.num_send_frames.get()
    }

    #[inline(always)]
    pub fn frame_size_send(&self) -> usize {
        self.geometry.send_frame_size.get()
    }

    /// The number of receive frames currently free, i.e. not lent out.
    #[inline]
    pub fn recv_frames_available(&self) -> usize {
        self.pending_recv.len()
    }

    /// Position, in the send ring, of the frame the next `get_send_buff` call will try.
    #[inline]
    pub fn next_send_index(&self) -> usize {
        self.next_send.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn socket(&self) -> &S {
        &self.socket
    }
}

impl<S> core::fmt::Debug for UdpZeroCopy<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UdpZeroCopy")
            .field("geometry", &self.geometry)
            .field("recv_frames_available", &self.pending_recv.len())
            .field("next_send", &self.next_send.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Resolves `host:port`, preferring IPv4.
fn resolve(host: &str, port: &str) -> Result<SocketAddr> {
    let err = |source| Error::Resolve {
        host: host.to_owned(),
        port: port.to_owned(),
        source,
    };

    let port_num = port
        .trim()
        .parse::<u16>()
        .map_err(|e| err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    let addrs: Vec<_> = (host, port_num).to_socket_addrs().map_err(err)?.collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or(addrs.first())
        .copied()
        .ok_or_else(|| err(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_SEND_FRAMES;

    #[test]
    fn numeric_hosts_resolve_without_dns() {
        let addr = resolve("127.0.0.1", "49152").unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 49152)));
    }

    #[test]
    fn service_names_are_not_ports() {
        let err = resolve("127.0.0.1", "http").unwrap_err();
        assert!(matches!(err, Error::Resolve { .. }), "{err}");
        assert!(err.is_config());
        assert!(err.to_string().starts_with("failed to resolve 127.0.0.1:http"));
    }

    #[test]
    fn validation_precedes_resolution() {
        let config = TransportConfig::new().with_num_send_frames(MAX_SEND_FRAMES + 1);
        let err = UdpZeroCopy::connect("host.invalid", "49152", &config).unwrap_err();
        assert!(err.is_config(), "{err}");
    }
}
