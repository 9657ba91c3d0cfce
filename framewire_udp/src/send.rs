//! Managed send buffers.
//!
//! The transport owns a fixed ring of `SendSlot`s, each holding one send frame.
//! A slot cycles through three phases:
//!
//! ```text
//!   acquire ──► lent out (SendBuff) ──► commit(len) ──► Signaled ──► acquire ...
//!                                            │
//!                                            └────────► Pending ──(kernel takes it)──► Signaled
//! ```
//!
//! A datagram is handed to the kernel without blocking. If the kernel can't take it
//! right away, the slot keeps a `Completion::Pending` token and the frame stays
//! untouchable until the datagram is pushed out. A frame is therefore never overwritten
//! while the kernel may still need its contents.
//!
//! Datagrams leave in commit order. Every commit first retries the pending datagrams
//! of older slots, oldest first, and a datagram committed while an older one is still
//! pending is queued behind it instead of being sent.

use core::{ops, time::Duration};
use std::io;

use arrayvec::ArrayVec;
use framewire_utils::Frame;
use parking_lot::{Mutex, MutexGuard};

use crate::{DatagramSocket, Error, MAX_SEND_FRAMES, Result, UdpSocket, io_err_is_transient};

/// Completion state of the last datagram committed from a send slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The kernel has the datagram (or there was none), the frame is free.
    Signaled,
    /// The first `len` bytes of the frame still have to be handed to the kernel.
    Pending { len: usize },
}

impl Completion {
    /// Makes one non-blocking attempt at sending `datagram`.
    pub(crate) fn issue(socket: &impl DatagramSocket, datagram: &[u8]) -> io::Result<Self> {
        match socket.try_send(datagram) {
            Ok(sent) => {
                if sent != datagram.len() {
                    log::warn!("datagram truncated on send: {sent} of {} bytes", datagram.len());
                }
                Ok(Self::Signaled)
            }
            Err(e) if io_err_is_transient(e.kind()) => Ok(Self::Pending {
                len: datagram.len(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Waits at most `timeout` for the socket to accept `datagram`.
    pub(crate) fn wait(
        socket: &impl DatagramSocket,
        datagram: &[u8],
        timeout: Duration,
    ) -> io::Result<Self> {
        let pending = Self::issue(socket, datagram)?;

        if pending == Self::Signaled || !socket.wait_writable(timeout)? {
            return Ok(pending);
        }

        Self::issue(socket, datagram)
    }

    #[inline(always)]
    pub(crate) const fn is_signaled(&self) -> bool {
        matches!(self, Self::Signaled)
    }
}

/// One frame of the send ring, with its completion state machine.
#[derive(Debug)]
pub(crate) struct SendSlot {
    frame: Frame,
    // set by `commit`, cleared by a successful `acquire`
    committed: bool,
    completion: Completion,
}

impl SendSlot {
    /// Wraps `frame` in a slot that is ready to be acquired.
    pub(crate) fn primed(frame: Frame) -> Self {
        let mut slot = Self {
            frame,
            committed: false,
            completion: Completion::Signaled,
        };

        slot.prime();
        slot
    }

    #[inline(always)]
    pub(crate) fn frame(&self) -> &Frame {
        &self.frame
    }

    #[inline(always)]
    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        &mut self.frame
    }

    #[cfg(test)]
    pub(crate) const fn completion(&self) -> Completion {
        self.completion
    }

    #[cfg(test)]
    pub(crate) const fn is_committed(&self) -> bool {
        self.committed
    }

    /// Commits an empty datagram: the slot becomes ready again, nothing is sent.
    #[inline]
    pub(crate) fn prime(&mut self) {
        if !self.committed {
            self.committed = true;
            self.completion = Completion::Signaled;
        }
    }

    /// Commits the first `len` bytes of the frame. At most once per acquire, later
    /// calls are ignored.
    ///
    /// If `queued` is set, an older datagram is still pending: this one is only marked
    /// pending, to be sent after it. Otherwise it is sent right away, if the kernel
    /// takes it. On a hard send error, the datagram is dropped and the slot is left
    /// ready.
    pub(crate) fn commit(
        &mut self,
        socket: &impl DatagramSocket,
        len: usize,
        queued: bool,
    ) -> io::Result<()> {
        if self.committed {
            return Ok(());
        }

        if len == 0 {
            self.prime();
            return Ok(());
        }

        debug_assert!(len <= self.frame.len());

        self.committed = true;

        if queued {
            log::trace!("send frame {}: {len} bytes queued", self.frame.index());
            self.completion = Completion::Pending { len };
            return Ok(());
        }

        match Completion::issue(socket, &self.frame[..len]) {
            Ok(completion) => {
                if !completion.is_signaled() {
                    log::trace!("send frame {}: {len} bytes in flight", self.frame.index());
                }
                self.completion = completion;
                Ok(())
            }
            Err(e) => {
                self.completion = Completion::Signaled;
                Err(e)
            }
        }
    }

    /// Makes one non-blocking attempt at sending the pending datagram, if any.
    ///
    /// Returns `Ok(true)` once nothing is pending. On a hard send error, the datagram
    /// is dropped.
    pub(crate) fn try_complete(&mut self, socket: &impl DatagramSocket) -> io::Result<bool> {
        let Completion::Pending { len } = self.completion else {
            return Ok(true);
        };

        match Completion::issue(socket, &self.frame[..len]) {
            Ok(completion) => {
                self.completion = completion;
                Ok(completion.is_signaled())
            }
            Err(e) => {
                self.completion = Completion::Signaled;
                Err(e)
            }
        }
    }

    /// Waits at most `timeout` for the previous datagram to be handed to the kernel,
    /// and re-arms the slot.
    ///
    /// Returns `Ok(false)` if the datagram is still in flight when the timeout expires,
    /// in which case the slot is untouched. On a hard send error, the datagram is
    /// dropped, the slot is left ready for the next acquire, and the error is returned.
    pub(crate) fn acquire(
        &mut self,
        socket: &impl DatagramSocket,
        timeout: Duration,
    ) -> io::Result<bool> {
        debug_assert!(self.committed, "send slot acquired twice without a commit");

        if let Completion::Pending { len } = self.completion {
            match Completion::wait(socket, &self.frame[..len], timeout) {
                Ok(Completion::Signaled) => {
                    log::trace!("send frame {}: {len} bytes completed", self.frame.index());
                }
                Ok(_) => return Ok(false),
                Err(e) => {
                    self.completion = Completion::Signaled;
                    return Err(e);
                }
            }
        }

        self.completion = Completion::Signaled;
        self.committed = false;
        Ok(true)
    }
}

/// Outcome of a pass over the pending datagrams of the ring.
#[derive(Debug)]
pub(crate) struct Flushed {
    /// Nothing older is left pending.
    pub clear: bool,
    /// The first hard error met. Its datagram was dropped.
    pub error: Option<io::Error>,
}

/// The send ring. Slot `i` is reused every `len()` commits.
#[derive(Debug)]
pub(crate) struct SendRing {
    slots: ArrayVec<Mutex<SendSlot>, MAX_SEND_FRAMES>,
}

impl SendRing {
    /// # Panics
    ///
    /// If `frames` yields more than [`MAX_SEND_FRAMES`] frames.
    pub(crate) fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            slots: frames
                .into_iter()
                .map(|frame| Mutex::new(SendSlot::primed(frame)))
                .collect(),
        }
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub(crate) fn slot(&self, index: usize) -> &Mutex<SendSlot> {
        &self.slots[index]
    }

    /// Retries the pending datagrams of `count` slots, in ring order starting at
    /// `oldest`, without blocking.
    ///
    /// Stops trying at the first datagram the kernel still refuses, so that none
    /// overtakes it. Slots currently lent out have nothing pending and are skipped.
    pub(crate) fn flush(
        &self,
        oldest: usize,
        count: usize,
        socket: &impl DatagramSocket,
    ) -> Flushed {
        let mut error = None;

        for i in (oldest..oldest + count).map(|i| i % self.len()) {
            let Some(mut slot) = self.slots[i].try_lock() else {
                continue;
            };

            match slot.try_complete(socket) {
                Ok(true) => {}
                Ok(false) => return Flushed { clear: false, error },
                Err(e) => {
                    log::debug!("send frame {i}: pending datagram dropped: {e}");
                    error.get_or_insert(e);
                }
            }
        }

        Flushed { clear: true, error }
    }
}

/// A send frame, lent out by the transport until it is committed.
///
/// Derefs (mutably) to the whole frame. Write the datagram at the start of it, then
/// [`commit`](Self::commit) the number of bytes written.
///
/// The transport's next call to `get_send_buff` on this slot blocks until the handle
/// is gone, so commit (or drop) it promptly.
///
/// # Misuse
///
/// - Dropping the handle without committing is the same as committing `0` bytes: the
///   slot becomes ready again and nothing is sent.
/// - Committing more bytes than the frame holds commits the whole frame.
/// - Committing twice is impossible: [`commit`](Self::commit) consumes the handle.
pub struct SendBuff<'a, S: DatagramSocket = UdpSocket> {
    slot: MutexGuard<'a, SendSlot>,
    ring: &'a SendRing,
    socket: &'a S,
    index: usize,
}

impl<'a, S: DatagramSocket> SendBuff<'a, S> {
    #[inline(always)]
    pub(crate) fn new(
        slot: MutexGuard<'a, SendSlot>,
        ring: &'a SendRing,
        socket: &'a S,
        index: usize,
    ) -> Self {
        Self {
            slot,
            ring,
            socket,
            index,
        }
    }

    /// Position of this frame in the send ring.
    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The largest datagram this frame can hold.
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slot.frame().len()
    }

    /// Sends the first `len` bytes of the frame, without waiting for completion.
    ///
    /// Pending datagrams committed earlier are retried first. If one of them still
    /// can't be sent, this datagram is queued behind it and goes out with it, on a
    /// later commit, `get_send_buff` or [`flush`](crate::UdpZeroCopy::flush).
    ///
    /// `len == 0` sends nothing and only returns the slot to the ring.
    ///
    /// A hard OS error is returned here, whether it hit this datagram or an earlier
    /// one. The datagram it hit is dropped, and its slot still returns to the ring.
    pub fn commit(mut self, len: usize) -> Result<()> {
        if len == 0 {
            self.slot.prime();
            return Ok(());
        }

        let capacity = self.capacity();

        let len = if len > capacity {
            log::warn!("commit of {len} bytes clamped to the {capacity} byte send frame");
            capacity
        } else {
            len
        };

        let older = self
            .ring
            .flush(self.index + 1, self.ring.len() - 1, self.socket);

        let res = self.slot.commit(self.socket, len, !older.clear);

        match (res, older.error) {
            (Err(e), _) | (Ok(()), Some(e)) => Err(Error::os("send", e)),
            (Ok(()), None) => Ok(()),
        }
    }
}

impl<S: DatagramSocket> ops::Deref for SendBuff<'_, S> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        self.slot.frame()
    }
}

impl<S: DatagramSocket> ops::DerefMut for SendBuff<'_, S> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.slot.frame_mut()
    }
}

impl<S: DatagramSocket> Drop for SendBuff<'_, S> {
    #[inline]
    fn drop(&mut self) {
        self.slot.prime();
    }
}

impl<S: DatagramSocket> core::fmt::Debug for SendBuff<'_, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SendBuff")
            .field("index", &self.index)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::{cell::RefCell, num::NonZeroUsize};
    use framewire_utils::FrameArena;
    use std::collections::VecDeque;

    /// Replays scripted send outcomes, then accepts everything.
    #[derive(Default)]
    struct Script {
        sends: RefCell<VecDeque<io::ErrorKind>>,
        sent: RefCell<Vec<Vec<u8>>>,
        writable: bool,
    }

    impl Script {
        fn failing(kinds: impl IntoIterator<Item = io::ErrorKind>) -> Self {
            Self {
                sends: RefCell::new(kinds.into_iter().collect()),
                ..Default::default()
            }
        }
    }

    impl DatagramSocket for Script {
        fn try_recv(&self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }

        fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
            match self.sends.borrow_mut().pop_front() {
                Some(kind) => Err(kind.into()),
                None => {
                    self.sent.borrow_mut().push(buf.to_vec());
                    Ok(buf.len())
                }
            }
        }

        fn wait_readable(&self, _: Duration) -> io::Result<bool> {
            Ok(false)
        }

        fn wait_writable(&self, _: Duration) -> io::Result<bool> {
            Ok(self.writable)
        }
    }

    fn frames(n: usize, size: usize) -> impl Iterator<Item = Frame> {
        FrameArena::allocate(NonZeroUsize::new(n).unwrap(), NonZeroUsize::new(size).unwrap())
            .into_frames()
    }

    fn slot(size: usize) -> SendSlot {
        SendSlot::primed(frames(1, size).next().unwrap())
    }

    #[test]
    fn primed_slots_are_ready() {
        let socket = Script::default();
        let mut slot = slot(8);

        assert!(slot.is_committed());
        assert_eq!(slot.completion(), Completion::Signaled);
        assert!(slot.acquire(&socket, Duration::ZERO).unwrap());
        assert!(!slot.is_committed());
        assert!(socket.sent.borrow().is_empty());
    }

    #[test]
    fn commit_sends_the_prefix_once() {
        let socket = Script::default();
        let mut slot = slot(8);
        slot.acquire(&socket, Duration::ZERO).unwrap();

        slot.frame_mut()[..3].copy_from_slice(b"abc");
        slot.commit(&socket, 3, false).unwrap();
        slot.commit(&socket, 8, false).unwrap();

        assert_eq!(*socket.sent.borrow(), [b"abc".to_vec()]);
    }

    #[test]
    fn queued_commits_wait_for_a_retry() {
        let socket = Script::default();
        let mut slot = slot(4);
        slot.acquire(&socket, Duration::ZERO).unwrap();

        slot.frame_mut().copy_from_slice(b"late");
        slot.commit(&socket, 4, true).unwrap();

        assert_eq!(slot.completion(), Completion::Pending { len: 4 });
        assert!(socket.sent.borrow().is_empty());

        assert!(slot.try_complete(&socket).unwrap());
        assert_eq!(*socket.sent.borrow(), [b"late".to_vec()]);
        assert!(slot.try_complete(&socket).unwrap());
        assert_eq!(socket.sent.borrow().len(), 1);
    }

    #[test]
    fn would_block_keeps_the_datagram_in_flight() {
        let socket = Script::failing([io::ErrorKind::WouldBlock, io::ErrorKind::WouldBlock]);
        let mut slot = slot(4);
        slot.acquire(&socket, Duration::ZERO).unwrap();

        slot.frame_mut().copy_from_slice(b"wxyz");
        slot.commit(&socket, 4, false).unwrap();
        assert_eq!(slot.completion(), Completion::Pending { len: 4 });

        // still blocked, and the socket never becomes writable
        assert!(!slot.acquire(&socket, Duration::ZERO).unwrap());
        assert_eq!(slot.completion(), Completion::Pending { len: 4 });
        assert!(slot.is_committed());

        // the kernel takes it now
        assert!(slot.acquire(&socket, Duration::ZERO).unwrap());
        assert_eq!(*socket.sent.borrow(), [b"wxyz".to_vec()]);
    }

    #[test]
    fn writability_triggers_a_retry() {
        let mut socket = Script::failing([io::ErrorKind::WouldBlock, io::ErrorKind::WouldBlock]);
        socket.writable = true;

        let mut slot = slot(2);
        slot.acquire(&socket, Duration::ZERO).unwrap();
        slot.commit(&socket, 2, false).unwrap();

        // one failed attempt, a readiness wait, then success
        assert!(slot.acquire(&socket, Duration::from_millis(10)).unwrap());
        assert_eq!(socket.sent.borrow().len(), 1);
    }

    #[test]
    fn hard_errors_leave_the_slot_ready() {
        let socket = Script::failing([io::ErrorKind::ConnectionRefused]);
        let mut slot = slot(2);
        slot.acquire(&socket, Duration::ZERO).unwrap();

        let err = slot.commit(&socket, 2, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(slot.completion(), Completion::Signaled);

        assert!(slot.acquire(&socket, Duration::ZERO).unwrap());
    }

    #[test]
    fn hard_errors_while_in_flight_are_reported_by_acquire() {
        let socket = Script::failing([io::ErrorKind::WouldBlock, io::ErrorKind::ConnectionRefused]);
        let mut slot = slot(2);
        slot.acquire(&socket, Duration::ZERO).unwrap();
        slot.commit(&socket, 2, false).unwrap();

        assert!(slot.acquire(&socket, Duration::ZERO).is_err());
        assert!(slot.acquire(&socket, Duration::ZERO).unwrap());
        assert!(socket.sent.borrow().is_empty());
    }

    #[test]
    fn ring_flush_stops_at_the_first_refusal() {
        let socket = Script::default();
        let ring = SendRing::new(frames(3, 1));

        for (i, byte) in [b'a', b'b', b'c'].into_iter().enumerate() {
            let mut slot = ring.slot(i).lock();
            slot.acquire(&socket, Duration::ZERO).unwrap();
            slot.frame_mut()[0] = byte;
            slot.commit(&socket, 1, true).unwrap();
        }

        socket.sends.borrow_mut().extend([io::ErrorKind::WouldBlock]);

        // starting from slot 1: "b" is refused, "c" and "a" must not overtake it
        let flushed = ring.flush(1, 3, &socket);
        assert!(!flushed.clear);
        assert!(flushed.error.is_none());
        assert!(socket.sent.borrow().is_empty());

        let flushed = ring.flush(1, 3, &socket);
        assert!(flushed.clear);
        assert_eq!(*socket.sent.borrow(), [b"b".to_vec(), b"c".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn ring_flush_drops_failed_datagrams_and_keeps_going() {
        let socket = Script::default();
        let ring = SendRing::new(frames(2, 1));

        for i in 0..2 {
            let mut slot = ring.slot(i).lock();
            slot.acquire(&socket, Duration::ZERO).unwrap();
            slot.commit(&socket, 1, true).unwrap();
        }

        socket.sends.borrow_mut().extend([io::ErrorKind::ConnectionRefused]);

        let flushed = ring.flush(0, 2, &socket);
        assert!(flushed.clear);
        assert_eq!(flushed.error.unwrap().kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(socket.sent.borrow().len(), 1);
    }
}
