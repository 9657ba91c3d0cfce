//! Managed receive buffers.
//!
//! Idle receive frames wait in the transport's handoff queue. When a datagram is read
//! into one, the frame moves into a [`RecvBuff`] handed to the caller; releasing the
//! handle (explicitly, or by dropping it) moves the frame back into the queue. A frame
//! is therefore always in exactly one place: the queue, or one live handle.

use core::ops;

use framewire_utils::{Frame, HandoffQueue};

pub(crate) type PendingRecvFrames = HandoffQueue<Frame>;

/// A received datagram, held in one of the transport's receive frames.
///
/// Derefs to the datagram's bytes. The frame returns to the pool when the handle is
/// [released](Self::release) or dropped.
///
/// # Misuse
///
/// - Releasing twice is harmless: only the first call has any effect.
/// - Leaking the handle (e.g. with [`core::mem::forget`]) removes its frame from
///   circulation for the lifetime of the transport.
#[derive(Debug)]
pub struct RecvBuff<'a> {
    frame: Option<Frame>,
    // number of valid bytes in `frame`, 0 once released
    len: usize,
    pending: &'a PendingRecvFrames,
}

impl<'a> RecvBuff<'a> {
    /// Marks `frame` as holding `len` bytes of valid data and wraps it in a handle.
    #[inline(always)]
    pub(crate) fn acquire(frame: Frame, len: usize, pending: &'a PendingRecvFrames) -> Self {
        debug_assert!(len > 0 && len <= frame.len());

        Self {
            frame: Some(frame),
            len,
            pending,
        }
    }

    /// Number of valid bytes, `0` once released.
    #[inline(always)]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` once released.
    #[inline(always)]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Index of the underlying receive frame, `None` once released.
    #[inline]
    pub fn frame_index(&self) -> Option<usize> {
        self.frame.as_ref().map(Frame::index)
    }

    /// Returns the frame to the transport's pool.
    ///
    /// After this, the handle derefs to an empty slice. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.len == 0 {
            return;
        }

        self.len = 0;

        if let Some(frame) = self.frame.take() {
            // the queue holds every receive frame, it can't be full while we own one
            let res = self.pending.push_assume_capacity(frame);
            debug_assert!(res.is_ok(), "receive frame released into a full pool");
        }
    }
}

impl ops::Deref for RecvBuff<'_> {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        match &self.frame {
            Some(frame) => &frame[..self.len],
            None => &[],
        }
    }
}

impl AsRef<[u8]> for RecvBuff<'_> {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for RecvBuff<'_> {
    #[inline]
    fn drop(&mut self) {
        self.release();
    }
}
