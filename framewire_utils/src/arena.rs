//! Fixed-size frame arenas.
//!
//! A [`FrameArena`] is one contiguous, zero-initialized allocation divided into
//! `frame_count` non-overlapping frames of `frame_size` bytes each. Frames are
//! addressable by index while the arena is intact, and can be split off into
//! independently owned [`Frame`]s with [`FrameArena::into_frames`].
//!
//! Splitting does not copy or reallocate: every [`Frame`] is a unique view into the
//! original allocation, which stays alive until the last frame is dropped.

use core::{num, ops};

use bytes::BytesMut;

/// One fixed-size region of a [`FrameArena`].
///
/// A frame's length never changes. Its contents are owned exclusively by whoever
/// holds the `Frame`, so moving a `Frame` is how ownership of the memory is
/// transferred between a pool and its users.
#[derive(Debug)]
pub struct Frame {
    index: usize,
    mem: BytesMut,
}

impl Frame {
    /// The position of this frame within the arena it was carved from.
    #[inline(always)]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The frame size, in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.mem.len()
    }

    /// Always `false` for frames obtained from an arena, frames are never empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }
}

impl ops::Deref for Frame {
    type Target = [u8];

    #[inline(always)]
    fn deref(&self) -> &[u8] {
        &self.mem
    }
}

impl ops::DerefMut for Frame {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.mem
    }
}

/// A contiguous region of memory pre-divided into fixed-size frames.
#[derive(Debug)]
pub struct FrameArena {
    frames: Vec<Frame>,
    frame_size: num::NonZeroUsize,
}

impl FrameArena {
    /// Allocates `frame_count * frame_size` zeroed bytes, in one allocation.
    ///
    /// # Panics
    ///
    /// If the total size overflows `usize`.
    pub fn allocate(frame_count: num::NonZeroUsize, frame_size: num::NonZeroUsize) -> Self {
        let total = frame_count
            .checked_mul(frame_size)
            .expect("frame arena size overflows usize");

        let mut region = BytesMut::zeroed(total.get());

        let frames = (0..frame_count.get())
            .map(|index| Frame {
                index,
                mem: region.split_to(frame_size.get()),
            })
            .collect();

        debug_assert!(region.is_empty());

        Self { frames, frame_size }
    }

    /// The number of frames in this arena.
    #[inline(always)]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The size of every frame in this arena, in bytes.
    #[inline(always)]
    pub const fn frame_size(&self) -> num::NonZeroUsize {
        self.frame_size
    }

    /// Returns the mutable byte region of the frame at `index`.
    ///
    /// # Panics
    ///
    /// If `index >= self.frame_count()`.
    #[inline(always)]
    pub fn frame_at(&mut self, index: usize) -> &mut [u8] {
        &mut self.frames[index]
    }

    /// Splits the arena into its frames, in index order.
    ///
    /// The underlying allocation is freed once every frame has been dropped.
    #[inline]
    pub fn into_frames(self) -> impl ExactSizeIterator<Item = Frame> {
        self.frames.into_iter()
    }
}
