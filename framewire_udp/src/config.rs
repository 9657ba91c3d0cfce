//! Transport configuration.
//!
//! [`TransportConfig`] describes the frame geometry of both buffer pools and the
//! optional kernel socket buffer sizes. It can be built with the `with_*` setters,
//! or parsed from the string hints a device address carries with
//! [`TransportConfig::from_hints`].

use core::num;

use crate::{ConfigError, nz};

/// Payload bytes that fit in a standard Ethernet frame: 1500 bytes of MTU, minus the
/// IPv4 header (20) and the UDP header (8).
pub const DEFAULT_MTU: num::NonZeroUsize = nz(1500 - 20 - 8);

/// A reasonable number of frames for both the send and the receive pool.
pub const DEFAULT_NUM_FRAMES: num::NonZeroUsize = nz(32);

/// The maximum number of send frames, i.e. of send completions that can be
/// outstanding, and waited on, at the same time.
///
/// This is a hard ceiling taken from the most restrictive supported platform
/// (Winsock can wait on at most 64 events at once), applied everywhere so that a
/// configuration valid on one platform is valid on all of them.
pub const MAX_SEND_FRAMES: usize = 64;

/// Construction-time configuration of a transport.
///
/// All fields are optional in the sense that [`Default`] provides a value for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    recv_frame_size: usize,
    num_recv_frames: usize,
    send_frame_size: usize,
    num_send_frames: usize,
    recv_buff_size: Option<num::NonZeroUsize>,
    send_buff_size: Option<num::NonZeroUsize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Validated pool geometry, as used to build the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub recv_frame_size: num::NonZeroUsize,
    pub num_recv_frames: num::NonZeroUsize,
    pub send_frame_size: num::NonZeroUsize,
    pub num_send_frames: num::NonZeroUsize,
}

impl TransportConfig {
    pub const fn new() -> Self {
        Self {
            recv_frame_size: DEFAULT_MTU.get(),
            num_recv_frames: DEFAULT_NUM_FRAMES.get(),
            send_frame_size: DEFAULT_MTU.get(),
            num_send_frames: DEFAULT_NUM_FRAMES.get(),
            recv_buff_size: None,
            send_buff_size: None,
        }
    }

    /// Bytes per receive frame. Datagrams larger than this are truncated.
    pub const fn with_recv_frame_size(mut self, size: usize) -> Self {
        self.recv_frame_size = size;
        self
    }

    /// Number of frames in the receive pool.
    pub const fn with_num_recv_frames(mut self, n: usize) -> Self {
        self.num_recv_frames = n;
        self
    }

    /// Bytes per send frame, i.e. the largest datagram that can be committed.
    pub const fn with_send_frame_size(mut self, size: usize) -> Self {
        self.send_frame_size = size;
        self
    }

    /// Number of frames in the send ring. At most [`MAX_SEND_FRAMES`].
    pub const fn with_num_send_frames(mut self, n: usize) -> Self {
        self.num_send_frames = n;
        self
    }

    /// Kernel receive buffer size to request. `0` keeps the OS default.
    pub const fn with_recv_buff_size(mut self, size: usize) -> Self {
        self.recv_buff_size = num::NonZeroUsize::new(size);
        self
    }

    /// Kernel send buffer size to request. `0` keeps the OS default.
    pub const fn with_send_buff_size(mut self, size: usize) -> Self {
        self.send_buff_size = num::NonZeroUsize::new(size);
        self
    }

    #[inline(always)]
    pub const fn recv_frame_size(&self) -> usize {
        self.recv_frame_size
    }

    #[inline(always)]
    pub const fn num_recv_frames(&self) -> usize {
        self.num_recv_frames
    }

    #[inline(always)]
    pub const fn send_frame_size(&self) -> usize {
        self.send_frame_size
    }

    #[inline(always)]
    pub const fn num_send_frames(&self) -> usize {
        self.num_send_frames
    }

    #[inline(always)]
    pub const fn recv_buff_size(&self) -> Option<num::NonZeroUsize> {
        self.recv_buff_size
    }

    #[inline(always)]
    pub const fn send_buff_size(&self) -> Option<num::NonZeroUsize> {
        self.send_buff_size
    }

    /// Checks this configuration without allocating or touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry().map(|_| ())
    }

    pub(crate) fn geometry(&self) -> Result<Geometry, ConfigError> {
        // The send ceiling is checked first: it is the one limit imposed by the platform.
        if self.num_send_frames > MAX_SEND_FRAMES {
            return Err(ConfigError::TooManySendFrames {
                requested: self.num_send_frames,
                max: MAX_SEND_FRAMES,
            });
        }

        let non_zero = |which, x| num::NonZeroUsize::new(x).ok_or(ConfigError::Zero { which });

        let geometry = Geometry {
            recv_frame_size: non_zero("recv_frame_size", self.recv_frame_size)?,
            num_recv_frames: non_zero("num_recv_frames", self.num_recv_frames)?,
            send_frame_size: non_zero("send_frame_size", self.send_frame_size)?,
            num_send_frames: non_zero("num_send_frames", self.num_send_frames)?,
        };

        let check_arena = |which, count: num::NonZeroUsize, size: num::NonZeroUsize| {
            count
                .checked_mul(size)
                .filter(|total| total.get() <= isize::MAX as usize)
                .map(|_| ())
                .ok_or(ConfigError::ArenaTooLarge {
                    which,
                    count: count.get(),
                    size: size.get(),
                })
        };

        check_arena("recv", geometry.num_recv_frames, geometry.recv_frame_size)?;
        check_arena("send", geometry.num_send_frames, geometry.send_frame_size)?;

        Ok(geometry)
    }

    /// Builds a configuration from `(key, value)` device hints, starting from the defaults.
    ///
    /// Recognized keys are `recv_frame_size`, `num_recv_frames`, `send_frame_size`,
    /// `num_send_frames`, `recv_buff_size` and `send_buff_size`. Other keys are ignored,
    /// so a full device address can be passed as is.
    ///
    /// Values are read as floating point numbers and truncated, so `"1e6"` and `"32.0"`
    /// are accepted. A socket buffer size of zero or less keeps the OS default. Zero
    /// frame sizes or counts are accepted here and rejected by [`validate`](Self::validate).
    pub fn from_hints<K, V>(hints: impl IntoIterator<Item = (K, V)>) -> Result<Self, ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();

        for (key, value) in hints {
            let (key, value) = (key.as_ref(), value.as_ref());

            let setter: fn(Self, usize) -> Self = match key {
                "recv_frame_size" => Self::with_recv_frame_size,
                "num_recv_frames" => Self::with_num_recv_frames,
                "send_frame_size" => Self::with_send_frame_size,
                "num_send_frames" => Self::with_num_send_frames,
                "recv_buff_size" => Self::with_recv_buff_size,
                "send_buff_size" => Self::with_send_buff_size,
                _ => continue,
            };

            let n = parse_hint(key, value)?;
            config = setter(config, n);
        }

        Ok(config)
    }
}

fn parse_hint(key: &str, value: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::InvalidHint {
        key: key.to_owned(),
        value: value.to_owned(),
    };

    let x = value.trim().parse::<f64>().map_err(|_| invalid())?;

    if !x.is_finite() {
        return Err(invalid());
    }

    // float-to-int `as` saturates, negative values become 0
    Ok(x as usize)
}
