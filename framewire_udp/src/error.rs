//! Error types for transport construction and steady-state I/O.
//!
//! Timeouts are never errors: every operation that waits reports an expired wait as
//! `Ok(None)`. What ends up here is either a configuration problem, detected before
//! any socket is opened, or an OS-level failure, which always carries the name of the
//! failing call and the OS error code.

use std::io;

use thiserror::Error;

/// A construction-time configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// More send frames were requested than the platform can wait on at once.
    #[error("num_send_frames ({requested}) exceeds the platform limit of {max} waitable completions")]
    TooManySendFrames { requested: usize, max: usize },
    /// A frame size or frame count was zero.
    #[error("{which} must be non-zero")]
    Zero { which: &'static str },
    /// `count * size` does not fit in the address space.
    #[error("{which} frame arena ({count} x {size} bytes) is too large")]
    ArenaTooLarge {
        which: &'static str,
        count: usize,
        size: usize,
    },
    /// A device hint could not be parsed as a number.
    #[error("invalid value {value:?} for hint `{key}`")]
    InvalidHint { key: String, value: String },
}

/// Errors reported by the transport.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The peer address could not be resolved, or resolved to nothing.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: String,
        #[source]
        source: io::Error,
    },
    /// An OS socket call failed.
    #[error("{call}() failed with error {}: {source}", os_code(.source))]
    Os {
        call: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    #[inline(always)]
    pub(crate) fn os(call: &'static str, source: io::Error) -> Self {
        Self::Os { call, source }
    }

    /// Returns the OS error code carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Os { source, .. } | Self::Resolve { source, .. } => source.raw_os_error(),
            Self::Config(_) => None,
        }
    }

    /// Returns `true` for errors caused by the transport's inputs rather than by the OS:
    /// an invalid configuration, or a peer address that doesn't resolve.
    #[inline(always)]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Resolve { .. })
    }
}

fn os_code(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(-1)
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
