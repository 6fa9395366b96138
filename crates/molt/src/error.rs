//! Error types for listener inheritance and handoff.

use std::os::fd::RawFd;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by inheritance, the control channel and the lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// A `LISTEN_*` activation variable is malformed.
    ///
    /// Fatal to startup: a half-understood activation environment means the
    /// parent and child disagree about which fds are live sockets.
    #[error("bad environment variable {var}: {reason}")]
    BadEnvironment {
        /// The offending variable name.
        var: &'static str,
        /// What was wrong with its value.
        reason: String,
    },

    /// An inherited file descriptor is not a listening TCP stream socket
    /// (nor the trailing Unix stream socket used as the control channel).
    #[error("inherited fd {fd} is not a TCP stream socket")]
    BadFd {
        /// The inherited descriptor number.
        fd: RawFd,
    },

    /// A listener could not be resolved or bound.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        /// The address as the caller wrote it.
        addr: String,
        /// The underlying resolution or bind error.
        #[source]
        source: std::io::Error,
    },

    /// A control-channel frame failed validation (wrong magic or an
    /// implausible length). The stream is abandoned after this.
    #[error("control channel frame is invalid")]
    BadFrame,

    /// A control-channel read or write missed its deadline.
    ///
    /// Kept distinct from generic I/O failure: the child uses "parent failed
    /// to confirm shutdown by the deadline" specifically as the trigger to
    /// SIGKILL a hung parent.
    #[error("control channel operation timed out")]
    Timeout,

    /// A handoff message could not be encoded or decoded.
    #[error("bad handoff message: {0}")]
    Message(#[from] serde_json::Error),

    /// Sentinel returned by an embedded server whose `serve` ended because
    /// `shutdown` was requested. Swallowed by the lifecycle; every other
    /// serve error is reported.
    #[error("server closed")]
    ServerClosed,

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is the dedicated deadline-expiry category.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
