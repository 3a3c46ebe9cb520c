//! Error and status types.
//!
//! Construction failures are the one place a connection failing to come
//! into being at all is a system-boundary failure, exactly where
//! idiomatic Rust reaches for `Result` over a bare option. Everything
//! else returns one of the small status enums below instead, because
//! none of those operations carry a propagatable failure distinct from
//! "fatal and already recorded on the connection" — the connection's
//! own sticky `read_error`/`eof` flags are the error channel for
//! steady-state I/O.

use std::io;

/// Failure constructing a [`crate::connection::Connection`].
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("connect timed out")]
    ConnectTimedOut,

    #[error("failed to set socket non-blocking: {0}")]
    SetNonblocking(#[source] io::Error),
}

/// Outcome of [`crate::connection::Connection::write`]/`write_data`/
/// `write_with_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything, including any previously buffered bytes, was drained.
    Flushed,
    /// Some bytes remain buffered for a later drain attempt.
    Buffered,
    /// A fatal write error occurred; the connection's `read_error`-style
    /// sticky fault is now set for the output half.
    Error,
}

/// Outcome of [`crate::connection::Connection::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// `outbuf` is now fully drained.
    Done,
    /// The wait was woken without draining everything (spurious wake or
    /// interrupt); the caller should retry.
    Woken,
    /// A fatal write error occurred mid-flush.
    Error,
}

/// Outcome of [`crate::connection::Connection::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Some I/O progress was made (a write drained, or a read or
    /// callback dispatch occurred).
    Progress,
    /// The timeout elapsed with nothing to report.
    Timeout,
    /// A fatal error occurred while polling.
    Error,
}

/// Result of [`crate::connection::Connection::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// Already registered to a *different* multiplexer.
    AlreadyRegisteredElsewhere,
}
