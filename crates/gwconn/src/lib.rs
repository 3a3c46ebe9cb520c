//! Buffered, non-blocking connections for the WAP/SMS gateway.
//!
//! A [`Connection`] wraps one fd with two independent half-duplex
//! locks, optional write buffering, framed non-blocking reads, and
//! optional registration with a [`Multiplexer`] for callback-driven
//! I/O. It builds on [`gwcore::ByteBuffer`] the same way `gwtimer`
//! builds on [`gwcore::EventQueue`].

mod connection;
mod errno;
mod error;
mod multiplexer;
mod raw_io;

pub use connection::Connection;
pub use error::{ConnError, FlushOutcome, RegisterOutcome, WaitOutcome, WriteOutcome};
pub use multiplexer::{Callback, Multiplexer, Readiness, Registration};
