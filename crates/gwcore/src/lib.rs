//! # gwcore
//!
//! Shared, platform-agnostic primitives used by the gateway's timer and
//! connection subsystems: an appendable byte buffer and a thread-safe
//! event queue.
//!
//! This crate is the leaf of the dependency graph — `gwtimer` and
//! `gwconn` both build on it, but it depends on neither.

pub mod buffer;
pub mod queue;

pub use buffer::ByteBuffer;
pub use queue::EventQueue;
