//! A timer set for the WAP/SMS gateway: a min-heap of pending timers
//! served by a single dedicated worker thread, which delivers expiry
//! events onto a [`gwcore::EventQueue`].
//!
//! The public surface is two types: [`TimerSet`] owns the worker thread
//! and the shared heap; [`Timer`] is a handle into it. Both manage their
//! own lifetimes via `Drop` — there is no explicit `destroy` call.

mod heap;
mod set;
mod state;
mod worker;

pub use set::{Timer, TimerSet};
