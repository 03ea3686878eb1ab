//! Example aggregates built on the `Chronicle` event sourcing core.
//!
//! The [`user`] module walks the whole boundary: typed commands that claim
//! unique keys, a write model folding current state for precondition checks,
//! command handlers with bounded retry, and a projection keeping a read table
//! current.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// These are examples, so a few pedantic lints are not worth their noise
#![allow(clippy::missing_const_for_fn)]

pub mod user;
