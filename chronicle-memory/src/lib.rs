//! In-memory adapter for the `Chronicle` event sourcing core
//!
//! This crate implements the `EventStorage` and `ProjectionStorage` ports
//! against plain process memory, useful for tests and development scenarios
//! where persistence is not required. Both stores are thread-safe and cheap
//! to clone; clones share the underlying state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod event_store;
mod projection_store;

pub use event_store::InMemoryEventStore;
pub use projection_store::{InMemoryProjectionStore, Row};
