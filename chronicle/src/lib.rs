//! `Chronicle` - multi-tenant event sourcing core
//!
//! Chronicle is the write and read spine of a multi-tenant platform: an
//! append-only event log with per-aggregate optimistic concurrency,
//! transactional unique constraints, and a projection engine that keeps
//! relational read tables eventually consistent with the log.
//!
//! The crate is storage-agnostic. [`Eventstore`] and the projection
//! [`Handler`](projection::Handler) talk to backends through the
//! [`EventStorage`] and [`ProjectionStorage`](projection::ProjectionStorage)
//! ports; adapter crates provide the implementations.
//!
//! # Writing
//!
//! Business logic reloads a write model (a pure fold over the aggregate's
//! events), decides, and pushes commands carrying the sequence the model
//! observed. A push is atomic across all its aggregates: expected sequences
//! are re-checked, unique keys are claimed or freed, and every committed
//! event receives a globally ordered position.
//!
//! # Reading
//!
//! Readers never touch raw events. Projections fold the log into relational
//! tables, tenant by tenant, in position order, with bounded batches and a
//! failed-event ledger that contains poison events instead of stalling a
//! tenant.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod constraint;
pub mod error;
pub mod event;
pub mod eventstore;
pub mod projection;
pub mod retry;
pub mod search;
pub mod store;
pub mod types;
pub mod write_model;

pub use command::{Aggregate, AggregateEvents, Command, ExpectedSequence};
pub use constraint::{ConstraintAction, UniqueConstraint};
pub use error::{
    CommandError, CommandResult, EventStoreError, EventStoreResult, ProjectionError,
    ProjectionResult,
};
pub use event::Event;
pub use eventstore::{EventSubscription, Eventstore, PushNotice};
pub use retry::{retry_command, RetryConfig};
pub use search::{AggregateFilter, SearchQuery, SearchQueryBuilder};
pub use store::{EventStorage, PendingEvent, PendingPush};
pub use types::{
    AggregateId, AggregateType, AggregateVersion, EventType, InstanceId, Position, ResourceOwner,
    Sequence,
};
pub use write_model::{append_and_reduce, ObjectDetails, QueryReducer, WriteModel};
