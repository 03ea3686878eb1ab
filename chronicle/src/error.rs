//! Error types for the event log, command boundary, and projection engine.
//!
//! Each subsystem has its own error enum; `From` conversions keep `?` flowing
//! from the log outward to command handlers. Storage adapters map their
//! backend errors into these variants at the boundary, so everything above the
//! ports stays backend-free.

use std::time::Duration;

use thiserror::Error;

use crate::command::ExpectedSequence;
use crate::types::{AggregateId, AggregateType, Sequence};

/// Errors returned by the event log (push and filter paths).
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The expected sequence supplied with a push no longer matches the
    /// aggregate's current sequence. The caller should reload its write model
    /// and retry.
    #[error("concurrent modification of {aggregate_type} {aggregate_id}: expected sequence {expected}, current is {current}")]
    ConcurrentModification {
        /// Kind of the conflicting aggregate.
        aggregate_type: AggregateType,
        /// Identifier of the conflicting aggregate.
        aggregate_id: AggregateId,
        /// What the push expected.
        expected: ExpectedSequence,
        /// What the log holds.
        current: Sequence,
    },

    /// A unique constraint claimed by this push is already held.
    ///
    /// The message is the conflict text the claiming command attached to its
    /// add descriptor, suitable for surfacing to a user.
    #[error("{message}")]
    UniqueConstraintViolated {
        /// Constraint namespace, e.g. `usernames`.
        constraint_type: String,
        /// The contested key.
        constraint_key: String,
        /// User-facing conflict text supplied by the claiming command.
        message: String,
    },

    /// One push tried to add the same unique constraint twice.
    ///
    /// Detected before any storage work; the push is rejected as a whole.
    #[error("unique constraint {constraint_type}:{constraint_key} added twice within one push")]
    ConstraintConflictInPush {
        /// Constraint namespace.
        constraint_type: String,
        /// The doubly-claimed key.
        constraint_key: String,
    },

    /// An event payload could not be serialized or deserialized.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store failed.
    #[error("storage failure: {0}")]
    Storage(String),

    /// The operation exceeded its deadline. Nothing was committed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

impl EventStoreError {
    /// Whether retrying the same operation can reasonably succeed.
    ///
    /// `ConcurrentModification` is retryable after reloading the write model;
    /// storage failures and timeouts are retryable as-is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::Storage(_) | Self::Timeout(_)
        )
    }
}

/// Errors surfaced at the command-handler boundary.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The target of the command does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The command would create something that already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The write model is in a state the command does not allow.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The event log rejected or failed the push.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// The bounded retry loop gave up.
    #[error("temporarily unable to complete after {attempts} attempts, please retry")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error of the final attempt.
        #[source]
        last: Box<CommandError>,
    },
}

impl CommandError {
    /// Converts a push error into its command-boundary shape.
    ///
    /// Uniqueness conflicts become `AlreadyExists` carrying the conflict text
    /// the claiming command attached; everything else passes through.
    #[must_use]
    pub fn from_push_error(error: EventStoreError) -> Self {
        match error {
            EventStoreError::UniqueConstraintViolated { message, .. } => {
                Self::AlreadyExists(message)
            }
            other => Self::EventStore(other),
        }
    }

    /// Whether the command may be retried after reloading its write model.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::EventStore(error) => error.is_retryable(),
            _ => false,
        }
    }
}

/// Errors raised inside the projection engine.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// A projection reducer rejected an event.
    ///
    /// Counted against the event's failure budget; see the handler's
    /// poison-event semantics.
    #[error("reducer failed: {0}")]
    Reduce(String),

    /// A payload could not be deserialized inside a reducer.
    #[error("payload deserialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reading the event log failed.
    #[error(transparent)]
    EventStore(#[from] EventStoreError),

    /// The projection store failed.
    #[error("projection storage failure: {0}")]
    Storage(String),

    /// One batch exceeded its transaction deadline. Nothing was committed.
    #[error("projection batch timed out after {0:?}")]
    Timeout(Duration),
}

impl ProjectionError {
    /// Whether this error counts against an event's failure budget.
    ///
    /// Reducer and payload errors are deterministic per event and are counted;
    /// storage and log errors are transient and retried with the same batch on
    /// the next cycle instead. Payload errors surfaced through the event log's
    /// own parse helper are counted as well.
    #[must_use]
    pub const fn is_event_failure(&self) -> bool {
        matches!(
            self,
            Self::Reduce(_)
                | Self::Serialization(_)
                | Self::EventStore(EventStoreError::Serialization(_))
        )
    }
}

/// Result alias for event log operations.
pub type EventStoreResult<T> = Result<T, EventStoreError>;

/// Result alias for command-boundary operations.
pub type CommandResult<T> = Result<T, CommandError>;

/// Result alias for projection engine operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;
