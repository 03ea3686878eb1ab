//! The command surface of the event log.
//!
//! Command handlers do not write events directly. They produce [`Command`]
//! values — intentions to append one event each — grouped per aggregate with
//! the expected sequence their write model observed. The log turns accepted
//! commands into committed [`crate::event::Event`]s.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::constraint::UniqueConstraint;
use crate::types::{
    AggregateId, AggregateType, AggregateVersion, EventType, ResourceOwner, Sequence,
};

/// Reference to one aggregate, the unit of consistency of the log.
///
/// The tenant is intentionally absent: a push is always scoped to a single
/// tenant, supplied with the push call, and events are stamped with it there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregate {
    /// Kind of the aggregate, e.g. `user`.
    pub aggregate_type: AggregateType,
    /// Identifier within the aggregate type.
    pub id: AggregateId,
    /// Sub-tenant owning the aggregate.
    pub resource_owner: ResourceOwner,
    /// Schema revision of the aggregate's event vocabulary.
    pub version: AggregateVersion,
}

impl Aggregate {
    /// Creates an aggregate reference.
    pub const fn new(
        aggregate_type: AggregateType,
        id: AggregateId,
        resource_owner: ResourceOwner,
        version: AggregateVersion,
    ) -> Self {
        Self {
            aggregate_type,
            id,
            resource_owner,
            version,
        }
    }
}

/// The sequence a push expects its aggregate to be at.
///
/// Supplied by the write model that produced the commands; checked inside the
/// push transaction. A mismatch fails the push with
/// [`crate::error::EventStoreError::ConcurrentModification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedSequence {
    /// The aggregate must not have any events yet.
    NoStream,
    /// The aggregate's current sequence must match exactly.
    Exact(Sequence),
    /// No concurrency check; append at whatever the current sequence is.
    Any,
}

impl ExpectedSequence {
    /// Whether `current` satisfies this expectation.
    #[must_use]
    pub fn matches(self, current: Sequence) -> bool {
        match self {
            Self::NoStream => current == Sequence::ZERO,
            Self::Exact(expected) => current == expected,
            Self::Any => true,
        }
    }
}

impl fmt::Display for ExpectedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStream => f.write_str("no stream"),
            Self::Exact(sequence) => sequence.fmt(f),
            Self::Any => f.write_str("any"),
        }
    }
}

/// One intended event, produced by business logic.
///
/// A command describes everything the log cannot decide itself: the event's
/// type, the actor, the payload, and the uniqueness markers the event claims
/// or frees. Sequence, position, and timestamp are assigned at commit.
pub trait Command: Send + Sync {
    /// The type of the resulting event.
    fn event_type(&self) -> EventType;

    /// The actor causing the event.
    fn creator(&self) -> String;

    /// Serializes the event payload. `None` for events without data.
    fn payload(&self) -> Result<Option<Value>, serde_json::Error>;

    /// Uniqueness markers this event claims or frees.
    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        Vec::new()
    }
}

/// Serialization helper for [`Command::payload`] implementations.
pub fn to_payload<T: Serialize>(payload: &T) -> Result<Option<Value>, serde_json::Error> {
    serde_json::to_value(payload).map(Some)
}

/// The commands one push carries for one aggregate, in append order.
#[derive(Debug)]
pub struct AggregateEvents {
    aggregate: Aggregate,
    expected: ExpectedSequence,
    commands: Vec<Box<dyn Command>>,
}

impl AggregateEvents {
    /// Starts an empty group for `aggregate` at `expected`.
    #[must_use]
    pub const fn new(aggregate: Aggregate, expected: ExpectedSequence) -> Self {
        Self {
            aggregate,
            expected,
            commands: Vec::new(),
        }
    }

    /// Appends a command to the group.
    #[must_use]
    pub fn command(mut self, command: impl Command + 'static) -> Self {
        self.commands.push(Box::new(command));
        self
    }

    /// The aggregate this group appends to.
    #[must_use]
    pub const fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    /// The sequence expectation of this group.
    #[must_use]
    pub const fn expected(&self) -> ExpectedSequence {
        self.expected
    }

    /// The commands of this group, in append order.
    #[must_use]
    pub fn commands(&self) -> &[Box<dyn Command>] {
        &self.commands
    }
}

impl fmt::Debug for dyn Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("event_type", &self.event_type())
            .finish_non_exhaustive()
    }
}
