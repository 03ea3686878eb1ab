//! Write models: current state folded from an aggregate's events.
//!
//! A command handler reloads state by running a query through a reducer,
//! decides, and pushes with the expectation the model observed. The base
//! [`WriteModel`] carries the bookkeeping every model needs; domain models
//! embed it and fold their own fields on top.

use chrono::{DateTime, Utc};

use crate::command::ExpectedSequence;
use crate::error::EventStoreResult;
use crate::event::Event;
use crate::search::SearchQuery;
use crate::types::{AggregateId, InstanceId, Position, ResourceOwner, Sequence};

/// Anything that can declare its source events and fold them, oldest first.
///
/// Implemented by write models and usable with
/// [`crate::eventstore::Eventstore::filter_to_reducer`].
pub trait QueryReducer: Send {
    /// The filter selecting this reducer's source events.
    fn query(&self) -> SearchQuery;

    /// Folds one event into the state. Events arrive in position order.
    ///
    /// # Errors
    ///
    /// Typically payload deserialization failures.
    fn reduce(&mut self, event: &Event) -> EventStoreResult<()>;
}

/// Bookkeeping common to all write models.
///
/// Domain models embed this and call [`WriteModel::absorb`] for every event
/// they fold, keeping `processed_sequence` honest for the next push.
#[derive(Debug, Clone)]
pub struct WriteModel {
    /// Tenant the model is scoped to.
    pub instance_id: InstanceId,
    /// Aggregate the model mirrors.
    pub aggregate_id: AggregateId,
    /// Sub-tenant owning the aggregate; set by the first folded event.
    pub resource_owner: Option<ResourceOwner>,
    /// Sequence of the last folded event.
    pub processed_sequence: Sequence,
    /// Position of the last folded event.
    pub position: Position,
    /// Creation time of the last folded event.
    pub change_date: Option<DateTime<Utc>>,
}

impl WriteModel {
    /// A model that has seen no events yet.
    #[must_use]
    pub const fn new(instance_id: InstanceId, aggregate_id: AggregateId) -> Self {
        Self {
            instance_id,
            aggregate_id,
            resource_owner: None,
            processed_sequence: Sequence::ZERO,
            position: Position::ZERO,
            change_date: None,
        }
    }

    /// Records one folded event's bookkeeping.
    pub fn absorb(&mut self, event: &Event) {
        self.processed_sequence = event.sequence;
        self.position = event.position;
        self.change_date = Some(event.created_at);
        if self.resource_owner.is_none() {
            self.resource_owner = Some(event.resource_owner.clone());
        }
    }

    /// The expectation a push based on this model must carry.
    #[must_use]
    pub fn expected_sequence(&self) -> ExpectedSequence {
        if self.processed_sequence == Sequence::ZERO {
            ExpectedSequence::NoStream
        } else {
            ExpectedSequence::Exact(self.processed_sequence)
        }
    }

    /// Whether the model has folded at least one event.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.processed_sequence > Sequence::ZERO
    }

    /// Write result metadata for command responses.
    #[must_use]
    pub fn details(&self) -> ObjectDetails {
        ObjectDetails {
            sequence: self.processed_sequence,
            position: self.position,
            event_date: self.change_date,
            resource_owner: self.resource_owner.clone(),
        }
    }
}

/// Metadata returned by command handlers after a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDetails {
    /// Sequence of the last event of the aggregate.
    pub sequence: Sequence,
    /// Position of the last event of the aggregate.
    pub position: Position,
    /// Creation time of the last event.
    pub event_date: Option<DateTime<Utc>>,
    /// Sub-tenant owning the aggregate.
    pub resource_owner: Option<ResourceOwner>,
}

/// Folds freshly committed events into a reducer without re-reading the log.
///
/// Used after a successful push: the returned events continue exactly where
/// the model stopped, so folding them directly keeps the model current.
///
/// # Errors
///
/// Propagates the first reducer error.
pub fn append_and_reduce<R>(reducer: &mut R, events: &[Event]) -> EventStoreResult<()>
where
    R: QueryReducer + ?Sized,
{
    for event in events {
        reducer.reduce(event)?;
    }
    Ok(())
}
