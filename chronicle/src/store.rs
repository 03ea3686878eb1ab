//! The storage port implemented by every event store backend.
//!
//! [`crate::eventstore::Eventstore`] lowers command groups into
//! [`PendingPush`] values and hands them to an [`EventStorage`]
//! implementation. Adapters own transactions, sequence assignment, position
//! allocation, and unique constraint bookkeeping; the core stays free of any
//! storage detail.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::command::{Aggregate, ExpectedSequence};
use crate::constraint::UniqueConstraint;
use crate::error::EventStoreResult;
use crate::event::Event;
use crate::search::SearchQuery;
use crate::types::{EventType, InstanceId, Position};

/// One serialized event awaiting commit.
///
/// Produced by lowering a [`crate::command::Command`]; the adapter fills in
/// sequence, position, and creation time when the transaction commits.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    /// Namespaced type tag, e.g. `user.added`.
    pub event_type: EventType,
    /// Serialized payload; `None` commits as an empty payload.
    pub payload: Option<Value>,
    /// Service or user that caused the event.
    pub creator: String,
    /// Constraint mutations that commit or fail with the event.
    pub unique_constraints: Vec<UniqueConstraint>,
}

/// All pending events of one aggregate within a push, with the concurrency
/// guard that protects them.
#[derive(Debug, Clone)]
pub struct PendingPush {
    /// The aggregate the events belong to.
    pub aggregate: Aggregate,
    /// Expected sequence of the aggregate before the first new event.
    pub expected: ExpectedSequence,
    /// Events in intent order.
    pub events: Vec<PendingEvent>,
}

/// Backend contract for the append-only event log.
///
/// Implementations must uphold the ordering guarantee: events become visible
/// to readers in position order with no gaps at read time, and positions
/// reflect commit order.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Atomically appends all groups for one tenant.
    ///
    /// Either every event of every group commits, or none do. Per aggregate,
    /// sequences continue gaplessly from the current head and `expected` is
    /// checked against that head. Constraint mutations across all groups are
    /// applied in the same transaction.
    ///
    /// Returns the committed events, in order, with sequence, position, and
    /// creation time filled in.
    async fn push(
        &self,
        instance_id: &InstanceId,
        pushes: Vec<PendingPush>,
    ) -> EventStoreResult<Vec<Event>>;

    /// Reads events matching `query`, ordered by position (descending when
    /// the query says so) and truncated to its limit.
    async fn filter(&self, query: &SearchQuery) -> EventStoreResult<Vec<Event>>;

    /// The position of the most recently committed event, across all tenants.
    async fn latest_position(&self) -> EventStoreResult<Position>;

    /// Tenants that committed at least one event within the past `window`.
    async fn active_instances(&self, window: Duration) -> EventStoreResult<Vec<InstanceId>>;

    /// Verifies the backend is reachable.
    async fn ping(&self) -> EventStoreResult<()>;
}
