//! Composable, immutable event filters.
//!
//! A [`SearchQuery`] is the one filter description understood by every read
//! path: write-model reloads, projection catch-up, and ad-hoc inspection.
//! Clauses at the query level combine with AND; repeated aggregate filter
//! blocks combine with OR, so one query can span several aggregate types with
//! different bounds.

use crate::event::Event;
use crate::types::{
    AggregateId, AggregateType, EventType, InstanceId, Position, ResourceOwner, Sequence,
};

/// One OR-block of a query: constraints on a single aggregate type.
///
/// Within the block all clauses are ANDed. Empty id/event-type sets mean
/// "any".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFilter {
    aggregate_type: AggregateType,
    aggregate_ids: Vec<AggregateId>,
    event_types: Vec<EventType>,
    sequence_after: Option<Sequence>,
}

impl AggregateFilter {
    /// Starts a filter block matching all events of `aggregate_type`.
    #[must_use]
    pub const fn new(aggregate_type: AggregateType) -> Self {
        Self {
            aggregate_type,
            aggregate_ids: Vec::new(),
            event_types: Vec::new(),
            sequence_after: None,
        }
    }

    /// Restricts the block to one aggregate id (repeatable).
    #[must_use]
    pub fn aggregate_id(mut self, id: AggregateId) -> Self {
        self.aggregate_ids.push(id);
        self
    }

    /// Restricts the block to a set of aggregate ids.
    #[must_use]
    pub fn aggregate_ids(mut self, ids: impl IntoIterator<Item = AggregateId>) -> Self {
        self.aggregate_ids.extend(ids);
        self
    }

    /// Restricts the block to a set of event types.
    #[must_use]
    pub fn event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types.extend(types);
        self
    }

    /// Only events with a sequence strictly greater than `sequence`.
    #[must_use]
    pub const fn sequence_after(mut self, sequence: Sequence) -> Self {
        self.sequence_after = Some(sequence);
        self
    }

    /// The aggregate type this block matches.
    #[must_use]
    pub const fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    /// The aggregate ids this block matches; empty means any.
    #[must_use]
    pub fn ids(&self) -> &[AggregateId] {
        &self.aggregate_ids
    }

    /// The event types this block matches; empty means any.
    #[must_use]
    pub fn types(&self) -> &[EventType] {
        &self.event_types
    }

    /// The lower sequence bound, if any.
    #[must_use]
    pub const fn sequence_bound(&self) -> Option<Sequence> {
        self.sequence_after
    }

    /// Whether `event` satisfies every clause of this block.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if event.aggregate_type != self.aggregate_type {
            return false;
        }
        if !self.aggregate_ids.is_empty() && !self.aggregate_ids.contains(&event.aggregate_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        self.sequence_after
            .map_or(true, |bound| event.sequence > bound)
    }
}

/// An immutable filter over the event log.
///
/// Built with [`SearchQueryBuilder`]; consumed by
/// [`crate::eventstore::Eventstore::filter`] and the storage adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    instance_id: Option<InstanceId>,
    resource_owner: Option<ResourceOwner>,
    position_after: Position,
    limit: Option<u64>,
    descending: bool,
    filters: Vec<AggregateFilter>,
}

impl SearchQuery {
    /// Starts building a query scoped to one tenant.
    #[must_use]
    pub fn builder(instance_id: InstanceId) -> SearchQueryBuilder {
        SearchQueryBuilder {
            query: Self {
                instance_id: Some(instance_id),
                resource_owner: None,
                position_after: Position::ZERO,
                limit: None,
                descending: false,
                filters: Vec::new(),
            },
        }
    }

    /// Starts building a cross-tenant query (system use only).
    #[must_use]
    pub fn builder_unscoped() -> SearchQueryBuilder {
        SearchQueryBuilder {
            query: Self {
                instance_id: None,
                resource_owner: None,
                position_after: Position::ZERO,
                limit: None,
                descending: false,
                filters: Vec::new(),
            },
        }
    }

    /// The tenant scope, if any.
    #[must_use]
    pub const fn instance_id(&self) -> Option<&InstanceId> {
        self.instance_id.as_ref()
    }

    /// The sub-tenant scope, if any.
    #[must_use]
    pub const fn resource_owner(&self) -> Option<&ResourceOwner> {
        self.resource_owner.as_ref()
    }

    /// The exclusive lower position bound; `Position::ZERO` reads from the
    /// start of the log.
    #[must_use]
    pub const fn position_after(&self) -> Position {
        self.position_after
    }

    /// The maximum number of events to return, if bounded.
    #[must_use]
    pub const fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Whether results are ordered newest-first.
    #[must_use]
    pub const fn is_descending(&self) -> bool {
        self.descending
    }

    /// The OR-blocks of the query; empty means all aggregate types.
    #[must_use]
    pub fn filters(&self) -> &[AggregateFilter] {
        &self.filters
    }

    /// Whether `event` matches this query, ignoring limit and order.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(instance_id) = &self.instance_id {
            if event.instance_id != *instance_id {
                return false;
            }
        }
        if let Some(resource_owner) = &self.resource_owner {
            if event.resource_owner != *resource_owner {
                return false;
            }
        }
        if event.position <= self.position_after {
            return false;
        }
        if self.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|filter| filter.matches(event))
    }
}

/// Builder for [`SearchQuery`].
#[derive(Debug, Clone)]
pub struct SearchQueryBuilder {
    query: SearchQuery,
}

impl SearchQueryBuilder {
    /// Restricts the query to one sub-tenant.
    #[must_use]
    pub fn resource_owner(mut self, resource_owner: ResourceOwner) -> Self {
        self.query.resource_owner = Some(resource_owner);
        self
    }

    /// Only events with a position strictly greater than `position`.
    #[must_use]
    pub const fn position_after(mut self, position: Position) -> Self {
        self.query.position_after = position;
        self
    }

    /// Bounds the number of returned events.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Orders results newest-first instead of oldest-first.
    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.query.descending = true;
        self
    }

    /// Adds an OR-block to the query.
    #[must_use]
    pub fn filter(mut self, filter: AggregateFilter) -> Self {
        self.query.filters.push(filter);
        self
    }

    /// Finishes the query.
    #[must_use]
    pub fn build(self) -> SearchQuery {
        self.query
    }
}
