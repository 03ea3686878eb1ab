//! Projections: relational read models maintained from the event log.
//!
//! A projection is a named, replayable fold: the same reduce concept write
//! models use, aimed at a relational table instead of an in-memory struct.
//! Readers only ever touch the table; the engine in [`handler`] keeps it
//! eventually consistent, tenant by tenant, and contains poison events so a
//! single bad payload cannot stall a tenant forever.

mod handler;
mod statement;
mod store;
mod table;

pub use handler::{Handler, HandlerConfig, HandlerHandle, TickOutcome};
pub use statement::{Column, ColumnValue, Operation, Statement};
pub use store::{FailedEvent, ProcessingGuard, ProjectionStorage};
pub use table::{ColumnDef, ColumnKind, TableDef};

use crate::error::ProjectionResult;
use crate::event::Event;
use crate::types::{AggregateType, EventType};

/// One source of events a projection consumes: an aggregate type, optionally
/// narrowed to specific event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    /// The aggregate type to consume.
    pub aggregate_type: AggregateType,
    /// Event types within it; empty means all.
    pub event_types: Vec<EventType>,
}

impl Interest {
    /// Consume every event of `aggregate_type`.
    #[must_use]
    pub const fn all(aggregate_type: AggregateType) -> Self {
        Self {
            aggregate_type,
            event_types: Vec::new(),
        }
    }

    /// Consume only the given event types of `aggregate_type`.
    #[must_use]
    pub fn events(
        aggregate_type: AggregateType,
        event_types: impl IntoIterator<Item = EventType>,
    ) -> Self {
        Self {
            aggregate_type,
            event_types: event_types.into_iter().collect(),
        }
    }
}

/// A named fold from events into one read table.
///
/// Implementations must be pure: reducing the same event always yields the
/// same statements. The engine relies on this for crash recovery (a batch may
/// be re-fetched and re-reduced) and for rebuilds.
pub trait Projection: Send + Sync {
    /// Unique name; also the key of the position and failure ledgers.
    fn name(&self) -> &str;

    /// The read table this projection maintains.
    fn table(&self) -> TableDef;

    /// The event sources this projection consumes.
    fn interests(&self) -> Vec<Interest>;

    /// Translates one event into zero or more statements.
    ///
    /// # Errors
    ///
    /// An error counts against the event's failure budget; see
    /// [`crate::error::ProjectionError::is_event_failure`].
    fn reduce(&self, event: &Event) -> ProjectionResult<Vec<Statement>>;
}
