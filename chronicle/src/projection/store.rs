//! The storage port implemented by projection backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ProjectionResult;
use crate::event::Event;
use crate::projection::statement::Statement;
use crate::projection::table::TableDef;
use crate::types::{AggregateId, InstanceId, Position, Sequence};

/// Held while exactly one worker processes one (projection, tenant) pair.
///
/// Dropping the guard releases the underlying lock. Guards must release even
/// when the holding task is cancelled mid-batch.
pub trait ProcessingGuard: Send {}

/// One entry of the failed-event ledger.
///
/// Keyed by (projection, tenant, aggregate, sequence); the count grows by one
/// per failed execution until the event is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    /// Projection that failed to process the event.
    pub projection: String,
    /// Tenant of the event.
    pub instance_id: InstanceId,
    /// Aggregate of the event.
    pub aggregate_id: AggregateId,
    /// Sequence of the event within its aggregate.
    pub sequence: Sequence,
    /// How many executions have failed so far.
    pub failure_count: u32,
    /// Error text of the most recent failure.
    pub error: String,
    /// When the most recent failure happened.
    pub last_failed: DateTime<Utc>,
}

/// Backend contract for projection state: read tables, positions, locks, and
/// the failed-event ledger.
#[async_trait]
pub trait ProjectionStorage: Send + Sync {
    /// Prepares the projection's read table and bookkeeping. Idempotent;
    /// called once at worker startup.
    async fn init(&self, projection: &str, table: &TableDef) -> ProjectionResult<()>;

    /// Tries to take the (projection, tenant) work lock without waiting.
    ///
    /// `None` means another worker holds it and this cycle should be
    /// skipped.
    async fn try_lock(
        &self,
        projection: &str,
        instance_id: &InstanceId,
    ) -> ProjectionResult<Option<Box<dyn ProcessingGuard>>>;

    /// The position up to which the tenant's events have been applied.
    /// `Position::ZERO` before the first batch.
    async fn position(&self, projection: &str, instance_id: &InstanceId)
        -> ProjectionResult<Position>;

    /// Applies a batch of statements and advances the stored position to
    /// `position`, atomically. An empty batch still advances the position.
    async fn apply(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        statements: &[Statement],
        position: Position,
    ) -> ProjectionResult<()>;

    /// Records one failed execution for `event` and returns the new total
    /// failure count. The count survives process restarts.
    async fn record_failure(
        &self,
        projection: &str,
        event: &Event,
        error: &str,
    ) -> ProjectionResult<u32>;

    /// The failed-event ledger of a projection, optionally narrowed to one
    /// tenant. Skipped events stay listed; nothing is silently dropped.
    async fn failed_events(
        &self,
        projection: &str,
        instance_id: Option<&InstanceId>,
    ) -> ProjectionResult<Vec<FailedEvent>>;

    /// Removes the tenant's rows, stored position, and failure entries so
    /// the next cycle replays from the start of the log.
    async fn reset(&self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<()>;
}
