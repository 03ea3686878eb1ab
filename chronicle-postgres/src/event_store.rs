//! The durable event log on PostgreSQL.
//!
//! A push runs as one transaction: per-aggregate advisory locks, sequence
//! expectation checks, unique-constraint bookkeeping, position allocation,
//! and the event inserts either all commit or all roll back.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument, warn};

use chronicle::store::{EventStorage, PendingEvent, PendingPush};
use chronicle::{
    Aggregate, AggregateId, AggregateType, AggregateVersion, ConstraintAction, Event,
    EventStoreError, EventStoreResult, EventType, InstanceId, Position, ResourceOwner, SearchQuery,
    Sequence, UniqueConstraint,
};

use crate::{store_failure, PostgresConfig, PostgresError};

const SELECT_EVENTS: &str = "SELECT instance_id, aggregate_type, aggregate_id, \
     aggregate_version, resource_owner, sequence, position, event_type, payload, creator, \
     created_at FROM events";

/// Event log backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connects with the default pool configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::ConnectionFailed`] if the pool cannot be
    /// created.
    pub async fn connect(connection_string: impl Into<String>) -> Result<Self, PostgresError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with a custom pool configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::ConnectionFailed`] if the pool cannot be
    /// created.
    pub async fn with_config(
        connection_string: impl Into<String>,
        config: PostgresConfig,
    ) -> Result<Self, PostgresError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Wraps an existing connection pool.
    ///
    /// Use this to share one pool between the event store and the projection
    /// store.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies the bundled schema migrations.
    ///
    /// Safe to call on every startup; already-applied migrations are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`PostgresError::MigrationFailed`] if a migration cannot be
    /// applied.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresError::MigrationFailed)
    }
}

#[async_trait]
impl EventStorage for PostgresEventStore {
    #[instrument(skip_all, fields(instance = %instance_id, groups = pushes.len()))]
    async fn push(
        &self,
        instance_id: &InstanceId,
        pushes: Vec<PendingPush>,
    ) -> EventStoreResult<Vec<Event>> {
        let total: usize = pushes.iter().map(|push| push.events.len()).sum();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| store_failure("begin push transaction", &error))?;

        lock_aggregates(&mut tx, instance_id, &pushes).await?;

        // Validate every group's expectation before writing anything. Later
        // groups on the same aggregate chain onto the sequences admitted for
        // earlier ones.
        let mut heads: HashMap<(String, String), Sequence> = HashMap::new();
        let mut bases = Vec::with_capacity(pushes.len());
        for push in &pushes {
            let key = (
                push.aggregate.aggregate_type.to_string(),
                push.aggregate.id.to_string(),
            );
            let current = match heads.get(&key) {
                Some(sequence) => *sequence,
                None => current_sequence(&mut tx, instance_id, &push.aggregate).await?,
            };
            if !push.expected.matches(current) {
                return Err(EventStoreError::ConcurrentModification {
                    aggregate_type: push.aggregate.aggregate_type.clone(),
                    aggregate_id: push.aggregate.id.clone(),
                    expected: push.expected,
                    current,
                });
            }
            bases.push(current);
            let mut next = current;
            for _ in &push.events {
                next = next.next();
            }
            heads.insert(key, next);
        }

        apply_constraints(&mut tx, instance_id, &pushes).await?;

        if total == 0 {
            tx.commit()
                .await
                .map_err(|error| store_failure("commit push transaction", &error))?;
            return Ok(Vec::new());
        }

        let mut position = allocate_positions(&mut tx, total).await?;
        let mut committed = Vec::with_capacity(total);
        for (push, base) in pushes.into_iter().zip(bases) {
            let mut sequence = base;
            for pending in push.events {
                sequence = sequence.next();
                position = position.next();
                let event = insert_event(
                    &mut tx,
                    instance_id,
                    &push.aggregate,
                    pending,
                    sequence,
                    position,
                )
                .await?;
                committed.push(event);
            }
        }

        tx.commit()
            .await
            .map_err(|error| store_failure("commit push transaction", &error))?;

        debug!(events = committed.len(), "push committed");
        Ok(committed)
    }

    #[instrument(skip_all, fields(filters = query.filters().len()))]
    async fn filter(&self, query: &SearchQuery) -> EventStoreResult<Vec<Event>> {
        let (sql, binds) = build_filter_query(query);
        let rows = bind_values(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| store_failure("filter events", &error))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_row =
                EventRow::try_from(row).map_err(|error| store_failure("decode event row", &error))?;
            events.push(event_row.into_event()?);
        }
        debug!(events = events.len(), "filter completed");
        Ok(events)
    }

    async fn latest_position(&self) -> EventStoreResult<Position> {
        let value: i64 = sqlx::query_scalar("SELECT value FROM events_position")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| store_failure("read log position", &error))?;
        u64::try_from(value)
            .map(Position::new)
            .map_err(|_| EventStoreError::Storage("negative log position".to_owned()))
    }

    async fn active_instances(&self, window: Duration) -> EventStoreResult<Vec<InstanceId>> {
        let delta = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(delta)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT instance_id FROM events WHERE created_at >= $1 ORDER BY instance_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| store_failure("list active instances", &error))?;

        names
            .into_iter()
            .map(|name| {
                InstanceId::try_new(name).map_err(|error| {
                    EventStoreError::Storage(format!("corrupt instance id in event log: {error}"))
                })
            })
            .collect()
    }

    async fn ping(&self) -> EventStoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| store_failure("ping", &error))?;
        Ok(())
    }
}

/// Takes per-aggregate advisory locks, sorted so concurrent pushes over
/// overlapping aggregates cannot deadlock. The locks expire with the
/// transaction.
async fn lock_aggregates(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &InstanceId,
    pushes: &[PendingPush],
) -> EventStoreResult<()> {
    let mut keys: Vec<String> = pushes
        .iter()
        .map(|push| {
            format!(
                "{instance_id}|{}|{}",
                push.aggregate.aggregate_type, push.aggregate.id
            )
        })
        .collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key)
            .execute(&mut **tx)
            .await
            .map_err(|error| store_failure("lock aggregate", &error))?;
    }
    Ok(())
}

async fn current_sequence(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &InstanceId,
    aggregate: &Aggregate,
) -> EventStoreResult<Sequence> {
    // MAX returns one NULL row for an aggregate without events.
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(sequence) FROM events \
         WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3",
    )
    .bind(instance_id.as_str())
    .bind(aggregate.aggregate_type.as_str())
    .bind(aggregate.id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|error| store_failure("read aggregate sequence", &error))?
    .flatten();

    max.map_or_else(
        || Ok(Sequence::ZERO),
        |value| {
            u64::try_from(value)
                .map(Sequence::new)
                .map_err(|_| EventStoreError::Storage("negative sequence in event log".to_owned()))
        },
    )
}

/// Claims and frees unique keys in event order, within the push transaction.
///
/// A lost claim surfaces the conflict message the claiming command attached.
async fn apply_constraints(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &InstanceId,
    pushes: &[PendingPush],
) -> EventStoreResult<()> {
    for push in pushes {
        for event in &push.events {
            for constraint in &event.unique_constraints {
                // Platform-wide keys share the empty tenant scope.
                let scope = if constraint.global {
                    ""
                } else {
                    instance_id.as_str()
                };
                match constraint.action {
                    ConstraintAction::Add => {
                        sqlx::query(
                            "INSERT INTO unique_constraints \
                             (instance_id, constraint_type, constraint_key) \
                             VALUES ($1, $2, $3)",
                        )
                        .bind(scope)
                        .bind(&constraint.constraint_type)
                        .bind(&constraint.constraint_key)
                        .execute(&mut **tx)
                        .await
                        .map_err(|error| claim_error(&error, constraint))?;
                    }
                    ConstraintAction::Remove => {
                        sqlx::query(
                            "DELETE FROM unique_constraints \
                             WHERE instance_id = $1 AND constraint_type = $2 \
                             AND constraint_key = $3",
                        )
                        .bind(scope)
                        .bind(&constraint.constraint_type)
                        .bind(&constraint.constraint_key)
                        .execute(&mut **tx)
                        .await
                        .map_err(|error| store_failure("free unique constraint", &error))?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn claim_error(error: &sqlx::Error, constraint: &UniqueConstraint) -> EventStoreError {
    if let sqlx::Error::Database(database) = error {
        if database.code().as_deref() == Some("23505") {
            warn!(
                constraint_type = %constraint.constraint_type,
                constraint_key = %constraint.constraint_key,
                "unique constraint already claimed"
            );
            return EventStoreError::UniqueConstraintViolated {
                constraint_type: constraint.constraint_type.clone(),
                constraint_key: constraint.constraint_key.clone(),
                message: constraint.conflict_message.clone(),
            };
        }
    }
    store_failure("claim unique constraint", error)
}

/// Reserves `count` positions on the commit counter and returns the position
/// just before the first reserved one.
///
/// The counter row stays locked until commit, so concurrent pushes observe
/// positions in commit order.
async fn allocate_positions(
    tx: &mut Transaction<'_, Postgres>,
    count: usize,
) -> EventStoreResult<Position> {
    let count_i64 = i64::try_from(count)
        .map_err(|_| EventStoreError::Storage("push exceeds position range".to_owned()))?;
    let last: i64 =
        sqlx::query_scalar("UPDATE events_position SET value = value + $1 RETURNING value")
            .bind(count_i64)
            .fetch_one(&mut **tx)
            .await
            .map_err(|error| store_failure("allocate positions", &error))?;

    u64::try_from(last - count_i64)
        .map(Position::new)
        .map_err(|_| EventStoreError::Storage("position counter out of range".to_owned()))
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    instance_id: &InstanceId,
    aggregate: &Aggregate,
    pending: PendingEvent,
    sequence: Sequence,
    position: Position,
) -> EventStoreResult<Event> {
    let created_at: DateTime<Utc> = sqlx::query_scalar(
        "INSERT INTO events \
         (instance_id, aggregate_type, aggregate_id, aggregate_version, resource_owner, \
         sequence, position, event_type, payload, creator) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING created_at",
    )
    .bind(instance_id.as_str())
    .bind(aggregate.aggregate_type.as_str())
    .bind(aggregate.id.as_str())
    .bind(aggregate.version.as_str())
    .bind(aggregate.resource_owner.as_str())
    .bind(sequence_i64(sequence)?)
    .bind(position_i64(position)?)
    .bind(pending.event_type.as_str())
    .bind(&pending.payload)
    .bind(&pending.creator)
    .fetch_one(&mut **tx)
    .await
    .map_err(|error| store_failure("append event", &error))?;

    Ok(Event {
        instance_id: instance_id.clone(),
        resource_owner: aggregate.resource_owner.clone(),
        aggregate_type: aggregate.aggregate_type.clone(),
        aggregate_id: aggregate.id.clone(),
        aggregate_version: aggregate.version.clone(),
        sequence,
        position,
        event_type: pending.event_type,
        created_at,
        payload: pending.payload,
        creator: pending.creator,
    })
}

fn sequence_i64(sequence: Sequence) -> EventStoreResult<i64> {
    i64::try_from(sequence.get())
        .map_err(|_| EventStoreError::Storage("sequence exceeds storable range".to_owned()))
}

fn position_i64(position: Position) -> EventStoreResult<i64> {
    i64::try_from(position.get())
        .map_err(|_| EventStoreError::Storage("position exceeds storable range".to_owned()))
}

/// Values bound to a built filter query, in `$n` order.
#[derive(Debug, PartialEq, Eq)]
enum Bind {
    Text(String),
    TextList(Vec<String>),
    Int(i64),
}

fn bind_values<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &'q [Bind],
) -> Query<'q, Postgres, PgArguments> {
    for bind in binds {
        query = match bind {
            Bind::Text(value) => query.bind(value),
            Bind::TextList(values) => query.bind(values),
            Bind::Int(value) => query.bind(*value),
        };
    }
    query
}

/// Renders a [`SearchQuery`] as SQL plus its bind list.
///
/// Scope clauses are conjoined; aggregate filter blocks are disjoined, with
/// the conditions inside each block conjoined again.
fn build_filter_query(query: &SearchQuery) -> (String, Vec<Bind>) {
    let mut sql = String::from(SELECT_EVENTS);
    let mut binds = Vec::new();
    let mut clauses = Vec::new();

    if let Some(instance_id) = query.instance_id() {
        binds.push(Bind::Text(instance_id.to_string()));
        clauses.push(format!("instance_id = ${}", binds.len()));
    }
    if let Some(resource_owner) = query.resource_owner() {
        binds.push(Bind::Text(resource_owner.to_string()));
        clauses.push(format!("resource_owner = ${}", binds.len()));
    }
    if query.position_after() > Position::ZERO {
        binds.push(Bind::Int(
            i64::try_from(query.position_after().get()).unwrap_or(i64::MAX),
        ));
        clauses.push(format!("position > ${}", binds.len()));
    }

    let blocks: Vec<String> = query
        .filters()
        .iter()
        .map(|filter| {
            let mut parts = Vec::new();
            binds.push(Bind::Text(filter.aggregate_type().to_string()));
            parts.push(format!("aggregate_type = ${}", binds.len()));
            if !filter.ids().is_empty() {
                binds.push(Bind::TextList(
                    filter.ids().iter().map(ToString::to_string).collect(),
                ));
                parts.push(format!("aggregate_id = ANY(${})", binds.len()));
            }
            if !filter.types().is_empty() {
                binds.push(Bind::TextList(
                    filter.types().iter().map(ToString::to_string).collect(),
                ));
                parts.push(format!("event_type = ANY(${})", binds.len()));
            }
            if let Some(bound) = filter.sequence_bound() {
                binds.push(Bind::Int(i64::try_from(bound.get()).unwrap_or(i64::MAX)));
                parts.push(format!("sequence > ${}", binds.len()));
            }
            format!("({})", parts.join(" AND "))
        })
        .collect();
    if !blocks.is_empty() {
        clauses.push(format!("({})", blocks.join(" OR ")));
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    sql.push_str(if query.is_descending() {
        " ORDER BY position DESC"
    } else {
        " ORDER BY position ASC"
    });

    if let Some(limit) = query.limit() {
        binds.push(Bind::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ${}", binds.len()));
    }

    (sql, binds)
}

/// Database row of one event, decoded before type-level validation.
struct EventRow {
    instance_id: String,
    aggregate_type: String,
    aggregate_id: String,
    aggregate_version: String,
    resource_owner: String,
    sequence: i64,
    position: i64,
    event_type: String,
    payload: Option<Value>,
    creator: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<PgRow> for EventRow {
    type Error = sqlx::Error;

    fn try_from(row: PgRow) -> Result<Self, Self::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_version: row.try_get("aggregate_version")?,
            resource_owner: row.try_get("resource_owner")?,
            sequence: row.try_get("sequence")?,
            position: row.try_get("position")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            creator: row.try_get("creator")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl EventRow {
    fn into_event(self) -> EventStoreResult<Event> {
        let sequence = u64::try_from(self.sequence)
            .map(Sequence::new)
            .map_err(|_| corrupt_row("negative sequence"))?;
        let position = u64::try_from(self.position)
            .map(Position::new)
            .map_err(|_| corrupt_row("negative position"))?;

        Ok(Event {
            instance_id: InstanceId::try_new(self.instance_id)
                .map_err(|error| corrupt_row(&error.to_string()))?,
            resource_owner: ResourceOwner::try_new(self.resource_owner)
                .map_err(|error| corrupt_row(&error.to_string()))?,
            aggregate_type: AggregateType::try_new(self.aggregate_type)
                .map_err(|error| corrupt_row(&error.to_string()))?,
            aggregate_id: AggregateId::try_new(self.aggregate_id)
                .map_err(|error| corrupt_row(&error.to_string()))?,
            aggregate_version: AggregateVersion::try_new(self.aggregate_version)
                .map_err(|error| corrupt_row(&error.to_string()))?,
            sequence,
            position,
            event_type: EventType::try_new(self.event_type)
                .map_err(|error| corrupt_row(&error.to_string()))?,
            created_at: self.created_at,
            payload: self.payload,
            creator: self.creator,
        })
    }
}

fn corrupt_row(detail: &str) -> EventStoreError {
    EventStoreError::Storage(format!("corrupt event row: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle::AggregateFilter;

    fn instance() -> InstanceId {
        InstanceId::try_new("inst-1").unwrap()
    }

    #[test]
    fn filter_sql_for_a_scoped_catch_up_query() {
        let query = SearchQuery::builder(instance())
            .position_after(Position::new(41))
            .limit(200)
            .filter(
                AggregateFilter::new(AggregateType::try_new("user").unwrap())
                    .aggregate_id(AggregateId::try_new("u-1").unwrap())
                    .event_types([
                        EventType::try_new("user.added").unwrap(),
                        EventType::try_new("user.renamed").unwrap(),
                    ]),
            )
            .build();

        let (sql, binds) = build_filter_query(&query);
        insta::assert_snapshot!(sql, @"SELECT instance_id, aggregate_type, aggregate_id, aggregate_version, resource_owner, sequence, position, event_type, payload, creator, created_at FROM events WHERE instance_id = $1 AND position > $2 AND ((aggregate_type = $3 AND aggregate_id = ANY($4) AND event_type = ANY($5))) ORDER BY position ASC LIMIT $6");
        assert_eq!(
            binds,
            vec![
                Bind::Text("inst-1".to_owned()),
                Bind::Int(41),
                Bind::Text("user".to_owned()),
                Bind::TextList(vec!["u-1".to_owned()]),
                Bind::TextList(vec!["user.added".to_owned(), "user.renamed".to_owned()]),
                Bind::Int(200),
            ]
        );
    }

    #[test]
    fn filter_sql_disjoined_aggregate_blocks() {
        let query = SearchQuery::builder(instance())
            .filter(AggregateFilter::new(AggregateType::try_new("user").unwrap()))
            .filter(
                AggregateFilter::new(AggregateType::try_new("org").unwrap())
                    .sequence_after(Sequence::new(3)),
            )
            .build();

        let (sql, binds) = build_filter_query(&query);
        insta::assert_snapshot!(sql, @"SELECT instance_id, aggregate_type, aggregate_id, aggregate_version, resource_owner, sequence, position, event_type, payload, creator, created_at FROM events WHERE instance_id = $1 AND ((aggregate_type = $2) OR (aggregate_type = $3 AND sequence > $4)) ORDER BY position ASC");
        assert_eq!(binds.len(), 4);
    }

    #[test]
    fn filter_sql_unscoped_descending() {
        let query = SearchQuery::builder_unscoped().descending().limit(1).build();

        let (sql, binds) = build_filter_query(&query);
        insta::assert_snapshot!(sql, @"SELECT instance_id, aggregate_type, aggregate_id, aggregate_version, resource_owner, sequence, position, event_type, payload, creator, created_at FROM events ORDER BY position DESC LIMIT $1");
        assert_eq!(binds, vec![Bind::Int(1)]);
    }

    #[test]
    fn filter_sql_with_resource_owner_scope() {
        let query = SearchQuery::builder(instance())
            .resource_owner(ResourceOwner::try_new("org-1").unwrap())
            .build();

        let (sql, _) = build_filter_query(&query);
        insta::assert_snapshot!(sql, @"SELECT instance_id, aggregate_type, aggregate_id, aggregate_version, resource_owner, sequence, position, event_type, payload, creator, created_at FROM events WHERE instance_id = $1 AND resource_owner = $2 ORDER BY position ASC");
    }

    #[test]
    fn event_row_rejects_negative_counters() {
        let row = EventRow {
            instance_id: "inst-1".to_owned(),
            aggregate_type: "user".to_owned(),
            aggregate_id: "u-1".to_owned(),
            aggregate_version: "v1".to_owned(),
            resource_owner: "org-1".to_owned(),
            sequence: -1,
            position: 1,
            event_type: "user.added".to_owned(),
            payload: None,
            creator: "admin".to_owned(),
            created_at: Utc::now(),
        };
        assert!(matches!(
            row.into_event(),
            Err(EventStoreError::Storage(detail)) if detail.contains("negative sequence")
        ));
    }
}
