//! Shared fixtures for the live PostgreSQL suite.
//!
//! These tests talk to a real server named by `DATABASE_URL` and are ignored
//! by default; run them with `cargo test -- --ignored`. The schema is shared
//! between runs, so every test works inside a tenant of its own and relies on
//! the instance columns for isolation.

// Allow dead_code because not all test binaries use all exports from this module
#![allow(dead_code)]

use std::env;

use serde::Serialize;
use serde_json::Value;

use chronicle::command::to_payload;
use chronicle::projection::{ColumnDef, TableDef};
use chronicle::{
    Aggregate, AggregateId, AggregateType, AggregateVersion, Command, Event, EventType,
    ExpectedSequence, InstanceId, PendingEvent, PendingPush, Position, ResourceOwner, Sequence,
    UniqueConstraint,
};
use chronicle_postgres::{PostgresEventStore, PostgresProjectionStore};
use sqlx::PgPool;

/// The read table every projection test writes into. Created once, shared by
/// all runs; rows are isolated by their tenant column.
pub const USERS_TABLE: &str = "users_read_v1";

/// Connected stores against the server named by `DATABASE_URL`, with the
/// schema migrated.
pub struct PostgresFixture {
    pub events: PostgresEventStore,
    pub projections: PostgresProjectionStore,
}

impl PostgresFixture {
    pub async fn connect() -> Self {
        init_tracing();
        let url = env::var("DATABASE_URL")
            .expect("set DATABASE_URL to a PostgreSQL server to run the live suite");
        let events = PostgresEventStore::connect(&url)
            .await
            .expect("should connect to postgres");
        events.migrate().await.expect("should run migrations");
        let projections = PostgresProjectionStore::from_pool(events.pool().clone());
        Self {
            events,
            projections,
        }
    }

    pub fn pool(&self) -> &PgPool {
        self.events.pool()
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// A tenant no other test run has seen.
pub fn tenant() -> InstanceId {
    InstanceId::try_new(format!("inst-{:08x}", rand::random::<u32>())).unwrap()
}

/// A projection name no other test run has seen.
pub fn projection_name() -> String {
    format!("users-{:08x}", rand::random::<u32>())
}

pub fn user_aggregate(id: &str) -> Aggregate {
    Aggregate::new(
        AggregateType::try_new("user").unwrap(),
        AggregateId::try_new(id).unwrap(),
        ResourceOwner::try_new("org-1").unwrap(),
        AggregateVersion::try_new("v1").unwrap(),
    )
}

pub fn pending(
    event_type: &str,
    payload: Option<Value>,
    constraints: Vec<UniqueConstraint>,
) -> PendingEvent {
    PendingEvent {
        event_type: EventType::try_new(event_type).unwrap(),
        payload,
        creator: "tester".to_owned(),
        unique_constraints: constraints,
    }
}

pub fn group(
    aggregate: &Aggregate,
    expected: ExpectedSequence,
    events: Vec<PendingEvent>,
) -> PendingPush {
    PendingPush {
        aggregate: aggregate.clone(),
        expected,
        events,
    }
}

/// A committed-looking event for feeding projection storage directly.
pub fn sample_event(
    instance_id: &InstanceId,
    aggregate_id: &str,
    sequence: u64,
    position: u64,
    event_type: &str,
) -> Event {
    Event {
        instance_id: instance_id.clone(),
        resource_owner: ResourceOwner::try_new("org-1").unwrap(),
        aggregate_type: AggregateType::try_new("user").unwrap(),
        aggregate_id: AggregateId::try_new(aggregate_id).unwrap(),
        aggregate_version: AggregateVersion::try_new("v1").unwrap(),
        sequence: Sequence::new(sequence),
        position: Position::new(position),
        event_type: EventType::try_new(event_type).unwrap(),
        created_at: chrono::Utc::now(),
        payload: None,
        creator: "tester".to_owned(),
    }
}

pub fn users_table() -> TableDef {
    TableDef::new(USERS_TABLE)
        .column(ColumnDef::text("instance_id"))
        .column(ColumnDef::text("id"))
        .column(ColumnDef::text("username"))
        .primary_key(["instance_id", "id"])
}

/// Registers a user with their username; the projection suite pushes events
/// through the full facade with this command.
#[derive(Debug, Serialize)]
pub struct AddUser {
    pub username: String,
}

impl Command for AddUser {
    fn event_type(&self) -> EventType {
        EventType::try_new("user.added").unwrap()
    }

    fn creator(&self) -> String {
        "tester".to_owned()
    }

    fn payload(&self) -> Result<Option<Value>, serde_json::Error> {
        to_payload(self)
    }
}
