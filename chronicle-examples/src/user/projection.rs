//! Read table of users, one row per live user.

use chronicle::projection::{Column, ColumnDef, Interest, Projection, Statement, TableDef};
use chronicle::{Event, ProjectionResult};

use super::events::{
    event_type, user_aggregate_type, UserEvent, USER_ADDED, USER_REMOVED, USER_RENAMED,
};

/// Name of the read table [`UsersProjection`] maintains.
pub const USERS_TABLE: &str = "users_projection_v1";

/// Projects user events into a queryable table keyed by tenant and user id.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsersProjection;

impl Projection for UsersProjection {
    fn name(&self) -> &str {
        "users"
    }

    fn table(&self) -> TableDef {
        TableDef::new(USERS_TABLE)
            .column(ColumnDef::text("instance_id"))
            .column(ColumnDef::text("id"))
            .column(ColumnDef::text("resource_owner"))
            .column(ColumnDef::text("username"))
            .column(ColumnDef::timestamp("changed_at"))
            .primary_key(["instance_id", "id"])
    }

    fn interests(&self) -> Vec<Interest> {
        vec![Interest::events(
            user_aggregate_type(),
            [USER_ADDED, USER_RENAMED, USER_REMOVED].map(event_type),
        )]
    }

    fn reduce(&self, event: &Event) -> ProjectionResult<Vec<Statement>> {
        let statement = match UserEvent::decode(event)? {
            Some(UserEvent::Added(payload)) => upsert(event, payload.username.into_inner()),
            Some(UserEvent::Renamed(payload)) => upsert(event, payload.username.into_inner()),
            Some(UserEvent::Removed) => Statement::delete(
                event,
                USERS_TABLE,
                vec![
                    Column::new("instance_id", event.instance_id.as_str()),
                    Column::new("id", event.aggregate_id.as_str()),
                ],
            ),
            None => Statement::noop(event),
        };
        Ok(vec![statement])
    }
}

fn upsert(event: &Event, username: String) -> Statement {
    Statement::upsert(
        event,
        USERS_TABLE,
        vec![
            Column::new("instance_id", event.instance_id.as_str()),
            Column::new("id", event.aggregate_id.as_str()),
        ],
        vec![
            Column::new("resource_owner", event.resource_owner.as_str()),
            Column::new("username", username),
            Column::new("changed_at", event.created_at),
        ],
    )
}
