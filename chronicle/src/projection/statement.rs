//! Statements: the write vocabulary of projections.
//!
//! A projection's reducer translates events into statements instead of
//! touching storage itself; the engine applies a whole batch of statements in
//! one transaction together with the position advance. Every statement is
//! stamped with the event that produced it so failures can be attributed.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::event::Event;
use crate::types::{AggregateId, InstanceId, Position, Sequence};

/// A typed cell value understood by every projection storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    /// UTF-8 text.
    Text(String),
    /// 64-bit signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
    /// Arbitrary JSON document.
    Json(Value),
    /// Explicit NULL, used to clear nullable cells.
    Null,
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ColumnValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for ColumnValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Value> for ColumnValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// A named cell, used both as a written value and as a filter condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name in the read table.
    pub name: String,
    /// The value to write or match.
    pub value: ColumnValue,
}

impl Column {
    /// Creates a cell.
    pub fn new(name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The effect of one statement on a read table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert the row identified by `keys`, or overwrite its `values` if it
    /// already exists. Idempotent, so re-applying a batch after a crash is
    /// safe.
    Upsert {
        /// Target read table.
        table: String,
        /// Identifying columns.
        keys: Vec<Column>,
        /// Non-identifying columns to write.
        values: Vec<Column>,
    },
    /// Delete all rows matching `conditions`.
    Delete {
        /// Target read table.
        table: String,
        /// Equality conditions, ANDed.
        conditions: Vec<Column>,
    },
    /// No table change; the event only advances the position.
    Noop,
}

/// One read-model mutation derived from one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Tenant of the source event.
    pub instance_id: InstanceId,
    /// Aggregate of the source event.
    pub aggregate_id: AggregateId,
    /// Sequence of the source event.
    pub sequence: Sequence,
    /// Position of the source event.
    pub position: Position,
    /// What to do.
    pub operation: Operation,
}

impl Statement {
    /// An upsert derived from `event`.
    #[must_use]
    pub fn upsert(
        event: &Event,
        table: impl Into<String>,
        keys: Vec<Column>,
        values: Vec<Column>,
    ) -> Self {
        Self::stamped(
            event,
            Operation::Upsert {
                table: table.into(),
                keys,
                values,
            },
        )
    }

    /// A delete derived from `event`.
    #[must_use]
    pub fn delete(event: &Event, table: impl Into<String>, conditions: Vec<Column>) -> Self {
        Self::stamped(
            event,
            Operation::Delete {
                table: table.into(),
                conditions,
            },
        )
    }

    /// A statement that changes nothing but still attributes the event.
    #[must_use]
    pub fn noop(event: &Event) -> Self {
        Self::stamped(event, Operation::Noop)
    }

    fn stamped(event: &Event, operation: Operation) -> Self {
        Self {
            instance_id: event.instance_id.clone(),
            aggregate_id: event.aggregate_id.clone(),
            sequence: event.sequence,
            position: event.position,
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateType, AggregateVersion, EventType, ResourceOwner};

    fn event() -> Event {
        Event {
            instance_id: InstanceId::try_new("inst-1").unwrap(),
            resource_owner: ResourceOwner::try_new("org-1").unwrap(),
            aggregate_type: AggregateType::try_new("user").unwrap(),
            aggregate_id: AggregateId::try_new("u-1").unwrap(),
            aggregate_version: AggregateVersion::try_new("v1").unwrap(),
            sequence: Sequence::new(4),
            position: Position::new(17),
            event_type: EventType::try_new("user.added").unwrap(),
            created_at: Utc::now(),
            payload: None,
            creator: "tester".to_owned(),
        }
    }

    #[test]
    fn statements_are_stamped_with_their_source_event() {
        let statement = Statement::upsert(
            &event(),
            "users_projection",
            vec![Column::new("id", "u-1")],
            vec![Column::new("username", "alice")],
        );

        assert_eq!(statement.aggregate_id.as_str(), "u-1");
        assert_eq!(statement.sequence, Sequence::new(4));
        assert_eq!(statement.position, Position::new(17));
    }

    #[test]
    fn column_values_convert_from_native_types() {
        assert_eq!(ColumnValue::from("alice"), ColumnValue::Text("alice".to_owned()));
        assert_eq!(ColumnValue::from(42_i64), ColumnValue::Int(42));
        assert_eq!(ColumnValue::from(7_u32), ColumnValue::Int(7));
        assert_eq!(ColumnValue::from(true), ColumnValue::Bool(true));
        assert_eq!(ColumnValue::from(None::<String>), ColumnValue::Null);
        assert_eq!(
            ColumnValue::from(Some("bob")),
            ColumnValue::Text("bob".to_owned())
        );
    }

    #[test]
    fn noop_keeps_the_attribution() {
        let statement = Statement::noop(&event());
        assert_eq!(statement.operation, Operation::Noop);
        assert_eq!(statement.position, Position::new(17));
    }
}
