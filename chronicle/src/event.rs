//! The immutable event envelope stored in the log.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventStoreError;
use crate::types::{
    AggregateId, AggregateType, AggregateVersion, EventType, InstanceId, Position, ResourceOwner,
    Sequence,
};

/// One committed fact of the event log.
///
/// Events are immutable once committed. `sequence` orders events within one
/// aggregate (gapless, starting at 1); `position` orders events across the
/// whole log and drives projection catch-up. Both are assigned by the storage
/// adapter at commit time — callers never choose them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// The tenant this event belongs to.
    pub instance_id: InstanceId,
    /// The sub-tenant (e.g. organization) owning the aggregate.
    pub resource_owner: ResourceOwner,
    /// The kind of the aggregate the event belongs to.
    pub aggregate_type: AggregateType,
    /// The aggregate the event belongs to.
    pub aggregate_id: AggregateId,
    /// The schema revision of the aggregate's event vocabulary.
    pub aggregate_version: AggregateVersion,
    /// Gapless per-aggregate counter, starting at 1.
    pub sequence: Sequence,
    /// Global ordering token assigned at commit.
    pub position: Position,
    /// The type of the event, e.g. `user.added`.
    pub event_type: EventType,
    /// Commit timestamp.
    pub created_at: DateTime<Utc>,
    /// Structured payload; `None` for events that carry no data.
    pub payload: Option<Value>,
    /// The actor that caused the event (user id, or a service identity).
    pub creator: String,
}

impl Event {
    /// Deserializes the payload into a typed value.
    ///
    /// An absent payload deserializes as JSON `null`, so targets that model
    /// optional data (e.g. `Option<T>`) parse cleanly from payload-less
    /// events.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, EventStoreError> {
        let value = self.payload.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(EventStoreError::from)
    }
}
