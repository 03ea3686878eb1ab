//! The user aggregate's event vocabulary.
//!
//! Write model and projection dispatch over the closed [`UserEvent`] set;
//! event types outside it decode to `None` and fall through to their no-op
//! cases.

use serde::{Deserialize, Serialize};

use chronicle::{AggregateType, Event, EventStoreResult, EventType};

use super::types::Username;

/// Aggregate type tag of all user events.
pub const USER_AGGREGATE: &str = "user";
/// A user was created.
pub const USER_ADDED: &str = "user.added";
/// A user's username changed.
pub const USER_RENAMED: &str = "user.renamed";
/// A user was deleted.
pub const USER_REMOVED: &str = "user.removed";

/// The user aggregate type as a typed tag.
#[must_use]
pub fn user_aggregate_type() -> AggregateType {
    AggregateType::try_new(USER_AGGREGATE).expect("static aggregate type is valid")
}

pub(crate) fn event_type(tag: &str) -> EventType {
    EventType::try_new(tag).expect("static event types are valid")
}

/// Payload of [`USER_ADDED`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAdded {
    /// The claimed initial username.
    pub username: Username,
}

/// Payload of [`USER_RENAMED`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRenamed {
    /// The newly claimed username.
    pub username: Username,
}

/// One decoded user event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    /// The user came into existence.
    Added(UserAdded),
    /// The user changed their username.
    Renamed(UserRenamed),
    /// The user was deleted.
    Removed,
}

impl UserEvent {
    /// Decodes an envelope into the vocabulary; `None` for foreign events.
    ///
    /// # Errors
    ///
    /// Payload deserialization failures.
    pub fn decode(event: &Event) -> EventStoreResult<Option<Self>> {
        match event.event_type.as_str() {
            USER_ADDED => Ok(Some(Self::Added(event.parse_payload()?))),
            USER_RENAMED => Ok(Some(Self::Renamed(event.parse_payload()?))),
            USER_REMOVED => Ok(Some(Self::Removed)),
            _ => Ok(None),
        }
    }
}
