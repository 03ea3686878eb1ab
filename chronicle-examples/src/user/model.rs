//! Current user state folded from the log.

use chronicle::{
    Aggregate, AggregateFilter, AggregateId, AggregateVersion, Event, EventStoreResult,
    Eventstore, InstanceId, QueryReducer, ResourceOwner, SearchQuery, Sequence, WriteModel,
};

use super::events::{user_aggregate_type, UserEvent};
use super::types::Username;

/// Write model of one user.
///
/// `username` is `None` both for users that never existed and for removed
/// ones; the embedded bookkeeping tells the two apart through its processed
/// sequence.
#[derive(Debug, Clone)]
pub struct UserModel {
    /// Shared write-model bookkeeping.
    pub model: WriteModel,
    /// The user's current username, if the user exists.
    pub username: Option<Username>,
}

impl UserModel {
    /// A model that has seen no events yet.
    #[must_use]
    pub fn new(instance_id: InstanceId, aggregate_id: AggregateId) -> Self {
        Self {
            model: WriteModel::new(instance_id, aggregate_id),
            username: None,
        }
    }

    /// Loads the user's current state from the log.
    ///
    /// # Errors
    ///
    /// Propagates filter and payload deserialization failures.
    pub async fn load(
        eventstore: &Eventstore,
        instance_id: &InstanceId,
        user_id: &AggregateId,
    ) -> EventStoreResult<Self> {
        let mut model = Self::new(instance_id.clone(), user_id.clone());
        eventstore.filter_to_reducer(&mut model).await?;
        Ok(model)
    }

    /// Whether the user currently exists (created and not removed).
    #[must_use]
    pub fn exists(&self) -> bool {
        self.username.is_some()
    }

    /// Whether this aggregate id has any history at all.
    #[must_use]
    pub fn has_history(&self) -> bool {
        self.model.processed_sequence > Sequence::ZERO
    }

    /// The aggregate reference a push based on this model targets.
    #[must_use]
    pub fn aggregate(&self, resource_owner: ResourceOwner) -> Aggregate {
        Aggregate::new(
            user_aggregate_type(),
            self.model.aggregate_id.clone(),
            resource_owner,
            AggregateVersion::try_new("v1").expect("static version is valid"),
        )
    }
}

impl QueryReducer for UserModel {
    fn query(&self) -> SearchQuery {
        SearchQuery::builder(self.model.instance_id.clone())
            .filter(
                AggregateFilter::new(user_aggregate_type())
                    .aggregate_id(self.model.aggregate_id.clone()),
            )
            .build()
    }

    fn reduce(&mut self, event: &Event) -> EventStoreResult<()> {
        match UserEvent::decode(event)? {
            Some(UserEvent::Added(payload)) => self.username = Some(payload.username),
            Some(UserEvent::Renamed(payload)) => self.username = Some(payload.username),
            Some(UserEvent::Removed) => self.username = None,
            None => {}
        }
        self.model.absorb(event);
        Ok(())
    }
}
