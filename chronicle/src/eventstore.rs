//! The event store facade.
//!
//! [`Eventstore`] is the single entry point for writing and reading events.
//! It lowers [`AggregateEvents`] groups into the storage port's pending
//! shapes, rejects pushes that conflict with themselves before any storage
//! work, and fans out an in-process notice after every successful push so
//! projections can catch up without polling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::instrument;

use crate::command::AggregateEvents;
use crate::constraint::ConstraintAction;
use crate::error::{EventStoreError, EventStoreResult};
use crate::event::Event;
use crate::search::SearchQuery;
use crate::store::{EventStorage, PendingEvent, PendingPush};
use crate::types::{AggregateType, InstanceId, Position};
use crate::write_model::QueryReducer;

/// Push notices a slow subscriber may buffer before it starts losing them.
/// Losing notices is safe: they are wake hints, not data.
const NOTICE_CAPACITY: usize = 256;

/// Announcement of a successful push.
#[derive(Debug, Clone)]
pub struct PushNotice {
    /// Tenant the push belonged to.
    pub instance_id: InstanceId,
    /// Aggregate types touched by the push, deduplicated, in first-touch
    /// order.
    pub aggregate_types: Vec<AggregateType>,
    /// Position of the last committed event of the push.
    pub position: Position,
}

/// Live feed of [`PushNotice`]s from one [`Eventstore`].
///
/// A subscriber that falls behind loses notices, never events: consumers are
/// expected to re-read the log from their own stored position whenever they
/// wake.
pub struct EventSubscription {
    receiver: broadcast::Receiver<PushNotice>,
}

impl EventSubscription {
    /// Waits for the next notice.
    ///
    /// Skips over overflow silently. Returns `None` once the originating
    /// store has been dropped.
    pub async fn recv(&mut self) -> Option<PushNotice> {
        loop {
            match self.receiver.recv().await {
                Ok(notice) => return Some(notice),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The multi-tenant event store.
///
/// Cheap to clone; all clones share the backend and the notice channel.
#[derive(Clone)]
pub struct Eventstore {
    storage: Arc<dyn EventStorage>,
    notices: broadcast::Sender<PushNotice>,
}

impl Eventstore {
    /// Wraps a storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn EventStorage>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { storage, notices }
    }

    /// Appends command groups for one tenant atomically.
    ///
    /// Either every command of every group commits, or none do. Within a
    /// group, events are appended in command order with gapless sequences
    /// continuing from the aggregate's head; across the whole push, committed
    /// events carry globally unique positions that reflect commit order.
    ///
    /// A push whose groups carry no commands at all is a no-op and returns
    /// no events.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::ConstraintConflictInPush`] if the push claims the
    /// same unique key twice, [`EventStoreError::ConcurrentModification`] if
    /// a group's expected sequence no longer matches, and
    /// [`EventStoreError::UniqueConstraintViolated`] if a claimed key is
    /// already held.
    #[instrument(skip_all, fields(instance = %instance_id, groups = groups.len()))]
    pub async fn push(
        &self,
        instance_id: &InstanceId,
        groups: Vec<AggregateEvents>,
    ) -> EventStoreResult<Vec<Event>> {
        let pushes = lower(&groups)?;
        if pushes.iter().all(|push| push.events.is_empty()) {
            return Ok(Vec::new());
        }
        reject_conflicting_claims(&pushes)?;
        let events = self.storage.push(instance_id, pushes).await?;
        self.notify(instance_id, &events);
        Ok(events)
    }

    /// Reads events matching `query`, ordered by position.
    ///
    /// # Errors
    ///
    /// Propagates backend failures as [`EventStoreError::Storage`].
    pub async fn filter(&self, query: &SearchQuery) -> EventStoreResult<Vec<Event>> {
        self.storage.filter(query).await
    }

    /// Reads the reducer's query and folds every matching event into it,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Propagates backend failures and any error the reducer raises.
    pub async fn filter_to_reducer<R>(&self, reducer: &mut R) -> EventStoreResult<()>
    where
        R: QueryReducer + ?Sized,
    {
        let events = self.storage.filter(&reducer.query()).await?;
        for event in &events {
            reducer.reduce(event)?;
        }
        Ok(())
    }

    /// The position of the most recently committed event, across all
    /// tenants. `Position::ZERO` for an empty log.
    ///
    /// # Errors
    ///
    /// Propagates backend failures as [`EventStoreError::Storage`].
    pub async fn latest_position(&self) -> EventStoreResult<Position> {
        self.storage.latest_position().await
    }

    /// Tenants that committed at least one event within the past `window`.
    ///
    /// # Errors
    ///
    /// Propagates backend failures as [`EventStoreError::Storage`].
    pub async fn active_instances(&self, window: Duration) -> EventStoreResult<Vec<InstanceId>> {
        self.storage.active_instances(window).await
    }

    /// Verifies the backend is reachable.
    ///
    /// # Errors
    ///
    /// [`EventStoreError::Storage`] when it is not.
    pub async fn ping(&self) -> EventStoreResult<()> {
        self.storage.ping().await
    }

    /// Opens a live feed of push notices.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.notices.subscribe(),
        }
    }

    fn notify(&self, instance_id: &InstanceId, events: &[Event]) {
        let Some(last) = events.last() else {
            return;
        };
        let mut aggregate_types = Vec::new();
        for event in events {
            if !aggregate_types.contains(&event.aggregate_type) {
                aggregate_types.push(event.aggregate_type.clone());
            }
        }
        // Err here means no live subscribers.
        self.notices
            .send(PushNotice {
                instance_id: instance_id.clone(),
                aggregate_types,
                position: last.position,
            })
            .ok();
    }
}

fn lower(groups: &[AggregateEvents]) -> EventStoreResult<Vec<PendingPush>> {
    let mut pushes = Vec::with_capacity(groups.len());
    for group in groups {
        let mut events = Vec::with_capacity(group.commands().len());
        for command in group.commands() {
            events.push(PendingEvent {
                event_type: command.event_type(),
                payload: command.payload()?,
                creator: command.creator(),
                unique_constraints: command.unique_constraints(),
            });
        }
        pushes.push(PendingPush {
            aggregate: group.aggregate().clone(),
            expected: group.expected(),
            events,
        });
    }
    Ok(pushes)
}

/// Rejects a push that adds the same unique key twice.
///
/// Scope is part of the key: a tenant-scoped add and a global add of the
/// same type and key do not conflict with each other.
fn reject_conflicting_claims(pushes: &[PendingPush]) -> EventStoreResult<()> {
    let mut claimed = HashSet::new();
    for push in pushes {
        for event in &push.events {
            for constraint in &event.unique_constraints {
                if constraint.action != ConstraintAction::Add {
                    continue;
                }
                let claim = (
                    constraint.global,
                    constraint.constraint_type.as_str(),
                    constraint.constraint_key.as_str(),
                );
                if !claimed.insert(claim) {
                    return Err(EventStoreError::ConstraintConflictInPush {
                        constraint_type: constraint.constraint_type.clone(),
                        constraint_key: constraint.constraint_key.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
