//! The in-memory event log.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chronicle::store::{EventStorage, PendingPush};
use chronicle::{
    AggregateId, AggregateType, ConstraintAction, Event, EventStoreError, EventStoreResult,
    InstanceId, Position, SearchQuery, Sequence,
};

/// Identity of one claimed unique key; `instance_id` is `None` for keys
/// enforced across all tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConstraintKey {
    instance_id: Option<InstanceId>,
    constraint_type: String,
    constraint_key: String,
}

type AggregateHead = (InstanceId, AggregateType, AggregateId);

#[derive(Default)]
struct Log {
    /// Committed events in position order.
    events: Vec<Event>,
    /// Current sequence per aggregate.
    heads: HashMap<AggregateHead, Sequence>,
    /// Currently claimed unique keys.
    constraints: HashSet<ConstraintKey>,
    /// Last allocated position.
    position: u64,
    /// Last commit time per tenant.
    activity: HashMap<InstanceId, DateTime<Utc>>,
}

/// Thread-safe in-memory event store for testing.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed events, across all tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.read().expect("RwLock poisoned").events.len()
    }

    /// Whether the log holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStorage for InMemoryEventStore {
    async fn push(
        &self,
        instance_id: &InstanceId,
        pushes: Vec<PendingPush>,
    ) -> EventStoreResult<Vec<Event>> {
        let mut log = self.log.write().expect("RwLock poisoned");

        // Validate everything before mutating, so a failed push commits
        // nothing.
        let mut working_heads: HashMap<AggregateHead, Sequence> = HashMap::new();
        for push in &pushes {
            let head = (
                instance_id.clone(),
                push.aggregate.aggregate_type.clone(),
                push.aggregate.id.clone(),
            );
            let current = working_heads
                .get(&head)
                .or_else(|| log.heads.get(&head))
                .copied()
                .unwrap_or(Sequence::ZERO);
            if !push.expected.matches(current) {
                return Err(EventStoreError::ConcurrentModification {
                    aggregate_type: push.aggregate.aggregate_type.clone(),
                    aggregate_id: push.aggregate.id.clone(),
                    expected: push.expected,
                    current,
                });
            }
            let mut next = current;
            for _ in &push.events {
                next = next.next();
            }
            working_heads.insert(head, next);
        }

        let mut working_constraints = log.constraints.clone();
        for push in &pushes {
            for event in &push.events {
                for constraint in &event.unique_constraints {
                    let key = ConstraintKey {
                        instance_id: if constraint.global {
                            None
                        } else {
                            Some(instance_id.clone())
                        },
                        constraint_type: constraint.constraint_type.clone(),
                        constraint_key: constraint.constraint_key.clone(),
                    };
                    match constraint.action {
                        ConstraintAction::Add => {
                            if !working_constraints.insert(key) {
                                return Err(EventStoreError::UniqueConstraintViolated {
                                    constraint_type: constraint.constraint_type.clone(),
                                    constraint_key: constraint.constraint_key.clone(),
                                    message: constraint.conflict_message.clone(),
                                });
                            }
                        }
                        ConstraintAction::Remove => {
                            working_constraints.remove(&key);
                        }
                    }
                }
            }
        }

        let now = Utc::now();
        let mut committed = Vec::new();
        for push in pushes {
            let head = (
                instance_id.clone(),
                push.aggregate.aggregate_type.clone(),
                push.aggregate.id.clone(),
            );
            let mut sequence = committed
                .iter()
                .rev()
                .find(|event: &&Event| {
                    event.aggregate_type == push.aggregate.aggregate_type
                        && event.aggregate_id == push.aggregate.id
                })
                .map_or_else(
                    || log.heads.get(&head).copied().unwrap_or(Sequence::ZERO),
                    |event| event.sequence,
                );
            for pending in push.events {
                sequence = sequence.next();
                log.position += 1;
                committed.push(Event {
                    instance_id: instance_id.clone(),
                    resource_owner: push.aggregate.resource_owner.clone(),
                    aggregate_type: push.aggregate.aggregate_type.clone(),
                    aggregate_id: push.aggregate.id.clone(),
                    aggregate_version: push.aggregate.version.clone(),
                    sequence,
                    position: Position::new(log.position),
                    event_type: pending.event_type,
                    created_at: now,
                    payload: pending.payload,
                    creator: pending.creator,
                });
            }
            log.heads.insert(head, sequence);
        }

        log.constraints = working_constraints;
        log.activity.insert(instance_id.clone(), now);
        log.events.extend(committed.iter().cloned());
        Ok(committed)
    }

    async fn filter(&self, query: &SearchQuery) -> EventStoreResult<Vec<Event>> {
        let log = self.log.read().expect("RwLock poisoned");
        let mut events: Vec<Event> = log
            .events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect();
        if query.is_descending() {
            events.reverse();
        }
        if let Some(limit) = query.limit() {
            events.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        Ok(events)
    }

    async fn latest_position(&self) -> EventStoreResult<Position> {
        let log = self.log.read().expect("RwLock poisoned");
        Ok(Position::new(log.position))
    }

    async fn active_instances(&self, window: Duration) -> EventStoreResult<Vec<InstanceId>> {
        let delta = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(delta)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let log = self.log.read().expect("RwLock poisoned");
        let mut instances: Vec<InstanceId> = log
            .activity
            .iter()
            .filter(|(_, last)| **last >= cutoff)
            .map(|(instance_id, _)| instance_id.clone())
            .collect();
        instances.sort();
        Ok(instances)
    }

    async fn ping(&self) -> EventStoreResult<()> {
        Ok(())
    }
}
