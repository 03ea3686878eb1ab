//! The projection engine: batch processing, scheduling, and poison-event
//! containment.
//!
//! One [`Handler`] owns one projection. Its [`Handler::tick`] performs a
//! single bounded catch-up cycle for one tenant and is directly testable;
//! [`Handler::start`] wraps ticking in a background worker that wakes on
//! relevant pushes and on a timer, and that stops cleanly on request.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, instrument, warn};

use crate::error::{ProjectionError, ProjectionResult};
use crate::eventstore::{EventSubscription, Eventstore, PushNotice};
use crate::projection::statement::Statement;
use crate::projection::store::{FailedEvent, ProjectionStorage};
use crate::projection::Projection;
use crate::search::{AggregateFilter, SearchQuery};
use crate::types::{InstanceId, Position};

/// Tuning knobs of one projection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Maximum events fetched per batch.
    pub bulk_limit: u64,
    /// How often the worker sweeps all active tenants, regardless of pushes.
    pub requeue_every: Duration,
    /// Failed executions an event is allowed before it is skipped.
    pub max_failure_count: u32,
    /// Deadline for one batch, fetch through commit.
    pub transaction_duration: Duration,
    /// How far back to look when listing tenants with recent activity.
    pub active_instance_window: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            bulk_limit: 100,
            requeue_every: Duration::from_secs(180),
            max_failure_count: 5,
            transaction_duration: Duration::from_secs(30),
            active_instance_window: Duration::from_secs(3600),
        }
    }
}

/// What one [`Handler::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another worker holds the tenant's lock; nothing was done.
    LockBusy,
    /// No events newer than the stored position.
    UpToDate,
    /// A batch was processed.
    Applied {
        /// Events whose statements were applied (skipped events excluded).
        applied: usize,
        /// The stored position after the batch.
        position: Position,
        /// Whether another batch is likely waiting.
        more: bool,
    },
}

/// Drives one projection over one event store.
pub struct Handler {
    projection: Arc<dyn Projection>,
    eventstore: Eventstore,
    storage: Arc<dyn ProjectionStorage>,
    config: HandlerConfig,
}

impl Handler {
    /// Creates a handler; call [`Handler::init`] once before processing.
    #[must_use]
    pub fn new(
        projection: Arc<dyn Projection>,
        eventstore: Eventstore,
        storage: Arc<dyn ProjectionStorage>,
        config: HandlerConfig,
    ) -> Self {
        Self {
            projection,
            eventstore,
            storage,
            config,
        }
    }

    /// Name of the projection this handler drives.
    #[must_use]
    pub fn projection_name(&self) -> &str {
        self.projection.name()
    }

    /// Prepares the projection's read table and bookkeeping. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates projection storage failures.
    pub async fn init(&self) -> ProjectionResult<()> {
        self.storage
            .init(self.projection.name(), &self.projection.table())
            .await
    }

    /// Runs one bounded catch-up cycle for `instance_id`.
    ///
    /// Takes the tenant's work lock without waiting (skipping the cycle if
    /// another worker holds it), fetches at most `bulk_limit` events past the
    /// stored position, folds them through the projection's reducer, and
    /// applies the resulting statements together with the position advance in
    /// one transaction.
    ///
    /// A reducer failure is recorded in the failed-event ledger; the batch
    /// halts just before the failing event until its failure count exceeds
    /// `max_failure_count`, after which the event is skipped for good. Other
    /// tenants are unaffected either way.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Timeout`] if the batch exceeds
    /// `transaction_duration` (the stored position is then unchanged), and
    /// any storage or event log failure. None of these advance the position.
    #[instrument(skip(self), fields(projection = self.projection.name(), instance = %instance_id))]
    pub async fn tick(&self, instance_id: &InstanceId) -> ProjectionResult<TickOutcome> {
        let Some(guard) = self
            .storage
            .try_lock(self.projection.name(), instance_id)
            .await?
        else {
            debug!("tenant is locked by another worker, skipping cycle");
            return Ok(TickOutcome::LockBusy);
        };

        let outcome = timeout(
            self.config.transaction_duration,
            self.process_batch(instance_id),
        )
        .await
        .map_err(|_elapsed| ProjectionError::Timeout(self.config.transaction_duration))?;

        drop(guard);
        outcome
    }

    async fn process_batch(&self, instance_id: &InstanceId) -> ProjectionResult<TickOutcome> {
        let name = self.projection.name();
        let from = self.storage.position(name, instance_id).await?;
        let query = batch_query(
            self.projection.as_ref(),
            instance_id,
            from,
            self.config.bulk_limit,
        );
        let events = self.eventstore.filter(&query).await?;
        if events.is_empty() {
            return Ok(TickOutcome::UpToDate);
        }
        let full_batch =
            u64::try_from(events.len()).map_or(true, |fetched| fetched >= self.config.bulk_limit);

        let mut statements: Vec<Statement> = Vec::new();
        let mut applied_through: Option<Position> = None;
        let mut applied = 0_usize;
        let mut halted = false;

        for event in &events {
            match self.projection.reduce(event) {
                Ok(batch) => {
                    statements.extend(batch);
                    applied_through = Some(event.position);
                    applied += 1;
                }
                Err(error) if error.is_event_failure() => {
                    let count = self
                        .storage
                        .record_failure(name, event, &error.to_string())
                        .await?;
                    if count > self.config.max_failure_count {
                        warn!(
                            aggregate = %event.aggregate_id,
                            sequence = %event.sequence,
                            failures = count,
                            "skipping event after repeated reducer failures"
                        );
                        applied_through = Some(event.position);
                        continue;
                    }
                    warn!(
                        aggregate = %event.aggregate_id,
                        sequence = %event.sequence,
                        failures = count,
                        %error,
                        "reducer failed, halting batch before the event"
                    );
                    halted = true;
                    break;
                }
                Err(error) => return Err(error),
            }
        }

        let Some(position) = applied_through else {
            // The very first event failed and is not yet skippable.
            return Ok(TickOutcome::Applied {
                applied: 0,
                position: from,
                more: true,
            });
        };

        self.storage
            .apply(name, instance_id, &statements, position)
            .await?;
        Ok(TickOutcome::Applied {
            applied,
            position,
            more: halted || full_batch,
        })
    }

    /// Catches `instance_id` up until no more full batches are waiting.
    ///
    /// Returns the stored position afterwards, usable for read-your-writes
    /// checks against the projection's tables.
    ///
    /// # Errors
    ///
    /// Propagates the first failing cycle.
    pub async fn trigger(&self, instance_id: &InstanceId) -> ProjectionResult<Position> {
        loop {
            match self.tick(instance_id).await? {
                TickOutcome::Applied { more: true, .. } => {}
                TickOutcome::Applied { position, .. } => return Ok(position),
                TickOutcome::LockBusy | TickOutcome::UpToDate => {
                    return self
                        .storage
                        .position(self.projection.name(), instance_id)
                        .await;
                }
            }
        }
    }

    /// The position up to which `instance_id`'s events have been applied.
    ///
    /// # Errors
    ///
    /// Propagates projection storage failures.
    pub async fn latest_position(&self, instance_id: &InstanceId) -> ProjectionResult<Position> {
        self.storage
            .position(self.projection.name(), instance_id)
            .await
    }

    /// The failed-event ledger, optionally narrowed to one tenant.
    ///
    /// # Errors
    ///
    /// Propagates projection storage failures.
    pub async fn failed_events(
        &self,
        instance_id: Option<&InstanceId>,
    ) -> ProjectionResult<Vec<FailedEvent>> {
        self.storage
            .failed_events(self.projection.name(), instance_id)
            .await
    }

    /// Drops the tenant's projected state so the next cycle replays it from
    /// the start of the log.
    ///
    /// # Errors
    ///
    /// Fails without touching anything if another worker is processing the
    /// tenant right now.
    pub async fn rebuild(&self, instance_id: &InstanceId) -> ProjectionResult<()> {
        let name = self.projection.name();
        let Some(guard) = self.storage.try_lock(name, instance_id).await? else {
            return Err(ProjectionError::Storage(
                "tenant is being processed, rebuild needs it idle".to_owned(),
            ));
        };
        let result = self.storage.reset(name, instance_id).await;
        drop(guard);
        result
    }

    /// Spawns the background worker for this projection.
    ///
    /// The worker sweeps all active tenants immediately, then wakes on every
    /// push touching an aggregate type the projection is interested in and on
    /// the `requeue_every` timer. Stop it with [`HandlerHandle::stop`];
    /// dropping the handle stops it too.
    #[must_use]
    pub fn start(self: Arc<Self>) -> HandlerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscription = self.eventstore.subscribe();
        let worker = Worker {
            handler: self,
            subscription,
            shutdown: shutdown_rx,
        };
        let join = tokio::spawn(worker.run());
        HandlerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Controls a running projection worker.
pub struct HandlerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl HandlerHandle {
    /// Signals the worker to stop and waits for in-flight work to finish.
    pub async fn stop(self) {
        // Err means the worker already exited.
        self.shutdown.send(true).ok();
        if self.join.await.is_err() {
            warn!("projection worker panicked before shutdown");
        }
    }

    /// Whether the worker task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}

struct Worker {
    handler: Arc<Handler>,
    subscription: EventSubscription,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        let mut requeue = interval(self.handler.config.requeue_every);
        requeue.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = requeue.tick() => self.sweep().await,
                notice = self.subscription.recv() => match notice {
                    Some(notice) => self.on_push(notice).await,
                    None => break,
                },
                _ = self.shutdown.changed() => break,
            }
        }
        debug!(
            projection = self.handler.projection.name(),
            "projection worker stopped"
        );
    }

    async fn on_push(&self, notice: PushNotice) {
        if !relevant(self.handler.projection.as_ref(), &notice) {
            return;
        }
        if let Err(error) = self.handler.trigger(&notice.instance_id).await {
            warn!(
                projection = self.handler.projection.name(),
                instance = %notice.instance_id,
                %error,
                "catch-up after push failed"
            );
        }
    }

    async fn sweep(&self) {
        let window = self.handler.config.active_instance_window;
        let instances = match self.handler.eventstore.active_instances(window).await {
            Ok(instances) => instances,
            Err(error) => {
                warn!(
                    projection = self.handler.projection.name(),
                    %error,
                    "could not list active tenants"
                );
                return;
            }
        };
        for instance_id in instances {
            if let Err(error) = self.handler.trigger(&instance_id).await {
                warn!(
                    projection = self.handler.projection.name(),
                    instance = %instance_id,
                    %error,
                    "scheduled catch-up failed"
                );
            }
        }
    }
}

fn batch_query(
    projection: &dyn Projection,
    instance_id: &InstanceId,
    after: Position,
    limit: u64,
) -> SearchQuery {
    let mut builder = SearchQuery::builder(instance_id.clone())
        .position_after(after)
        .limit(limit);
    for interest in projection.interests() {
        let mut filter = AggregateFilter::new(interest.aggregate_type);
        if !interest.event_types.is_empty() {
            filter = filter.event_types(interest.event_types);
        }
        builder = builder.filter(filter);
    }
    builder.build()
}

fn relevant(projection: &dyn Projection, notice: &PushNotice) -> bool {
    let interests = projection.interests();
    if interests.is_empty() {
        return true;
    }
    notice
        .aggregate_types
        .iter()
        .any(|aggregate_type| {
            interests
                .iter()
                .any(|interest| interest.aggregate_type == *aggregate_type)
        })
}
