//! PostgreSQL adapter for the Chronicle event sourcing core.
//!
//! Provides [`PostgresEventStore`] (the durable event log) and
//! [`PostgresProjectionStore`] (projection state, work claims, and the
//! failed-event ledger), both backed by one `sqlx` connection pool.
//!
//! The schema lives in `migrations/` and is applied with
//! [`PostgresEventStore::migrate`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::num::NonZeroU32;
use std::time::Duration;

use chronicle::{EventStoreError, ProjectionError};
use nutype::nutype;
use thiserror::Error;
use tracing::error;

mod event_store;
mod projection_store;

pub use event_store::PostgresEventStore;
pub use projection_store::PostgresProjectionStore;

/// Errors raised while setting up the adapter itself.
///
/// Operational errors after setup surface through the `chronicle` error types
/// instead.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// Applying the bundled migrations failed.
    #[error("failed to run postgres migrations")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10).
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds).
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes).
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: NonZeroU32 = match NonZeroU32::new(10) {
            Some(value) => value,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Maps a backend failure on the event log path, logging it at the boundary.
pub(crate) fn store_failure(operation: &str, error: &sqlx::Error) -> EventStoreError {
    error!(operation, error = %error, "postgres operation failed");
    EventStoreError::Storage(format!("{operation}: {error}"))
}

/// Maps a backend failure on the projection path, logging it at the boundary.
pub(crate) fn projection_failure(operation: &str, error: &sqlx::Error) -> ProjectionError {
    error!(operation, error = %error, "postgres operation failed");
    ProjectionError::Storage(format!("{operation}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_limits_the_pool() {
        let config = PostgresConfig::default();
        let max: NonZeroU32 = config.max_connections.into();
        assert_eq!(max.get(), 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }
}
