//! Projection state on PostgreSQL: read tables, positions, work locks, and
//! the failed-event ledger.
//!
//! One batch of statements and its position advance commit in a single
//! transaction, so a crash can never leave rows ahead of the stored position.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Connection, Postgres, Row};
use tracing::{debug, instrument};

use chronicle::projection::{
    Column, ColumnKind, ColumnValue, FailedEvent, Operation, ProcessingGuard, ProjectionStorage,
    Statement, TableDef,
};
use chronicle::{
    AggregateId, Event, InstanceId, Position, ProjectionError, ProjectionResult, Sequence,
};

use crate::projection_failure;

/// Projection storage backed by PostgreSQL.
///
/// Table definitions registered through `init` are kept in memory; every
/// process re-registers its projections at startup before processing.
#[derive(Debug, Clone)]
pub struct PostgresProjectionStore {
    pool: PgPool,
    defs: Arc<RwLock<HashMap<String, TableDef>>>,
}

impl PostgresProjectionStore {
    /// Wraps an existing connection pool, typically shared with the event
    /// store.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            defs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn table_for(&self, projection: &str) -> ProjectionResult<TableDef> {
        self.defs
            .read()
            .expect("RwLock poisoned")
            .get(projection)
            .cloned()
            .ok_or_else(|| {
                ProjectionError::Storage(format!("projection {projection} is not initialized"))
            })
    }
}

/// Holds the advisory lock for one (projection, tenant) pair.
///
/// The connection is detached from the pool while the lock is held; closing
/// it on drop is what releases the lock, even when the holding task is
/// cancelled mid-batch.
struct PostgresGuard {
    conn: Option<PgConnection>,
}

impl ProcessingGuard for PostgresGuard {}

impl Drop for PostgresGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Outside a runtime the connection is simply dropped; the socket
            // close still ends the session and releases the advisory lock.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    conn.close().await.ok();
                });
            }
        }
    }
}

#[async_trait]
impl ProjectionStorage for PostgresProjectionStore {
    async fn init(&self, projection: &str, table: &TableDef) -> ProjectionResult<()> {
        let ddl = build_create_table(table);
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|error| projection_failure("create read table", &error))?;
        self.defs
            .write()
            .expect("RwLock poisoned")
            .insert(projection.to_owned(), table.clone());
        debug!(projection, table = %table.name, "projection initialized");
        Ok(())
    }

    async fn try_lock(
        &self,
        projection: &str,
        instance_id: &InstanceId,
    ) -> ProjectionResult<Option<Box<dyn ProcessingGuard>>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| projection_failure("acquire lock connection", &error))?;
        let locked: bool =
            sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtextextended($1, 0))")
                .bind(format!("{projection}|{instance_id}"))
                .fetch_one(&mut *conn)
                .await
                .map_err(|error| projection_failure("take work lock", &error))?;

        if locked {
            Ok(Some(Box::new(PostgresGuard {
                conn: Some(conn.detach()),
            })))
        } else {
            Ok(None)
        }
    }

    async fn position(
        &self,
        projection: &str,
        instance_id: &InstanceId,
    ) -> ProjectionResult<Position> {
        let stored: Option<i64> = sqlx::query_scalar(
            "SELECT position FROM projection_positions WHERE projection = $1 AND instance_id = $2",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| projection_failure("read projection position", &error))?;

        stored.map_or_else(
            || Ok(Position::ZERO),
            |value| {
                u64::try_from(value).map(Position::new).map_err(|_| {
                    ProjectionError::Storage("negative projection position".to_owned())
                })
            },
        )
    }

    #[instrument(skip_all, fields(projection = projection, instance = %instance_id, statements = statements.len()))]
    async fn apply(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        statements: &[Statement],
        position: Position,
    ) -> ProjectionResult<()> {
        let def = self.table_for(projection)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| projection_failure("begin apply transaction", &error))?;

        for statement in statements {
            let Some((sql, binds)) = build_statement(&def, statement)? else {
                continue;
            };
            bind_columns(sqlx::query(&sql), &binds)
                .execute(&mut *tx)
                .await
                .map_err(|error| projection_failure("apply statement", &error))?;
        }

        sqlx::query(
            "INSERT INTO projection_positions (projection, instance_id, position, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (projection, instance_id) \
             DO UPDATE SET position = EXCLUDED.position, updated_at = now()",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .bind(position_i64(position)?)
        .execute(&mut *tx)
        .await
        .map_err(|error| projection_failure("advance projection position", &error))?;

        tx.commit()
            .await
            .map_err(|error| projection_failure("commit apply transaction", &error))?;
        Ok(())
    }

    async fn record_failure(
        &self,
        projection: &str,
        event: &Event,
        error: &str,
    ) -> ProjectionResult<u32> {
        let count: i32 = sqlx::query_scalar(
            "INSERT INTO projection_failures \
             (projection, instance_id, aggregate_id, sequence, failure_count, error, last_failed) \
             VALUES ($1, $2, $3, $4, 1, $5, now()) \
             ON CONFLICT (projection, instance_id, aggregate_id, sequence) \
             DO UPDATE SET failure_count = projection_failures.failure_count + 1, \
             error = EXCLUDED.error, last_failed = now() \
             RETURNING failure_count",
        )
        .bind(projection)
        .bind(event.instance_id.as_str())
        .bind(event.aggregate_id.as_str())
        .bind(sequence_i64(event.sequence)?)
        .bind(error)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| projection_failure("record event failure", &error))?;

        u32::try_from(count)
            .map_err(|_| ProjectionError::Storage("failure count out of range".to_owned()))
    }

    async fn failed_events(
        &self,
        projection: &str,
        instance_id: Option<&InstanceId>,
    ) -> ProjectionResult<Vec<FailedEvent>> {
        let mut sql = String::from(
            "SELECT projection, instance_id, aggregate_id, sequence, failure_count, error, \
             last_failed FROM projection_failures WHERE projection = $1",
        );
        if instance_id.is_some() {
            sql.push_str(" AND instance_id = $2");
        }
        sql.push_str(" ORDER BY instance_id, aggregate_id, sequence");

        let mut query = sqlx::query(&sql).bind(projection);
        if let Some(instance_id) = instance_id {
            query = query.bind(instance_id.as_str());
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|error| projection_failure("read failed events", &error))?;

        rows.into_iter().map(|row| decode_failure(&row)).collect()
    }

    async fn reset(&self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<()> {
        let def = self.table_for(projection)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| projection_failure("begin reset transaction", &error))?;

        sqlx::query("DELETE FROM projection_positions WHERE projection = $1 AND instance_id = $2")
            .bind(projection)
            .bind(instance_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|error| projection_failure("reset projection position", &error))?;

        sqlx::query("DELETE FROM projection_failures WHERE projection = $1 AND instance_id = $2")
            .bind(projection)
            .bind(instance_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|error| projection_failure("reset failure ledger", &error))?;

        // Rows are attributed to tenants by their instance_id column.
        let sql = format!("DELETE FROM {} WHERE instance_id = $1", def.name);
        sqlx::query(&sql)
            .bind(instance_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|error| projection_failure("reset read table", &error))?;

        tx.commit()
            .await
            .map_err(|error| projection_failure("commit reset transaction", &error))?;
        Ok(())
    }
}

const fn column_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Text => "TEXT",
        ColumnKind::BigInt => "BIGINT",
        ColumnKind::Boolean => "BOOLEAN",
        ColumnKind::Timestamp => "TIMESTAMPTZ",
        ColumnKind::Jsonb => "JSONB",
    }
}

/// Renders the `CREATE TABLE IF NOT EXISTS` DDL for a read table.
fn build_create_table(table: &TableDef) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut line = format!("{} {}", column.name, column_type(column.kind));
            if !column.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();
    if !table.primary_key.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", table.primary_key.join(", ")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table.name,
        parts.join(", ")
    )
}

/// Renders one statement as SQL plus its bind list, after validating it
/// against the registered table definition. `None` for noops.
///
/// NULL cells are rendered inline so every bound parameter keeps the concrete
/// type of its column kind.
fn build_statement(
    def: &TableDef,
    statement: &Statement,
) -> ProjectionResult<Option<(String, Vec<ColumnValue>)>> {
    match &statement.operation {
        Operation::Upsert {
            table,
            keys,
            values,
        } => {
            check_target(def, table, keys.iter().chain(values.iter()))?;
            let mut binds = Vec::new();
            let mut columns = Vec::new();
            let mut cells = Vec::new();
            for column in keys.iter().chain(values.iter()) {
                columns.push(column.name.clone());
                cells.push(render_value(&column.value, &mut binds));
            }
            let conflict = keys
                .iter()
                .map(|column| column.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let sql = if values.is_empty() {
                format!(
                    "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({conflict}) DO NOTHING",
                    columns.join(", "),
                    cells.join(", ")
                )
            } else {
                let updates = values
                    .iter()
                    .map(|column| format!("{0} = EXCLUDED.{0}", column.name))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "INSERT INTO {table} ({}) VALUES ({}) \
                     ON CONFLICT ({conflict}) DO UPDATE SET {updates}",
                    columns.join(", "),
                    cells.join(", ")
                )
            };
            Ok(Some((sql, binds)))
        }
        Operation::Delete { table, conditions } => {
            check_target(def, table, conditions.iter())?;
            let mut binds = Vec::new();
            let clauses: Vec<String> = conditions
                .iter()
                .map(|column| {
                    if matches!(column.value, ColumnValue::Null) {
                        format!("{} IS NULL", column.name)
                    } else {
                        let cell = render_value(&column.value, &mut binds);
                        format!("{} = {cell}", column.name)
                    }
                })
                .collect();
            let sql = if clauses.is_empty() {
                format!("DELETE FROM {table}")
            } else {
                format!("DELETE FROM {table} WHERE {}", clauses.join(" AND "))
            };
            Ok(Some((sql, binds)))
        }
        Operation::Noop => Ok(None),
    }
}

fn render_value(value: &ColumnValue, binds: &mut Vec<ColumnValue>) -> String {
    if matches!(value, ColumnValue::Null) {
        "NULL".to_owned()
    } else {
        binds.push(value.clone());
        format!("${}", binds.len())
    }
}

fn bind_columns<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    binds: &'q [ColumnValue],
) -> Query<'q, Postgres, PgArguments> {
    for value in binds {
        query = match value {
            ColumnValue::Text(text) => query.bind(text),
            ColumnValue::Int(int) => query.bind(*int),
            ColumnValue::Bool(flag) => query.bind(*flag),
            ColumnValue::Timestamp(at) => query.bind(*at),
            ColumnValue::Json(json) => query.bind(json),
            // Null never reaches the bind list; the builders render it inline.
            ColumnValue::Null => query,
        };
    }
    query
}

fn check_target<'a>(
    def: &TableDef,
    table: &str,
    columns: impl Iterator<Item = &'a Column>,
) -> ProjectionResult<()> {
    if table != def.name {
        return Err(ProjectionError::Storage(format!(
            "statement targets unknown table {table}, expected {}",
            def.name
        )));
    }
    for column in columns {
        if !def.columns.iter().any(|known| known.name == column.name) {
            return Err(ProjectionError::Storage(format!(
                "unknown column {} in table {table}",
                column.name
            )));
        }
    }
    Ok(())
}

fn decode_failure(row: &PgRow) -> ProjectionResult<FailedEvent> {
    let decode = |error: sqlx::Error| projection_failure("decode failure row", &error);
    let sequence: i64 = row.try_get("sequence").map_err(decode)?;
    let failure_count: i32 = row.try_get("failure_count").map_err(decode)?;
    let instance_id: String = row.try_get("instance_id").map_err(decode)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(decode)?;

    Ok(FailedEvent {
        projection: row.try_get("projection").map_err(decode)?,
        instance_id: InstanceId::try_new(instance_id)
            .map_err(|error| corrupt_ledger(&error.to_string()))?,
        aggregate_id: AggregateId::try_new(aggregate_id)
            .map_err(|error| corrupt_ledger(&error.to_string()))?,
        sequence: u64::try_from(sequence)
            .map(Sequence::new)
            .map_err(|_| corrupt_ledger("negative sequence"))?,
        failure_count: u32::try_from(failure_count)
            .map_err(|_| corrupt_ledger("negative failure count"))?,
        error: row.try_get("error").map_err(decode)?,
        last_failed: row.try_get("last_failed").map_err(decode)?,
    })
}

fn corrupt_ledger(detail: &str) -> ProjectionError {
    ProjectionError::Storage(format!("corrupt failure ledger row: {detail}"))
}

fn position_i64(position: Position) -> ProjectionResult<i64> {
    i64::try_from(position.get())
        .map_err(|_| ProjectionError::Storage("position exceeds storable range".to_owned()))
}

fn sequence_i64(sequence: Sequence) -> ProjectionResult<i64> {
    i64::try_from(sequence.get())
        .map_err(|_| ProjectionError::Storage("sequence exceeds storable range".to_owned()))
}
