//! The in-memory projection store.
//!
//! Statements are applied against nested maps instead of SQL tables, with the
//! projection's `TableDef` used to reject unknown tables and columns — the
//! kind of mistake a relational backend would surface, caught here in tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chronicle::projection::{
    Column, ColumnValue, FailedEvent, Operation, ProcessingGuard, ProjectionStorage, Statement,
    TableDef,
};
use chronicle::{
    AggregateId, Event, InstanceId, Position, ProjectionError, ProjectionResult, Sequence,
};

/// One materialized row: column name to value.
pub type Row = BTreeMap<String, ColumnValue>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FailureKey {
    projection: String,
    instance_id: InstanceId,
    aggregate_id: AggregateId,
    sequence: Sequence,
}

struct FailureEntry {
    count: u32,
    error: String,
    last_failed: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    /// Registered table definition per projection.
    defs: HashMap<String, TableDef>,
    /// Table name to rows, keyed by the canonical form of their key columns.
    tables: HashMap<String, HashMap<String, Row>>,
    /// Applied position per (projection, tenant).
    positions: HashMap<(String, InstanceId), Position>,
    /// Held work locks.
    locks: HashSet<(String, InstanceId)>,
    /// The failed-event ledger.
    failures: HashMap<FailureKey, FailureEntry>,
}

/// Thread-safe in-memory projection store for testing.
#[derive(Clone, Default)]
pub struct InMemoryProjectionStore {
    state: Arc<RwLock<State>>,
}

struct MemoryGuard {
    state: Arc<RwLock<State>>,
    key: (String, InstanceId),
}

impl ProcessingGuard for MemoryGuard {}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.write() {
            state.locks.remove(&self.key);
        }
    }
}

impl InMemoryProjectionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of `table`, in key order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        let state = self.state.read().expect("RwLock poisoned");
        state.tables.get(table).map_or_else(Vec::new, |rows| {
            let mut all: Vec<(&String, &Row)> = rows.iter().collect();
            all.sort_by(|(left, _), (right, _)| left.cmp(right));
            all.into_iter().map(|(_, row)| row.clone()).collect()
        })
    }

    /// Rows of `table` matching every equality condition.
    #[must_use]
    pub fn find(&self, table: &str, conditions: &[Column]) -> Vec<Row> {
        self.rows(table)
            .into_iter()
            .filter(|row| matches_conditions(row, conditions))
            .collect()
    }
}

#[async_trait]
impl ProjectionStorage for InMemoryProjectionStore {
    async fn init(&self, projection: &str, table: &TableDef) -> ProjectionResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        state.tables.entry(table.name.clone()).or_default();
        state.defs.insert(projection.to_owned(), table.clone());
        Ok(())
    }

    async fn try_lock(
        &self,
        projection: &str,
        instance_id: &InstanceId,
    ) -> ProjectionResult<Option<Box<dyn ProcessingGuard>>> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let key = (projection.to_owned(), instance_id.clone());
        if !state.locks.insert(key.clone()) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryGuard {
            state: Arc::clone(&self.state),
            key,
        })))
    }

    async fn position(
        &self,
        projection: &str,
        instance_id: &InstanceId,
    ) -> ProjectionResult<Position> {
        let state = self.state.read().expect("RwLock poisoned");
        Ok(state
            .positions
            .get(&(projection.to_owned(), instance_id.clone()))
            .copied()
            .unwrap_or(Position::ZERO))
    }

    async fn apply(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        statements: &[Statement],
        position: Position,
    ) -> ProjectionResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let def = state
            .defs
            .get(projection)
            .ok_or_else(|| {
                ProjectionError::Storage(format!("projection {projection} is not initialized"))
            })?
            .clone();

        for statement in statements {
            match &statement.operation {
                Operation::Upsert {
                    table,
                    keys,
                    values,
                } => {
                    check_target(&def, table, keys.iter().chain(values.iter()))?;
                    let rows = state.tables.entry(table.clone()).or_default();
                    let row = rows.entry(canonical_key(keys)).or_default();
                    for column in keys.iter().chain(values.iter()) {
                        row.insert(column.name.clone(), column.value.clone());
                    }
                }
                Operation::Delete { table, conditions } => {
                    check_target(&def, table, conditions.iter())?;
                    if let Some(rows) = state.tables.get_mut(table) {
                        rows.retain(|_, row| !matches_conditions(row, conditions));
                    }
                }
                Operation::Noop => {}
            }
        }

        state
            .positions
            .insert((projection.to_owned(), instance_id.clone()), position);
        Ok(())
    }

    async fn record_failure(
        &self,
        projection: &str,
        event: &Event,
        error: &str,
    ) -> ProjectionResult<u32> {
        let mut state = self.state.write().expect("RwLock poisoned");
        let key = FailureKey {
            projection: projection.to_owned(),
            instance_id: event.instance_id.clone(),
            aggregate_id: event.aggregate_id.clone(),
            sequence: event.sequence,
        };
        let now = Utc::now();
        let entry = state.failures.entry(key).or_insert_with(|| FailureEntry {
            count: 0,
            error: String::new(),
            last_failed: now,
        });
        entry.count += 1;
        entry.error = error.to_owned();
        entry.last_failed = now;
        Ok(entry.count)
    }

    async fn failed_events(
        &self,
        projection: &str,
        instance_id: Option<&InstanceId>,
    ) -> ProjectionResult<Vec<FailedEvent>> {
        let state = self.state.read().expect("RwLock poisoned");
        let mut entries: Vec<FailedEvent> = state
            .failures
            .iter()
            .filter(|(key, _)| {
                key.projection == projection
                    && instance_id.map_or(true, |wanted| *wanted == key.instance_id)
            })
            .map(|(key, entry)| FailedEvent {
                projection: key.projection.clone(),
                instance_id: key.instance_id.clone(),
                aggregate_id: key.aggregate_id.clone(),
                sequence: key.sequence,
                failure_count: entry.count,
                error: entry.error.clone(),
                last_failed: entry.last_failed,
            })
            .collect();
        entries.sort_by(|left, right| {
            (&left.instance_id, &left.aggregate_id, left.sequence).cmp(&(
                &right.instance_id,
                &right.aggregate_id,
                right.sequence,
            ))
        });
        Ok(entries)
    }

    async fn reset(&self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<()> {
        let mut state = self.state.write().expect("RwLock poisoned");
        state
            .positions
            .remove(&(projection.to_owned(), instance_id.clone()));
        state
            .failures
            .retain(|key, _| !(key.projection == projection && key.instance_id == *instance_id));
        // Rows are attributed to tenants by their instance_id column.
        let table_name = state.defs.get(projection).map(|def| def.name.clone());
        if let Some(table_name) = table_name {
            let tenant = ColumnValue::Text(instance_id.to_string());
            if let Some(rows) = state.tables.get_mut(&table_name) {
                rows.retain(|_, row| row.get("instance_id") != Some(&tenant));
            }
        }
        Ok(())
    }
}

fn matches_conditions(row: &Row, conditions: &[Column]) -> bool {
    conditions
        .iter()
        .all(|condition| row.get(&condition.name) == Some(&condition.value))
}

fn canonical_key(keys: &[Column]) -> String {
    let mut parts: Vec<String> = keys
        .iter()
        .map(|column| format!("{}={}", column.name, canonical_value(&column.value)))
        .collect();
    parts.sort();
    parts.join("|")
}

fn canonical_value(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Text(text) => format!("t:{text}"),
        ColumnValue::Int(int) => format!("i:{int}"),
        ColumnValue::Bool(flag) => format!("b:{flag}"),
        ColumnValue::Timestamp(at) => format!("ts:{}", at.to_rfc3339()),
        ColumnValue::Json(json) => format!("j:{json}"),
        ColumnValue::Null => "null".to_owned(),
    }
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
