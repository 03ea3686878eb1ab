//! Storage-agnostic description of a projection's read table.
//!
//! Adapters turn a [`TableDef`] into whatever their backend needs: the
//! relational adapter derives `CREATE TABLE` DDL from it, the in-memory one
//! uses it to validate statements in tests.

/// Value kind of a read-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer.
    BigInt,
    /// Boolean.
    Boolean,
    /// UTC timestamp.
    Timestamp,
    /// JSON document.
    Jsonb,
}

/// One column of a read table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Value kind.
    pub kind: ColumnKind,
    /// Whether the column accepts NULL.
    pub nullable: bool,
}

impl ColumnDef {
    /// A non-nullable text column.
    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Text)
    }

    /// A non-nullable 64-bit integer column.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::BigInt)
    }

    /// A non-nullable boolean column.
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Boolean)
    }

    /// A non-nullable timestamp column.
    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Timestamp)
    }

    /// A non-nullable JSON column.
    pub fn jsonb(name: impl Into<String>) -> Self {
        Self::new(name, ColumnKind::Jsonb)
    }

    /// Marks the column nullable.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
        }
    }
}

/// A read table: name, columns, and primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Table name; by convention suffixed with the projection's version,
    /// e.g. `users_projection_v1`.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Names of the primary-key columns, in key order.
    pub primary_key: Vec<String>,
}

impl TableDef {
    /// Starts a table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_columns_and_key() {
        let table = TableDef::new("users_projection_v1")
            .column(ColumnDef::text("instance_id"))
            .column(ColumnDef::text("id"))
            .column(ColumnDef::text("username"))
            .column(ColumnDef::bigint("sequence"))
            .column(ColumnDef::timestamp("changed_at").nullable())
            .primary_key(["instance_id", "id"]);

        assert_eq!(table.name, "users_projection_v1");
        assert_eq!(table.columns.len(), 5);
        assert!(!table.columns[0].nullable);
        assert!(table.columns[4].nullable);
        assert_eq!(table.primary_key, vec!["instance_id", "id"]);
    }
}
