//! Store-agnostic persistence contract.
//!
//! The sync core talks to storage only through [`PersistenceGateway`]:
//! single-row upsert on a conflict key, equality select, bulk delete.
//! Records are flat JSON objects keyed by column name.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub type Record = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Parliamentarians,
    Bills,
    Votes,
    RollCallEntries,
}

/// Foreign key from `column` to the `id` of `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub column: &'static str,
    pub table: Table,
    pub required: bool,
}

impl Table {
    /// Parents before children.
    pub const ALL: [Table; 4] = [
        Table::Parliamentarians,
        Table::Bills,
        Table::Votes,
        Table::RollCallEntries,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Parliamentarians => "parliamentarians",
            Table::Bills => "bills",
            Table::Votes => "votes",
            Table::RollCallEntries => "roll_call_entries",
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Parliamentarians => &[
                "external_id",
                "full_name",
                "chamber",
                "region",
                "district",
                "party",
                "last_synced_at",
            ],
            Table::Bills => &[
                "boletin",
                "title",
                "status",
                "status_recognized",
                "chamber_of_origin",
                "urgency",
                "initiative",
                "entry_date",
                "source",
                "last_modified",
            ],
            Table::Votes => &[
                "session_key",
                "session_id",
                "chamber",
                "bill_id",
                "boletin",
                "voted_at",
                "description",
                "yes_count",
                "no_count",
                "abstain_count",
                "paired_count",
                "quorum",
                "result",
            ],
            Table::RollCallEntries => &["vote_id", "parliamentarian_id", "option"],
        }
    }

    /// Natural key each table is upserted on.
    pub fn conflict_key(&self) -> &'static str {
        match self {
            Table::Parliamentarians => "external_id",
            Table::Bills => "boletin",
            Table::Votes => "session_key",
            Table::RollCallEntries => "vote_id,parliamentarian_id",
        }
    }

    pub fn references(&self) -> &'static [Reference] {
        match self {
            Table::Votes => &[Reference {
                column: "bill_id",
                table: Table::Bills,
                required: false,
            }],
            Table::RollCallEntries => &[
                Reference {
                    column: "vote_id",
                    table: Table::Votes,
                    required: true,
                },
                Reference {
                    column: "parliamentarian_id",
                    table: Table::Parliamentarians,
                    required: true,
                },
            ],
            Table::Parliamentarians | Table::Bills => &[],
        }
    }

    /// Value a column takes when an insert leaves it out. Mirrors the
    /// `DEFAULT` clauses of the migrations.
    pub fn column_default(&self, column: &str) -> Value {
        match (self, column) {
            (Table::Bills, "title") => Value::from(""),
            (Table::Bills, "status_recognized") => Value::Bool(true),
            (Table::Bills, "entry_date") | (Table::Votes, "voted_at") => Value::from("unknown"),
            _ => Value::Null,
        }
    }

    /// Checks that `key` names columns of this table and returns them.
    pub fn conflict_columns<'k>(&self, key: &'k str) -> Result<Vec<&'k str>, GatewayError> {
        let cols: Vec<&str> = key.split(',').map(str::trim).collect();
        if cols.iter().any(|c| c.is_empty() || !self.columns().contains(c)) {
            return Err(GatewayError::InvalidConflictKey {
                table: self.name(),
                key: key.to_string(),
            });
        }
        Ok(cols)
    }

    pub fn check_columns(&self, record: &Record) -> Result<(), GatewayError> {
        match record
            .keys()
            .find(|k| !self.columns().contains(&k.as_str()))
        {
            Some(column) => Err(GatewayError::UnknownColumn {
                table: self.name(),
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Row as returned by the store: surrogate id plus the column values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub id: i64,
    pub fields: Record,
}

impl StoredRecord {
    pub fn str_field(&self, column: &str) -> Option<&str> {
        self.fields.get(column).and_then(Value::as_str)
    }

    pub fn i64_field(&self, column: &str) -> Option<i64> {
        self.fields.get(column).and_then(Value::as_i64)
    }
}

/// Conjunction of column equalities. An empty filter selects everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(column, value)
    }

    pub fn and(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn matches(&self, fields: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(column, value)| fields.get(column).unwrap_or(&Value::Null) == value)
    }

    pub fn as_object(&self) -> Record {
        self.conditions.iter().cloned().collect()
    }

    pub fn check_columns(&self, table: Table) -> Result<(), GatewayError> {
        table.check_columns(&self.as_object())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown column `{column}` for table {table}")]
    UnknownColumn { table: &'static str, column: String },
    #[error("invalid conflict key `{key}` for table {table}")]
    InvalidConflictKey { table: &'static str, key: String },
    #[error("record for {table} has no value for key column `{column}`")]
    MissingKey { table: &'static str, column: String },
    #[error("constraint violated on {table}: {detail}")]
    Constraint { table: &'static str, detail: String },
    #[error("could not decode {table} row: {detail}")]
    Decode { table: &'static str, detail: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Inserts `record`, or updates the row whose `conflict_key` columns
    /// match. Columns absent from `record` keep their stored value.
    async fn upsert(
        &self,
        table: Table,
        record: Record,
        conflict_key: &str,
    ) -> Result<StoredRecord, GatewayError>;

    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<StoredRecord>, GatewayError>;

    /// Returns the number of rows removed from `table` itself.
    async fn delete_all(&self, table: Table) -> Result<u64, GatewayError>;
}
