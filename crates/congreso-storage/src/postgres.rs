//! Postgres-backed gateway.
//!
//! Records travel as a single JSONB parameter and are expanded with
//! `jsonb_populate_record`, so one statement shape serves every table.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::error::ErrorKind;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::gateway::{Filter, GatewayError, PersistenceGateway, Record, StoredRecord, Table};

/// Columns maintained by the schema rather than the sync.
const MANAGED_COLUMNS: [&str; 3] = ["id", "created_at", "updated_at"];

#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

fn upsert_sql(table: Table, columns: &[&str], key_columns: &[&str]) -> String {
    let name = table.name();
    let column_list = columns.join(", ");
    let mut assignments: Vec<String> = columns
        .iter()
        .filter(|c| !key_columns.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    assignments.push("updated_at = NOW()".to_string());
    format!(
        "INSERT INTO {name} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_record(NULL::{name}, $1::jsonb) \
         ON CONFLICT ({keys}) DO UPDATE SET {sets} \
         RETURNING id, to_jsonb({name}.*) AS data",
        keys = key_columns.join(", "),
        sets = assignments.join(", "),
    )
}

fn select_sql(table: Table) -> String {
    let name = table.name();
    format!("SELECT id, to_jsonb({name}.*) AS data FROM {name} WHERE to_jsonb({name}.*) @> $1::jsonb ORDER BY id")
}

fn decode_row(table: Table, row: &PgRow) -> Result<StoredRecord, GatewayError> {
    let id: i64 = row.try_get("id")?;
    let data: Value = row.try_get("data")?;
    let Value::Object(mut fields) = data else {
        return Err(GatewayError::Decode {
            table: table.name(),
            detail: "row data is not a JSON object".to_string(),
        });
    };
    for column in MANAGED_COLUMNS {
        fields.remove(column);
    }
    Ok(StoredRecord { id, fields })
}

fn map_db_error(table: Table, err: sqlx::Error) -> GatewayError {
    if let sqlx::Error::Database(db) = &err {
        match db.kind() {
            ErrorKind::UniqueViolation
            | ErrorKind::ForeignKeyViolation
            | ErrorKind::NotNullViolation
            | ErrorKind::CheckViolation => {
                return GatewayError::Constraint {
                    table: table.name(),
                    detail: db.message().to_string(),
                }
            }
            _ => {}
        }
    }
    GatewayError::Database(err)
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn upsert(
        &self,
        table: Table,
        record: Record,
        conflict_key: &str,
    ) -> Result<StoredRecord, GatewayError> {
        table.check_columns(&record)?;
        let key_columns = table.conflict_columns(conflict_key)?;
        if let Some(missing) = key_columns
            .iter()
            .find(|c| record.get(**c).map(Value::is_null).unwrap_or(true))
        {
            return Err(GatewayError::MissingKey {
                table: table.name(),
                column: missing.to_string(),
            });
        }

        // Only the columns present in the record are written; the rest keep
        // their stored value on conflict.
        let columns: Vec<&str> = table
            .columns()
            .iter()
            .copied()
            .filter(|c| record.contains_key(*c))
            .collect();
        let sql = upsert_sql(table, &columns, &key_columns);
        debug!(table = table.name(), %sql, "upsert");

        let row = sqlx::query(&sql)
            .bind(Value::Object(record))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| map_db_error(table, err))?;
        decode_row(table, &row)
    }

    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<StoredRecord>, GatewayError> {
        filter.check_columns(table)?;
        let rows = sqlx::query(&select_sql(table))
            .bind(Value::Object(filter.as_object()))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| map_db_error(table, err))?;
        rows.iter().map(|row| decode_row(table, row)).collect()
    }

    async fn delete_all(&self, table: Table) -> Result<u64, GatewayError> {
        let sql = format!("DELETE FROM {}", table.name());
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|err| map_db_error(table, err))?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_statement_updates_only_non_key_columns() {
        let sql = upsert_sql(
            Table::RollCallEntries,
            &["vote_id", "parliamentarian_id", "option"],
            &["vote_id", "parliamentarian_id"],
        );
        assert!(sql.starts_with("INSERT INTO roll_call_entries (vote_id, parliamentarian_id, option)"));
        assert!(sql.contains("jsonb_populate_record(NULL::roll_call_entries, $1::jsonb)"));
        assert!(sql.contains("ON CONFLICT (vote_id, parliamentarian_id)"));
        assert!(sql.contains("DO UPDATE SET option = EXCLUDED.option, updated_at = NOW()"));
        assert!(!sql.contains("vote_id = EXCLUDED.vote_id"));
    }

    #[test]
    fn select_statement_uses_containment() {
        let sql = select_sql(Table::Bills);
        assert!(sql.contains("FROM bills WHERE to_jsonb(bills.*) @> $1::jsonb"));
        assert!(sql.ends_with("ORDER BY id"));
    }
}
