//! In-process gateway used by tests, fixture runs, and demos.
//!
//! Mirrors the constraints of the relational schema that matter to the sync:
//! unique conflict keys, required foreign keys, and cascade on delete.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::gateway::{Filter, GatewayError, PersistenceGateway, Record, StoredRecord, Table};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    tables: BTreeMap<Table, Vec<StoredRecord>>,
}

impl MemoryState {
    fn rows(&self, table: Table) -> &[StoredRecord] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    fn contains_id(&self, table: Table, id: i64) -> bool {
        self.rows(table).iter().any(|r| r.id == id)
    }

    fn check_references(&self, table: Table, fields: &Record) -> Result<(), GatewayError> {
        for reference in table.references() {
            match fields.get(reference.column).unwrap_or(&Value::Null) {
                Value::Null if reference.required => {
                    return Err(GatewayError::Constraint {
                        table: table.name(),
                        detail: format!("{} must not be null", reference.column),
                    });
                }
                Value::Null => {}
                value => {
                    let found = value
                        .as_i64()
                        .map(|id| self.contains_id(reference.table, id))
                        .unwrap_or(false);
                    if !found {
                        return Err(GatewayError::Constraint {
                            table: table.name(),
                            detail: format!(
                                "{} = {value} has no row in {}",
                                reference.column,
                                reference.table.name()
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn clear(&mut self, table: Table) -> u64 {
        let removed = self.tables.remove(&table).unwrap_or_default();
        for child in Table::ALL {
            for reference in child.references().iter().filter(|r| r.table == table) {
                if reference.required {
                    self.clear(child);
                } else if let Some(rows) = self.tables.get_mut(&child) {
                    for row in rows.iter_mut() {
                        row.fields.insert(reference.column.to_string(), Value::Null);
                    }
                }
            }
        }
        removed.len() as u64
    }
}

#[derive(Debug, Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, GatewayError> {
        self.state
            .lock()
            .map_err(|_| GatewayError::Unavailable("memory store lock poisoned".to_string()))
    }

    pub fn count(&self, table: Table) -> usize {
        self.lock().map(|s| s.rows(table).len()).unwrap_or(0)
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn upsert(
        &self,
        table: Table,
        record: Record,
        conflict_key: &str,
    ) -> Result<StoredRecord, GatewayError> {
        table.check_columns(&record)?;
        let key_columns = table.conflict_columns(conflict_key)?;
        let mut key = Filter::all();
        for column in &key_columns {
            match record.get(*column) {
                Some(value) if !value.is_null() => key = key.and(*column, value.clone()),
                _ => {
                    return Err(GatewayError::MissingKey {
                        table: table.name(),
                        column: column.to_string(),
                    })
                }
            }
        }

        let mut state = self.lock()?;
        let existing = state
            .rows(table)
            .iter()
            .position(|row| key.matches(&row.fields));

        match existing {
            Some(index) => {
                let mut merged = state.rows(table)[index].fields.clone();
                merged.extend(record);
                state.check_references(table, &merged)?;
                let rows = state.tables.entry(table).or_default();
                rows[index].fields = merged;
                Ok(rows[index].clone())
            }
            None => {
                let mut fields: Record = table
                    .columns()
                    .iter()
                    .map(|c| (c.to_string(), table.column_default(c)))
                    .collect();
                fields.extend(record);
                state.check_references(table, &fields)?;
                state.next_id += 1;
                let stored = StoredRecord {
                    id: state.next_id,
                    fields,
                };
                state.tables.entry(table).or_default().push(stored.clone());
                Ok(stored)
            }
        }
    }

    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<StoredRecord>, GatewayError> {
        filter.check_columns(table)?;
        let state = self.lock()?;
        Ok(state
            .rows(table)
            .iter()
            .filter(|row| filter.matches(&row.fields))
            .cloned()
            .collect())
    }

    async fn delete_all(&self, table: Table) -> Result<u64, GatewayError> {
        let mut state = self.lock()?;
        Ok(state.clear(table))
    }
}
