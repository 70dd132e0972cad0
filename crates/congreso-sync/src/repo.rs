//! Typed access to the gateway tables used by the pipeline and the read API.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use congreso_core::{Bill, Boletin, CanonicalDate, Chamber, ExternalId, Parliamentarian, Vote};
use congreso_storage::{Filter, GatewayError, PersistenceGateway, Record, StoredRecord, Table};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::reconcile::{BillIndex, IdentityReconciler};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParliamentarianRow {
    pub id: i64,
    pub external_id: String,
    pub full_name: String,
    pub chamber: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub party: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillRow {
    pub id: i64,
    pub boletin: String,
    pub title: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub status_recognized: Option<bool>,
    #[serde(default)]
    pub chamber_of_origin: Option<String>,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub initiative: Option<String>,
    #[serde(default)]
    pub entry_date: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

#[derive(Clone)]
pub struct Repository {
    gateway: Arc<dyn PersistenceGateway>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").finish_non_exhaustive()
    }
}

fn object(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

fn put_some(record: &mut Record, column: &str, value: Option<&str>) {
    if let Some(value) = value {
        record.insert(column.to_string(), Value::from(value));
    }
}

fn decode<T: DeserializeOwned>(table: Table, row: StoredRecord) -> Result<T, GatewayError> {
    let mut fields = row.fields;
    fields.insert("id".to_string(), Value::from(row.id));
    serde_json::from_value(Value::Object(fields)).map_err(|err| GatewayError::Decode {
        table: table.name(),
        detail: err.to_string(),
    })
}

impl Repository {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    /// Reads the full parliamentarian population. Rows with an unusable id or
    /// chamber are left out of the index and logged.
    pub async fn load_identity_index(&self) -> Result<IdentityReconciler, GatewayError> {
        let rows = self.gateway.select(Table::Parliamentarians, &Filter::all()).await?;
        let total = rows.len();
        let entries: Vec<_> = rows
            .into_iter()
            .filter_map(|row| {
                let external_id = row.str_field("external_id").and_then(ExternalId::from_stored);
                let chamber = row.str_field("chamber").and_then(|c| c.parse::<Chamber>().ok());
                match (external_id, chamber) {
                    (Some(external_id), Some(chamber)) => {
                        let name = row.str_field("full_name").unwrap_or_default().to_string();
                        Some((row.id, external_id, chamber, name))
                    }
                    _ => {
                        warn!(row_id = row.id, "parliamentarian row without usable id or chamber");
                        None
                    }
                }
            })
            .collect();
        if entries.len() != total {
            warn!(skipped = total - entries.len(), "identity index built from a partial population");
        }
        Ok(IdentityReconciler::from_rows(entries))
    }

    pub async fn load_bill_index(&self) -> Result<BillIndex, GatewayError> {
        let rows = self.gateway.select(Table::Bills, &Filter::all()).await?;
        Ok(BillIndex::from_rows(rows.into_iter().filter_map(|row| {
            let boletin = row.str_field("boletin").and_then(|b| Boletin::parse(b).ok())?;
            Some((row.id, boletin))
        })))
    }

    pub async fn upsert_parliamentarian(
        &self,
        p: &Parliamentarian,
        synced_at: DateTime<Utc>,
    ) -> Result<i64, GatewayError> {
        let record = object(json!({
            "external_id": p.external_id.as_str(),
            "full_name": p.full_name,
            "chamber": p.chamber.as_str(),
            "region": p.region,
            "district": p.district,
            "party": p.party,
            "last_synced_at": synced_at.to_rfc3339(),
        }));
        let table = Table::Parliamentarians;
        Ok(self.gateway.upsert(table, record, table.conflict_key()).await?.id)
    }

    /// Writes only the columns this observation knows. A bill published by
    /// both chambers keeps the title or status one of them omits.
    pub async fn upsert_bill(&self, bill: &Bill, modified_at: DateTime<Utc>) -> Result<i64, GatewayError> {
        let mut record = object(json!({
            "boletin": bill.boletin.as_str(),
            "source": bill.source.as_str(),
            "last_modified": modified_at.to_rfc3339(),
        }));
        if !bill.title.is_empty() {
            record.insert("title".into(), json!(bill.title));
        }
        if let Some(status) = &bill.status {
            record.insert("status".into(), json!(status));
            record.insert("status_recognized".into(), json!(bill.status_recognized));
        }
        put_some(&mut record, "chamber_of_origin", bill.chamber_of_origin.map(|c| c.as_str()));
        put_some(&mut record, "urgency", bill.urgency.as_deref());
        put_some(&mut record, "initiative", bill.initiative.as_deref());
        if let CanonicalDate::Known(_) = bill.entry_date {
            record.insert("entry_date".into(), json!(bill.entry_date.to_string()));
        }
        let table = Table::Bills;
        Ok(self.gateway.upsert(table, record, table.conflict_key()).await?.id)
    }

    pub async fn upsert_vote(&self, vote: &Vote, bill_id: Option<i64>) -> Result<i64, GatewayError> {
        let record = object(json!({
            "session_key": vote.session_key,
            "session_id": vote.session_id,
            "chamber": vote.chamber.as_str(),
            "bill_id": bill_id,
            "boletin": vote.boletin.as_ref().map(Boletin::as_str),
            "voted_at": vote.voted_at.to_string(),
            "description": vote.description,
            "yes_count": vote.tally.yes,
            "no_count": vote.tally.no,
            "abstain_count": vote.tally.abstain,
            "paired_count": vote.tally.paired,
            "quorum": vote.quorum,
            "result": vote.result,
        }));
        let table = Table::Votes;
        Ok(self.gateway.upsert(table, record, table.conflict_key()).await?.id)
    }

    pub async fn upsert_roll_call_entry(
        &self,
        vote_id: i64,
        parliamentarian_id: i64,
        option: &str,
    ) -> Result<i64, GatewayError> {
        let record = object(json!({
            "vote_id": vote_id,
            "parliamentarian_id": parliamentarian_id,
            "option": option,
        }));
        let table = Table::RollCallEntries;
        Ok(self.gateway.upsert(table, record, table.conflict_key()).await?.id)
    }

    /// Deletes every row, children first. Returns rows removed per table.
    pub async fn reset(&self) -> Result<BTreeMap<String, u64>, GatewayError> {
        let mut removed = BTreeMap::new();
        for table in Table::ALL.iter().rev() {
            let count = self.gateway.delete_all(*table).await?;
            removed.insert(table.name().to_string(), count);
        }
        Ok(removed)
    }

    pub async fn list_parliamentarians(
        &self,
        chamber: Option<Chamber>,
    ) -> Result<Vec<ParliamentarianRow>, GatewayError> {
        let filter = match chamber {
            Some(chamber) => Filter::by("chamber", chamber.as_str()),
            None => Filter::all(),
        };
        let table = Table::Parliamentarians;
        self.gateway
            .select(table, &filter)
            .await?
            .into_iter()
            .map(|row| decode(table, row))
            .collect()
    }

    pub async fn list_bills(&self, status: Option<&str>) -> Result<Vec<BillRow>, GatewayError> {
        let filter = match status {
            Some(status) => Filter::by("status", status),
            None => Filter::all(),
        };
        let table = Table::Bills;
        self.gateway
            .select(table, &filter)
            .await?
            .into_iter()
            .map(|row| decode(table, row))
            .collect()
    }

    pub async fn count(&self, table: Table) -> Result<usize, GatewayError> {
        Ok(self.gateway.select(table, &Filter::all()).await?.len())
    }
}
