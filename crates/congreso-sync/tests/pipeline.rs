use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use congreso_adapters::{
    CamaraClient, Coverage, FetchContext, FixtureTransport, SenadoClient, SourceClient, SourceError,
    SourceSet, Transport,
};
use congreso_core::{Chamber, RawBill, RawParliamentarian, RawVoteEntry, RawVoteSession};
use congreso_storage::{
    Filter, GatewayError, MemoryGateway, PersistenceGateway, Record, StoredRecord, Table,
};
use congreso_sync::{
    Orchestrator, Repository, SyncError, SyncPlan, SyncUnit, DEADLINE_EXCEEDED,
};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn fixture_sources() -> Arc<SourceSet> {
    let transport: Arc<dyn Transport> = Arc::new(FixtureTransport::new(fixtures_dir()));
    Arc::new(
        SourceSet::new()
            .with(Arc::new(CamaraClient::new(transport.clone())))
            .with(Arc::new(SenadoClient::new(transport))),
    )
}

struct FakeSource {
    chamber: Chamber,
    parliamentarians: Vec<RawParliamentarian>,
    bills: Vec<RawBill>,
    sessions: Vec<RawVoteSession>,
    roll_calls: HashMap<String, Vec<RawVoteEntry>>,
    bill_delay: Option<Duration>,
    panic_on_year: Option<i32>,
}

impl FakeSource {
    fn new(chamber: Chamber) -> Self {
        Self {
            chamber,
            parliamentarians: Vec::new(),
            bills: Vec::new(),
            sessions: Vec::new(),
            roll_calls: HashMap::new(),
            bill_delay: None,
            panic_on_year: None,
        }
    }
}

#[async_trait]
impl SourceClient for FakeSource {
    fn source(&self) -> Chamber {
        self.chamber
    }

    fn coverage(&self) -> Coverage {
        Coverage::from_year(1990)
    }

    async fn fetch_parliamentarians(&self, _ctx: &FetchContext) -> Result<Vec<RawParliamentarian>, SourceError> {
        Ok(self.parliamentarians.clone())
    }

    async fn fetch_bills(&self, _ctx: &FetchContext, year: i32) -> Result<Vec<RawBill>, SourceError> {
        if let Some(delay) = self.bill_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_year == Some(year) {
            panic!("fake source exploded for {year}");
        }
        Ok(self.bills.clone())
    }

    async fn fetch_vote_sessions(&self, _ctx: &FetchContext, _year: i32) -> Result<Vec<RawVoteSession>, SourceError> {
        Ok(self.sessions.clone())
    }

    async fn fetch_roll_call(&self, _ctx: &FetchContext, session_id: &str) -> Result<Vec<RawVoteEntry>, SourceError> {
        self.roll_calls
            .get(session_id)
            .cloned()
            .ok_or_else(|| SourceError::unavailable(self.chamber, "no such session"))
    }
}

fn raw_person(id: &str, name: &str) -> RawParliamentarian {
    RawParliamentarian {
        id: Some(id.to_string()),
        full_name: Some(name.to_string()),
        ..Default::default()
    }
}

fn raw_bill(boletin: &str, title: &str) -> RawBill {
    RawBill {
        boletin: Some(boletin.to_string()),
        title: Some(title.to_string()),
        status: Some("En tramitación".to_string()),
        ..Default::default()
    }
}

/// Rejects writes of one boletin, and optionally every read of the
/// parliamentarian table.
struct FlakyGateway {
    inner: MemoryGateway,
    reject_boletin: Option<String>,
    fail_index_reads: bool,
}

#[async_trait]
impl PersistenceGateway for FlakyGateway {
    async fn upsert(&self, table: Table, record: Record, conflict_key: &str) -> Result<StoredRecord, GatewayError> {
        let boletin = record.get("boletin").and_then(|v| v.as_str());
        if table == Table::Bills && boletin.is_some() && boletin == self.reject_boletin.as_deref() {
            return Err(GatewayError::Constraint {
                table: "bills",
                detail: "rejected by test".to_string(),
            });
        }
        self.inner.upsert(table, record, conflict_key).await
    }

    async fn select(&self, table: Table, filter: &Filter) -> Result<Vec<StoredRecord>, GatewayError> {
        if self.fail_index_reads && table == Table::Parliamentarians {
            return Err(GatewayError::Unavailable("connection refused".to_string()));
        }
        self.inner.select(table, filter).await
    }

    async fn delete_all(&self, table: Table) -> Result<u64, GatewayError> {
        self.inner.delete_all(table).await
    }
}

async fn row_id(gateway: &MemoryGateway, table: Table, column: &str, value: &str) -> i64 {
    let rows = gateway.select(table, &Filter::by(column, value)).await.unwrap();
    assert_eq!(rows.len(), 1, "{table} {column}={value}");
    rows[0].id
}

#[tokio::test]
async fn fixture_pass_reconciles_both_chambers() {
    let gateway = Arc::new(MemoryGateway::new());
    let orchestrator = Orchestrator::new(fixture_sources(), gateway.clone());
    let summary = orchestrator.run(SyncPlan::full([2024])).await.unwrap();

    assert!(!summary.partial_failure);
    assert!(!summary.timed_out);
    assert_eq!(summary.units.len(), 3);

    let camara = summary.unit(SyncUnit::Parliamentarians(Chamber::Camara)).unwrap();
    assert_eq!((camara.inserted, camara.updated, camara.skipped), (4, 0, 1));
    assert_eq!(camara.conflicts.len(), 1);
    assert_eq!(camara.near_duplicates.len(), 1);
    assert_eq!(camara.near_duplicates[0].external_id.as_str(), "DIP-1201");
    assert_eq!(camara.near_duplicates[0].similar_external_id.as_str(), "DIP-1200");

    let senado = summary.unit(SyncUnit::Parliamentarians(Chamber::Senado)).unwrap();
    assert_eq!((senado.inserted, senado.skipped), (3, 0));
    assert!(senado.conflicts.is_empty());

    let bills = summary.unit(SyncUnit::Bills(2024)).unwrap();
    assert_eq!(bills.error, None);
    assert_eq!((bills.inserted, bills.updated, bills.skipped), (5, 1, 1));
    assert_eq!(bills.unrecognized_values.len(), 1);
    assert_eq!(bills.unrecognized_values[0].value, "En comisión mixta especial");
    assert_eq!(bills.votes.sessions_written, 4);
    assert_eq!(bills.votes.entries_written, 9);
    assert_eq!(bills.votes.unmatched_entries, 1);
    assert_eq!(bills.votes.failed_sessions, 0);

    assert_eq!(gateway.count(Table::Parliamentarians), 7);
    // 17203-15 arrives from both chambers and shares one row.
    assert_eq!(gateway.count(Table::Bills), 5);
    assert_eq!(gateway.count(Table::Votes), 4);
    assert_eq!(gateway.count(Table::RollCallEntries), 9);
}

#[tokio::test]
async fn second_pass_is_idempotent_and_keeps_row_ids() {
    let gateway = Arc::new(MemoryGateway::new());
    let orchestrator = Orchestrator::new(fixture_sources(), gateway.clone());
    orchestrator.run(SyncPlan::full([2024])).await.unwrap();
    let counts: Vec<_> = Table::ALL.iter().map(|t| gateway.count(*t)).collect();
    let deputy = row_id(&gateway, Table::Parliamentarians, "external_id", "DIP-1096").await;
    let bill = row_id(&gateway, Table::Bills, "boletin", "17203-15").await;

    let summary = orchestrator.run(SyncPlan::full([2024])).await.unwrap();
    let again: Vec<_> = Table::ALL.iter().map(|t| gateway.count(*t)).collect();
    assert_eq!(counts, again);
    assert_eq!(row_id(&gateway, Table::Parliamentarians, "external_id", "DIP-1096").await, deputy);
    assert_eq!(row_id(&gateway, Table::Bills, "boletin", "17203-15").await, bill);

    let camara = summary.unit(SyncUnit::Parliamentarians(Chamber::Camara)).unwrap();
    assert_eq!((camara.inserted, camara.updated), (0, 4));
    assert_eq!(camara.conflicts.len(), 1);
    let bills = summary.unit(SyncUnit::Bills(2024)).unwrap();
    assert_eq!((bills.inserted, bills.updated), (0, 6));
}

#[tokio::test]
async fn duplicate_name_under_new_id_is_rejected() {
    let gateway = Arc::new(MemoryGateway::new());
    let orchestrator = Orchestrator::new(fixture_sources(), gateway.clone());
    let summary = orchestrator.run(SyncPlan::parliamentarians_only()).await.unwrap();

    let conflict = &summary.unit(SyncUnit::Parliamentarians(Chamber::Camara)).unwrap().conflicts[0];
    assert_eq!(conflict.incoming_external_id.as_str(), "DIP-100B");
    assert_eq!(conflict.existing_external_id.as_str(), "DIP-100");

    let repo = Repository::new(gateway.clone());
    let ids: Vec<_> = repo
        .list_parliamentarians(Some(Chamber::Camara))
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.external_id)
        .collect();
    assert!(ids.contains(&"DIP-100".to_string()));
    assert!(!ids.contains(&"DIP-100B".to_string()));
    // Same name in the other chamber is a different identity.
    assert_eq!(repo.list_parliamentarians(Some(Chamber::Senado)).await.unwrap().len(), 3);
}

#[tokio::test]
async fn roll_call_reference_resolves_to_prefixed_row() {
    let mut camara = FakeSource::new(Chamber::Camara);
    camara.parliamentarians = vec![raw_person("1096", "Gonzalo Ibáñez Larraín")];
    camara.sessions = vec![RawVoteSession {
        session_id: Some("900".to_string()),
        date: Some("03/12/2024".to_string()),
        ..Default::default()
    }];
    camara.roll_calls.insert(
        "900".to_string(),
        vec![
            RawVoteEntry {
                session_id: "900".to_string(),
                parliamentarian_ref: Some("1096".to_string()),
                option: Some("Afirmativo".to_string()),
                ..Default::default()
            },
            RawVoteEntry {
                session_id: "900".to_string(),
                parliamentarian_ref: Some("4242".to_string()),
                option: Some("Afirmativo".to_string()),
                ..Default::default()
            },
        ],
    );
    let gateway = Arc::new(MemoryGateway::new());
    let orchestrator = Orchestrator::new(Arc::new(SourceSet::new().with(Arc::new(camara))), gateway.clone());
    let summary = orchestrator.run(SyncPlan::full([2024])).await.unwrap();

    let deputy = row_id(&gateway, Table::Parliamentarians, "external_id", "DIP-1096").await;
    let vote = row_id(&gateway, Table::Votes, "session_key", "camara:900").await;
    let entries = gateway.select(Table::RollCallEntries, &Filter::all()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].i64_field("parliamentarian_id"), Some(deputy));
    assert_eq!(entries[0].i64_field("vote_id"), Some(vote));
    assert_eq!(entries[0].str_field("option"), Some("si"));

    let votes = &summary.unit(SyncUnit::Bills(2024)).unwrap().votes;
    assert_eq!(votes.unmatched_entries, 1);
    assert_eq!(votes.entries_written, 1);
}

#[tokio::test]
async fn resync_updates_bill_title_in_place() {
    let gateway = Arc::new(MemoryGateway::new());
    for title in ["Título original", "Título corregido"] {
        let mut senado = FakeSource::new(Chamber::Senado);
        senado.bills = vec![raw_bill("17203-15", title)];
        let orchestrator = Orchestrator::new(Arc::new(SourceSet::new().with(Arc::new(senado))), gateway.clone());
        orchestrator.run(SyncPlan::bills_only([2024])).await.unwrap();
    }
    let bills = Repository::new(gateway.clone()).list_bills(None).await.unwrap();
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].title, "Título corregido");
    assert_eq!(bills[0].status.as_deref(), Some("en_tramitacion"));
}

#[tokio::test]
async fn bill_seen_by_both_chambers_keeps_fields_only_one_publishes() {
    let gateway = Arc::new(MemoryGateway::new());
    let mut camara = FakeSource::new(Chamber::Camara);
    camara.bills = vec![RawBill {
        urgency: Some("Suma".to_string()),
        ..raw_bill("17203-15", "Modifica la ley de pesca")
    }];
    let mut senado = FakeSource::new(Chamber::Senado);
    senado.bills = vec![RawBill {
        boletin: Some("17203-15".to_string()),
        ..Default::default()
    }];
    let sources = SourceSet::new().with(Arc::new(camara)).with(Arc::new(senado));
    let orchestrator = Orchestrator::new(Arc::new(sources), gateway.clone());
    let summary = orchestrator.run(SyncPlan::bills_only([2024])).await.unwrap();

    let unit = summary.unit(SyncUnit::Bills(2024)).unwrap();
    assert_eq!((unit.inserted, unit.updated), (1, 1));
    let bills = Repository::new(gateway.clone()).list_bills(None).await.unwrap();
    assert_eq!(bills.len(), 1);
    assert_eq!(bills[0].title, "Modifica la ley de pesca");
    assert_eq!(bills[0].status.as_deref(), Some("en_tramitacion"));
    assert_eq!(bills[0].urgency.as_deref(), Some("suma"));
}

#[tokio::test]
async fn outage_for_one_year_leaves_other_years_intact() {
    let gateway = Arc::new(MemoryGateway::new());
    let orchestrator = Orchestrator::new(fixture_sources(), gateway.clone());
    let summary = orchestrator.run(SyncPlan::full([2023, 2024])).await.unwrap();

    assert!(summary.partial_failure);
    let failed = summary.unit(SyncUnit::Bills(2023)).unwrap();
    let error = failed.error.as_deref().unwrap();
    assert!(error.contains("camara bills"), "{error}");
    assert!(error.contains("senado bills"), "{error}");

    let ok = summary.unit(SyncUnit::Bills(2024)).unwrap();
    assert_eq!(ok.error, None);
    assert_eq!(ok.inserted, 5);
    assert!(summary.unit(SyncUnit::Parliamentarians(Chamber::Camara)).unwrap().error.is_none());
}

#[tokio::test]
async fn bills_only_pass_uses_stored_identities() {
    let gateway = Arc::new(MemoryGateway::new());
    let orchestrator = Orchestrator::new(fixture_sources(), gateway.clone());
    orchestrator.run(SyncPlan::parliamentarians_only()).await.unwrap();

    let summary = orchestrator.run(SyncPlan::bills_only([2024])).await.unwrap();
    assert_eq!(summary.units.len(), 1);
    let votes = &summary.unit(SyncUnit::Bills(2024)).unwrap().votes;
    assert_eq!(votes.entries_written, 9);
    assert_eq!(votes.unmatched_entries, 1);
}

#[tokio::test]
async fn rejected_writes_are_counted_per_record() {
    let gateway = Arc::new(FlakyGateway {
        inner: MemoryGateway::new(),
        reject_boletin: Some("16987-07".to_string()),
        fail_index_reads: false,
    });
    let orchestrator = Orchestrator::new(fixture_sources(), gateway.clone());
    let summary = orchestrator.run(SyncPlan::full([2024])).await.unwrap();

    let bills = summary.unit(SyncUnit::Bills(2024)).unwrap();
    assert_eq!(bills.error, None);
    assert_eq!(bills.failed_records, 1);
    assert_eq!((bills.inserted, bills.updated), (4, 1));
    assert!(!summary.partial_failure);
}

#[tokio::test]
async fn unreadable_index_is_a_pass_failure() {
    let gateway = Arc::new(FlakyGateway {
        inner: MemoryGateway::new(),
        reject_boletin: None,
        fail_index_reads: true,
    });
    let orchestrator = Orchestrator::new(fixture_sources(), gateway);
    let err = orchestrator.run(SyncPlan::full([2024])).await.unwrap_err();
    assert!(matches!(err, SyncError::IndexUnavailable(GatewayError::Unavailable(_))));
}

#[tokio::test]
async fn deadline_returns_partial_summary() {
    let mut camara = FakeSource::new(Chamber::Camara);
    camara.parliamentarians = vec![raw_person("1", "Ana Soto")];
    camara.bills = vec![raw_bill("1-07", "Lenta")];
    camara.bill_delay = Some(Duration::from_secs(30));
    let orchestrator = Orchestrator::new(
        Arc::new(SourceSet::new().with(Arc::new(camara))),
        Arc::new(MemoryGateway::new()),
    );

    let started = Instant::now();
    let summary = orchestrator
        .run(SyncPlan::full([2023, 2024]).with_timeout(Some(Duration::from_millis(300))))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(summary.timed_out);
    assert!(summary.partial_failure);
    let people = summary.unit(SyncUnit::Parliamentarians(Chamber::Camara)).unwrap();
    assert_eq!(people.error, None);
    assert_eq!(people.inserted, 1);
    for year in [2023, 2024] {
        let unit = summary.unit(SyncUnit::Bills(year)).unwrap();
        assert_eq!(unit.error.as_deref(), Some(DEADLINE_EXCEEDED));
    }
}

#[tokio::test]
async fn panicking_year_does_not_affect_other_years() {
    let mut senado = FakeSource::new(Chamber::Senado);
    senado.bills = vec![raw_bill("16800-06", "Proyecto")];
    senado.panic_on_year = Some(2023);
    let orchestrator = Orchestrator::new(
        Arc::new(SourceSet::new().with(Arc::new(senado))),
        Arc::new(MemoryGateway::new()),
    )
    .with_year_concurrency(2);

    let summary = orchestrator.run(SyncPlan::bills_only([2023, 2024])).await.unwrap();
    let failed = summary.unit(SyncUnit::Bills(2023)).unwrap();
    assert!(failed.error.as_deref().unwrap().starts_with("internal fault"));
    let ok = summary.unit(SyncUnit::Bills(2024)).unwrap();
    assert_eq!(ok.error, None);
    assert_eq!(ok.inserted + ok.updated, 1);
}
