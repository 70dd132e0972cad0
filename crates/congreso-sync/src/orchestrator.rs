//! Sync pass state machine.
//!
//! `Idle -> FetchingParliamentarians -> FetchingBills[year]... -> Aggregating -> Done`.
//! Every unit runs in its own task and writes its counts into a report the
//! orchestrator owns, so a failing, panicking, or timed-out unit still leaves
//! a report behind and never touches another unit's.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use congreso_adapters::{FetchContext, SourceClient, SourceError, SourceSet};
use congreso_core::{Chamber, RawBill, RawParliamentarian, RawVoteEntry, RawVoteSession};
use congreso_storage::{GatewayError, PersistenceGateway};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::normalize::{
    normalize_bill, normalize_parliamentarian, normalize_roll_call_entry, normalize_vote,
    UnrecognizedValue,
};
use crate::outcome::{RecordOutcome, SyncPhase, SyncSummary, SyncUnit, UnitReport};
use crate::reconcile::{BillIndex, Decision, IdentityReconciler, DEFAULT_REVIEW_THRESHOLD};
use crate::repo::Repository;

pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Faults that make a pass meaningless. Everything else ends up in the
/// summary.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot build the parliamentarian index")]
    IndexUnavailable(#[source] GatewayError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub parliamentarians: bool,
    pub years: Vec<i32>,
    pub timeout: Option<Duration>,
}

impl SyncPlan {
    pub fn full(years: impl IntoIterator<Item = i32>) -> Self {
        Self {
            parliamentarians: true,
            years: years.into_iter().collect(),
            timeout: None,
        }
    }

    pub fn parliamentarians_only() -> Self {
        Self::full([])
    }

    /// Bills and votes only; the identity index comes from the store as is.
    pub fn bills_only(years: impl IntoIterator<Item = i32>) -> Self {
        Self {
            parliamentarians: false,
            ..Self::full(years)
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn ordered_years(&self) -> Vec<i32> {
        let mut years = self.years.clone();
        years.sort_unstable();
        years.dedup();
        years
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorOptions {
    pub review_threshold: f64,
    pub year_concurrency: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            review_threshold: DEFAULT_REVIEW_THRESHOLD,
            year_concurrency: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    sources: Arc<SourceSet>,
    repo: Repository,
    options: OrchestratorOptions,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_report(report: &Mutex<UnitReport>) -> UnitReport {
    std::mem::take(&mut *lock(report))
}

async fn bounded<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn join_failure(err: &JoinError) -> String {
    if err.is_panic() {
        "internal fault: unit task panicked".to_string()
    } else {
        "unit task cancelled".to_string()
    }
}

fn expired() -> UnitReport {
    let mut report = UnitReport::default();
    report.fail(DEADLINE_EXCEEDED);
    report
}

fn log_unit(unit: SyncUnit, report: &UnitReport) {
    match &report.error {
        Some(error) => warn!(%unit, %error, inserted = report.inserted, updated = report.updated, "sync unit failed"),
        None => info!(
            %unit,
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            conflicts = report.conflicts.len(),
            unmatched = report.votes.unmatched_entries,
            "sync unit completed"
        ),
    }
}

impl Orchestrator {
    pub fn new(sources: Arc<SourceSet>, gateway: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            sources,
            repo: Repository::new(gateway),
            options: OrchestratorOptions::default(),
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_review_threshold(mut self, threshold: f64) -> Self {
        self.options.review_threshold = threshold;
        self
    }

    pub fn with_year_concurrency(mut self, concurrency: usize) -> Self {
        self.options.year_concurrency = concurrency.max(1);
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn sources(&self) -> &Arc<SourceSet> {
        &self.sources
    }

    pub fn options(&self) -> OrchestratorOptions {
        self.options
    }

    /// Runs one pass. Returns a summary under any partial failure, including
    /// an elapsed timeout; errors only when the identity index cannot be read.
    pub async fn run(&self, plan: SyncPlan) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.run_pass(run_id, started_at, plan)
            .instrument(info_span!("sync_pass", %run_id))
            .await
    }

    async fn run_pass(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        plan: SyncPlan,
    ) -> Result<SyncSummary, SyncError> {
        let ctx = FetchContext::new(run_id);
        let deadline = plan.timeout.map(|timeout| Instant::now() + timeout);
        let chambers = if plan.parliamentarians {
            self.sources.chambers()
        } else {
            Vec::new()
        };
        let years = plan.ordered_years();
        let mut summary = SyncSummary::new(run_id, started_at);
        info!(?chambers, ?years, "sync pass started");

        let index = match bounded(deadline, self.repo.load_identity_index()).await {
            Some(result) => result.map_err(SyncError::IndexUnavailable)?,
            None => {
                summary.timed_out = true;
                IdentityReconciler::default()
            }
        };
        debug!(known = index.len(), "identity index loaded");

        if !chambers.is_empty() {
            summary.phases.push(SyncPhase::FetchingParliamentarians);
        }
        let shared = Arc::new(Mutex::new(index));
        let mut reload = false;
        for chamber in chambers {
            let unit = SyncUnit::Parliamentarians(chamber);
            if summary.timed_out {
                summary.insert_unit(unit, expired());
                continue;
            }
            let report = Arc::new(Mutex::new(UnitReport::default()));
            let worker = ParliamentarianWorker {
                ctx,
                sources: self.sources.clone(),
                repo: self.repo.clone(),
                index: shared.clone(),
                report: report.clone(),
                chamber,
                synced_at: started_at,
                review_threshold: self.options.review_threshold,
            };
            let mut handle = tokio::spawn(worker.run().instrument(info_span!("sync_unit", %unit)));
            let finished = bounded(deadline, &mut handle).await;
            let mut report = take_report(&report);
            match finished {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    reload = true;
                    report.fail(join_failure(&err));
                }
                None => {
                    handle.abort();
                    summary.timed_out = true;
                    report.fail(DEADLINE_EXCEEDED);
                }
            }
            log_unit(unit, &report);
            summary.insert_unit(unit, report);
        }

        let identities = if reload && !summary.timed_out {
            warn!("parliamentarian unit faulted, reloading the identity index");
            match bounded(deadline, self.repo.load_identity_index()).await {
                Some(result) => result.map_err(SyncError::IndexUnavailable)?,
                None => {
                    summary.timed_out = true;
                    IdentityReconciler::default()
                }
            }
        } else {
            std::mem::take(&mut *lock(&shared))
        };

        if !years.is_empty() && !summary.timed_out {
            match bounded(deadline, self.repo.load_bill_index()).await {
                Some(Ok(bills)) => {
                    self.sync_years(ctx, started_at, &years, Arc::new(identities), bills, deadline, &mut summary)
                        .await
                }
                Some(Err(err)) => {
                    warn!(error = %err, "bill index unavailable");
                    for &year in &years {
                        let mut report = UnitReport::default();
                        report.fail(format!("bill index unavailable: {err}"));
                        summary.insert_unit(SyncUnit::Bills(year), report);
                    }
                }
                None => summary.timed_out = true,
            }
        }
        for &year in &years {
            let unit = SyncUnit::Bills(year);
            if summary.unit(unit).is_none() {
                summary.insert_unit(unit, expired());
            }
        }

        summary.phases.push(SyncPhase::Aggregating);
        summary.partial_failure = summary.units.values().any(UnitReport::is_failed);
        summary.phases.push(SyncPhase::Done);
        summary.finished_at = Utc::now();
        info!(
            partial_failure = summary.partial_failure,
            timed_out = summary.timed_out,
            units = summary.units.len(),
            "sync pass finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_years(
        &self,
        ctx: FetchContext,
        started_at: DateTime<Utc>,
        years: &[i32],
        identities: Arc<IdentityReconciler>,
        bills: BillIndex,
        deadline: Option<Instant>,
        summary: &mut SyncSummary,
    ) {
        let bills = Arc::new(Mutex::new(bills));
        let permits = Arc::new(Semaphore::new(self.options.year_concurrency.max(1)));
        let mut running = Vec::with_capacity(years.len());

        for &year in years {
            summary.phases.push(SyncPhase::FetchingBills { year });
            let unit = SyncUnit::Bills(year);
            let report = Arc::new(Mutex::new(UnitReport::default()));
            let worker = YearWorker {
                ctx,
                sources: self.sources.clone(),
                repo: self.repo.clone(),
                identities: identities.clone(),
                bills: bills.clone(),
                report: report.clone(),
                year,
                modified_at: started_at,
            };
            let permits = permits.clone();
            let handle = tokio::spawn(
                async move {
                    let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                    worker.run().await
                }
                .instrument(info_span!("sync_unit", %unit)),
            );
            running.push((unit, report, handle));
        }

        for (unit, report, mut handle) in running {
            let finished = if handle.is_finished() {
                Some((&mut handle).await)
            } else if summary.timed_out {
                None
            } else {
                bounded(deadline, &mut handle).await
            };
            let mut report = take_report(&report);
            match finished {
                Some(Ok(())) => {}
                Some(Err(err)) => report.fail(join_failure(&err)),
                None => {
                    handle.abort();
                    summary.timed_out = true;
                    report.fail(DEADLINE_EXCEEDED);
                }
            }
            log_unit(unit, &report);
            summary.insert_unit(unit, report);
        }
    }
}

struct ParliamentarianWorker {
    ctx: FetchContext,
    sources: Arc<SourceSet>,
    repo: Repository,
    index: Arc<Mutex<IdentityReconciler>>,
    report: Arc<Mutex<UnitReport>>,
    chamber: Chamber,
    synced_at: DateTime<Utc>,
    review_threshold: f64,
}

impl ParliamentarianWorker {
    fn note(&self, update: impl FnOnce(&mut UnitReport)) {
        update(&mut lock(&self.report));
    }

    async fn run(self) {
        let raws = match self.sources.fetch_parliamentarians(&self.ctx, self.chamber).await {
            Ok(raws) => raws,
            Err(err) => {
                warn!(error = %err, "parliamentarian fetch failed");
                self.note(|r| r.fail(err.to_string()));
                return;
            }
        };
        info!(count = raws.len(), "parliamentarians fetched");
        for raw in &raws {
            let outcome = self.sync_one(raw).await;
            self.note(|r| r.count(outcome));
        }
    }

    async fn sync_one(&self, raw: &RawParliamentarian) -> RecordOutcome {
        let p = match normalize_parliamentarian(raw, self.chamber) {
            Ok(p) => p,
            Err(skip) => {
                debug!(reason = %skip, raw_id = ?raw.id, "parliamentarian skipped");
                return RecordOutcome::Skipped;
            }
        };

        let decision = lock(&self.index).decide(&p);
        match decision {
            Decision::Conflict(conflict) => {
                warn!(
                    name = %conflict.full_name,
                    incoming = %conflict.incoming_external_id,
                    existing = %conflict.existing_external_id,
                    "identity conflict, record rejected"
                );
                self.note(|r| r.conflicts.push(conflict));
                RecordOutcome::Conflicted
            }
            Decision::Update { row_id } => match self.repo.upsert_parliamentarian(&p, self.synced_at).await {
                Ok(id) => {
                    if id != row_id {
                        warn!(external_id = %p.external_id, expected = row_id, actual = id, "row id moved");
                    }
                    lock(&self.index).record(&p, id);
                    debug!(external_id = %p.external_id, row_id = id, "parliamentarian updated");
                    RecordOutcome::Updated
                }
                Err(err) => {
                    warn!(external_id = %p.external_id, error = %err, "parliamentarian write failed");
                    RecordOutcome::Failed
                }
            },
            Decision::Insert => match self.repo.upsert_parliamentarian(&p, self.synced_at).await {
                Ok(id) => {
                    let near = {
                        let mut index = lock(&self.index);
                        let near = index.near_duplicates(&p, self.review_threshold);
                        index.record(&p, id);
                        near
                    };
                    for item in &near {
                        warn!(
                            external_id = %item.external_id,
                            similar = %item.similar_external_id,
                            score = item.score,
                            "possible duplicate parliamentarian"
                        );
                    }
                    debug!(external_id = %p.external_id, row_id = id, "parliamentarian inserted");
                    self.note(|r| r.near_duplicates.extend(near));
                    RecordOutcome::Inserted
                }
                Err(err) => {
                    warn!(external_id = %p.external_id, error = %err, "parliamentarian write failed");
                    RecordOutcome::Failed
                }
            },
        }
    }
}

struct YearWorker {
    ctx: FetchContext,
    sources: Arc<SourceSet>,
    repo: Repository,
    identities: Arc<IdentityReconciler>,
    bills: Arc<Mutex<BillIndex>>,
    report: Arc<Mutex<UnitReport>>,
    year: i32,
    modified_at: DateTime<Utc>,
}

impl YearWorker {
    fn note(&self, update: impl FnOnce(&mut UnitReport)) {
        update(&mut lock(&self.report));
    }

    fn flag(&self, flags: Vec<UnrecognizedValue>) {
        if flags.is_empty() {
            return;
        }
        for flag in &flags {
            warn!(field = %flag.field, value = %flag.value, "unrecognized value kept verbatim");
        }
        self.note(|r| r.unrecognized_values.extend(flags));
    }

    /// Each source is tried on its own; a source that fails is reported and
    /// the next one still runs.
    async fn run(self) {
        let clients: Vec<Arc<dyn SourceClient>> = self.sources.clients().cloned().collect();
        for client in clients {
            let chamber = client.source();
            if let Err(err) = self.sync_bills(client.as_ref()).await {
                warn!(source = %chamber, error = %err, "bill fetch failed");
                self.note(|r| r.fail(format!("{chamber} bills: {err}")));
                continue;
            }
            if let Err(err) = self.sync_votes(client.as_ref()).await {
                warn!(source = %chamber, error = %err, "vote session fetch failed");
                self.note(|r| r.fail(format!("{chamber} votes: {err}")));
            }
        }
    }

    async fn sync_bills(&self, client: &dyn SourceClient) -> Result<(), SourceError> {
        let chamber = client.source();
        let raws = client.fetch_bills(&self.ctx, self.year).await?;
        info!(source = %chamber, count = raws.len(), "bills fetched");
        for raw in &raws {
            let outcome = self.sync_bill(raw, chamber).await;
            self.note(|r| r.count(outcome));
        }
        Ok(())
    }

    async fn sync_bill(&self, raw: &RawBill, source: Chamber) -> RecordOutcome {
        let normalized = match normalize_bill(raw, source) {
            Ok(normalized) => normalized,
            Err(skip) => {
                debug!(reason = %skip, "bill skipped");
                return RecordOutcome::Skipped;
            }
        };
        self.flag(normalized.flags);
        let bill = normalized.value;

        let known = lock(&self.bills).get(&bill.boletin);
        match self.repo.upsert_bill(&bill, self.modified_at).await {
            Ok(id) => {
                lock(&self.bills).record(bill.boletin.clone(), id);
                debug!(boletin = %bill.boletin, row_id = id, "bill written");
                if known.is_some() {
                    RecordOutcome::Updated
                } else {
                    RecordOutcome::Inserted
                }
            }
            Err(err) => {
                warn!(boletin = %bill.boletin, error = %err, "bill write failed");
                RecordOutcome::Failed
            }
        }
    }

    async fn sync_votes(&self, client: &dyn SourceClient) -> Result<(), SourceError> {
        let sessions = client.fetch_vote_sessions(&self.ctx, self.year).await?;
        info!(source = %client.source(), count = sessions.len(), "vote sessions fetched");
        for raw in &sessions {
            self.sync_session(client, raw).await;
        }
        Ok(())
    }

    async fn sync_session(&self, client: &dyn SourceClient, raw: &RawVoteSession) {
        let chamber = client.source();
        let normalized = match normalize_vote(raw, chamber) {
            Ok(normalized) => normalized,
            Err(skip) => {
                debug!(reason = %skip, "vote session skipped");
                self.note(|r| r.votes.sessions_skipped += 1);
                return;
            }
        };
        self.flag(normalized.flags);
        let vote = normalized.value;

        let bill_id = vote.boletin.as_ref().and_then(|b| lock(&self.bills).get(b));
        let vote_id = match self.repo.upsert_vote(&vote, bill_id).await {
            Ok(id) => id,
            Err(err) => {
                warn!(session = %vote.session_key, error = %err, "vote write failed");
                self.note(|r| r.votes.failed_writes += 1);
                return;
            }
        };
        self.note(|r| r.votes.sessions_written += 1);

        let entries = match client.fetch_roll_call(&self.ctx, &vote.session_id).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(session = %vote.session_key, error = %err, "roll call unavailable");
                self.note(|r| r.votes.failed_sessions += 1);
                return;
            }
        };
        for raw in &entries {
            let outcome = self.sync_entry(raw, chamber, vote_id).await;
            self.note(|r| r.votes.count_entry(outcome));
        }
    }

    async fn sync_entry(&self, raw: &RawVoteEntry, chamber: Chamber, vote_id: i64) -> RecordOutcome {
        let normalized = match normalize_roll_call_entry(raw, chamber) {
            Ok(normalized) => normalized,
            Err(skip) => {
                debug!(reason = %skip, session = %raw.session_id, "roll-call entry skipped");
                return RecordOutcome::Skipped;
            }
        };
        self.flag(normalized.flags);
        let entry = normalized.value;

        let Some(parliamentarian_id) = self.identities.resolve(chamber, &entry.parliamentarian_ref) else {
            debug!(
                session = %entry.session_key,
                reference = %entry.parliamentarian_ref,
                name = raw.parliamentarian_name.as_deref().unwrap_or_default(),
                "unmatched roll-call entry dropped"
            );
            return RecordOutcome::Unmatched;
        };
        match self
            .repo
            .upsert_roll_call_entry(vote_id, parliamentarian_id, &entry.option)
            .await
        {
            Ok(_) => RecordOutcome::Inserted,
            Err(err) => {
                warn!(session = %entry.session_key, error = %err, "roll-call entry write failed");
                RecordOutcome::Failed
            }
        }
    }
}
