//! Per-record outcomes and the pass summary they roll up into.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use congreso_core::Chamber;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::normalize::UnrecognizedValue;
use crate::reconcile::{IdentityConflict, NearDuplicate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Updated,
    Skipped,
    Conflicted,
    Unmatched,
    Failed,
}

/// Independently reported slice of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncUnit {
    Parliamentarians(Chamber),
    Bills(i32),
}

impl fmt::Display for SyncUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncUnit::Parliamentarians(chamber) => write!(f, "parliamentarians:{chamber}"),
            SyncUnit::Bills(year) => write!(f, "bills:{year}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    pub sessions_written: u32,
    pub sessions_skipped: u32,
    pub entries_written: u32,
    pub entries_skipped: u32,
    pub unmatched_entries: u32,
    /// Sessions whose roll call could not be fetched.
    pub failed_sessions: u32,
    /// Sessions or entries the gateway rejected.
    pub failed_writes: u32,
}

impl VoteCounts {
    pub fn count_entry(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted | RecordOutcome::Updated => self.entries_written += 1,
            RecordOutcome::Skipped => self.entries_skipped += 1,
            RecordOutcome::Unmatched => self.unmatched_entries += 1,
            RecordOutcome::Failed => self.failed_writes += 1,
            RecordOutcome::Conflicted => {}
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub inserted: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed_records: u32,
    pub conflicts: Vec<IdentityConflict>,
    pub near_duplicates: Vec<NearDuplicate>,
    pub unrecognized_values: Vec<UnrecognizedValue>,
    pub votes: VoteCounts,
    pub error: Option<String>,
}

impl UnitReport {
    pub fn count(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Skipped => self.skipped += 1,
            RecordOutcome::Failed => self.failed_records += 1,
            RecordOutcome::Unmatched => self.votes.unmatched_entries += 1,
            // the conflict itself is pushed by the caller
            RecordOutcome::Conflicted => {}
        }
    }

    /// Records a unit-level failure. Several failures in one unit (one per
    /// source, say) are joined.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.error = Some(match self.error.take() {
            Some(previous) => format!("{previous}; {message}"),
            None => message,
        });
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    FetchingParliamentarians,
    FetchingBills { year: i32 },
    Aggregating,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<SyncPhase>,
    /// Keyed by [`SyncUnit`]'s display form.
    pub units: BTreeMap<String, UnitReport>,
    pub partial_failure: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryTotals {
    pub inserted: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed_records: u32,
    pub conflicts: usize,
    pub near_duplicates: usize,
    pub unrecognized_values: usize,
    pub unmatched_entries: u32,
    pub failed_units: usize,
}

impl SyncSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            phases: vec![SyncPhase::Idle],
            units: BTreeMap::new(),
            partial_failure: false,
            timed_out: false,
        }
    }

    pub fn unit(&self, unit: SyncUnit) -> Option<&UnitReport> {
        self.units.get(&unit.to_string())
    }

    pub fn insert_unit(&mut self, unit: SyncUnit, report: UnitReport) {
        self.units.insert(unit.to_string(), report);
    }

    pub fn conflicts(&self) -> impl Iterator<Item = (&str, &IdentityConflict)> {
        self.units
            .iter()
            .flat_map(|(unit, report)| report.conflicts.iter().map(move |c| (unit.as_str(), c)))
    }

    pub fn totals(&self) -> SummaryTotals {
        self.units.values().fold(SummaryTotals::default(), |mut t, r| {
            t.inserted += r.inserted;
            t.updated += r.updated;
            t.skipped += r.skipped;
            t.failed_records += r.failed_records;
            t.conflicts += r.conflicts.len();
            t.near_duplicates += r.near_duplicates.len();
            t.unrecognized_values += r.unrecognized_values.len();
            t.unmatched_entries += r.votes.unmatched_entries;
            t.failed_units += usize::from(r.is_failed());
            t
        })
    }
}
