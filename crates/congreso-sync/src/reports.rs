//! Run reports: `reports/<run_id>/` with the summary, a markdown brief and
//! parquet snapshots hashed into a manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::warn;

use crate::outcome::{SyncSummary, UnitReport};

pub const SUMMARY_FILE: &str = "summary.json";
pub const BRIEF_FILE: &str = "brief.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub files: Vec<ReportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes every report file for `summary` and returns the run directory.
pub async fn write_run_report(reports_root: &Path, summary: &SyncSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let summary_path = run_dir.join(SUMMARY_FILE);
    let json = serde_json::to_vec_pretty(summary).context("serializing sync summary")?;
    fs::write(&summary_path, json)
        .await
        .with_context(|| format!("writing {}", summary_path.display()))?;

    let brief_path = run_dir.join(BRIEF_FILE);
    fs::write(&brief_path, render_brief(summary))
        .await
        .with_context(|| format!("writing {}", brief_path.display()))?;

    let units_path = snapshot_dir.join("units.parquet");
    let conflicts_path = snapshot_dir.join("conflicts.parquet");
    write_units_parquet(&units_path, summary)?;
    write_conflicts_parquet(&conflicts_path, summary)?;

    let manifest = ReportManifest {
        schema_version: 1,
        run_id: summary.run_id.to_string(),
        files: vec![
            manifest_entry("summary", &run_dir, &summary_path)?,
            manifest_entry("brief", &run_dir, &brief_path)?,
            manifest_entry("units", &run_dir, &units_path)?,
            manifest_entry("conflicts", &run_dir, &conflicts_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing report manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}

/// Like [`write_run_report`] but only logs failures; a report never changes
/// the outcome of the pass it describes.
pub async fn write_run_report_logged(reports_root: &Path, summary: &SyncSummary) -> Option<PathBuf> {
    match write_run_report(reports_root, summary).await {
        Ok(dir) => Some(dir),
        Err(err) => {
            warn!(run_id = %summary.run_id, error = ?err, "writing run report failed");
            None
        }
    }
}

pub fn render_brief(summary: &SyncSummary) -> String {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };
    let mut lines = vec![
        "# Congreso Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Partial failure: {}", yes_no(summary.partial_failure)),
        format!("- Timed out: {}", yes_no(summary.timed_out)),
        String::new(),
        "## Units".to_string(),
        String::new(),
        "| unit | inserted | updated | skipped | conflicts | sessions | entries | unmatched | error |".to_string(),
        "|---|---|---|---|---|---|---|---|---|".to_string(),
    ];
    for (unit, r) in &summary.units {
        lines.push(format!(
            "| {unit} | {} | {} | {} | {} | {} | {} | {} | {} |",
            r.inserted,
            r.updated,
            r.skipped,
            r.conflicts.len(),
            r.votes.sessions_written,
            r.votes.entries_written,
            r.votes.unmatched_entries,
            r.error.as_deref().unwrap_or("")
        ));
    }

    let conflicts: Vec<_> = summary.conflicts().collect();
    if !conflicts.is_empty() {
        lines.extend([String::new(), "## Identity Conflicts".to_string(), String::new()]);
        for (unit, c) in conflicts {
            lines.push(format!(
                "- {unit}: `{}` \"{}\" rejected, name held by `{}`",
                c.incoming_external_id, c.full_name, c.existing_external_id
            ));
        }
    }

    let review: Vec<_> = summary.units.values().flat_map(|r| &r.near_duplicates).collect();
    if !review.is_empty() {
        lines.extend([String::new(), "## Review Queue".to_string(), String::new()]);
        for item in review {
            lines.push(format!(
                "- `{}` \"{}\" ~ `{}` ({:.3})",
                item.external_id, item.full_name, item.similar_external_id, item.score
            ));
        }
    }

    let flagged: Vec<_> = summary.units.values().flat_map(|r| &r.unrecognized_values).collect();
    if !flagged.is_empty() {
        lines.extend([String::new(), "## Unrecognized Values".to_string(), String::new()]);
        for flag in flagged {
            lines.push(format!("- {}: `{}`", flag.field, flag.value));
        }
    }

    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the `runs` most recent reports under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();

    let mut summaries = Vec::new();
    for dir in dirs {
        let path = dir.path().join(SUMMARY_FILE);
        let parsed = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))
            .and_then(|text| {
                serde_json::from_str::<SyncSummary>(&text).with_context(|| format!("parsing {}", path.display()))
            });
        match parsed {
            Ok(summary) => summaries.push((dir.path(), summary)),
            Err(err) => warn!(error = ?err, "skipping unreadable run report"),
        }
    }
    summaries.sort_by(|a, b| b.1.started_at.cmp(&a.1.started_at));

    let mut lines = vec!["# Congreso Sync Reports".to_string(), String::new()];
    for (dir, summary) in summaries.into_iter().take(runs.max(1)) {
        let totals = summary.totals();
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- units: {} ({} failed)", summary.units.len(), totals.failed_units));
        lines.push(format!(
            "- inserted: {}, updated: {}, skipped: {}",
            totals.inserted, totals.updated, totals.skipped
        ));
        lines.push(format!(
            "- conflicts: {}, review items: {}, unmatched entries: {}",
            totals.conflicts, totals.near_duplicates, totals.unmatched_entries
        ));
        if summary.timed_out {
            lines.push("- timed out".to_string());
        }
        let brief = dir.join(BRIEF_FILE);
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing parquet batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_units_parquet(path: &Path, summary: &SyncSummary) -> Result<()> {
    const COUNTERS: [&str; 11] = [
        "inserted",
        "updated",
        "skipped",
        "failed_records",
        "conflicts",
        "near_duplicates",
        "unrecognized_values",
        "sessions_written",
        "entries_written",
        "unmatched_entries",
        "failed_sessions",
    ];
    let mut fields = vec![ArrowField::new("unit", DataType::Utf8, false)];
    fields.extend(COUNTERS.iter().map(|name| ArrowField::new(*name, DataType::UInt32, false)));
    fields.push(ArrowField::new("error", DataType::Utf8, true));
    let schema = Arc::new(Schema::new(fields));

    let reports: Vec<&UnitReport> = summary.units.values().collect();
    let counter = |get: &dyn Fn(&UnitReport) -> u32| -> ArrayRef {
        Arc::new(UInt32Array::from(reports.iter().map(|r| get(r)).collect::<Vec<_>>()))
    };
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            summary.units.keys().map(|k| Some(k.as_str())).collect::<Vec<_>>(),
        )),
        counter(&|r| r.inserted),
        counter(&|r| r.updated),
        counter(&|r| r.skipped),
        counter(&|r| r.failed_records),
        counter(&|r| r.conflicts.len() as u32),
        counter(&|r| r.near_duplicates.len() as u32),
        counter(&|r| r.unrecognized_values.len() as u32),
        counter(&|r| r.votes.sessions_written),
        counter(&|r| r.votes.entries_written),
        counter(&|r| r.votes.unmatched_entries),
        counter(&|r| r.votes.failed_sessions),
        Arc::new(StringArray::from(
            reports.iter().map(|r| r.error.as_deref()).collect::<Vec<_>>(),
        )),
    ];

    let batch = RecordBatch::try_new(schema, columns).context("building units record batch")?;
    write_parquet(path, batch)
}

fn write_conflicts_parquet(path: &Path, summary: &SyncSummary) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("unit", DataType::Utf8, false),
        ArrowField::new("chamber", DataType::Utf8, false),
        ArrowField::new("full_name", DataType::Utf8, false),
        ArrowField::new("incoming_external_id", DataType::Utf8, false),
        ArrowField::new("existing_external_id", DataType::Utf8, false),
    ]));
    let rows: Vec<_> = summary.conflicts().collect();

    let units = StringArray::from(rows.iter().map(|(u, _)| Some(*u)).collect::<Vec<_>>());
    let chambers = StringArray::from(rows.iter().map(|(_, c)| Some(c.chamber.as_str())).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|(_, c)| Some(c.full_name.as_str())).collect::<Vec<_>>());
    let incoming = StringArray::from(
        rows.iter()
            .map(|(_, c)| Some(c.incoming_external_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let existing = StringArray::from(
        rows.iter()
            .map(|(_, c)| Some(c.existing_external_id.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(units),
            Arc::new(chambers),
            Arc::new(names),
            Arc::new(incoming),
            Arc::new(existing),
        ],
    )
    .context("building conflicts record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ReportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ReportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::SyncUnit;
    use crate::reconcile::IdentityConflict;
    use chrono::{Duration, Utc};
    use congreso_core::{Chamber, ExternalId};
    use uuid::Uuid;

    fn summary(offset_minutes: i64) -> SyncSummary {
        let mut summary = SyncSummary::new(Uuid::new_v4(), Utc::now() - Duration::minutes(offset_minutes));
        let mut camara = UnitReport {
            inserted: 4,
            skipped: 1,
            ..Default::default()
        };
        camara.conflicts.push(IdentityConflict {
            chamber: Chamber::Camara,
            full_name: "Juan Pérez".into(),
            incoming_external_id: ExternalId::for_chamber(Chamber::Camara, "100B").unwrap(),
            existing_external_id: ExternalId::for_chamber(Chamber::Camara, "100").unwrap(),
        });
        summary.insert_unit(SyncUnit::Parliamentarians(Chamber::Camara), camara);
        let mut failed = UnitReport::default();
        failed.fail("camara bills: upstream unavailable");
        summary.insert_unit(SyncUnit::Bills(2023), failed);
        summary.partial_failure = true;
        summary
    }

    #[tokio::test]
    async fn run_report_writes_all_files_with_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let s = summary(0);
        let dir = write_run_report(tmp.path(), &s).await.unwrap();

        assert!(dir.join(SUMMARY_FILE).exists());
        assert!(dir.join("snapshots/units.parquet").exists());
        assert!(dir.join("snapshots/conflicts.parquet").exists());

        let brief = std::fs::read_to_string(dir.join(BRIEF_FILE)).unwrap();
        assert!(brief.contains("| parliamentarians:camara | 4 | 0 | 1 | 1 |"));
        assert!(brief.contains("`DIP-100B` \"Juan Pérez\" rejected, name held by `DIP-100`"));

        let manifest: ReportManifest =
            serde_json::from_slice(&std::fs::read(dir.join("snapshots/manifest.json")).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 4);
        assert!(manifest.files.iter().all(|f| f.sha256.len() == 64 && f.bytes > 0));
        assert_eq!(manifest.files[2].path, "snapshots/units.parquet");

        let back: SyncSummary = serde_json::from_slice(&std::fs::read(dir.join(SUMMARY_FILE)).unwrap()).unwrap();
        assert_eq!(back, s);
    }

    #[tokio::test]
    async fn markdown_lists_newest_runs_first() {
        let tmp = tempfile::tempdir().unwrap();
        let older = summary(60);
        let newer = summary(1);
        write_run_report(tmp.path(), &older).await.unwrap();
        write_run_report(tmp.path(), &newer).await.unwrap();
        std::fs::create_dir_all(tmp.path().join("not-a-run")).unwrap();

        let md = report_markdown(5, tmp.path()).unwrap();
        let newer_at = md.find(&newer.run_id.to_string()).unwrap();
        let older_at = md.find(&older.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);
        assert!(md.contains("- units: 2 (1 failed)"));

        let only_latest = report_markdown(1, tmp.path()).unwrap();
        assert!(!only_latest.contains(&older.run_id.to_string()));
    }

    #[test]
    fn missing_reports_dir_is_an_error() {
        assert!(report_markdown(1, Path::new("/definitely/not/reports")).is_err());
    }
}
