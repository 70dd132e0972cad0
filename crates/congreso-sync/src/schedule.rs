//! Cron trigger for the sync pass. Each firing runs the same pass as the
//! CLI and web triggers and writes a run report.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{Orchestrator, SyncPlan};
use crate::{run_and_report, SyncConfig};

/// Two cron jobs, each running the on-demand pass for the current year.
/// `None` when the scheduler is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let orchestrator = orchestrator.clone();
        let reports_dir = config.reports_dir.clone();
        let timeout = config.pass_timeout;
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = orchestrator.clone();
            let reports_dir = reports_dir.clone();
            Box::pin(async move {
                let plan = SyncPlan::full([Utc::now().year()]).with_timeout(timeout);
                match run_and_report(&orchestrator, plan, &reports_dir).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        partial_failure = summary.partial_failure,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
