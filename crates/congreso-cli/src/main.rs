use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Utc};
use clap::{Args, Parser, Subcommand};
use congreso_storage::{run_migrations, PgGateway};
use congreso_sync::{Repository, SyncConfig, SyncPlan, SyncSummary};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "congreso-cli")]
#[command(about = "Chilean Congress sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass and write its report.
    Sync(SyncArgs),
    Migrate,
    Serve,
    /// Delete every synced row.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Print a digest of the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    /// Bill year to sync; repeatable.
    #[arg(long = "year")]
    years: Vec<i32>,
    #[arg(long)]
    from: Option<i32>,
    /// Defaults to the current year when `--from` is given.
    #[arg(long)]
    to: Option<i32>,
    #[arg(long)]
    skip_parliamentarians: bool,
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl SyncArgs {
    fn years(&self) -> Result<Vec<i32>> {
        let current = Utc::now().year();
        if !self.years.is_empty() {
            return Ok(self.years.clone());
        }
        match (self.from, self.to) {
            (None, None) => Ok(vec![current]),
            (None, Some(_)) => bail!("--to requires --from"),
            (Some(from), to) => {
                let to = to.unwrap_or(current);
                if from > to {
                    bail!("--from {from} is after --to {to}");
                }
                Ok((from..=to).collect())
            }
        }
    }

    fn plan(&self) -> Result<SyncPlan> {
        let years = self.years()?;
        let plan = if self.skip_parliamentarians {
            SyncPlan::bills_only(years)
        } else {
            SyncPlan::full(years)
        };
        Ok(plan.with_timeout(self.timeout_secs.map(Duration::from_secs)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let summary = congreso_sync::run_sync_once_from_env(args.plan()?).await?;
            print_summary(&summary);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let gateway = PgGateway::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            run_migrations(gateway.pool()).await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            congreso_web::serve_from_env().await?;
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes every synced row; pass --yes to confirm");
            }
            let config = SyncConfig::from_env();
            let repo = Repository::new(congreso_sync::build_gateway(&config).await?);
            let removed = repo.reset().await.context("resetting store")?;
            for (table, rows) in removed {
                println!("{table}: {rows} rows deleted");
            }
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            print!("{}", congreso_sync::report_markdown(runs, &config.reports_dir)?);
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()
            };
            let orchestrator = Arc::new(congreso_sync::orchestrator_from_env(&config).await?);
            let Some(mut sched) = congreso_sync::maybe_build_scheduler(&config, orchestrator).await? else {
                bail!("scheduler disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron_1 = %config.sync_cron_1, cron_2 = %config.sync_cron_2, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    let totals = summary.totals();
    println!(
        "sync complete: run_id={} units={} inserted={} updated={} skipped={} conflicts={} partial_failure={} timed_out={}",
        summary.run_id,
        summary.units.len(),
        totals.inserted,
        totals.updated,
        totals.skipped,
        totals.conflicts,
        summary.partial_failure,
        summary.timed_out
    );
    for (unit, report) in &summary.units {
        if let Some(error) = &report.error {
            println!("  {unit}: {error}");
        }
    }
}
