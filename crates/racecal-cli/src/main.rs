use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use racecal_core::{DateWindow, Discipline};
use racecal_storage::{connect_gateway, migrate};
use racecal_sync::{SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "racecal")]
#[command(about = "Race schedule store and calendar reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest then reconcile one window.
    Sync(WindowArgs),
    /// Create or update the schedule tables.
    Migrate,
    /// Scrape fixtures into the schedule store.
    Ingest(WindowArgs),
    /// Push eligible stored races to the calendars.
    Reconcile {
        #[command(flatten)]
        window: WindowArgs,
        /// Write to an in-memory calendar instead of the live one.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
}

#[derive(Debug, Clone, Args)]
struct WindowArgs {
    /// First day (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Last day, inclusive; defaults to `start`.
    #[arg(long)]
    finish: Option<NaiveDate>,
    /// Restrict to these disciplines (repeatable); defaults to all with rules.
    #[arg(long = "discipline")]
    disciplines: Vec<Discipline>,
}

impl WindowArgs {
    fn window(&self) -> Result<DateWindow> {
        let start = self.start.unwrap_or_else(|| Local::now().date_naive());
        let finish = self.finish.unwrap_or(start);
        Ok(DateWindow::new(start, finish)?)
    }
}

fn init_tracing() {
    let filter = std::env::var("RACECAL_LOG")
        .ok()
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(WindowArgs {
        start: None,
        finish: None,
        disciplines: Vec::new(),
    })) {
        Commands::Sync(args) => {
            let pipeline = SyncPipeline::from_config(config, false).await?;
            let (ingest, reconcile) = pipeline.run_once(args.window()?, &args.disciplines).await?;
            println!(
                "sync complete: ingest_run={} races={} reconcile_run={} writes={} failures={} report={}",
                ingest.run_id,
                ingest.races.success_count,
                reconcile.run_id,
                reconcile.report.write_count(),
                reconcile.report.failure_count(),
                reconcile.report_path
            );
        }
        Commands::Migrate => {
            let db = connect_gateway(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            migrate(db.as_ref()).await.context("applying schema")?;
            println!("schema up to date");
        }
        Commands::Ingest(args) => {
            let pipeline = SyncPipeline::from_config(config, true).await?;
            let summary = pipeline.ingest(args.window()?, &args.disciplines).await?;
            println!(
                "ingest complete: run_id={} places={}/{} races={}/{} rejected={}",
                summary.run_id,
                summary.places.success_count,
                summary.scraped_places,
                summary.races.success_count,
                summary.scraped_races,
                summary.rejected_places + summary.rejected_races
            );
        }
        Commands::Reconcile { window, dry_run } => {
            let pipeline = SyncPipeline::from_config(config, dry_run).await?;
            let summary = pipeline
                .reconcile(window.window()?, &window.disciplines)
                .await?;
            println!(
                "reconcile complete: run_id={} eligible={} deleted={} inserted={} updated={} unchanged={} failures={} report={}",
                summary.run_id,
                summary.eligible_races,
                summary.report.deleted.len(),
                summary.report.inserted.len(),
                summary.report.updated.len(),
                summary.report.unchanged.len(),
                summary.report.failure_count(),
                summary.report_path
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::from_config(config, false).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set RACECAL_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
