//! Ingest + reconcile orchestration: scrape facts into the schedule store,
//! then push the eligible races to the external calendars.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Days, Local, Utc};
use racecal_adapters::{FixtureScrapingGateway, ScrapingGateway};
use racecal_calendar::{
    CalendarGateway, GoogleCalendarConfig, GoogleCalendarGateway, InMemoryCalendar,
};
use racecal_core::{logged, DateWindow, Discipline, PlaceEntity, RaceEntity};
use racecal_storage::{
    connect_gateway, migrate, ScheduleRepository, ScheduleStore, UpsertOptions, UpsertResult,
};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod classify;
pub mod reconcile;
pub mod rules;

pub use classify::{
    classify, is_eligible, priority_of, AllowLists, PriorityEntry, PriorityTable,
    DEFAULT_PRIORITY_THRESHOLD,
};
pub use reconcile::{
    plan_for_discipline, DisciplinePlan, ReconcileError, ReconcileReport, ReconciliationEngine,
    SyncFailure, SyncOperation,
};
pub use rules::{DisciplineRules, RulesConfig};

pub const CRATE_NAME: &str = "racecal-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub fixtures_dir: PathBuf,
    pub rules_path: PathBuf,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub schedule_window_days: u64,
    pub google_access_token: Option<String>,
    pub http_timeout_secs: u64,
    pub upsert_batch_size: usize,
    pub upsert_pacing_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let upsert = UpsertOptions::default();
        Self {
            database_url: "sqlite://racecal.db".to_string(),
            fixtures_dir: PathBuf::from("./fixtures"),
            rules_path: PathBuf::from("./rules.yaml"),
            reports_dir: PathBuf::from("./reports"),
            scheduler_enabled: false,
            sync_cron: "0 6 * * *".to_string(),
            schedule_window_days: 7,
            google_access_token: None,
            http_timeout_secs: 20,
            upsert_batch_size: upsert.batch_size,
            upsert_pacing_ms: upsert.pacing.as_millis() as u64,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            fixtures_dir: std::env::var("RACECAL_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.fixtures_dir),
            rules_path: std::env::var("RACECAL_RULES")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_path),
            reports_dir: std::env::var("RACECAL_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            scheduler_enabled: std::env::var("RACECAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            schedule_window_days: env_parse("RACECAL_SCHEDULE_WINDOW_DAYS")
                .unwrap_or(defaults.schedule_window_days),
            google_access_token: std::env::var("GOOGLE_CALENDAR_ACCESS_TOKEN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            http_timeout_secs: env_parse("RACECAL_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            upsert_batch_size: env_parse("RACECAL_UPSERT_BATCH_SIZE")
                .unwrap_or(defaults.upsert_batch_size),
            upsert_pacing_ms: env_parse("RACECAL_UPSERT_PACING_MS")
                .unwrap_or(defaults.upsert_pacing_ms),
        }
    }

    pub fn upsert_options(&self) -> UpsertOptions {
        UpsertOptions {
            batch_size: self.upsert_batch_size.max(1),
            pacing: Duration::from_millis(self.upsert_pacing_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub window: DateWindow,
    pub disciplines: Vec<Discipline>,
    pub scraped_places: usize,
    pub scraped_races: usize,
    pub rejected_places: usize,
    pub rejected_races: usize,
    pub places: UpsertResult,
    pub races: UpsertResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub window: DateWindow,
    pub disciplines: Vec<Discipline>,
    pub dry_run: bool,
    pub fetched_races: usize,
    pub eligible_races: usize,
    pub report: ReconcileReport,
    pub report_path: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    rules: RulesConfig,
    scraper: Arc<dyn ScrapingGateway>,
    repository: Arc<dyn ScheduleRepository>,
    calendar: Arc<dyn CalendarGateway>,
    table: PriorityTable,
    dry_run: bool,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        rules: RulesConfig,
        scraper: Arc<dyn ScrapingGateway>,
        repository: Arc<dyn ScheduleRepository>,
        calendar: Arc<dyn CalendarGateway>,
    ) -> Self {
        Self {
            config,
            rules,
            scraper,
            repository,
            calendar,
            table: PriorityTable::standard(),
            dry_run: false,
        }
    }

    /// Marks reports as dry runs; the caller supplies a non-live calendar.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_priority_table(mut self, table: PriorityTable) -> Self {
        self.table = table;
        self
    }

    /// Wires the production collaborators from configuration, applying the
    /// schema first. With `dry_run`, calendar writes go to an in-memory
    /// calendar.
    pub async fn from_config(config: SyncConfig, dry_run: bool) -> Result<Self> {
        let rules = RulesConfig::load(&config.rules_path)?;
        let db = connect_gateway(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        migrate(db.as_ref())
            .await
            .with_context(|| format!("applying schema to {}", config.database_url))?;
        let repository = ScheduleStore::new(db).with_options(config.upsert_options());
        let scraper = FixtureScrapingGateway::new(config.fixtures_dir.clone());

        let calendar: Arc<dyn CalendarGateway> = if dry_run {
            Arc::new(InMemoryCalendar::new())
        } else {
            let Some(token) = config.google_access_token.clone() else {
                bail!("GOOGLE_CALENDAR_ACCESS_TOKEN is required unless running a dry run");
            };
            let mut google = GoogleCalendarConfig::new(token, rules.calendar_ids());
            google.timeout = Duration::from_secs(config.http_timeout_secs);
            Arc::new(GoogleCalendarGateway::new(google).context("building calendar client")?)
        };

        Ok(Self::new(
            config,
            rules,
            Arc::new(scraper),
            Arc::new(repository),
            calendar,
        )
        .with_dry_run(dry_run))
    }

    /// `requested` when given, otherwise every discipline with rules.
    pub fn disciplines(&self, requested: &[Discipline]) -> Vec<Discipline> {
        if requested.is_empty() {
            self.rules.configured_disciplines()
        } else {
            requested.to_vec()
        }
    }

    pub async fn ingest(&self, window: DateWindow, requested: &[Discipline]) -> Result<IngestSummary> {
        let run_id = Uuid::new_v4();
        let disciplines = self.disciplines(requested);
        let span = info_span!("ingest", %run_id, start = %window.start, finish = %window.finish);
        logged("ingest", self.ingest_inner(run_id, window, disciplines))
            .instrument(span)
            .await
    }

    async fn ingest_inner(
        &self,
        run_id: Uuid,
        window: DateWindow,
        disciplines: Vec<Discipline>,
    ) -> Result<IngestSummary> {
        let place_facts = self
            .scraper
            .fetch_place_list(&disciplines, window, &[])
            .await
            .context("fetching place facts")?;
        let race_facts = self
            .scraper
            .fetch_race_list(&disciplines, window, &[], &[])
            .await
            .context("fetching race facts")?;

        let scraped_places = place_facts.len();
        let scraped_races = race_facts.len();

        let places: Vec<PlaceEntity> = place_facts
            .into_iter()
            .filter_map(|fact| match PlaceEntity::from_fact(fact) {
                Ok(place) => Some(place),
                Err(err) => {
                    warn!(error = %err, "rejecting place fact");
                    None
                }
            })
            .collect();
        let races: Vec<RaceEntity> = race_facts
            .into_iter()
            .filter_map(|fact| match RaceEntity::from_fact(fact) {
                Ok(race) => Some(race),
                Err(err) => {
                    warn!(error = %err, "rejecting race fact");
                    None
                }
            })
            .collect();

        let rejected_places = scraped_places - places.len();
        let rejected_races = scraped_races - races.len();
        let place_result = self.repository.upsert_places(&places).await;
        let race_result = self.repository.upsert_races(&races).await;

        info!(
            scraped_places,
            scraped_races,
            rejected_places,
            rejected_races,
            place_failures = place_result.failure_count,
            race_failures = race_result.failure_count,
            "ingest complete"
        );

        Ok(IngestSummary {
            run_id,
            window,
            disciplines,
            scraped_places,
            scraped_races,
            rejected_places,
            rejected_races,
            places: place_result,
            races: race_result,
        })
    }

    pub async fn reconcile(
        &self,
        window: DateWindow,
        requested: &[Discipline],
    ) -> Result<ReconcileSummary> {
        let run_id = Uuid::new_v4();
        let disciplines = self.disciplines(requested);
        let span = info_span!("reconcile", %run_id, start = %window.start, finish = %window.finish);
        logged("reconcile", self.reconcile_inner(run_id, window, disciplines))
            .instrument(span)
            .await
    }

    async fn reconcile_inner(
        &self,
        run_id: Uuid,
        window: DateWindow,
        disciplines: Vec<Discipline>,
    ) -> Result<ReconcileSummary> {
        let started_at = Utc::now();
        let races = self
            .repository
            .fetch_races(&disciplines, window, &[])
            .await;
        let eligible = classify(
            &races,
            &self.rules.allow_lists(),
            &self.table,
            self.rules.priority_threshold,
        );
        info!(fetched = races.len(), eligible = eligible.len(), "classified races");

        let engine = ReconciliationEngine::new(self.calendar.clone());
        let report = engine.reconcile(window, &disciplines, &eligible).await?;

        let mut summary = ReconcileSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            window,
            disciplines,
            dry_run: self.dry_run,
            fetched_races: races.len(),
            eligible_races: eligible.len(),
            report,
            report_path: String::new(),
        };
        let path = self.write_report(&summary).await?;
        summary.report_path = path.display().to_string();
        Ok(summary)
    }

    /// Ingest then reconcile the same window.
    pub async fn run_once(
        &self,
        window: DateWindow,
        requested: &[Discipline],
    ) -> Result<(IngestSummary, ReconcileSummary)> {
        let ingest = self.ingest(window, requested).await?;
        let reconcile = self.reconcile(window, requested).await?;
        Ok((ingest, reconcile))
    }

    async fn write_report(&self, summary: &ReconcileSummary) -> Result<PathBuf> {
        let run_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        let path = run_dir.join("reconcile.json");
        let bytes = serde_json::to_vec_pretty(summary).context("serializing reconcile report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    pub fn reports_dir(&self) -> &Path {
        &self.config.reports_dir
    }

    /// Cron job running [`SyncPipeline::run_once`] over a rolling window
    /// starting today. `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                let window = pipeline.rolling_window();
                match pipeline.run_once(window, &[]).await {
                    Ok((ingest, reconcile)) => info!(
                        ingest_run = %ingest.run_id,
                        reconcile_run = %reconcile.run_id,
                        writes = reconcile.report.write_count(),
                        failures = reconcile.report.failure_count(),
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    fn rolling_window(&self) -> DateWindow {
        let today = Local::now().date_naive();
        let finish = today
            .checked_add_days(Days::new(self.config.schedule_window_days))
            .unwrap_or(today);
        DateWindow::new(today, finish).unwrap_or_else(|_| DateWindow::single(today))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_options_follow_config() {
        let config = SyncConfig {
            upsert_batch_size: 0,
            upsert_pacing_ms: 25,
            ..SyncConfig::default()
        };
        let options = config.upsert_options();
        assert_eq!(options.batch_size, 1);
        assert_eq!(options.pacing, Duration::from_millis(25));
    }

    #[test]
    fn defaults_match_repository_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.upsert_batch_size, 50);
        assert_eq!(config.upsert_pacing_ms, 500);
        assert!(!config.scheduler_enabled);
    }
}
