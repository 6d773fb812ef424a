//! Normalized schedule storage for racecal.
//!
//! Places and races are split across a base table and discipline-conditional
//! side tables. [`ScheduleStore`] hides that layout behind whole-entity reads
//! (outer joins keyed by id) and chunked insert-or-update writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use racecal_core::{
    timed, DateWindow, Discipline, HeldDays, PlaceEntity, PlaceId, RaceDetails, RaceEntity, RaceId,
    DATETIME_FORMAT,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod db;
pub mod schema;

pub use db::{
    connect_gateway, DbError, DbGateway, PgGateway, SqlRow, SqlValue, SqliteGateway, Statement,
};
pub use schema::migrate;

pub const CRATE_NAME: &str = "racecal-storage";

#[derive(Debug, Clone, Copy)]
pub struct UpsertOptions {
    /// Entities per insert-or-update statement.
    pub batch_size: usize,
    /// Pause between consecutive batches to bound load on the backing store.
    pub pacing: Duration,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            pacing: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<UpsertFailure>,
}

/// A fetched row that could not be turned back into an entity.
#[derive(Debug, Error)]
#[error("row {id:?} dropped: {reason}")]
pub struct RowParseError {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("batch {batch_index} ({size} entities) failed: {source}")]
pub struct BatchWriteError {
    pub batch_index: usize,
    pub size: usize,
    #[source]
    pub source: DbError,
}

/// Whole-entity access to the authoritative schedule.
///
/// Reads are best-effort (bad rows and backend failures are logged and
/// skipped); writes report per-entity outcomes instead of failing.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn fetch_places(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Vec<PlaceEntity>;

    async fn fetch_races(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Vec<RaceEntity>;

    async fn upsert_places(&self, places: &[PlaceEntity]) -> UpsertResult;

    async fn upsert_races(&self, races: &[RaceEntity]) -> UpsertResult;
}

#[derive(Clone)]
pub struct ScheduleStore {
    db: Arc<dyn DbGateway>,
    options: UpsertOptions,
}

impl ScheduleStore {
    pub fn new(db: Arc<dyn DbGateway>) -> Self {
        Self {
            db,
            options: UpsertOptions::default(),
        }
    }

    pub fn with_options(mut self, options: UpsertOptions) -> Self {
        self.options = options;
        self
    }

    pub fn gateway(&self) -> &Arc<dyn DbGateway> {
        &self.db
    }

    async fn query_places(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Vec<PlaceEntity> {
        if disciplines.is_empty() {
            return Vec::new();
        }

        let mut columns = vec!["p.id", "p.race_type", "p.date_time", "p.location_name"];
        let mut joins = String::new();
        if disciplines.iter().any(|d| d.descriptor().uses_held_days) {
            columns.extend(["hd.held_times", "hd.held_day_times"]);
            joins.push_str(" LEFT JOIN held_day hd ON hd.id = p.id AND hd.race_type = p.race_type");
        }
        if disciplines.iter().any(|d| d.descriptor().uses_place_grade) {
            columns.push("pg.grade");
            joins.push_str(" LEFT JOIN place_grade pg ON pg.id = p.id AND pg.race_type = p.race_type");
        }

        let Some((predicate, params)) = window_predicate("p", disciplines, window, locations)
        else {
            return Vec::new();
        };
        let sql = format!(
            "SELECT {} FROM place p{joins} WHERE {predicate} ORDER BY p.date_time, p.id",
            columns.join(", ")
        );

        let rows = match self.db.query_all(&sql, &params).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "place fetch failed; returning no rows");
                return Vec::new();
            }
        };

        rows.iter()
            .filter_map(|row| match place_from_row(row) {
                Ok(place) => Some(place),
                Err(err) => {
                    warn!(error = %err, "dropping unparsable place row");
                    None
                }
            })
            .collect()
    }

    async fn query_races(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Vec<RaceEntity> {
        if disciplines.is_empty() {
            return Vec::new();
        }

        let mut columns = vec![
            "r.id",
            "r.race_type",
            "r.date_time",
            "r.location_name",
            "r.race_name",
            "r.grade",
        ];
        let mut joins = String::new();
        if disciplines.iter().any(|d| d.descriptor().uses_race_condition) {
            columns.extend(["rc.surface_type", "rc.distance"]);
            joins.push_str(
                " LEFT JOIN race_condition rc ON rc.id = r.id AND rc.race_type = r.race_type",
            );
        }
        if disciplines.iter().any(|d| d.descriptor().uses_stage) {
            columns.push("rs.stage");
            joins.push_str(" LEFT JOIN race_stage rs ON rs.id = r.id AND rs.race_type = r.race_type");
        }

        let Some((predicate, params)) = window_predicate("r", disciplines, window, locations)
        else {
            return Vec::new();
        };
        let sql = format!(
            "SELECT {} FROM race r{joins} WHERE {predicate} ORDER BY r.date_time, r.id",
            columns.join(", ")
        );

        let rows = match self.db.query_all(&sql, &params).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "race fetch failed; returning no rows");
                return Vec::new();
            }
        };

        rows.iter()
            .filter_map(|row| match race_from_row(row) {
                Ok(race) => Some(race),
                Err(err) => {
                    warn!(error = %err, "dropping unparsable race row");
                    None
                }
            })
            .collect()
    }

    async fn upsert_all<E: Stored>(&self, entities: &[E], tables: &[TableWrite<E>]) -> UpsertResult {
        let mut result = UpsertResult::default();
        let entities = dedupe_last(entities);
        if entities.is_empty() {
            return result;
        }

        let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let batches: Vec<&[&E]> = entities.chunks(self.options.batch_size.max(1)).collect();
        let total = batches.len();

        for (batch_index, batch) in batches.into_iter().enumerate() {
            let statements: Vec<Statement> = tables
                .iter()
                .filter_map(|table| table.statement(batch, &stamp))
                .collect();

            match self.db.run_batch(&statements).await {
                Ok(affected) => {
                    debug!(batch_index, size = batch.len(), affected, "batch written");
                    result.success_count += batch.len();
                }
                Err(source) => {
                    let reason = source.to_string();
                    let err = BatchWriteError {
                        batch_index,
                        size: batch.len(),
                        source,
                    };
                    warn!(error = %err, "batch write failed; continuing with next batch");
                    result
                        .failures
                        .extend(batch.iter().map(|entity| UpsertFailure {
                            id: entity.key().to_string(),
                            reason: reason.clone(),
                        }));
                }
            }

            if batch_index + 1 < total && !self.options.pacing.is_zero() {
                tokio::time::sleep(self.options.pacing).await;
            }
        }

        result.failure_count = result.failures.len();
        result
    }
}

#[async_trait]
impl ScheduleRepository for ScheduleStore {
    async fn fetch_places(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Vec<PlaceEntity> {
        let span = info_span!("fetch_places", ?disciplines, start = %window.start, finish = %window.finish);
        timed(
            "fetch_places",
            self.query_places(disciplines, window, locations),
        )
        .instrument(span)
        .await
    }

    async fn fetch_races(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Vec<RaceEntity> {
        let span = info_span!("fetch_races", ?disciplines, start = %window.start, finish = %window.finish);
        timed("fetch_races", self.query_races(disciplines, window, locations))
            .instrument(span)
            .await
    }

    async fn upsert_places(&self, places: &[PlaceEntity]) -> UpsertResult {
        let span = info_span!("upsert_places", count = places.len());
        timed("upsert_places", self.upsert_all(places, &PLACE_TABLES))
            .instrument(span)
            .await
    }

    async fn upsert_races(&self, races: &[RaceEntity]) -> UpsertResult {
        let span = info_span!("upsert_races", count = races.len());
        timed("upsert_races", self.upsert_all(races, &RACE_TABLES))
            .instrument(span)
            .await
    }
}

trait Stored: Sync {
    fn key(&self) -> &str;
}

impl Stored for PlaceEntity {
    fn key(&self) -> &str {
        self.id.as_str()
    }
}

impl Stored for RaceEntity {
    fn key(&self) -> &str {
        self.id.as_str()
    }
}

/// One target table of an upsert. `row` yields the values for `columns`
/// (first column is always `id`), or `None` when the entity has no row there.
struct TableWrite<E> {
    table: &'static str,
    columns: &'static [&'static str],
    row: fn(&E) -> Option<Vec<SqlValue>>,
}

impl<E> TableWrite<E> {
    fn statement(&self, batch: &[&E], stamp: &str) -> Option<Statement> {
        let rows: Vec<Vec<SqlValue>> = batch.iter().filter_map(|e| (self.row)(e)).collect();
        if rows.is_empty() {
            return None;
        }

        let width = self.columns.len() + 2;
        let mut params = Vec::with_capacity(rows.len() * width);
        let mut tuples = Vec::with_capacity(rows.len());
        for row in rows {
            let base = params.len();
            let slots: Vec<String> = (1..=width).map(|i| format!("?{}", base + i)).collect();
            tuples.push(format!("({})", slots.join(", ")));
            params.extend(row);
            params.push(SqlValue::text(stamp));
            params.push(SqlValue::text(stamp));
        }

        let updates: Vec<String> = self
            .columns
            .iter()
            .skip(1)
            .map(|c| format!("{c} = excluded.{c}"))
            .chain(std::iter::once("updated_at = excluded.updated_at".to_string()))
            .collect();

        let sql = format!(
            "INSERT INTO {} ({}, created_at, updated_at) VALUES {} ON CONFLICT (id) DO UPDATE SET {}",
            self.table,
            self.columns.join(", "),
            tuples.join(", "),
            updates.join(", ")
        );
        Some(Statement::new(sql, params))
    }
}

const PLACE_TABLES: [TableWrite<PlaceEntity>; 3] = [
    TableWrite {
        table: "place",
        columns: &["id", "race_type", "date_time", "location_name"],
        row: place_row,
    },
    TableWrite {
        table: "held_day",
        columns: &["id", "race_type", "held_times", "held_day_times"],
        row: held_day_row,
    },
    TableWrite {
        table: "place_grade",
        columns: &["id", "race_type", "grade"],
        row: place_grade_row,
    },
];

const RACE_TABLES: [TableWrite<RaceEntity>; 3] = [
    TableWrite {
        table: "race",
        columns: &[
            "id",
            "place_id",
            "race_type",
            "date_time",
            "location_name",
            "race_number",
            "race_name",
            "grade",
        ],
        row: race_row,
    },
    TableWrite {
        table: "race_condition",
        columns: &["id", "race_type", "surface_type", "distance"],
        row: race_condition_row,
    },
    TableWrite {
        table: "race_stage",
        columns: &["id", "race_type", "stage"],
        row: race_stage_row,
    },
];

fn place_row(p: &PlaceEntity) -> Option<Vec<SqlValue>> {
    Some(vec![
        p.id.as_str().into(),
        p.discipline.as_str().into(),
        format_datetime(p.datetime).into(),
        p.location_name.as_str().into(),
    ])
}

fn held_day_row(p: &PlaceEntity) -> Option<Vec<SqlValue>> {
    if !p.discipline.descriptor().uses_held_days {
        return None;
    }
    let held = p.held_days?;
    Some(vec![
        p.id.as_str().into(),
        p.discipline.as_str().into(),
        held.held_times.into(),
        held.held_day_times.into(),
    ])
}

fn place_grade_row(p: &PlaceEntity) -> Option<Vec<SqlValue>> {
    if !p.discipline.descriptor().uses_place_grade {
        return None;
    }
    let grade = p.grade.clone()?;
    Some(vec![
        p.id.as_str().into(),
        p.discipline.as_str().into(),
        grade.into(),
    ])
}

fn race_row(r: &RaceEntity) -> Option<Vec<SqlValue>> {
    Some(vec![
        r.id.as_str().into(),
        r.place_id.as_str().into(),
        r.discipline.as_str().into(),
        format_datetime(r.datetime).into(),
        r.location_name.as_str().into(),
        r.race_number.into(),
        r.name.as_str().into(),
        r.grade.clone().into(),
    ])
}

fn race_condition_row(r: &RaceEntity) -> Option<Vec<SqlValue>> {
    if !r.discipline.descriptor().uses_race_condition {
        return None;
    }
    let surface = r.surface_type.clone()?;
    let distance = r.distance?;
    Some(vec![
        r.id.as_str().into(),
        r.discipline.as_str().into(),
        surface.into(),
        distance.into(),
    ])
}

fn race_stage_row(r: &RaceEntity) -> Option<Vec<SqlValue>> {
    if !r.discipline.descriptor().uses_stage {
        return None;
    }
    let stage = r.stage.clone()?;
    Some(vec![
        r.id.as_str().into(),
        r.discipline.as_str().into(),
        stage.into(),
    ])
}

/// Keeps the last occurrence of each id so one statement never touches a row twice.
fn dedupe_last<E: Stored>(entities: &[E]) -> Vec<&E> {
    let mut last: HashMap<&str, usize> = HashMap::with_capacity(entities.len());
    for (index, entity) in entities.iter().enumerate() {
        last.insert(entity.key(), index);
    }
    if last.len() < entities.len() {
        debug!(
            duplicates = entities.len() - last.len(),
            "collapsing duplicate ids before upsert"
        );
    }
    entities
        .iter()
        .enumerate()
        .filter(|(index, entity)| last.get(entity.key()) == Some(index))
        .map(|(_, entity)| entity)
        .collect()
}

fn window_predicate(
    alias: &str,
    disciplines: &[Discipline],
    window: DateWindow,
    locations: &[String],
) -> Option<(String, Vec<SqlValue>)> {
    let (first, last) = window.storable_range()?;
    let mut params: Vec<SqlValue> = Vec::new();
    let types = push_list(
        &mut params,
        disciplines.iter().map(|d| SqlValue::from(d.as_str())),
    );
    let lower = push_list(
        &mut params,
        [SqlValue::from(format_datetime(first))],
    );
    let upper = push_list(
        &mut params,
        [SqlValue::from(format_datetime(last))],
    );

    let mut predicate = format!(
        "{alias}.race_type IN ({types}) AND {alias}.date_time >= {lower} AND {alias}.date_time <= {upper}"
    );
    if !locations.is_empty() {
        let names = push_list(
            &mut params,
            locations.iter().map(|l| SqlValue::from(l.as_str())),
        );
        predicate.push_str(&format!(" AND {alias}.location_name IN ({names})"));
    }
    Some((predicate, params))
}

fn push_list(params: &mut Vec<SqlValue>, values: impl IntoIterator<Item = SqlValue>) -> String {
    let mut slots = Vec::new();
    for value in values {
        params.push(value);
        slots.push(format!("?{}", params.len()));
    }
    slots.join(", ")
}

fn format_datetime(value: NaiveDateTime) -> String {
    value.format(DATETIME_FORMAT).to_string()
}

fn row_error(row: &SqlRow, reason: impl Into<String>) -> RowParseError {
    RowParseError {
        id: row.text("id").unwrap_or_default().to_string(),
        reason: reason.into(),
    }
}

fn row_discipline(row: &SqlRow) -> Result<Discipline, RowParseError> {
    row.text("race_type")
        .unwrap_or_default()
        .parse()
        .map_err(|err: racecal_core::FormatError| row_error(row, err.to_string()))
}

fn row_datetime(row: &SqlRow) -> Result<NaiveDateTime, RowParseError> {
    let raw = row
        .text("date_time")
        .ok_or_else(|| row_error(row, "missing date_time"))?;
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .map_err(|err| row_error(row, format!("bad date_time {raw:?}: {err}")))
}

fn row_required_text(row: &SqlRow, column: &str) -> Result<String, RowParseError> {
    row.text(column)
        .map(str::to_string)
        .ok_or_else(|| row_error(row, format!("missing {column}")))
}

fn row_u32(row: &SqlRow, column: &str) -> Result<Option<u32>, RowParseError> {
    row.integer(column)
        .map(|v| u32::try_from(v).map_err(|_| row_error(row, format!("{column} out of range: {v}"))))
        .transpose()
}

fn place_from_row(row: &SqlRow) -> Result<PlaceEntity, RowParseError> {
    let discipline = row_discipline(row)?;
    let id = PlaceId::parse(discipline, row.text("id").unwrap_or_default())
        .map_err(|err| row_error(row, err.to_string()))?;
    let datetime = row_datetime(row)?;
    let location_name = row_required_text(row, "location_name")?;
    let held_days = match (row_u32(row, "held_times")?, row_u32(row, "held_day_times")?) {
        (Some(held_times), Some(held_day_times)) => Some(HeldDays {
            held_times,
            held_day_times,
        }),
        _ => None,
    };
    let grade = row.text("grade").map(str::to_string);
    Ok(PlaceEntity::from_parts(
        id,
        discipline,
        datetime,
        location_name,
        held_days,
        grade,
    ))
}

fn race_from_row(row: &SqlRow) -> Result<RaceEntity, RowParseError> {
    let discipline = row_discipline(row)?;
    let id = RaceId::parse(discipline, row.text("id").unwrap_or_default())
        .map_err(|err| row_error(row, err.to_string()))?;
    let datetime = row_datetime(row)?;
    let location_name = row_required_text(row, "location_name")?;
    let name = row_required_text(row, "race_name")?;
    let details = RaceDetails {
        grade: row.text("grade").map(str::to_string),
        surface_type: row.text("surface_type").map(str::to_string),
        distance: row_u32(row, "distance")?,
        stage: row.text("stage").map(str::to_string),
    };
    Ok(RaceEntity::from_parts(
        id,
        discipline,
        datetime,
        location_name,
        name,
        details,
    ))
}
