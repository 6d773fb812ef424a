//! Diff-based calendar reconciliation.
//!
//! Per discipline the calendar's events for the window are compared by id
//! with the authoritative races: events without a race are deleted, every
//! race is then inserted or updated. All deletes finish before any upsert.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use racecal_calendar::{CalendarError, CalendarGateway};
use racecal_core::{CalendarEvent, DateWindow, Discipline, RaceEntity};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    List,
    Fetch,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub discipline: Discipline,
    pub operation: SyncOperation,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub deleted: Vec<String>,
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub skipped_disciplines: Vec<Discipline>,
    pub failures: Vec<SyncFailure>,
}

impl ReconcileReport {
    pub fn success_count(&self) -> usize {
        self.deleted.len() + self.inserted.len() + self.updated.len() + self.unchanged.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Calendar writes performed.
    pub fn write_count(&self) -> usize {
        self.deleted.len() + self.inserted.len() + self.updated.len()
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("calendar for {discipline} is misconfigured: {source}")]
    Fatal {
        discipline: Discipline,
        #[source]
        source: CalendarError,
    },
}

/// Mutations needed to bring one discipline's calendar in line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisciplinePlan {
    pub discipline: Discipline,
    pub deletes: Vec<String>,
    pub upserts: Vec<CalendarEvent>,
}

pub fn plan_for_discipline(
    discipline: Discipline,
    races: &[RaceEntity],
    current: &[CalendarEvent],
) -> DisciplinePlan {
    let wanted: HashSet<&str> = races
        .iter()
        .filter(|r| r.discipline == discipline)
        .map(|r| r.id.as_str())
        .collect();

    let mut seen = HashSet::new();
    let deletes: Vec<String> = current
        .iter()
        .filter(|e| e.discipline == discipline && !wanted.contains(e.id.as_str()))
        .filter(|e| seen.insert(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();

    let doomed: HashSet<&str> = deletes.iter().map(String::as_str).collect();
    let upserts = races
        .iter()
        .filter(|r| r.discipline == discipline && !doomed.contains(r.id.as_str()))
        .map(CalendarEvent::for_race)
        .collect();

    DisciplinePlan {
        discipline,
        deletes,
        upserts,
    }
}

enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

pub struct ReconciliationEngine {
    calendar: Arc<dyn CalendarGateway>,
}

impl ReconciliationEngine {
    pub fn new(calendar: Arc<dyn CalendarGateway>) -> Self {
        Self { calendar }
    }

    /// Reconciles `disciplines` for `window` against the classified `races`.
    ///
    /// Calendar failures are collected in the report; only a calendar
    /// configuration error aborts.
    pub async fn reconcile(
        &self,
        window: DateWindow,
        disciplines: &[Discipline],
        races: &[RaceEntity],
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();

        let listings = join_all(disciplines.iter().map(|&discipline| async move {
            (
                discipline,
                self.calendar.fetch_event_list(discipline, window).await,
            )
        }))
        .await;

        let mut plans = Vec::with_capacity(listings.len());
        for (discipline, listing) in listings {
            match listing {
                Ok(current) => {
                    let plan = plan_for_discipline(discipline, races, &current);
                    debug!(
                        %discipline,
                        current = current.len(),
                        deletes = plan.deletes.len(),
                        upserts = plan.upserts.len(),
                        "planned"
                    );
                    plans.push(plan);
                }
                Err(source) if source.is_fatal() => {
                    return Err(ReconcileError::Fatal { discipline, source });
                }
                Err(err) => {
                    warn!(%discipline, error = %err, "listing calendar events failed; skipping discipline");
                    report.skipped_disciplines.push(discipline);
                    report.failures.push(SyncFailure {
                        id: None,
                        discipline,
                        operation: SyncOperation::List,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let deletions = join_all(plans.iter().flat_map(|plan| {
            plan.deletes.iter().map(move |id| async move {
                let result = self.calendar.delete_event(plan.discipline, id).await;
                (plan.discipline, id, result)
            })
        }))
        .await;
        for (discipline, id, result) in deletions {
            match result {
                Ok(()) => report.deleted.push(id.clone()),
                Err(source) if source.is_fatal() => {
                    return Err(ReconcileError::Fatal { discipline, source });
                }
                Err(err) => {
                    warn!(%discipline, %id, error = %err, "calendar delete failed");
                    report.failures.push(SyncFailure {
                        id: Some(id.clone()),
                        discipline,
                        operation: SyncOperation::Delete,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let upserts = join_all(
            plans
                .iter()
                .flat_map(|plan| plan.upserts.iter())
                .map(|event| async move { (event, self.upsert(event).await) }),
        )
        .await;
        for (event, result) in upserts {
            match result {
                Ok(UpsertOutcome::Inserted) => report.inserted.push(event.id.clone()),
                Ok(UpsertOutcome::Updated) => report.updated.push(event.id.clone()),
                Ok(UpsertOutcome::Unchanged) => report.unchanged.push(event.id.clone()),
                Err((_, source)) if source.is_fatal() => {
                    return Err(ReconcileError::Fatal {
                        discipline: event.discipline,
                        source,
                    });
                }
                Err((operation, err)) => {
                    warn!(discipline = %event.discipline, id = %event.id, ?operation, error = %err, "calendar upsert failed");
                    report.failures.push(SyncFailure {
                        id: Some(event.id.clone()),
                        discipline: event.discipline,
                        operation,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            deleted = report.deleted.len(),
            inserted = report.inserted.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            failures = report.failure_count(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn upsert(
        &self,
        event: &CalendarEvent,
    ) -> Result<UpsertOutcome, (SyncOperation, CalendarError)> {
        let existing = self
            .calendar
            .fetch_event(event.discipline, &event.id)
            .await
            .map_err(|err| (SyncOperation::Fetch, err))?;
        match existing {
            Some(current) if &current == event => Ok(UpsertOutcome::Unchanged),
            Some(_) => self
                .calendar
                .update_event(event)
                .await
                .map(|()| UpsertOutcome::Updated)
                .map_err(|err| (SyncOperation::Update, err)),
            None => self
                .calendar
                .insert_event(event)
                .await
                .map(|()| UpsertOutcome::Inserted)
                .map_err(|err| (SyncOperation::Insert, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use racecal_calendar::{GoogleCalendarConfig, GoogleCalendarGateway, InMemoryCalendar};
    use racecal_core::RaceFact;
    use std::collections::HashMap;

    fn june_first() -> DateWindow {
        DateWindow::single(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
    }

    fn keirin(number: u32) -> RaceEntity {
        RaceEntity::from_fact(RaceFact {
            discipline: Discipline::Keirin,
            datetime: NaiveDate::from_ymd_opt(2024, 6, 1)
                .unwrap()
                .and_hms_opt(10 + number, 0, 0)
                .unwrap(),
            location_name: "Hiratsuka".into(),
            race_number: number,
            name: format!("Race {number}"),
            grade: Some("G1".into()),
            surface_type: None,
            distance: None,
            stage: Some("S-Final".into()),
        })
        .unwrap()
    }

    fn sorted_ids(events: Vec<CalendarEvent>) -> Vec<String> {
        let mut ids: Vec<_> = events.into_iter().map(|e| e.id).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn stale_events_are_replaced_and_missing_ones_inserted() {
        let (r1, r2, r3, r4) = (keirin(1), keirin(2), keirin(3), keirin(4));
        let mut stale_r2 = CalendarEvent::for_race(&r2);
        stale_r2.location = "Somewhere else".into();
        let calendar = Arc::new(InMemoryCalendar::with_events([
            stale_r2,
            CalendarEvent::for_race(&r4),
        ]));
        let engine = ReconciliationEngine::new(calendar.clone());
        let races = vec![r1.clone(), r2.clone(), r3.clone()];

        let report = engine
            .reconcile(june_first(), &[Discipline::Keirin], &races)
            .await
            .unwrap();

        assert_eq!(report.deleted, vec![r4.id.to_string()]);
        let mut inserted = report.inserted.clone();
        inserted.sort();
        assert_eq!(inserted, vec![r1.id.to_string(), r3.id.to_string()]);
        assert_eq!(report.updated, vec![r2.id.to_string()]);
        assert_eq!(report.failure_count(), 0);

        let ids = sorted_ids(calendar.events(Discipline::Keirin).await);
        assert_eq!(ids, vec![r1.id.to_string(), r2.id.to_string(), r3.id.to_string()]);
        let writes = calendar.writes().await;
        assert_eq!(writes[0], format!("delete {}", r4.id));
    }

    #[tokio::test]
    async fn second_run_is_a_no_op() {
        let races: Vec<_> = (1..=3).map(keirin).collect();
        let calendar = Arc::new(InMemoryCalendar::with_events([CalendarEvent::for_race(&keirin(7))]));
        let engine = ReconciliationEngine::new(calendar.clone());

        engine
            .reconcile(june_first(), &[Discipline::Keirin], &races)
            .await
            .unwrap();
        let writes_after_first = calendar.writes().await.len();

        let second = engine
            .reconcile(june_first(), &[Discipline::Keirin], &races)
            .await
            .unwrap();
        assert!(second.deleted.is_empty());
        assert_eq!(second.write_count(), 0);
        assert_eq!(second.unchanged.len(), 3);
        assert_eq!(calendar.writes().await.len(), writes_after_first);
    }

    #[tokio::test]
    async fn single_event_failures_do_not_stop_the_run() {
        let races: Vec<_> = (1..=3).map(keirin).collect();
        let stale = keirin(5);
        let calendar = Arc::new(InMemoryCalendar::with_events([
            CalendarEvent::for_race(&stale),
            CalendarEvent::for_race(&keirin(6)),
        ]));
        calendar.fail_on(stale.id.to_string()).await;
        calendar.fail_on(races[1].id.to_string()).await;
        let engine = ReconciliationEngine::new(calendar.clone());

        let report = engine
            .reconcile(june_first(), &[Discipline::Keirin], &races)
            .await
            .unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.inserted.len(), 2);
        assert_eq!(report.failure_count(), 2);
        let ops: HashSet<_> = report.failures.iter().map(|f| f.operation).collect();
        assert_eq!(ops, HashSet::from([SyncOperation::Delete, SyncOperation::Fetch]));
    }

    #[tokio::test]
    async fn listing_failure_skips_only_that_discipline() {
        let calendar = Arc::new(InMemoryCalendar::new());
        calendar.fail_listing(Discipline::Boatrace).await;
        let engine = ReconciliationEngine::new(calendar.clone());

        let report = engine
            .reconcile(
                june_first(),
                &[Discipline::Keirin, Discipline::Boatrace],
                &[keirin(1)],
            )
            .await
            .unwrap();
        assert_eq!(report.skipped_disciplines, vec![Discipline::Boatrace]);
        assert_eq!(report.inserted, vec![keirin(1).id.to_string()]);
        assert_eq!(report.failures[0].operation, SyncOperation::List);
    }

    #[tokio::test]
    async fn missing_calendar_mapping_aborts() {
        let gateway =
            GoogleCalendarGateway::new(GoogleCalendarConfig::new("token", HashMap::new())).unwrap();
        let engine = ReconciliationEngine::new(Arc::new(gateway));
        let err = engine
            .reconcile(june_first(), &[Discipline::Keirin], &[keirin(1)])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Fatal {
                discipline: Discipline::Keirin,
                ..
            }
        ));
    }

    #[test]
    fn plans_never_compare_ids_across_disciplines() {
        let race = keirin(1);
        let mut foreign = CalendarEvent::for_race(&race);
        foreign.discipline = Discipline::Boatrace;
        let plan = plan_for_discipline(Discipline::Keirin, &[race.clone()], &[foreign.clone()]);
        assert!(plan.deletes.is_empty());
        assert_eq!(plan.upserts, vec![CalendarEvent::for_race(&race)]);

        let boat = plan_for_discipline(Discipline::Boatrace, &[race], &[foreign.clone()]);
        assert_eq!(boat.deletes, vec![foreign.id]);
        assert!(boat.upserts.is_empty());
    }
}
