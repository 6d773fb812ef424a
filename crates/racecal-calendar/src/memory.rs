use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use racecal_core::{CalendarEvent, DateWindow, Discipline};
use tokio::sync::Mutex;

use crate::{CalendarError, CalendarGateway};

/// Calendar kept in process memory. Used for dry runs and tests; supports
/// failure injection per event id and per discipline listing.
#[derive(Debug, Default)]
pub struct InMemoryCalendar {
    events: Mutex<BTreeMap<(Discipline, String), CalendarEvent>>,
    failing_ids: Mutex<HashSet<String>>,
    failing_listings: Mutex<HashSet<Discipline>>,
    writes: Mutex<Vec<String>>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: impl IntoIterator<Item = CalendarEvent>) -> Self {
        let map = events
            .into_iter()
            .map(|e| ((e.discipline, e.id.clone()), e))
            .collect();
        Self {
            events: Mutex::new(map),
            ..Self::default()
        }
    }

    /// Every mutation touching `id` fails from now on.
    pub async fn fail_on(&self, id: impl Into<String>) {
        self.failing_ids.lock().await.insert(id.into());
    }

    pub async fn fail_listing(&self, discipline: Discipline) {
        self.failing_listings.lock().await.insert(discipline);
    }

    pub async fn events(&self, discipline: Discipline) -> Vec<CalendarEvent> {
        self.events
            .lock()
            .await
            .values()
            .filter(|e| e.discipline == discipline)
            .cloned()
            .collect()
    }

    /// Successful mutations so far, as `"<op> <id>"`.
    pub async fn writes(&self) -> Vec<String> {
        self.writes.lock().await.clone()
    }

    async fn check(&self, id: &str) -> Result<(), CalendarError> {
        if self.failing_ids.lock().await.contains(id) {
            return Err(CalendarError::Unavailable(format!("injected failure for {id}")));
        }
        Ok(())
    }

    async fn record(&self, op: &str, id: &str) {
        self.writes.lock().await.push(format!("{op} {id}"));
    }
}

#[async_trait]
impl CalendarGateway for InMemoryCalendar {
    async fn fetch_event_list(
        &self,
        discipline: Discipline,
        window: DateWindow,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        if self.failing_listings.lock().await.contains(&discipline) {
            return Err(CalendarError::Unavailable(format!(
                "injected listing failure for {discipline}"
            )));
        }
        Ok(self
            .events
            .lock()
            .await
            .values()
            .filter(|e| e.discipline == discipline && window.contains(e.start_time))
            .cloned()
            .collect())
    }

    async fn fetch_event(
        &self,
        discipline: Discipline,
        id: &str,
    ) -> Result<Option<CalendarEvent>, CalendarError> {
        self.check(id).await?;
        Ok(self
            .events
            .lock()
            .await
            .get(&(discipline, id.to_string()))
            .cloned())
    }

    async fn insert_event(&self, event: &CalendarEvent) -> Result<(), CalendarError> {
        self.check(&event.id).await?;
        let mut events = self.events.lock().await;
        let key = (event.discipline, event.id.clone());
        if events.contains_key(&key) {
            return Err(CalendarError::Conflict(event.id.clone()));
        }
        events.insert(key, event.clone());
        drop(events);
        self.record("insert", &event.id).await;
        Ok(())
    }

    async fn update_event(&self, event: &CalendarEvent) -> Result<(), CalendarError> {
        self.check(&event.id).await?;
        let mut events = self.events.lock().await;
        match events.get_mut(&(event.discipline, event.id.clone())) {
            Some(existing) => *existing = event.clone(),
            None => return Err(CalendarError::NotFound(event.id.clone())),
        }
        drop(events);
        self.record("update", &event.id).await;
        Ok(())
    }

    async fn delete_event(&self, discipline: Discipline, id: &str) -> Result<(), CalendarError> {
        self.check(id).await?;
        if self
            .events
            .lock()
            .await
            .remove(&(discipline, id.to_string()))
            .is_none()
        {
            return Err(CalendarError::NotFound(id.to_string()));
        }
        self.record("delete", id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn event(id: &str, discipline: Discipline, day: u32) -> CalendarEvent {
        let start = NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        CalendarEvent {
            id: id.into(),
            discipline,
            title: "title".into(),
            start_time: start,
            end_time: start + chrono::Duration::minutes(5),
            location: "Hiratsuka".into(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn listing_is_scoped_by_discipline_and_window() {
        let calendar = InMemoryCalendar::with_events([
            event("keirin202406013501", Discipline::Keirin, 1),
            event("keirin202406033501", Discipline::Keirin, 3),
            event("boatrace202406010101", Discipline::Boatrace, 1),
        ]);
        let window = DateWindow::single(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        let listed = calendar
            .fetch_event_list(Discipline::Keirin, window)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "keirin202406013501");
    }

    #[tokio::test]
    async fn crud_and_failure_injection() {
        let calendar = InMemoryCalendar::new();
        let e = event("keirin202406013501", Discipline::Keirin, 1);
        assert!(matches!(
            calendar.update_event(&e).await,
            Err(CalendarError::NotFound(_))
        ));
        calendar.insert_event(&e).await.unwrap();
        assert!(matches!(
            calendar.insert_event(&e).await,
            Err(CalendarError::Conflict(_))
        ));
        assert_eq!(
            calendar.fetch_event(Discipline::Keirin, &e.id).await.unwrap(),
            Some(e.clone())
        );
        assert_eq!(calendar.fetch_event(Discipline::Jra, &e.id).await.unwrap(), None);

        calendar.fail_on(e.id.clone()).await;
        assert!(calendar.delete_event(Discipline::Keirin, &e.id).await.is_err());
        assert_eq!(calendar.writes().await, vec![format!("insert {}", e.id)]);
    }
}
