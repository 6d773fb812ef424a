//! Google Calendar v3 REST client.
//!
//! Google event ids only allow `[a-v0-9]`, so race ids are hex-encoded on the
//! wire and also carried verbatim in the `raceId` private extended property.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use racecal_core::{CalendarEvent, DateWindow, Discipline};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{CalendarError, CalendarGateway};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/calendar/v3/";
const TIME_ZONE: &str = "Asia/Tokyo";
const JST_OFFSET_SECS: i64 = 9 * 3600;
const RACE_ID_PROPERTY: &str = "raceId";

#[derive(Debug, Clone)]
pub struct GoogleCalendarConfig {
    pub access_token: String,
    pub calendar_ids: HashMap<Discipline, String>,
    pub timeout: Duration,
    pub base_url: String,
}

impl GoogleCalendarConfig {
    pub fn new(access_token: impl Into<String>, calendar_ids: HashMap<Discipline, String>) -> Self {
        Self {
            access_token: access_token.into(),
            calendar_ids,
            timeout: Duration::from_secs(20),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct GoogleCalendarGateway {
    client: reqwest::Client,
    config: GoogleCalendarConfig,
}

impl GoogleCalendarGateway {
    pub fn new(config: GoogleCalendarConfig) -> Result<Self, CalendarError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Calendar id for `discipline`; an unmapped or malformed id is a config error.
    fn calendar_id(&self, discipline: Discipline) -> Result<&str, CalendarError> {
        let id = self
            .config
            .calendar_ids
            .get(&discipline)
            .map(|id| id.trim())
            .ok_or_else(|| {
                CalendarError::Config(format!("no calendar id configured for {discipline}"))
            })?;
        if id.is_empty() || id.contains(char::is_whitespace) || id.contains('/') {
            return Err(CalendarError::Config(format!(
                "malformed calendar id {id:?} for {discipline}"
            )));
        }
        Ok(id)
    }

    fn events_url(&self, discipline: Discipline, event_id: Option<&str>) -> Result<Url, CalendarError> {
        let calendar_id = self.calendar_id(discipline)?;
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|err| CalendarError::Config(format!("bad calendar base url: {err}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                CalendarError::Config("calendar base url cannot carry a path".to_string())
            })?;
            segments.pop_if_empty().extend(["calendars", calendar_id, "events"]);
            if let Some(event_id) = event_id {
                segments.push(event_id);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(&self.config.access_token)
    }

    async fn send_event(
        &self,
        method: Method,
        url: Url,
        event: &CalendarEvent,
    ) -> Result<StatusCode, CalendarError> {
        let response = self
            .request(method, url)
            .json(&GoogleEvent::from_event(event))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT || status == StatusCode::NOT_FOUND {
            return Ok(status);
        }
        Err(http_error(response).await)
    }
}

#[async_trait]
impl CalendarGateway for GoogleCalendarGateway {
    async fn fetch_event_list(
        &self,
        discipline: Discipline,
        window: DateWindow,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let url = self.events_url(discipline, None)?;
        let time_min = format_jst(window.lower_bound());
        let time_max = format_jst(window.upper_bound());
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("timeMin", time_min.clone()),
                ("timeMax", time_max.clone()),
                ("singleEvents", "true".to_string()),
                ("maxResults", "2500".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .request(Method::GET, url.clone())
                .query(&query)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(http_error(response).await);
            }
            let page: EventPage = response.json().await?;

            for item in page.items {
                if item.is_cancelled() {
                    continue;
                }
                match item.into_event(discipline) {
                    Ok(event) if window.contains(event.start_time) => events.push(event),
                    Ok(_) => {}
                    Err(err) => warn!(%discipline, error = %err, "skipping unreadable calendar event"),
                }
            }

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(%discipline, count = events.len(), "listed calendar events");
        Ok(events)
    }

    async fn fetch_event(
        &self,
        discipline: Discipline,
        id: &str,
    ) -> Result<Option<CalendarEvent>, CalendarError> {
        let url = self.events_url(discipline, Some(&encode_event_id(id)))?;
        let response = self.request(Method::GET, url).send().await?;
        if matches!(response.status(), StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        let item: GoogleEvent = response.json().await?;
        if item.is_cancelled() {
            return Ok(None);
        }
        item.into_event(discipline).map(Some)
    }

    async fn insert_event(&self, event: &CalendarEvent) -> Result<(), CalendarError> {
        let url = self.events_url(event.discipline, None)?;
        match self.send_event(Method::POST, url, event).await? {
            // A cancelled event keeps its id reserved; writing it again revives it.
            StatusCode::CONFLICT => {
                debug!(id = %event.id, "event id taken by a cancelled event; updating instead");
                self.update_event(event).await
            }
            StatusCode::NOT_FOUND => Err(CalendarError::NotFound(event.id.clone())),
            _ => Ok(()),
        }
    }

    async fn update_event(&self, event: &CalendarEvent) -> Result<(), CalendarError> {
        let url = self.events_url(event.discipline, Some(&encode_event_id(&event.id)))?;
        match self.send_event(Method::PUT, url, event).await? {
            StatusCode::NOT_FOUND => Err(CalendarError::NotFound(event.id.clone())),
            StatusCode::CONFLICT => Err(CalendarError::Conflict(event.id.clone())),
            _ => Ok(()),
        }
    }

    async fn delete_event(&self, discipline: Discipline, id: &str) -> Result<(), CalendarError> {
        let url = self.events_url(discipline, Some(&encode_event_id(id)))?;
        let response = self.request(Method::DELETE, url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::GONE => Ok(()),
            StatusCode::NOT_FOUND => Err(CalendarError::NotFound(id.to_string())),
            _ => Err(http_error(response).await),
        }
    }
}

async fn http_error(response: reqwest::Response) -> CalendarError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    CalendarError::HttpStatus { status, body }
}

pub fn encode_event_id(race_id: &str) -> String {
    hex::encode(race_id.as_bytes())
}

pub fn decode_event_id(event_id: &str) -> Option<String> {
    let bytes = hex::decode(event_id).ok()?;
    String::from_utf8(bytes).ok()
}

fn format_jst(value: NaiveDateTime) -> String {
    format!("{}+09:00", value.format("%Y-%m-%dT%H:%M:%S"))
}

fn parse_jst(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.naive_utc() + chrono::Duration::seconds(JST_OFFSET_SECS))
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    start: Option<EventTime>,
    #[serde(default)]
    end: Option<EventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extended_properties: Option<ExtendedProperties>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTime {
    #[serde(default)]
    date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_zone: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ExtendedProperties {
    #[serde(default)]
    private: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPage {
    #[serde(default)]
    items: Vec<GoogleEvent>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl GoogleEvent {
    fn from_event(event: &CalendarEvent) -> Self {
        let time = |value: NaiveDateTime| EventTime {
            date_time: Some(format_jst(value)),
            time_zone: Some(TIME_ZONE.to_string()),
        };
        Self {
            id: Some(encode_event_id(&event.id)),
            status: None,
            summary: Some(event.title.clone()),
            location: Some(event.location.clone()),
            description: Some(event.description.clone()),
            start: Some(time(event.start_time)),
            end: Some(time(event.end_time)),
            extended_properties: Some(ExtendedProperties {
                private: HashMap::from([(RACE_ID_PROPERTY.to_string(), event.id.clone())]),
            }),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.status.as_deref() == Some("cancelled")
    }

    fn into_event(self, discipline: Discipline) -> Result<CalendarEvent, CalendarError> {
        let id = self
            .extended_properties
            .as_ref()
            .and_then(|p| p.private.get(RACE_ID_PROPERTY).cloned())
            .or_else(|| self.id.as_deref().and_then(decode_event_id))
            .ok_or_else(|| CalendarError::Malformed {
                id: self.id.clone().unwrap_or_default(),
                reason: "no race id".to_string(),
            })?;

        let time = |slot: &Option<EventTime>, name: &str| {
            slot.as_ref()
                .and_then(|t| t.date_time.as_deref())
                .and_then(parse_jst)
                .ok_or_else(|| CalendarError::Malformed {
                    id: id.clone(),
                    reason: format!("missing or unparsable {name} time"),
                })
        };
        let start_time = time(&self.start, "start")?;
        let end_time = time(&self.end, "end")?;

        Ok(CalendarEvent {
            id,
            discipline,
            title: self.summary.unwrap_or_default(),
            start_time,
            end_time,
            location: self.location.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample_event() -> CalendarEvent {
        let start = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(15, 30, 0)
            .unwrap();
        CalendarEvent {
            id: "world2024060101".into(),
            discipline: Discipline::World,
            title: "[GI] Prix".into(),
            start_time: start,
            end_time: start + chrono::Duration::minutes(10),
            location: "Longchamp".into(),
            description: "race_id: world2024060101".into(),
        }
    }

    #[test]
    fn event_ids_fit_google_alphabet() {
        let encoded = encode_event_id("world2024060101");
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='v').contains(&c)));
        assert_eq!(decode_event_id(&encoded).as_deref(), Some("world2024060101"));
        assert_eq!(decode_event_id("zz"), None);
    }

    #[test]
    fn wire_format_preserves_event() {
        let event = sample_event();
        let wire = GoogleEvent::from_event(&event);
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["start"]["dateTime"], "2024-06-01T15:30:00+09:00");
        assert_eq!(json["start"]["timeZone"], "Asia/Tokyo");
        assert_eq!(json["extendedProperties"]["private"]["raceId"], "world2024060101");

        let parsed: GoogleEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.into_event(Discipline::World).unwrap(), event);
    }

    #[test]
    fn utc_times_are_read_back_in_jst() {
        let raw = serde_json::json!({
            "id": encode_event_id("world2024060101"),
            "summary": "Prix",
            "start": { "dateTime": "2024-06-01T06:30:00Z" },
            "end": { "dateTime": "2024-06-01T06:40:00Z" }
        });
        let parsed: GoogleEvent = serde_json::from_value(raw).unwrap();
        let event = parsed.into_event(Discipline::World).unwrap();
        assert_eq!(event.id, "world2024060101");
        assert_eq!(event.start_time, sample_event().start_time);
    }

    #[tokio::test]
    async fn unmapped_calendar_is_a_fatal_config_error() {
        let mut ids = HashMap::new();
        ids.insert(Discipline::Jra, "bad id".to_string());
        let gateway = GoogleCalendarGateway::new(GoogleCalendarConfig::new("token", ids)).unwrap();
        let window = DateWindow::single(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());

        let err = gateway
            .fetch_event_list(Discipline::Keirin, window)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        let err = gateway.delete_event(Discipline::Jra, "jra2024060105").await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn event_urls_encode_calendar_ids() {
        let mut ids = HashMap::new();
        ids.insert(Discipline::Keirin, "abc@group.calendar.google.com".to_string());
        let gateway = GoogleCalendarGateway::new(GoogleCalendarConfig::new("token", ids)).unwrap();
        let url = gateway
            .events_url(Discipline::Keirin, Some("6b6569"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.googleapis.com/calendar/v3/calendars/abc@group.calendar.google.com/events/6b6569"
        );
    }
}
