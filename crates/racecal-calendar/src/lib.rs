//! External calendar access: one calendar per discipline, events keyed by race id.

use async_trait::async_trait;
use racecal_core::{CalendarEvent, DateWindow, Discipline};
use thiserror::Error;

pub mod google;
pub mod memory;

pub use google::{GoogleCalendarConfig, GoogleCalendarGateway};
pub use memory::InMemoryCalendar;

pub const CRATE_NAME: &str = "racecal-calendar";

#[derive(Debug, Error)]
pub enum CalendarError {
    /// Missing or malformed calendar mapping. Aborts the run.
    #[error("calendar configuration error: {0}")]
    Config(String),
    #[error("calendar request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("calendar returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("event {0:?} not found")]
    NotFound(String),
    #[error("event {0:?} already exists")]
    Conflict(String),
    #[error("malformed calendar event {id:?}: {reason}")]
    Malformed { id: String, reason: String },
    #[error("calendar unavailable: {0}")]
    Unavailable(String),
}

impl CalendarError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CalendarError::Config(_))
    }
}

/// CRUD over the per-discipline external calendars.
#[async_trait]
pub trait CalendarGateway: Send + Sync {
    /// Events whose start falls inside `window`.
    async fn fetch_event_list(
        &self,
        discipline: Discipline,
        window: DateWindow,
    ) -> Result<Vec<CalendarEvent>, CalendarError>;

    async fn fetch_event(
        &self,
        discipline: Discipline,
        id: &str,
    ) -> Result<Option<CalendarEvent>, CalendarError>;

    async fn insert_event(&self, event: &CalendarEvent) -> Result<(), CalendarError>;

    async fn update_event(&self, event: &CalendarEvent) -> Result<(), CalendarError>;

    async fn delete_event(&self, discipline: Discipline, id: &str) -> Result<(), CalendarError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(CalendarError::Config("no calendar".into()).is_fatal());
        assert!(!CalendarError::NotFound("x".into()).is_fatal());
        assert!(!CalendarError::HttpStatus {
            status: 500,
            body: String::new()
        }
        .is_fatal());
    }
}
