//! Core domain model for racecal: disciplines, identifiers, entities and the
//! calendar event contract shared by storage, adapters and sync.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod discipline;
pub mod entity;
pub mod id;

pub use discipline::{Discipline, DisciplineDescriptor, RuleFamily};
pub use entity::{
    CalendarEvent, DateWindow, HeldDays, PlaceEntity, PlaceFact, RaceDetails, RaceEntity, RaceFact,
};
pub use id::{generate_place_id, generate_race_id, validate_id, EntityId, PlaceId, RaceId};

pub const CRATE_NAME: &str = "racecal-core";

/// Canonical text form of stored datetimes.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Invalid identifier or input shape. Always surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unknown discipline {0:?}")]
    UnknownDiscipline(String),
    #[error("unknown venue {location:?} for {discipline}")]
    UnknownVenue {
        discipline: Discipline,
        location: String,
    },
    #[error("race number {0} is outside 1..=99")]
    RaceNumber(u32),
    #[error("date {0} cannot be encoded as eight digits")]
    DateOutOfRange(NaiveDate),
    #[error("{candidate:?} is not a valid {discipline} identifier")]
    InvalidId {
        discipline: Discipline,
        candidate: String,
    },
    #[error("{discipline} {entity} is missing required field `{field}`")]
    MissingField {
        discipline: Discipline,
        entity: &'static str,
        field: &'static str,
    },
    #[error("window finish {finish} is before start {start}")]
    InvalidWindow { start: NaiveDate, finish: NaiveDate },
}

/// Runs a fallible operation with start/finish/failure logging and timing.
pub async fn logged<T, E, F>(operation: &'static str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    debug!(operation, "started");
    let result = fut.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(operation, elapsed_ms, "finished"),
        Err(err) => warn!(operation, elapsed_ms, error = %err, "failed"),
    }
    result
}

/// Like [`logged`] for best-effort operations that report failures in their output.
pub async fn timed<T, F>(operation: &'static str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    debug!(operation, "started");
    let out = fut.await;
    info!(
        operation,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "finished"
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logged_passes_results_through() {
        let ok: Result<u32, FormatError> = logged("ok", async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
        let err: Result<u32, FormatError> =
            logged("err", async { Err(FormatError::RaceNumber(0)) }).await;
        assert_eq!(err, Err(FormatError::RaceNumber(0)));
        assert_eq!(timed("plain", async { "done" }).await, "done");
    }
}
