//! Deterministic place and race identifiers.
//!
//! Grammar: `<prefix><yyyymmdd><venue code>[<race number>]`, for example
//! `keirin2024060134` (place) and `keirin202406013411` (race 11 at that place).

use std::fmt;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Discipline, FormatError};

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z]+)([0-9]{8})([0-9]{2})([0-9]{2})?$").expect("identifier pattern compiles")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaceId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RaceId(String);

/// Result of validating an identifier of either shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityId {
    Place(PlaceId),
    Race(RaceId),
}

impl EntityId {
    pub fn as_str(&self) -> &str {
        match self {
            EntityId::Place(id) => id.as_str(),
            EntityId::Race(id) => id.as_str(),
        }
    }
}

impl PlaceId {
    pub fn parse(discipline: Discipline, candidate: &str) -> Result<Self, FormatError> {
        match validate_id(discipline, candidate)? {
            EntityId::Place(id) => Ok(id),
            EntityId::Race(_) => Err(invalid(discipline, candidate)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RaceId {
    pub fn parse(discipline: Discipline, candidate: &str) -> Result<Self, FormatError> {
        match validate_id(discipline, candidate)? {
            EntityId::Race(id) => Ok(id),
            EntityId::Place(_) => Err(invalid(discipline, candidate)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier of the place this race belongs to.
    pub fn place_id(&self) -> PlaceId {
        PlaceId(self.0[..self.0.len() - 2].to_string())
    }

    pub fn race_number(&self) -> u32 {
        self.0[self.0.len() - 2..].parse().unwrap_or_default()
    }
}

impl fmt::Display for PlaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PlaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RaceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn generate_place_id(
    discipline: Discipline,
    date: NaiveDate,
    location: &str,
) -> Result<PlaceId, FormatError> {
    let descriptor = discipline.descriptor();
    let code = descriptor
        .venue_code(location)
        .ok_or_else(|| FormatError::UnknownVenue {
            discipline,
            location: location.to_string(),
        })?;
    if !(0..=9999).contains(&date.year()) {
        return Err(FormatError::DateOutOfRange(date));
    }
    Ok(PlaceId(format!(
        "{}{}{}",
        descriptor.prefix,
        date.format("%Y%m%d"),
        code
    )))
}

pub fn generate_race_id(
    discipline: Discipline,
    date: NaiveDate,
    location: &str,
    race_number: u32,
) -> Result<RaceId, FormatError> {
    if !(1..=99).contains(&race_number) {
        return Err(FormatError::RaceNumber(race_number));
    }
    let place = generate_place_id(discipline, date, location)?;
    Ok(RaceId(format!("{}{:02}", place.0, race_number)))
}

/// Checks `candidate` against `^<prefix>[0-9]{8}[0-9]{2}([0-9]{2})?$` for `discipline`.
pub fn validate_id(discipline: Discipline, candidate: &str) -> Result<EntityId, FormatError> {
    let caps = ID_PATTERN
        .captures(candidate)
        .ok_or_else(|| invalid(discipline, candidate))?;
    if &caps[1] != discipline.descriptor().prefix {
        return Err(invalid(discipline, candidate));
    }
    Ok(if caps.get(4).is_some() {
        EntityId::Race(RaceId(candidate.to_string()))
    } else {
        EntityId::Place(PlaceId(candidate.to_string()))
    })
}

fn invalid(discipline: Discipline, candidate: &str) -> FormatError {
    FormatError::InvalidId {
        discipline,
        candidate: candidate.to_string(),
    }
}
