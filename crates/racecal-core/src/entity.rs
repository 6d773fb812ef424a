use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::id::{generate_place_id, generate_race_id};
use crate::{Discipline, FormatError, PlaceId, RaceId};

/// Meeting/day sequence of a held session (only tracked for [`Discipline::Jra`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldDays {
    pub held_times: u32,
    pub held_day_times: u32,
}

/// Raw place fact handed over by a scraping gateway; carries no identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceFact {
    pub discipline: Discipline,
    pub datetime: NaiveDateTime,
    pub location_name: String,
    #[serde(default)]
    pub held_days: Option<HeldDays>,
    #[serde(default)]
    pub grade: Option<String>,
}

/// Raw race fact handed over by a scraping gateway; carries no identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaceFact {
    pub discipline: Discipline,
    pub datetime: NaiveDateTime,
    pub location_name: String,
    pub race_number: u32,
    pub name: String,
    #[serde(default)]
    pub grade: Option<String>,
    #[serde(default)]
    pub surface_type: Option<String>,
    #[serde(default)]
    pub distance: Option<u32>,
    #[serde(default)]
    pub stage: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceEntity {
    pub id: PlaceId,
    pub discipline: Discipline,
    pub datetime: NaiveDateTime,
    pub location_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub held_days: Option<HeldDays>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
}

impl PlaceEntity {
    /// Builds an entity from a scraped fact, deriving its identifier.
    ///
    /// Fields the discipline requires must be present; fields it does not use
    /// are dropped.
    pub fn from_fact(fact: PlaceFact) -> Result<Self, FormatError> {
        let descriptor = fact.discipline.descriptor();
        if descriptor.uses_held_days && fact.held_days.is_none() {
            return Err(missing(fact.discipline, "place", "held_days"));
        }
        if descriptor.uses_place_grade && blank(&fact.grade) {
            return Err(missing(fact.discipline, "place", "grade"));
        }
        let id = generate_place_id(fact.discipline, fact.datetime.date(), &fact.location_name)?;
        Ok(Self::from_parts(
            id,
            fact.discipline,
            fact.datetime,
            fact.location_name,
            fact.held_days,
            fact.grade,
        ))
    }

    /// Reassembles a stored entity; conditional fields the discipline does
    /// not use are discarded whatever the side tables contained.
    pub fn from_parts(
        id: PlaceId,
        discipline: Discipline,
        datetime: NaiveDateTime,
        location_name: String,
        held_days: Option<HeldDays>,
        grade: Option<String>,
    ) -> Self {
        let descriptor = discipline.descriptor();
        Self {
            id,
            discipline,
            datetime,
            location_name,
            held_days: held_days.filter(|_| descriptor.uses_held_days),
            grade: grade.filter(|_| descriptor.uses_place_grade),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaceEntity {
    pub id: RaceId,
    pub place_id: PlaceId,
    pub discipline: Discipline,
    pub datetime: NaiveDateTime,
    pub location_name: String,
    pub race_number: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Conditional race columns, grouped by the side table they live in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaceDetails {
    pub grade: Option<String>,
    pub surface_type: Option<String>,
    pub distance: Option<u32>,
    pub stage: Option<String>,
}

impl RaceEntity {
    pub fn from_fact(fact: RaceFact) -> Result<Self, FormatError> {
        let descriptor = fact.discipline.descriptor();
        if descriptor.uses_race_condition {
            if blank(&fact.surface_type) {
                return Err(missing(fact.discipline, "race", "surface_type"));
            }
            if fact.distance.is_none() {
                return Err(missing(fact.discipline, "race", "distance"));
            }
        }
        if descriptor.uses_stage && blank(&fact.stage) {
            return Err(missing(fact.discipline, "race", "stage"));
        }
        let id = generate_race_id(
            fact.discipline,
            fact.datetime.date(),
            &fact.location_name,
            fact.race_number,
        )?;
        Ok(Self::from_parts(
            id,
            fact.discipline,
            fact.datetime,
            fact.location_name,
            fact.name,
            RaceDetails {
                grade: fact.grade,
                surface_type: fact.surface_type,
                distance: fact.distance,
                stage: fact.stage,
            },
        ))
    }

    pub fn from_parts(
        id: RaceId,
        discipline: Discipline,
        datetime: NaiveDateTime,
        location_name: String,
        name: String,
        details: RaceDetails,
    ) -> Self {
        let descriptor = discipline.descriptor();
        Self {
            place_id: id.place_id(),
            race_number: id.race_number(),
            id,
            discipline,
            datetime,
            location_name,
            name,
            grade: details.grade,
            surface_type: details.surface_type.filter(|_| descriptor.uses_race_condition),
            distance: details.distance.filter(|_| descriptor.uses_race_condition),
            stage: details.stage.filter(|_| descriptor.uses_stage),
        }
    }
}

/// External calendar event; `id` is the race id it represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub discipline: Discipline,
    pub title: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub location: String,
    pub description: String,
}

impl CalendarEvent {
    /// Desired calendar representation of a race.
    pub fn for_race(race: &RaceEntity) -> Self {
        let descriptor = race.discipline.descriptor();
        let title = match &race.grade {
            Some(grade) => format!("[{grade}] {}", race.name),
            None => race.name.clone(),
        };

        let mut lines = vec![
            format!("discipline: {}", race.discipline),
            format!("venue: {} race {}", race.location_name, race.race_number),
        ];
        if let Some(grade) = &race.grade {
            lines.push(format!("grade: {grade}"));
        }
        if let Some(stage) = &race.stage {
            lines.push(format!("stage: {stage}"));
        }
        if let (Some(surface), Some(distance)) = (&race.surface_type, race.distance) {
            lines.push(format!("course: {surface} {distance}m"));
        }
        lines.push(format!("race_id: {}", race.id));

        Self {
            id: race.id.to_string(),
            discipline: race.discipline,
            title,
            start_time: race.datetime,
            end_time: race.datetime + Duration::minutes(descriptor.event_duration_minutes),
            location: race.location_name.clone(),
            description: lines.join("\n"),
        }
    }
}

/// Inclusive range of calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub finish: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, finish: NaiveDate) -> Result<Self, FormatError> {
        if finish < start {
            return Err(FormatError::InvalidWindow { start, finish });
        }
        Ok(Self { start, finish })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            finish: day,
        }
    }

    pub fn contains(&self, datetime: NaiveDateTime) -> bool {
        let day = datetime.date();
        self.start <= day && day <= self.finish
    }

    /// First instant of `start`.
    pub fn lower_bound(&self) -> NaiveDateTime {
        self.start.and_time(chrono::NaiveTime::MIN)
    }

    /// First instant after `finish`.
    pub fn upper_bound(&self) -> NaiveDateTime {
        self.finish
            .succ_opt()
            .map(|d| d.and_time(chrono::NaiveTime::MIN))
            .unwrap_or(NaiveDateTime::MAX)
    }

    /// First and last second of the window, limited to four-digit years so
    /// that `DATETIME_FORMAT` text compares in date order. `None` when the
    /// window starts after year 9999.
    pub fn storable_range(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let cap = NaiveDate::from_ymd_opt(9999, 12, 31)?;
        if self.start > cap {
            return None;
        }
        let last = self.finish.min(cap).and_time(chrono::NaiveTime::MIN) + Duration::seconds(86_399);
        Some((self.lower_bound(), last))
    }
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn missing(discipline: Discipline, entity: &'static str, field: &'static str) -> FormatError {
    FormatError::MissingField {
        discipline,
        entity,
        field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn keirin_fact() -> RaceFact {
        RaceFact {
            discipline: Discipline::Keirin,
            datetime: at(2024, 6, 1, 16, 30),
            location_name: "Hiratsuka".into(),
            race_number: 12,
            name: "Takamatsunomiya Kinen Cup".into(),
            grade: Some("G1".into()),
            surface_type: Some("Bank".into()),
            distance: Some(2025),
            stage: Some("S-Final".into()),
        }
    }

    #[test]
    fn race_from_fact_strips_unused_conditional_fields() {
        let race = RaceEntity::from_fact(keirin_fact()).unwrap();
        assert_eq!(race.id.as_str(), "keirin202406013512");
        assert_eq!(race.place_id.as_str(), "keirin2024060135");
        assert_eq!(race.race_number, 12);
        assert_eq!(race.stage.as_deref(), Some("S-Final"));
        assert_eq!(race.surface_type, None);
        assert_eq!(race.distance, None);
    }

    #[test]
    fn race_from_fact_requires_discipline_fields() {
        let mut fact = keirin_fact();
        fact.stage = Some("  ".into());
        assert!(matches!(
            RaceEntity::from_fact(fact).unwrap_err(),
            FormatError::MissingField { field: "stage", .. }
        ));

        let horse = RaceFact {
            discipline: Discipline::Jra,
            datetime: at(2024, 6, 2, 15, 40),
            location_name: "Tokyo".into(),
            race_number: 11,
            name: "Tokyo Yushun".into(),
            grade: Some("G1".into()),
            surface_type: Some("Turf".into()),
            distance: None,
            stage: Some("Final".into()),
        };
        assert!(matches!(
            RaceEntity::from_fact(horse).unwrap_err(),
            FormatError::MissingField { field: "distance", .. }
        ));
    }

    #[test]
    fn place_from_fact_applies_discipline_rules() {
        let jra = PlaceFact {
            discipline: Discipline::Jra,
            datetime: at(2024, 6, 2, 0, 0),
            location_name: "Tokyo".into(),
            held_days: Some(HeldDays {
                held_times: 3,
                held_day_times: 2,
            }),
            grade: Some("G1".into()),
        };
        let place = PlaceEntity::from_fact(jra.clone()).unwrap();
        assert_eq!(place.id.as_str(), "jra2024060205");
        assert!(place.held_days.is_some());
        assert_eq!(place.grade, None);

        let without_sessions = PlaceFact {
            held_days: None,
            ..jra
        };
        assert!(PlaceEntity::from_fact(without_sessions).is_err());

        let boat = PlaceFact {
            discipline: Discipline::Boatrace,
            datetime: at(2024, 6, 2, 0, 0),
            location_name: "Suminoe".into(),
            held_days: Some(HeldDays {
                held_times: 1,
                held_day_times: 1,
            }),
            grade: None,
        };
        assert!(PlaceEntity::from_fact(boat).is_err());
    }

    #[test]
    fn calendar_event_mirrors_the_race() {
        let race = RaceEntity::from_fact(keirin_fact()).unwrap();
        let event = CalendarEvent::for_race(&race);
        assert_eq!(event.id, race.id.as_str());
        assert_eq!(event.title, "[G1] Takamatsunomiya Kinen Cup");
        assert_eq!(event.end_time - event.start_time, Duration::minutes(5));
        assert!(event.description.contains("stage: S-Final"));
        assert!(event.description.ends_with("race_id: keirin202406013512"));
        assert_eq!(event, CalendarEvent::for_race(&race));
    }

    #[test]
    fn date_window_bounds_are_inclusive() {
        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(),
        )
        .unwrap();
        assert!(window.contains(at(2024, 6, 2, 23, 59)));
        assert!(!window.contains(at(2024, 6, 3, 0, 0)));
        assert_eq!(window.upper_bound(), at(2024, 6, 3, 0, 0));
        assert!(DateWindow::new(window.finish, window.start).is_err());
    }

    #[test]
    fn storable_range_stays_within_four_digit_years() {
        let window = DateWindow::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), NaiveDate::MAX).unwrap();
        let (first, last) = window.storable_range().unwrap();
        assert_eq!(first, at(2024, 6, 1, 0, 0));
        assert_eq!(
            last,
            NaiveDate::from_ymd_opt(9999, 12, 31)
                .unwrap()
                .and_hms_opt(23, 59, 59)
                .unwrap()
        );
        assert_eq!(last.format(crate::DATETIME_FORMAT).to_string(), "9999-12-31 23:59:59");
        assert_eq!(DateWindow::single(NaiveDate::MAX).storable_range(), None);
    }

    #[test]
    fn absent_fields_are_omitted_when_serialized() {
        let race = RaceEntity::from_fact(keirin_fact()).unwrap();
        let json = serde_json::to_value(&race).unwrap();
        assert!(json.get("surface_type").is_none());
        assert_eq!(json["discipline"], "keirin");
    }
}
