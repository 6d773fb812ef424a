//! Scraping gateway contract + fixture-first implementation.
//!
//! A fixture bundle is a captured source page for one discipline: already
//! parsed place/race records, and optionally the raw race-card HTML, whose
//! rows are parsed into additional race facts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use racecal_core::{DateWindow, Discipline, PlaceFact, RaceFact};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "racecal-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Raw schedule facts from the source sites. Facts carry no identifier.
#[async_trait]
pub trait ScrapingGateway: Send + Sync {
    async fn fetch_place_list(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Result<Vec<PlaceFact>, AdapterError>;

    /// Empty `grades` means no grade filter.
    async fn fetch_race_list(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
        grades: &[String],
    ) -> Result<Vec<RaceFact>, AdapterError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub discipline: Discipline,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
    #[serde(default)]
    pub raw_artifact: Option<FixtureRawArtifact>,
    #[serde(default)]
    pub places: Vec<PlaceFact>,
    #[serde(default)]
    pub races: Vec<RaceFact>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRawArtifact {
    pub content_type: String,
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let mut bundle: FixtureBundle = read_json_file(path)?;
    hydrate_inline_raw_artifact(path, &mut bundle)?;
    Ok(bundle)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn hydrate_inline_raw_artifact(bundle_path: &Path, bundle: &mut FixtureBundle) -> Result<()> {
    let Some(raw) = bundle.raw_artifact.as_mut() else {
        return Ok(());
    };
    if raw.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &raw.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    if !raw_path.exists() {
        return Ok(());
    }
    let text = fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture raw artifact {}", raw_path.display()))?;
    raw.inline_text = Some(text);
    Ok(())
}

/// All race facts in a bundle: the parsed records plus any rows of the raw
/// race-card HTML.
pub fn bundle_race_facts(bundle: &FixtureBundle) -> Result<Vec<RaceFact>, AdapterError> {
    let mut races = bundle.races.clone();
    if let Some(raw) = &bundle.raw_artifact {
        if raw.content_type.starts_with("text/html") {
            if let Some(html) = raw.inline_text.as_deref() {
                races.extend(parse_race_card_html(bundle.discipline, html)?);
            }
        }
    }
    Ok(races)
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn cell_text(row: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    row.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Parses `table.race-card` elements. The table carries the meeting
/// (`data-date`, `data-venue`, optional `data-grade`); each `tr.race` row
/// carries number, post time, name and the discipline-specific cells.
pub fn parse_race_card_html(
    discipline: Discipline,
    html: &str,
) -> Result<Vec<RaceFact>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table.race-card")?;
    let row_sel = selector("tr.race")?;
    let number_sel = selector(".number")?;
    let time_sel = selector(".time")?;
    let name_sel = selector(".name")?;
    let grade_sel = selector(".grade")?;
    let stage_sel = selector(".stage")?;
    let surface_sel = selector(".surface")?;
    let distance_sel = selector(".distance")?;

    let mut facts = Vec::new();
    for table in document.select(&table_sel) {
        let attr = |name: &str| table.value().attr(name).and_then(|v| text_or_none(v.to_string()));
        let (Some(date), Some(venue)) = (attr("data-date"), attr("data-venue")) else {
            return Err(AdapterError::Message(
                "race-card table without data-date/data-venue".to_string(),
            ));
        };
        let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .map_err(|e| AdapterError::Message(format!("bad race-card date {date:?}: {e}")))?;
        let table_grade = attr("data-grade");

        for row in table.select(&row_sel) {
            let Some(race_number) = cell_text(&row, &number_sel).and_then(|n| n.parse().ok()) else {
                warn!(%discipline, %venue, "skipping race-card row without a race number");
                continue;
            };
            let Some(time) = cell_text(&row, &time_sel)
                .and_then(|t| NaiveTime::parse_from_str(&t, "%H:%M").ok())
            else {
                warn!(%discipline, %venue, race_number, "skipping race-card row without a post time");
                continue;
            };
            facts.push(RaceFact {
                discipline,
                datetime: date.and_time(time),
                location_name: venue.clone(),
                race_number,
                name: cell_text(&row, &name_sel).unwrap_or_else(|| format!("{venue} R{race_number}")),
                grade: cell_text(&row, &grade_sel).or_else(|| table_grade.clone()),
                surface_type: cell_text(&row, &surface_sel),
                distance: cell_text(&row, &distance_sel)
                    .map(|d| d.trim_end_matches('m').to_string())
                    .and_then(|d| d.parse().ok()),
                stage: cell_text(&row, &stage_sel),
            });
        }
    }
    Ok(facts)
}

/// Serves facts from `<root>/<discipline>/*.json` bundles.
#[derive(Debug, Clone)]
pub struct FixtureScrapingGateway {
    root: PathBuf,
}

impl FixtureScrapingGateway {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundles(&self, discipline: Discipline) -> Result<Vec<FixtureBundle>, AdapterError> {
        let dir = self.root.join(discipline.as_str());
        if !dir.is_dir() {
            debug!(%discipline, dir = %dir.display(), "no fixture directory");
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("listing {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut bundles = Vec::with_capacity(paths.len());
        for path in paths {
            let bundle = load_fixture_bundle(&path)?;
            if bundle.discipline != discipline {
                return Err(AdapterError::Message(format!(
                    "{} declares discipline {} but lives under {}",
                    path.display(),
                    bundle.discipline,
                    discipline
                )));
            }
            bundles.push(bundle);
        }
        Ok(bundles)
    }
}

fn location_allowed(locations: &[String], location: &str) -> bool {
    locations.is_empty() || locations.iter().any(|l| l == location)
}

#[async_trait]
impl ScrapingGateway for FixtureScrapingGateway {
    async fn fetch_place_list(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
    ) -> Result<Vec<PlaceFact>, AdapterError> {
        let mut facts = Vec::new();
        for &discipline in disciplines {
            for bundle in self.bundles(discipline)? {
                facts.extend(bundle.places.into_iter().filter(|p| {
                    p.discipline == discipline
                        && window.contains(p.datetime)
                        && location_allowed(locations, &p.location_name)
                }));
            }
        }
        debug!(count = facts.len(), "fixture place facts");
        Ok(facts)
    }

    async fn fetch_race_list(
        &self,
        disciplines: &[Discipline],
        window: DateWindow,
        locations: &[String],
        grades: &[String],
    ) -> Result<Vec<RaceFact>, AdapterError> {
        let mut facts = Vec::new();
        for &discipline in disciplines {
            for bundle in self.bundles(discipline)? {
                facts.extend(bundle_race_facts(&bundle)?.into_iter().filter(|r| {
                    r.discipline == discipline
                        && window.contains(r.datetime)
                        && location_allowed(locations, &r.location_name)
                        && (grades.is_empty()
                            || r.grade.as_ref().is_some_and(|g| grades.contains(g)))
                }));
            }
        }
        debug!(count = facts.len(), "fixture race facts");
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEIRIN_CARD: &str = r#"
        <html><body>
        <table class="race-card" data-date="2024-06-01" data-venue="Hiratsuka" data-grade="G1">
          <tr class="race"><td class="number">11</td><td class="time">15:30</td>
              <td class="name">Semifinal</td><td class="stage">S-Semifinal</td></tr>
          <tr class="race"><td class="number">12</td><td class="time">16:30</td>
              <td class="name">Final</td><td class="stage">S-Final</td></tr>
          <tr class="race"><td class="number"></td><td class="time">17:00</td></tr>
        </table>
        </body></html>
    "#;

    #[test]
    fn race_card_rows_become_facts() {
        let facts = parse_race_card_html(Discipline::Keirin, KEIRIN_CARD).unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[1].race_number, 12);
        assert_eq!(facts[1].stage.as_deref(), Some("S-Final"));
        assert_eq!(facts[1].grade.as_deref(), Some("G1"));
        assert_eq!(facts[1].location_name, "Hiratsuka");
        assert_eq!(facts[1].datetime.format("%H:%M").to_string(), "16:30");
    }

    #[test]
    fn horse_cells_parse_surface_and_distance() {
        let html = r#"<table class="race-card" data-date="2024-06-02" data-venue="Tokyo">
            <tr class="race"><td class="number">11</td><td class="time">15:40</td>
            <td class="name">Yasuda Kinen</td><td class="grade">GI</td>
            <td class="surface">Turf</td><td class="distance">1600m</td></tr></table>"#;
        let facts = parse_race_card_html(Discipline::Jra, html).unwrap();
        assert_eq!(facts[0].distance, Some(1600));
        assert_eq!(facts[0].surface_type.as_deref(), Some("Turf"));
        assert_eq!(facts[0].grade.as_deref(), Some("GI"));
    }

    #[test]
    fn table_without_meeting_attributes_is_rejected() {
        let html = r#"<table class="race-card"><tr class="race"></tr></table>"#;
        assert!(parse_race_card_html(Discipline::Keirin, html).is_err());
    }
}
