//! Calendar eligibility. Allow-list disciplines only check the race grade;
//! tiered disciplines also need a (grade, stage) priority at or above the
//! threshold.

use std::collections::{HashMap, HashSet};

use racecal_core::Discipline::{self, AutoRace, Boatrace, Keirin};
use racecal_core::{RaceEntity, RuleFamily};

pub const DEFAULT_PRIORITY_THRESHOLD: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityEntry {
    pub discipline: Discipline,
    pub grade: &'static str,
    pub stage: &'static str,
    pub priority: u32,
}

const fn entry(discipline: Discipline, grade: &'static str, stage: &'static str, priority: u32) -> PriorityEntry {
    PriorityEntry {
        discipline,
        grade,
        stage,
        priority,
    }
}

static STANDARD_PRIORITIES: &[PriorityEntry] = &[
    entry(Keirin, "GP", "S-Final", 9),
    entry(Keirin, "G1", "S-Final", 8),
    entry(Keirin, "G1", "S-Semifinal", 6),
    entry(Keirin, "G1", "S-Special-Select", 5),
    entry(Keirin, "G1", "S-Second-Round", 4),
    entry(Keirin, "G1", "S-Qualifier", 3),
    entry(Keirin, "G2", "S-Final", 7),
    entry(Keirin, "G2", "S-Semifinal", 5),
    entry(Keirin, "G2", "S-Special-Select", 4),
    entry(Keirin, "G2", "S-Qualifier", 2),
    entry(Keirin, "G3", "S-Final", 6),
    entry(Keirin, "G3", "S-Semifinal", 4),
    entry(Keirin, "G3", "S-Special-Select", 3),
    entry(Keirin, "G3", "S-Qualifier", 1),
    entry(Keirin, "F1", "S-Final", 4),
    entry(Keirin, "F1", "S-Semifinal", 2),
    entry(Keirin, "F1", "A-Final", 1),
    entry(Keirin, "F2", "A-Final", 1),
    entry(Boatrace, "SG", "Final", 9),
    entry(Boatrace, "SG", "Semifinal", 7),
    entry(Boatrace, "SG", "Qualifier", 5),
    entry(Boatrace, "G1", "Final", 7),
    entry(Boatrace, "G1", "Semifinal", 5),
    entry(Boatrace, "G1", "Qualifier", 3),
    entry(Boatrace, "G2", "Final", 5),
    entry(Boatrace, "G2", "Semifinal", 3),
    entry(Boatrace, "G3", "Final", 4),
    entry(Boatrace, "G3", "Semifinal", 2),
    entry(Boatrace, "General", "Final", 1),
    entry(AutoRace, "SG", "Final", 9),
    entry(AutoRace, "SG", "Semifinal", 6),
    entry(AutoRace, "SG", "Qualifier", 4),
    entry(AutoRace, "G1", "Final", 7),
    entry(AutoRace, "G1", "Semifinal", 5),
    entry(AutoRace, "G1", "Qualifier", 3),
    entry(AutoRace, "G2", "Final", 5),
    entry(AutoRace, "G2", "Semifinal", 3),
    entry(AutoRace, "Open", "Final", 2),
];

/// Immutable (discipline, grade, stage) -> priority lookup.
#[derive(Debug, Clone, Copy)]
pub struct PriorityTable {
    entries: &'static [PriorityEntry],
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl PriorityTable {
    pub const fn standard() -> Self {
        Self {
            entries: STANDARD_PRIORITIES,
        }
    }

    pub const fn new(entries: &'static [PriorityEntry]) -> Self {
        Self { entries }
    }

    /// 0 when no row matches.
    pub fn priority_of(&self, discipline: Discipline, grade: &str, stage: &str) -> u32 {
        self.entries
            .iter()
            .find(|e| e.discipline == discipline && e.grade == grade && e.stage == stage)
            .map_or(0, |e| e.priority)
    }
}

/// Priority from the standard table.
pub fn priority_of(discipline: Discipline, grade: &str, stage: &str) -> u32 {
    PriorityTable::standard().priority_of(discipline, grade, stage)
}

/// Per-discipline grade allow-lists. A discipline with no list admits nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowLists {
    grades: HashMap<Discipline, HashSet<String>>,
}

impl AllowLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, S>(mut self, discipline: Discipline, grades: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grades
            .entry(discipline)
            .or_default()
            .extend(grades.into_iter().map(Into::into));
        self
    }

    pub fn allows(&self, discipline: Discipline, grade: Option<&str>) -> bool {
        match (self.grades.get(&discipline), grade) {
            (Some(allowed), Some(grade)) => allowed.contains(grade),
            _ => false,
        }
    }
}

pub fn is_eligible(
    race: &RaceEntity,
    allow_lists: &AllowLists,
    table: &PriorityTable,
    threshold: u32,
) -> bool {
    if !allow_lists.allows(race.discipline, race.grade.as_deref()) {
        return false;
    }
    match race.discipline.family() {
        RuleFamily::AllowList => true,
        RuleFamily::Tiered => {
            let grade = race.grade.as_deref().unwrap_or_default();
            let stage = race.stage.as_deref().unwrap_or_default();
            table.priority_of(race.discipline, grade, stage) >= threshold
        }
    }
}

/// Eligible races, grouped by discipline in [`Discipline::ALL`] order, input
/// order kept within each discipline.
pub fn classify(
    races: &[RaceEntity],
    allow_lists: &AllowLists,
    table: &PriorityTable,
    threshold: u32,
) -> Vec<RaceEntity> {
    Discipline::ALL
        .iter()
        .flat_map(|&discipline| {
            races
                .iter()
                .filter(move |r| r.discipline == discipline)
                .filter(move |r| is_eligible(r, allow_lists, table, threshold))
                .cloned()
        })
        .collect()
}
