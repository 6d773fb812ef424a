//! Discipline descriptors: the per-discipline rules shared by every layer.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FormatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Discipline {
    Jra,
    Nar,
    World,
    Keirin,
    AutoRace,
    Boatrace,
}

/// Eligibility rule family a discipline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleFamily {
    /// Race grade must be in the configured allow-list.
    AllowList,
    /// Allow-list plus a (grade, stage) priority threshold.
    Tiered,
}

/// Static description of how one discipline is identified, stored and classified.
#[derive(Debug)]
pub struct DisciplineDescriptor {
    pub discipline: Discipline,
    pub prefix: &'static str,
    pub family: RuleFamily,
    /// Places carry a `held_day` row (meeting/day sequence).
    pub uses_held_days: bool,
    /// Places carry a `place_grade` row.
    pub uses_place_grade: bool,
    /// Races carry a `race_condition` row (surface type + distance).
    pub uses_race_condition: bool,
    /// Races carry a `race_stage` row.
    pub uses_stage: bool,
    pub event_duration_minutes: i64,
    venues: &'static [(&'static str, &'static str)],
}

impl DisciplineDescriptor {
    /// Two-digit venue code for a location name, matched case-insensitively.
    pub fn venue_code(&self, location: &str) -> Option<&'static str> {
        let location = location.trim();
        self.venues
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(location))
            .map(|(_, code)| *code)
    }

    pub fn venue_name(&self, code: &str) -> Option<&'static str> {
        self.venues
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(name, _)| *name)
    }

    pub fn venues(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.venues.iter().map(|(name, _)| *name)
    }
}

impl Discipline {
    pub const ALL: [Discipline; 6] = [
        Discipline::Jra,
        Discipline::Nar,
        Discipline::World,
        Discipline::Keirin,
        Discipline::AutoRace,
        Discipline::Boatrace,
    ];

    pub fn descriptor(self) -> &'static DisciplineDescriptor {
        match self {
            Discipline::Jra => &JRA,
            Discipline::Nar => &NAR,
            Discipline::World => &WORLD,
            Discipline::Keirin => &KEIRIN,
            Discipline::AutoRace => &AUTORACE,
            Discipline::Boatrace => &BOATRACE,
        }
    }

    pub fn as_str(self) -> &'static str {
        self.descriptor().prefix
    }

    pub fn family(self) -> RuleFamily {
        self.descriptor().family
    }
}

impl fmt::Display for Discipline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Discipline {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Discipline::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| FormatError::UnknownDiscipline(s.to_string()))
    }
}

static JRA: DisciplineDescriptor = DisciplineDescriptor {
    discipline: Discipline::Jra,
    prefix: "jra",
    family: RuleFamily::AllowList,
    uses_held_days: true,
    uses_place_grade: false,
    uses_race_condition: true,
    uses_stage: false,
    event_duration_minutes: 10,
    venues: &[
        ("Sapporo", "01"),
        ("Hakodate", "02"),
        ("Fukushima", "03"),
        ("Niigata", "04"),
        ("Tokyo", "05"),
        ("Nakayama", "06"),
        ("Chukyo", "07"),
        ("Kyoto", "08"),
        ("Hanshin", "09"),
        ("Kokura", "10"),
    ],
};

static NAR: DisciplineDescriptor = DisciplineDescriptor {
    discipline: Discipline::Nar,
    prefix: "nar",
    family: RuleFamily::AllowList,
    uses_held_days: false,
    uses_place_grade: false,
    uses_race_condition: true,
    uses_stage: false,
    event_duration_minutes: 10,
    venues: &[
        ("Monbetsu", "30"),
        ("Morioka", "35"),
        ("Mizusawa", "36"),
        ("Urawa", "42"),
        ("Funabashi", "43"),
        ("Ohi", "44"),
        ("Kawasaki", "45"),
        ("Kanazawa", "46"),
        ("Kasamatsu", "47"),
        ("Nagoya", "48"),
        ("Sonoda", "50"),
        ("Himeji", "51"),
        ("Kochi", "54"),
        ("Saga", "55"),
        ("Obihiro", "65"),
    ],
};

static WORLD: DisciplineDescriptor = DisciplineDescriptor {
    discipline: Discipline::World,
    prefix: "world",
    family: RuleFamily::AllowList,
    uses_held_days: false,
    uses_place_grade: false,
    uses_race_condition: true,
    uses_stage: false,
    event_duration_minutes: 10,
    venues: &[
        ("Longchamp", "01"),
        ("Chantilly", "02"),
        ("Deauville", "03"),
        ("Saint-Cloud", "04"),
        ("Ascot", "05"),
        ("Epsom", "06"),
        ("Newmarket", "07"),
        ("York", "08"),
        ("Goodwood", "09"),
        ("Curragh", "10"),
        ("Leopardstown", "11"),
        ("Churchill Downs", "12"),
        ("Santa Anita", "13"),
        ("Belmont Park", "14"),
        ("Saratoga", "15"),
        ("Keeneland", "16"),
        ("Del Mar", "17"),
        ("Meydan", "18"),
        ("Sha Tin", "19"),
        ("Happy Valley", "20"),
        ("Flemington", "21"),
        ("Randwick", "22"),
        ("Moonee Valley", "23"),
        ("King Abdulaziz", "24"),
        ("Baden-Baden", "25"),
    ],
};

static KEIRIN: DisciplineDescriptor = DisciplineDescriptor {
    discipline: Discipline::Keirin,
    prefix: "keirin",
    family: RuleFamily::Tiered,
    uses_held_days: false,
    uses_place_grade: true,
    uses_race_condition: false,
    uses_stage: true,
    event_duration_minutes: 5,
    venues: &[
        ("Hakodate", "11"),
        ("Aomori", "12"),
        ("Iwaki-Taira", "13"),
        ("Yahiko", "21"),
        ("Maebashi", "22"),
        ("Toride", "23"),
        ("Utsunomiya", "24"),
        ("Omiya", "25"),
        ("Seibuen", "26"),
        ("Keiokaku", "27"),
        ("Tachikawa", "28"),
        ("Matsudo", "31"),
        ("Chiba", "32"),
        ("Kawasaki", "34"),
        ("Hiratsuka", "35"),
        ("Odawara", "36"),
        ("Ito", "37"),
        ("Shizuoka", "38"),
        ("Nagoya", "42"),
        ("Gifu", "43"),
        ("Ogaki", "44"),
        ("Toyohashi", "45"),
        ("Toyama", "46"),
        ("Matsusaka", "47"),
        ("Yokkaichi", "48"),
        ("Fukui", "51"),
        ("Nara", "53"),
        ("Mukomachi", "54"),
        ("Wakayama", "55"),
        ("Kishiwada", "56"),
        ("Tamano", "61"),
        ("Hiroshima", "62"),
        ("Hofu", "63"),
        ("Takamatsu", "71"),
        ("Komatsushima", "73"),
        ("Kochi", "74"),
        ("Matsuyama", "75"),
        ("Kokura", "81"),
        ("Kurume", "83"),
        ("Takeo", "84"),
        ("Sasebo", "85"),
        ("Beppu", "86"),
        ("Kumamoto", "87"),
    ],
};

static AUTORACE: DisciplineDescriptor = DisciplineDescriptor {
    discipline: Discipline::AutoRace,
    prefix: "autorace",
    family: RuleFamily::Tiered,
    uses_held_days: false,
    uses_place_grade: true,
    uses_race_condition: false,
    uses_stage: true,
    event_duration_minutes: 5,
    venues: &[
        ("Kawaguchi", "02"),
        ("Isesaki", "03"),
        ("Hamamatsu", "04"),
        ("Iizuka", "05"),
        ("Sanyo", "06"),
    ],
};

static BOATRACE: DisciplineDescriptor = DisciplineDescriptor {
    discipline: Discipline::Boatrace,
    prefix: "boatrace",
    family: RuleFamily::Tiered,
    uses_held_days: false,
    uses_place_grade: true,
    uses_race_condition: false,
    uses_stage: true,
    event_duration_minutes: 5,
    venues: &[
        ("Kiryu", "01"),
        ("Toda", "02"),
        ("Edogawa", "03"),
        ("Heiwajima", "04"),
        ("Tamagawa", "05"),
        ("Hamanako", "06"),
        ("Gamagori", "07"),
        ("Tokoname", "08"),
        ("Tsu", "09"),
        ("Mikuni", "10"),
        ("Biwako", "11"),
        ("Suminoe", "12"),
        ("Amagasaki", "13"),
        ("Naruto", "14"),
        ("Marugame", "15"),
        ("Kojima", "16"),
        ("Miyajima", "17"),
        ("Tokuyama", "18"),
        ("Shimonoseki", "19"),
        ("Wakamatsu", "20"),
        ("Ashiya", "21"),
        ("Fukuoka", "22"),
        ("Karatsu", "23"),
        ("Omura", "24"),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_codes_are_unique_within_each_discipline() {
        for discipline in Discipline::ALL {
            let descriptor = discipline.descriptor();
            let mut codes: Vec<_> = descriptor.venues.iter().map(|(_, c)| *c).collect();
            let total = codes.len();
            codes.sort_unstable();
            codes.dedup();
            assert_eq!(codes.len(), total, "duplicate venue code in {discipline}");
            assert!(codes.iter().all(|c| c.len() == 2 && c.bytes().all(|b| b.is_ascii_digit())));
        }
    }

    #[test]
    fn venue_lookup_is_scoped_to_the_discipline() {
        assert_eq!(Discipline::Nar.descriptor().venue_code("Kawasaki"), Some("45"));
        assert_eq!(Discipline::Keirin.descriptor().venue_code("kawasaki"), Some("34"));
        assert_eq!(Discipline::Jra.descriptor().venue_code("Kawasaki"), None);
        assert_eq!(Discipline::Boatrace.descriptor().venue_name("24"), Some("Omura"));
    }

    #[test]
    fn discipline_parses_from_prefix() {
        assert_eq!("autorace".parse::<Discipline>().unwrap(), Discipline::AutoRace);
        assert_eq!(" JRA ".parse::<Discipline>().unwrap(), Discipline::Jra);
        assert!("horse".parse::<Discipline>().is_err());
    }

    #[test]
    fn conditional_tables_follow_the_rule_family() {
        for discipline in Discipline::ALL {
            let d = discipline.descriptor();
            match d.family {
                RuleFamily::Tiered => {
                    assert!(d.uses_place_grade && d.uses_stage && !d.uses_race_condition);
                }
                RuleFamily::AllowList => {
                    assert!(!d.uses_place_grade && !d.uses_stage && d.uses_race_condition);
                }
            }
        }
        assert!(Discipline::Jra.descriptor().uses_held_days);
        assert_eq!(
            Discipline::ALL.iter().filter(|d| d.descriptor().uses_held_days).count(),
            1
        );
    }
}
