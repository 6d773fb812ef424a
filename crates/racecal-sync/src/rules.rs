use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use racecal_core::Discipline;
use serde::{Deserialize, Serialize};

use crate::classify::{AllowLists, DEFAULT_PRIORITY_THRESHOLD};

/// Per-discipline calendar routing and eligibility rules (`rules.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_threshold")]
    pub priority_threshold: u32,
    #[serde(default)]
    pub disciplines: BTreeMap<Discipline, DisciplineRules>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisciplineRules {
    #[serde(default)]
    pub calendar_id: Option<String>,
    #[serde(default)]
    pub grades: Vec<String>,
}

fn default_threshold() -> u32 {
    DEFAULT_PRIORITY_THRESHOLD
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            priority_threshold: DEFAULT_PRIORITY_THRESHOLD,
            disciplines: BTreeMap::new(),
        }
    }
}

impl RulesConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Disciplines with a rules entry, in [`Discipline::ALL`] order.
    pub fn configured_disciplines(&self) -> Vec<Discipline> {
        Discipline::ALL
            .into_iter()
            .filter(|d| self.disciplines.contains_key(d))
            .collect()
    }

    pub fn allow_lists(&self) -> AllowLists {
        self.disciplines
            .iter()
            .fold(AllowLists::new(), |lists, (discipline, rules)| {
                lists.with(*discipline, rules.grades.iter().cloned())
            })
    }

    pub fn calendar_ids(&self) -> HashMap<Discipline, String> {
        self.disciplines
            .iter()
            .filter_map(|(d, rules)| rules.calendar_id.clone().map(|id| (*d, id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_rules_and_defaults_threshold() {
        let rules = RulesConfig::from_yaml_str(
            r#"
disciplines:
  keirin:
    calendar_id: keirin@group.calendar.google.com
    grades: [GP, G1]
  jra:
    grades: [GI]
"#,
        )
        .unwrap();
        assert_eq!(rules.priority_threshold, DEFAULT_PRIORITY_THRESHOLD);
        assert_eq!(
            rules.configured_disciplines(),
            vec![Discipline::Jra, Discipline::Keirin]
        );
        assert!(rules.allow_lists().allows(Discipline::Keirin, Some("GP")));
        assert!(!rules.allow_lists().allows(Discipline::Jra, Some("GII")));
        assert_eq!(rules.calendar_ids().len(), 1);
    }

    #[test]
    fn unknown_disciplines_are_rejected() {
        assert!(RulesConfig::from_yaml_str("disciplines:\n  harness: {}\n").is_err());
    }

    #[test]
    fn workspace_rules_file_loads() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../rules.yaml");
        let rules = RulesConfig::load(path).unwrap();
        assert_eq!(rules.configured_disciplines(), Discipline::ALL.to_vec());
    }
}
