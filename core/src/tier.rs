//! Geographic tier classification.
//!
//! Country names are normalised to ISO codes through the alias table,
//! then matched against the three tier lists. Anything that resolves to
//! a code outside the lists is `Other`; blank and null-sentinel input is
//! `Unknown`.

use crate::config::TierConfig;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    #[serde(rename = "Tier 1")]
    Tier1,
    #[serde(rename = "Tier 2")]
    Tier2,
    #[serde(rename = "Tier 3")]
    Tier3,
    Other,
    Unknown,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Tier1, Tier::Tier2, Tier::Tier3, Tier::Other, Tier::Unknown];

    pub fn label(&self) -> &'static str {
        match self {
            Tier::Tier1 => "Tier 1",
            Tier::Tier2 => "Tier 2",
            Tier::Tier3 => "Tier 3",
            Tier::Other => "Other",
            Tier::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::ALL
            .into_iter()
            .find(|t| t.label() == s)
            .ok_or_else(|| format!("unknown tier label '{s}'"))
    }
}

/// Values the stores use in place of a missing country.
const NULL_SENTINELS: [&str; 3] = ["Unknown", "NULL", "None"];

/// Blank or a null sentinel.
pub fn is_missing_country(country: &str) -> bool {
    let trimmed = country.trim();
    trimmed.is_empty() || NULL_SENTINELS.contains(&trimmed)
}

#[derive(Debug, Clone)]
pub struct TierClassifier {
    aliases: HashMap<String, String>,
    tier_1: HashSet<String>,
    tier_2: HashSet<String>,
    tier_3: HashSet<String>,
}

impl TierClassifier {
    pub fn new(config: &TierConfig) -> Self {
        let set = |list: &[String]| -> HashSet<String> { list.iter().cloned().collect() };
        Self {
            aliases: config.country_aliases.clone().into_iter().collect(),
            tier_1: set(&config.tier_1),
            tier_2: set(&config.tier_2),
            tier_3: set(&config.tier_3),
        }
    }

    /// Resolve a full country name to its ISO code; codes pass through.
    /// Matching is case-sensitive.
    pub fn country_code(&self, country: &str) -> String {
        let country = country.trim();
        match self.aliases.get(country) {
            Some(code) => code.clone(),
            None => country.to_string(),
        }
    }

    pub fn classify(&self, country: &str) -> Tier {
        if is_missing_country(country) {
            return Tier::Unknown;
        }

        let code = self.country_code(country);
        if self.tier_1.contains(&code) {
            Tier::Tier1
        } else if self.tier_2.contains(&code) {
            Tier::Tier2
        } else if self.tier_3.contains(&code) {
            Tier::Tier3
        } else {
            Tier::Other
        }
    }

    pub fn classify_opt(&self, country: Option<&str>) -> Tier {
        country.map_or(Tier::Unknown, |c| self.classify(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_tiers;

    fn classifier() -> TierClassifier {
        TierClassifier::new(&default_tiers())
    }

    #[test]
    fn full_name_and_code_agree() {
        let c = classifier();
        for (name, code) in &default_tiers().country_aliases {
            assert_eq!(
                c.classify(name),
                c.classify(code),
                "{name} and {code} classified differently"
            );
        }
        assert_eq!(c.classify("Russian Federation"), Tier::Tier3);
        assert_eq!(c.classify("RU"), Tier::Tier3);
        assert_eq!(c.classify("Czech Republic"), c.classify("Czechia"));
    }

    #[test]
    fn tier_lists_map_to_their_tier() {
        let c = classifier();
        assert_eq!(c.classify("US"), Tier::Tier1);
        assert_eq!(c.classify("Germany"), Tier::Tier1);
        assert_eq!(c.classify("Brazil"), Tier::Tier2);
        assert_eq!(c.classify("LT"), Tier::Tier2);
        assert_eq!(c.classify("India"), Tier::Tier3);
    }

    #[test]
    fn unlisted_countries_are_other() {
        let c = classifier();
        assert_eq!(c.classify("Kazakhstan"), Tier::Other);
        assert_eq!(c.classify("JP"), Tier::Other);
        assert_eq!(c.classify("Atlantis"), Tier::Other);
    }

    #[test]
    fn blank_and_sentinels_are_unknown() {
        let c = classifier();
        for input in ["", "   ", "Unknown", "NULL", "None"] {
            assert_eq!(c.classify(input), Tier::Unknown, "input {input:?}");
        }
        assert_eq!(c.classify_opt(None), Tier::Unknown);
        assert!(is_missing_country(" NULL "));
        assert!(!is_missing_country("unknown"));
    }

    #[test]
    fn classify_is_total_over_odd_input() {
        let c = classifier();
        for input in ["\u{0}", "ÄÖÜ", "🇺🇸", "us", "Tier 1", "\n\t"] {
            let tier = c.classify(input);
            assert!(Tier::ALL.contains(&tier));
        }
    }

    #[test]
    fn codes_and_names_match_case_sensitively() {
        let c = classifier();
        assert_eq!(c.classify("us"), Tier::Other);
        assert_eq!(c.classify("germany"), Tier::Other);
        assert_eq!(c.classify(" US "), Tier::Tier1);
    }

    #[test]
    fn labels_round_trip() {
        for tier in Tier::ALL {
            assert_eq!(tier.label().parse::<Tier>().unwrap(), tier);
        }
    }
}
