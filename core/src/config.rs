use crate::error::{PushError, PushResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn start_str(&self) -> String {
        self.start.format("%Y-%m-%d").to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format("%Y-%m-%d").to_string()
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.start_str(), self.end_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub tier_1: Vec<String>,
    pub tier_2: Vec<String>,
    pub tier_3: Vec<String>,
    /// Full country name (as stored by the push-event store) to ISO code.
    pub country_aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEndpoint {
    /// SQLite file path or `file:` URI.
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub push_events: StoreEndpoint,
    pub conversions: StoreEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub freshness_secs: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_device_lookup_limit() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub push_window: DateWindow,
    pub conversion_window: DateWindow,
    pub platform_type: i64,
    pub push_event_type: i64,
    pub target_apps: Vec<String>,
    pub control_group_id: String,
    pub tiers: TierConfig,
    pub stores: StoreConfig,
    pub cache: CacheConfig,
    pub processed_dir: PathBuf,
    #[serde(default = "default_device_lookup_limit")]
    pub device_lookup_limit: usize,
}

impl AnalysisConfig {
    /// Load from a JSON file.
    /// In tests, use AnalysisConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: AnalysisConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Cannot parse {path}: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PushResult<()> {
        for (label, window) in [
            ("push_window", &self.push_window),
            ("conversion_window", &self.conversion_window),
        ] {
            if window.start > window.end {
                return Err(PushError::InvalidConfig(format!(
                    "{label} starts after it ends ({window})"
                )));
            }
        }

        if self.control_group_id.trim().is_empty() {
            return Err(PushError::InvalidConfig(
                "control_group_id must not be empty".into(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for code in self
            .tiers
            .tier_1
            .iter()
            .chain(&self.tiers.tier_2)
            .chain(&self.tiers.tier_3)
        {
            if !seen.insert(code.as_str()) {
                return Err(PushError::InvalidConfig(format!(
                    "country code {code} listed in more than one tier"
                )));
            }
        }
        Ok(())
    }

    /// Config with hardcoded defaults for use in unit tests.
    /// Stores point at in-memory databases; callers override `stores`.
    pub fn default_test() -> Self {
        let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default();
        Self {
            push_window: DateWindow::new(date(2025, 5, 22), date(2025, 5, 29)),
            conversion_window: DateWindow::new(date(2025, 5, 22), date(2025, 6, 7)),
            platform_type: 1,
            push_event_type: 7,
            target_apps: ["Michelangelo", "Leonardo", "Raphael", "Splinter"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            control_group_id: "6".into(),
            tiers: default_tiers(),
            stores: StoreConfig {
                push_events: StoreEndpoint {
                    uri: "file:push_events?mode=memory&cache=shared".into(),
                },
                conversions: StoreEndpoint {
                    uri: "file:conversions?mode=memory&cache=shared".into(),
                },
            },
            cache: CacheConfig {
                dir: PathBuf::from("data/cache"),
                freshness_secs: 3600,
                enabled: false,
            },
            processed_dir: PathBuf::from("data/processed"),
            device_lookup_limit: default_device_lookup_limit(),
        }
    }
}

fn codes(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Tier lists and country aliases used when no config file overrides them.
pub fn default_tiers() -> TierConfig {
    let tier_1 = codes(&[
        "US", "UK", "CA", "AU", "DE", "FR", "NL", "SE", "NO", "DK", "CH", "AT", "BE", "FI",
    ]);
    let tier_2 = codes(&[
        "ES", "IT", "PL", "BR", "MX", "AR", "CL", "CZ", "HU", "SK", "HR", "SI", "EE", "LV", "LT",
    ]);
    let tier_3 = codes(&[
        "IN", "ID", "TH", "VN", "PH", "MY", "BD", "PK", "UA", "RU", "TR", "EG", "ZA", "NG",
    ]);

    let aliases: &[(&str, &str)] = &[
        ("United States", "US"),
        ("United Kingdom", "UK"),
        ("Canada", "CA"),
        ("Australia", "AU"),
        ("Germany", "DE"),
        ("France", "FR"),
        ("Netherlands", "NL"),
        ("Sweden", "SE"),
        ("Norway", "NO"),
        ("Denmark", "DK"),
        ("Switzerland", "CH"),
        ("Austria", "AT"),
        ("Belgium", "BE"),
        ("Finland", "FI"),
        ("Spain", "ES"),
        ("Italy", "IT"),
        ("Poland", "PL"),
        ("Brazil", "BR"),
        ("Mexico", "MX"),
        ("Argentina", "AR"),
        ("Chile", "CL"),
        ("Czechia", "CZ"),
        ("Czech Republic", "CZ"),
        ("Hungary", "HU"),
        ("Slovakia", "SK"),
        ("Croatia", "HR"),
        ("Slovenia", "SI"),
        ("Estonia", "EE"),
        ("Latvia", "LV"),
        ("Lithuania", "LT"),
        ("India", "IN"),
        ("Indonesia", "ID"),
        ("Thailand", "TH"),
        ("Vietnam", "VN"),
        ("Philippines", "PH"),
        ("Malaysia", "MY"),
        ("Bangladesh", "BD"),
        ("Pakistan", "PK"),
        ("Ukraine", "UA"),
        ("Russia", "RU"),
        ("Russian Federation", "RU"),
        ("Turkey", "TR"),
        ("Egypt", "EG"),
        ("South Africa", "ZA"),
        ("Nigeria", "NG"),
        // Outside the tier lists; classified as Other.
        ("Kazakhstan", "KZ"),
        ("Venezuela", "VE"),
        ("Venezuela, Bolivarian Republic of", "VE"),
        ("Côte d'Ivoire", "CI"),
        ("Serbia", "RS"),
        ("Bosnia and Herzegovina", "BA"),
        ("Albania", "AL"),
        ("Bulgaria", "BG"),
        ("Romania", "RO"),
        ("Moldova", "MD"),
        ("Belarus", "BY"),
        ("Georgia", "GE"),
        ("Armenia", "AM"),
        ("Azerbaijan", "AZ"),
        ("Morocco", "MA"),
        ("Tunisia", "TN"),
        ("Algeria", "DZ"),
        ("Jordan", "JO"),
        ("Lebanon", "LB"),
        ("Iran", "IR"),
        ("Iraq", "IQ"),
        ("Saudi Arabia", "SA"),
        ("United Arab Emirates", "AE"),
        ("Israel", "IL"),
        ("Kenya", "KE"),
        ("Ghana", "GH"),
        ("Senegal", "SN"),
        ("Tanzania", "TZ"),
        ("Uganda", "UG"),
        ("Ethiopia", "ET"),
        ("Colombia", "CO"),
        ("Peru", "PE"),
        ("Ecuador", "EC"),
        ("Uruguay", "UY"),
        ("Paraguay", "PY"),
        ("Bolivia", "BO"),
        ("Costa Rica", "CR"),
        ("Panama", "PA"),
        ("Guatemala", "GT"),
        ("Dominican Republic", "DO"),
        ("Cuba", "CU"),
        ("Jamaica", "JM"),
        ("China", "CN"),
        ("Japan", "JP"),
        ("South Korea", "KR"),
        ("Taiwan", "TW"),
        ("Hong Kong", "HK"),
        ("Singapore", "SG"),
        ("New Zealand", "NZ"),
    ];

    TierConfig {
        tier_1,
        tier_2,
        tier_3,
        country_aliases: aliases
            .iter()
            .map(|(name, code)| (name.to_string(), code.to_string()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_test_config_is_valid() {
        AnalysisConfig::default_test().validate().unwrap();
    }

    #[test]
    fn overlapping_tiers_are_rejected() {
        let mut config = AnalysisConfig::default_test();
        config.tiers.tier_3.push("US".into());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("US"), "unexpected error: {err}");
    }

    #[test]
    fn inverted_window_is_rejected() {
        let mut config = AnalysisConfig::default_test();
        std::mem::swap(&mut config.push_window.start, &mut config.push_window.end);
        assert!(config.validate().is_err());
    }

    #[test]
    fn shipped_config_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../data/analysis_config.json");
        let config = AnalysisConfig::load(path).unwrap();
        assert_eq!(config.control_group_id, "6");
        assert!(config.cache.enabled);
        assert_eq!(
            config.tiers.country_aliases.len(),
            default_tiers().country_aliases.len()
        );
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = AnalysisConfig::default_test();
        let json = serde_json::to_string(&config).unwrap();
        let back: AnalysisConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.push_window, config.push_window);
        assert_eq!(back.tiers.country_aliases.len(), config.tiers.country_aliases.len());
        assert_eq!(back.device_lookup_limit, 10_000);
    }
}
