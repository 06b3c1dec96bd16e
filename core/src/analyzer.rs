//! Push analyzer. Joins push/control rows with conversions and computes
//! per-group conversion statistics and lift over the control group.
//!
//! RULE: The analyzer never touches a store. It works on records the
//! loader (or a snapshot) already produced.
//!
//! Users are counted once per group: `total_users` is the number of
//! distinct user ids in the group, and a user counts as converted when any
//! of their rows carries a deposit (registration).

use crate::{
    config::AnalysisConfig,
    model::{ConversionRecord, MergedRecord, PushBucket, PushRecord, UserType},
    tier::{is_missing_country, Tier, TierClassifier},
    types::{round_to, GroupId},
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GroupType {
    #[serde(rename = "Control Group")]
    Control,
    #[serde(rename = "Push Group")]
    Push,
}

/// Aggregates shared by every summary cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMetrics {
    pub total_users: usize,
    pub avg_pushes: f64,
    pub users_with_deposits: usize,
    pub users_with_regs: usize,
    pub total_deposits: i64,
    pub total_registrations: i64,
    pub total_revenue: f64,
    /// Percent of users with at least one deposit.
    pub deposit_conversion: f64,
    pub reg_conversion: f64,
    /// Deposits per user.
    pub arpu: f64,
    pub revenue_per_user: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbGroupSummary {
    pub ab_group: GroupId,
    pub group_type: GroupType,
    #[serde(flatten)]
    pub metrics: GroupMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoTierSummary {
    pub tier: Tier,
    pub ab_group: GroupId,
    pub group_type: GroupType,
    #[serde(flatten)]
    pub metrics: GroupMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketSummary {
    pub tier: Tier,
    pub push_bucket: PushBucket,
    pub total_users: usize,
    pub users_with_deposits: usize,
    pub conversion_rate: f64,
}

// ── Effectiveness report ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlMetrics {
    pub group_id: GroupId,
    pub users: usize,
    pub deposits: i64,
    pub conversion_rate: f64,
    pub arpu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushAverage {
    pub conversion_rate: f64,
    pub improvement_vs_control: f64,
    pub relative_improvement_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestPushGroup {
    pub group_id: GroupId,
    pub conversion_rate: f64,
    pub improvement_vs_control: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivenessVerdict {
    pub push_effective: bool,
    pub avg_lift_percentage_points: f64,
    pub best_lift_percentage_points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEffectiveness {
    pub control_group: ControlMetrics,
    pub push_groups_average: PushAverage,
    pub best_push_group: BestPushGroup,
    pub summary: EffectivenessVerdict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnavailableReason {
    MissingControlGroup { group_id: GroupId },
    NoPushGroups,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnavailableReason::MissingControlGroup { group_id } => {
                write!(f, "control group {group_id} not found in the A/B summary")
            }
            UnavailableReason::NoPushGroups => f.write_str("no push groups to compare"),
        }
    }
}

/// Lift of push groups over the control group, or the reason it could not
/// be computed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EffectivenessReport {
    Evaluated(PushEffectiveness),
    Unavailable { error: UnavailableReason },
}

impl EffectivenessReport {
    pub fn evaluated(&self) -> Option<&PushEffectiveness> {
        match self {
            EffectivenessReport::Evaluated(e) => Some(e),
            EffectivenessReport::Unavailable { .. } => None,
        }
    }
}

// ── Analyzer ─────────────────────────────────────────────────────────────────

pub struct PushAnalyzer {
    control_group_id: GroupId,
    classifier: TierClassifier,
}

/// Conversion totals of one user across every country/campaign row.
#[derive(Default)]
struct UserConversions {
    deposits: i64,
    registrations: i64,
    revenue: f64,
    events: i64,
    country: Option<String>,
}

impl PushAnalyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            control_group_id: config.control_group_id.clone(),
            classifier: TierClassifier::new(&config.tiers),
        }
    }

    fn group_type(&self, group: &str) -> GroupType {
        if group == self.control_group_id {
            GroupType::Control
        } else {
            GroupType::Push
        }
    }

    /// Left join on user id. Every push/control row yields exactly one
    /// merged row; users without conversions get zero totals. A user with
    /// rows in several countries carries the same totals on each row.
    pub fn merge_data(
        &self,
        push: &[PushRecord],
        conversions: &[ConversionRecord],
    ) -> Vec<MergedRecord> {
        let mut by_user: HashMap<&str, UserConversions> = HashMap::new();
        for c in conversions {
            let entry = by_user.entry(c.user_id.as_str()).or_default();
            entry.deposits += c.total_deposits;
            entry.registrations += c.total_registrations;
            entry.revenue += c.total_revenue;
            entry.events += c.conversion_events;
            if entry.country.is_none() {
                entry.country = c.country.clone();
            }
        }

        let mut matched = 0usize;
        let merged: Vec<MergedRecord> = push
            .iter()
            .map(|p| {
                let conv = by_user.get(p.user_id.as_str());
                if conv.is_some() {
                    matched += 1;
                }
                let country = p
                    .country
                    .clone()
                    .filter(|c| !is_missing_country(c))
                    .or_else(|| conv.and_then(|c| c.country.clone()));
                let deposits = conv.map_or(0, |c| c.deposits);
                let registrations = conv.map_or(0, |c| c.registrations);

                MergedRecord {
                    user_id: p.user_id.clone(),
                    ab_group: p.ab_group.clone(),
                    tier: self.classifier.classify_opt(country.as_deref()),
                    country,
                    push_count: p.push_count,
                    push_days: p.push_days,
                    push_bucket: p.push_bucket,
                    campaign_duration_hours: p.campaign_duration_hours,
                    first_push: p.first_push,
                    total_deposits: deposits,
                    total_registrations: registrations,
                    total_revenue: conv.map_or(0.0, |c| c.revenue),
                    conversion_events: conv.map_or(0, |c| c.events),
                    has_deposit: deposits > 0,
                    has_registration: registrations > 0,
                    user_type: UserType::classify(deposits, registrations),
                }
            })
            .collect();

        log::info!(
            "analyzer: merged {} rows, {matched} with conversions",
            merged.len()
        );
        merged
    }

    pub fn ab_analysis(&self, merged: &[MergedRecord]) -> Vec<AbGroupSummary> {
        let mut groups: BTreeMap<&str, GroupAccumulator> = BTreeMap::new();
        for r in merged {
            groups.entry(r.ab_group.as_str()).or_default().add(r);
        }
        groups
            .into_iter()
            .map(|(group, acc)| AbGroupSummary {
                ab_group: group.to_string(),
                group_type: self.group_type(group),
                metrics: acc.finish(),
            })
            .collect()
    }

    pub fn geo_analysis(&self, merged: &[MergedRecord]) -> Vec<GeoTierSummary> {
        let mut cells: BTreeMap<(Tier, &str), GroupAccumulator> = BTreeMap::new();
        for r in merged {
            cells
                .entry((r.tier, r.ab_group.as_str()))
                .or_default()
                .add(r);
        }
        cells
            .into_iter()
            .map(|((tier, group), acc)| GeoTierSummary {
                tier,
                ab_group: group.to_string(),
                group_type: self.group_type(group),
                metrics: acc.finish(),
            })
            .collect()
    }

    /// Deposit conversion by (tier, push bucket).
    pub fn bucket_analysis(&self, merged: &[MergedRecord]) -> Vec<BucketSummary> {
        let mut cells: BTreeMap<(Tier, PushBucket), GroupAccumulator> = BTreeMap::new();
        for r in merged {
            cells.entry((r.tier, r.push_bucket)).or_default().add(r);
        }
        cells
            .into_iter()
            .map(|((tier, push_bucket), acc)| {
                let m = acc.finish();
                BucketSummary {
                    tier,
                    push_bucket,
                    total_users: m.total_users,
                    users_with_deposits: m.users_with_deposits,
                    conversion_rate: m.deposit_conversion,
                }
            })
            .collect()
    }

    pub fn calculate_push_effectiveness(&self, ab_stats: &[AbGroupSummary]) -> EffectivenessReport {
        let Some(control) = ab_stats
            .iter()
            .find(|s| s.ab_group == self.control_group_id)
        else {
            log::warn!(
                "analyzer: control group {} missing; effectiveness not computed",
                self.control_group_id
            );
            return EffectivenessReport::Unavailable {
                error: UnavailableReason::MissingControlGroup {
                    group_id: self.control_group_id.clone(),
                },
            };
        };

        let push_groups: Vec<&AbGroupSummary> = ab_stats
            .iter()
            .filter(|s| s.ab_group != self.control_group_id)
            .collect();
        let Some(best) = push_groups.iter().copied().reduce(|best, s| {
            if s.metrics.deposit_conversion > best.metrics.deposit_conversion {
                s
            } else {
                best
            }
        }) else {
            log::warn!("analyzer: no push groups next to the control group");
            return EffectivenessReport::Unavailable {
                error: UnavailableReason::NoPushGroups,
            };
        };

        let control_rate = control.metrics.deposit_conversion;
        let avg_rate = push_groups
            .iter()
            .map(|s| s.metrics.deposit_conversion)
            .sum::<f64>()
            / push_groups.len() as f64;
        let best_rate = best.metrics.deposit_conversion;

        let avg_lift = avg_rate - control_rate;
        let best_lift = best_rate - control_rate;
        let relative = if control_rate == 0.0 {
            0.0
        } else {
            (avg_rate / control_rate - 1.0) * 100.0
        };

        EffectivenessReport::Evaluated(PushEffectiveness {
            control_group: ControlMetrics {
                group_id: control.ab_group.clone(),
                users: control.metrics.total_users,
                deposits: control.metrics.total_deposits,
                conversion_rate: control_rate,
                arpu: control.metrics.arpu,
            },
            push_groups_average: PushAverage {
                conversion_rate: round_to(avg_rate, 3),
                improvement_vs_control: round_to(avg_lift, 3),
                relative_improvement_pct: round_to(relative, 2),
            },
            best_push_group: BestPushGroup {
                group_id: best.ab_group.clone(),
                conversion_rate: best_rate,
                improvement_vs_control: round_to(best_lift, 3),
            },
            summary: EffectivenessVerdict {
                push_effective: avg_rate > control_rate,
                avg_lift_percentage_points: round_to(avg_lift, 3),
                best_lift_percentage_points: round_to(best_lift, 3),
            },
        })
    }
}

#[derive(Default)]
struct GroupAccumulator<'a> {
    users: HashSet<&'a str>,
    depositors: HashSet<&'a str>,
    registrants: HashSet<&'a str>,
    pushes: i64,
    deposits: i64,
    registrations: i64,
    revenue: f64,
}

impl<'a> GroupAccumulator<'a> {
    /// Pushes are summed per row. Conversion totals are per user and
    /// counted on the user's first row only.
    fn add(&mut self, r: &'a MergedRecord) {
        let user = r.user_id.as_str();
        self.pushes += r.push_count;
        if !self.users.insert(user) {
            return;
        }
        if r.has_deposit {
            self.depositors.insert(user);
        }
        if r.has_registration {
            self.registrants.insert(user);
        }
        self.deposits += r.total_deposits;
        self.registrations += r.total_registrations;
        self.revenue += r.total_revenue;
    }

    fn finish(self) -> GroupMetrics {
        let users = self.users.len();
        let per_user = |v: f64| if users == 0 { 0.0 } else { v / users as f64 };
        GroupMetrics {
            total_users: users,
            avg_pushes: round_to(per_user(self.pushes as f64), 2),
            users_with_deposits: self.depositors.len(),
            users_with_regs: self.registrants.len(),
            total_deposits: self.deposits,
            total_registrations: self.registrations,
            total_revenue: round_to(self.revenue, 2),
            deposit_conversion: round_to(per_user(self.depositors.len() as f64) * 100.0, 3),
            reg_conversion: round_to(per_user(self.registrants.len() as f64) * 100.0, 3),
            arpu: round_to(per_user(self.deposits as f64), 4),
            revenue_per_user: round_to(per_user(self.revenue), 4),
        }
    }
}
