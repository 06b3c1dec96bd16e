//! Typed records flowing through the pipeline.
//!
//! Every record implements `Tabular`, which is the boundary where raw store
//! rows are validated and where processed data is written to and read back
//! from snapshots.

use crate::{
    error::{PushError, PushResult},
    table::{Row, Tabular, Value},
    tier::Tier,
    types::{CampaignId, GroupId, UserId},
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Push buckets ─────────────────────────────────────────────────────────────

/// Push-count ranges: {0}, {1}, {2-3}, {4-5}, {6-10}, {11+}.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PushBucket {
    #[serde(rename = "0")]
    Zero,
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2-3")]
    TwoToThree,
    #[serde(rename = "4-5")]
    FourToFive,
    #[serde(rename = "6-10")]
    SixToTen,
    #[serde(rename = "10+")]
    OverTen,
}

impl PushBucket {
    pub const ALL: [PushBucket; 6] = [
        PushBucket::Zero,
        PushBucket::One,
        PushBucket::TwoToThree,
        PushBucket::FourToFive,
        PushBucket::SixToTen,
        PushBucket::OverTen,
    ];

    pub fn for_count(push_count: i64) -> Self {
        match push_count {
            i64::MIN..=0 => PushBucket::Zero,
            1 => PushBucket::One,
            2..=3 => PushBucket::TwoToThree,
            4..=5 => PushBucket::FourToFive,
            6..=10 => PushBucket::SixToTen,
            _ => PushBucket::OverTen,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PushBucket::Zero => "0",
            PushBucket::One => "1",
            PushBucket::TwoToThree => "2-3",
            PushBucket::FourToFive => "4-5",
            PushBucket::SixToTen => "6-10",
            PushBucket::OverTen => "10+",
        }
    }
}

impl fmt::Display for PushBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PushBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PushBucket::ALL
            .into_iter()
            .find(|b| b.label() == s)
            .ok_or_else(|| format!("unknown push bucket '{s}'"))
    }
}

// ── User type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum UserType {
    #[serde(rename = "No Conversion")]
    NoConversion,
    #[serde(rename = "Registration Only")]
    RegistrationOnly,
    Deposit,
}

impl UserType {
    /// Deposit takes precedence over registration.
    pub fn classify(total_deposits: i64, total_registrations: i64) -> Self {
        if total_deposits > 0 {
            UserType::Deposit
        } else if total_registrations > 0 {
            UserType::RegistrationOnly
        } else {
            UserType::NoConversion
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            UserType::NoConversion => "No Conversion",
            UserType::RegistrationOnly => "Registration Only",
            UserType::Deposit => "Deposit",
        }
    }
}

impl FromStr for UserType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [UserType::NoConversion, UserType::RegistrationOnly, UserType::Deposit]
            .into_iter()
            .find(|u| u.label() == s)
            .ok_or_else(|| format!("unknown user type '{s}'"))
    }
}

fn parse_label<T: FromStr<Err = String>>(row: &Row<'_>, column: &str) -> PushResult<T> {
    let text = row.text(column)?;
    text.parse().map_err(|e: String| PushError::ColumnType {
        column: column.to_string(),
        expected: "label",
        found: e,
    })
}

fn hours_between(first: Option<NaiveDateTime>, last: Option<NaiveDateTime>) -> f64 {
    match (first, last) {
        (Some(f), Some(l)) => (l - f).num_milliseconds() as f64 / 3_600_000.0,
        _ => 0.0,
    }
}

// ── Push / control records ───────────────────────────────────────────────────

/// One row per (user, A/B group, country) of push delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRecord {
    pub user_id: UserId,
    pub ab_group: GroupId,
    pub country: Option<String>,
    pub push_count: i64,
    pub first_push: Option<NaiveDateTime>,
    pub last_push: Option<NaiveDateTime>,
    pub push_days: i64,
    pub avg_success_rate: Option<f64>,
    pub campaign_duration_hours: f64,
    pub push_bucket: PushBucket,
    pub tier: Tier,
}

/// Control-group users share the push layout with zero pushes and no
/// push timestamps.
pub type ControlRecord = PushRecord;

impl PushRecord {
    pub fn campaign_hours(first: Option<NaiveDateTime>, last: Option<NaiveDateTime>) -> f64 {
        hours_between(first, last)
    }

    pub fn is_control(&self) -> bool {
        self.push_count == 0 && self.first_push.is_none()
    }
}

impl Tabular for PushRecord {
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "ab_group",
        "country",
        "push_count",
        "first_push",
        "last_push",
        "push_days",
        "avg_success_rate",
        "campaign_duration_hours",
        "push_bucket",
        "tier",
    ];

    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::Text(self.user_id.clone()),
            Value::Text(self.ab_group.clone()),
            Value::opt_text(self.country.as_deref()),
            Value::Integer(self.push_count),
            Value::timestamp(self.first_push),
            Value::timestamp(self.last_push),
            Value::Integer(self.push_days),
            Value::opt_real(self.avg_success_rate),
            Value::Real(self.campaign_duration_hours),
            Value::Text(self.push_bucket.label().to_string()),
            Value::Text(self.tier.label().to_string()),
        ]
    }

    fn from_row(row: &Row<'_>) -> PushResult<Self> {
        Ok(Self {
            user_id: row.text("user_id")?,
            ab_group: row.text("ab_group")?,
            country: row.opt_text("country")?,
            push_count: row.int_or_zero("push_count")?,
            first_push: row.opt_timestamp("first_push")?,
            last_push: row.opt_timestamp("last_push")?,
            push_days: row.int_or_zero("push_days")?,
            avg_success_rate: row.opt_real("avg_success_rate")?,
            campaign_duration_hours: row.real_or_zero("campaign_duration_hours")?,
            push_bucket: parse_label(row, "push_bucket")?,
            tier: parse_label(row, "tier")?,
        })
    }
}

// ── Conversion records ───────────────────────────────────────────────────────

/// One row per (user, country, campaign) of tracker conversions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub user_id: UserId,
    pub country: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub total_deposits: i64,
    pub total_registrations: i64,
    pub total_revenue: f64,
    pub conversion_events: i64,
    pub first_conversion: Option<NaiveDateTime>,
    pub last_conversion: Option<NaiveDateTime>,
    pub conversion_window_hours: f64,
    pub user_type: UserType,
    pub arpu: f64,
    pub tier: Tier,
}

impl ConversionRecord {
    pub fn window_hours(first: Option<NaiveDateTime>, last: Option<NaiveDateTime>) -> f64 {
        hours_between(first, last)
    }

    /// Revenue per conversion event; the event count is floored at 1.
    pub fn arpu_for(total_revenue: f64, conversion_events: i64) -> f64 {
        total_revenue / conversion_events.max(1) as f64
    }
}

impl Tabular for ConversionRecord {
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "country",
        "campaign_id",
        "total_deposits",
        "total_registrations",
        "total_revenue",
        "conversion_events",
        "first_conversion",
        "last_conversion",
        "conversion_window_hours",
        "user_type",
        "arpu",
        "tier",
    ];

    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::Text(self.user_id.clone()),
            Value::opt_text(self.country.as_deref()),
            self.campaign_id.map_or(Value::Null, Value::Integer),
            Value::Integer(self.total_deposits),
            Value::Integer(self.total_registrations),
            Value::Real(self.total_revenue),
            Value::Integer(self.conversion_events),
            Value::timestamp(self.first_conversion),
            Value::timestamp(self.last_conversion),
            Value::Real(self.conversion_window_hours),
            Value::Text(self.user_type.label().to_string()),
            Value::Real(self.arpu),
            Value::Text(self.tier.label().to_string()),
        ]
    }

    fn from_row(row: &Row<'_>) -> PushResult<Self> {
        Ok(Self {
            user_id: row.text("user_id")?,
            country: row.opt_text("country")?,
            campaign_id: row.opt_int("campaign_id")?,
            total_deposits: row.int_or_zero("total_deposits")?,
            total_registrations: row.int_or_zero("total_registrations")?,
            total_revenue: row.real_or_zero("total_revenue")?,
            conversion_events: row.int_or_zero("conversion_events")?,
            first_conversion: row.opt_timestamp("first_conversion")?,
            last_conversion: row.opt_timestamp("last_conversion")?,
            conversion_window_hours: row.real_or_zero("conversion_window_hours")?,
            user_type: parse_label(row, "user_type")?,
            arpu: row.real_or_zero("arpu")?,
            tier: parse_label(row, "tier")?,
        })
    }
}

// ── Merged records ───────────────────────────────────────────────────────────

/// Push or control row left-joined with the user's conversion totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub user_id: UserId,
    pub ab_group: GroupId,
    pub country: Option<String>,
    pub tier: Tier,
    pub push_count: i64,
    pub push_days: i64,
    pub push_bucket: PushBucket,
    pub campaign_duration_hours: f64,
    pub first_push: Option<NaiveDateTime>,
    pub total_deposits: i64,
    pub total_registrations: i64,
    pub total_revenue: f64,
    pub conversion_events: i64,
    pub has_deposit: bool,
    pub has_registration: bool,
    pub user_type: UserType,
}

impl Tabular for MergedRecord {
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "ab_group",
        "country",
        "tier",
        "push_count",
        "push_days",
        "push_bucket",
        "campaign_duration_hours",
        "first_push",
        "total_deposits",
        "total_registrations",
        "total_revenue",
        "conversion_events",
        "has_deposit",
        "has_registration",
        "user_type",
    ];

    fn to_row(&self) -> Vec<Value> {
        vec![
            Value::Text(self.user_id.clone()),
            Value::Text(self.ab_group.clone()),
            Value::opt_text(self.country.as_deref()),
            Value::Text(self.tier.label().to_string()),
            Value::Integer(self.push_count),
            Value::Integer(self.push_days),
            Value::Text(self.push_bucket.label().to_string()),
            Value::Real(self.campaign_duration_hours),
            Value::timestamp(self.first_push),
            Value::Integer(self.total_deposits),
            Value::Integer(self.total_registrations),
            Value::Real(self.total_revenue),
            Value::Integer(self.conversion_events),
            Value::Integer(self.has_deposit as i64),
            Value::Integer(self.has_registration as i64),
            Value::Text(self.user_type.label().to_string()),
        ]
    }

    fn from_row(row: &Row<'_>) -> PushResult<Self> {
        Ok(Self {
            user_id: row.text("user_id")?,
            ab_group: row.text("ab_group")?,
            country: row.opt_text("country")?,
            tier: parse_label(row, "tier")?,
            push_count: row.int_or_zero("push_count")?,
            push_days: row.int_or_zero("push_days")?,
            push_bucket: parse_label(row, "push_bucket")?,
            campaign_duration_hours: row.real_or_zero("campaign_duration_hours")?,
            first_push: row.opt_timestamp("first_push")?,
            total_deposits: row.int_or_zero("total_deposits")?,
            total_registrations: row.int_or_zero("total_registrations")?,
            total_revenue: row.real_or_zero("total_revenue")?,
            conversion_events: row.int_or_zero("conversion_events")?,
            has_deposit: row.int_or_zero("has_deposit")? > 0,
            has_registration: row.int_or_zero("has_registration")? > 0,
            user_type: parse_label(row, "user_type")?,
        })
    }
}

// ── Campaigns and devices ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: CampaignId,
    pub name: String,
    pub alias: Option<String>,
    pub state: String,
}

impl CampaignRecord {
    pub fn is_active(&self) -> bool {
        self.state == "active"
    }

    pub fn from_row(row: &Row<'_>) -> PushResult<Self> {
        Ok(Self {
            id: row.opt_int("id")?.ok_or_else(|| PushError::ColumnType {
                column: "id".into(),
                expected: "integer",
                found: "null".into(),
            })?,
            name: row.opt_text("name")?.unwrap_or_default(),
            alias: row.opt_text("alias")?,
            state: row.opt_text("state")?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub user_id: UserId,
    pub country_name: Option<String>,
    pub language_name: Option<String>,
    pub ab_group: Option<GroupId>,
    pub platform: Option<i64>,
    pub active: Option<bool>,
    pub timezone: Option<String>,
    pub device_created_at: Option<NaiveDateTime>,
}

impl DeviceRecord {
    pub fn from_row(row: &Row<'_>) -> PushResult<Self> {
        Ok(Self {
            user_id: row.text("user_id")?,
            country_name: row.opt_text("country_name")?,
            language_name: row.opt_text("language_name")?,
            ab_group: row.opt_text("ab_group")?,
            platform: row.opt_int("platform")?,
            active: row.opt_int("active")?.map(|a| a != 0),
            timezone: row.opt_text("timezone")?,
            device_created_at: row.opt_timestamp("device_created_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;

    #[test]
    fn bucket_boundaries() {
        let cases = [
            (0, PushBucket::Zero),
            (1, PushBucket::One),
            (2, PushBucket::TwoToThree),
            (3, PushBucket::TwoToThree),
            (4, PushBucket::FourToFive),
            (5, PushBucket::FourToFive),
            (6, PushBucket::SixToTen),
            (10, PushBucket::SixToTen),
            (11, PushBucket::OverTen),
            (500, PushBucket::OverTen),
        ];
        for (count, bucket) in cases {
            assert_eq!(PushBucket::for_count(count), bucket, "count {count}");
        }
    }

    #[test]
    fn deposit_overrides_registration() {
        assert_eq!(UserType::classify(1, 1), UserType::Deposit);
        assert_eq!(UserType::classify(0, 2), UserType::RegistrationOnly);
        assert_eq!(UserType::classify(0, 0), UserType::NoConversion);
    }

    #[test]
    fn arpu_floors_event_count() {
        assert_eq!(ConversionRecord::arpu_for(50.0, 0), 50.0);
        assert_eq!(ConversionRecord::arpu_for(50.0, 4), 12.5);
    }

    #[test]
    fn push_record_survives_table_round_trip() {
        let first = crate::table::parse_timestamp("2025-05-22 08:00:00");
        let last = crate::table::parse_timestamp("2025-05-23 20:30:00.125");
        let record = PushRecord {
            user_id: "u1".into(),
            ab_group: "2".into(),
            country: Some("Germany".into()),
            push_count: 4,
            first_push: first,
            last_push: last,
            push_days: 2,
            avg_success_rate: Some(0.75),
            campaign_duration_hours: PushRecord::campaign_hours(first, last),
            push_bucket: PushBucket::FourToFive,
            tier: Tier::Tier1,
        };
        assert!((record.campaign_duration_hours - 36.5).abs() < 1e-4);
        let table = Table::from_records(std::slice::from_ref(&record));
        let back: Vec<PushRecord> = table.to_records().unwrap();
        assert_eq!(back, vec![record]);
        assert_eq!(
            back[0].last_push.map(|t| t.and_utc().timestamp_subsec_millis()),
            Some(125)
        );
    }
}
