//! Push/control schema reconciliation.
//!
//! The control query produces a subset of the processed push columns. Before
//! the two are concatenated every push column missing from the control table
//! is filled according to what the column means, then the control columns are
//! reordered to the push order.

use crate::{
    model::PushBucket,
    table::{Table, Value},
    tier::TierClassifier,
};

/// How a push column absent from the control table is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillRule {
    /// No push happened, so there is no push timestamp.
    MissingTimestamp,
    /// Counts and durations of zero pushes.
    Zero,
    /// Delivery success is undefined without pushes.
    MissingRate,
    /// The zero-push bucket label.
    ZeroBucket,
    /// Recomputed from `country` when present, else `Unknown`.
    TierFromCountry,
    /// Identity columns. A control table without them cannot be joined;
    /// rows end up dropped at parse time.
    MissingIdentity,
    /// Column outside the known push layout.
    Unclassified,
}

/// Fill rule for every column of the processed push layout.
pub fn fill_rule(column: &str) -> FillRule {
    match column {
        "first_push" | "last_push" => FillRule::MissingTimestamp,
        "push_count" | "push_days" | "campaign_duration_hours" => FillRule::Zero,
        "avg_success_rate" => FillRule::MissingRate,
        "push_bucket" => FillRule::ZeroBucket,
        "tier" => FillRule::TierFromCountry,
        "user_id" | "ab_group" | "country" => FillRule::MissingIdentity,
        _ => FillRule::Unclassified,
    }
}

/// Make `control` union-compatible with `push`: same columns, same order.
/// Control-only columns are dropped.
pub fn align_control_table(push: &Table, mut control: Table, classifier: &TierClassifier) -> Table {
    let missing: Vec<String> = push
        .columns()
        .iter()
        .filter(|c| !control.has_column(c))
        .cloned()
        .collect();

    for column in &missing {
        match fill_rule(column) {
            FillRule::MissingTimestamp | FillRule::MissingRate => {
                control.add_column(column, |_| Value::Null)
            }
            FillRule::Zero => {
                let zero = if column == "campaign_duration_hours" {
                    Value::Real(0.0)
                } else {
                    Value::Integer(0)
                };
                control.add_column(column, |_| zero.clone())
            }
            FillRule::ZeroBucket => control.add_column(column, |_| {
                Value::Text(PushBucket::Zero.label().to_string())
            }),
            FillRule::TierFromCountry => {
                let has_country = control.has_column("country");
                control.add_column(column, |row| {
                    let country = if has_country {
                        row.opt_text("country").ok().flatten()
                    } else {
                        None
                    };
                    Value::Text(classifier.classify_opt(country.as_deref()).label().to_string())
                })
            }
            FillRule::MissingIdentity => {
                log::warn!("align: control table has no '{column}' column; filling with null");
                control.add_column(column, |_| Value::Null)
            }
            FillRule::Unclassified => {
                log::warn!("align: no fill rule for push column '{column}'; filling with null");
                control.add_column(column, |_| Value::Null)
            }
        }
    }

    let dropped: Vec<&String> = control
        .columns()
        .iter()
        .filter(|c| !push.has_column(c))
        .collect();
    if !dropped.is_empty() {
        log::debug!("align: dropping control-only columns {dropped:?}");
    }

    control.reorder(push.columns())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::default_tiers, model::PushRecord, table::Tabular};

    fn push_table() -> Table {
        Table::with_columns(PushRecord::COLUMNS)
    }

    fn raw_control() -> Table {
        let mut t = Table::with_columns(&["ab_group", "user_id", "country", "device_note"]);
        t.push_row(vec![
            Value::Text("6".into()),
            Value::Text("c1".into()),
            Value::Text("Russian Federation".into()),
            Value::Text("x".into()),
        ])
        .unwrap();
        t.push_row(vec![
            Value::Text("6".into()),
            Value::Text("c2".into()),
            Value::Null,
            Value::Null,
        ])
        .unwrap();
        t
    }

    #[test]
    fn aligned_columns_match_push_order() {
        let classifier = TierClassifier::new(&default_tiers());
        let aligned = align_control_table(&push_table(), raw_control(), &classifier);
        assert_eq!(aligned.columns(), push_table().columns());
    }

    #[test]
    fn push_only_columns_take_documented_fills() {
        let classifier = TierClassifier::new(&default_tiers());
        let aligned = align_control_table(&push_table(), raw_control(), &classifier);
        let rows: Vec<_> = aligned.rows().collect();

        let first = &rows[0];
        assert_eq!(first.get("push_count"), Some(&Value::Integer(0)));
        assert_eq!(first.get("push_days"), Some(&Value::Integer(0)));
        assert_eq!(first.get("campaign_duration_hours"), Some(&Value::Real(0.0)));
        assert_eq!(first.get("first_push"), Some(&Value::Null));
        assert_eq!(first.get("last_push"), Some(&Value::Null));
        assert_eq!(first.get("avg_success_rate"), Some(&Value::Null));
        assert_eq!(first.get("push_bucket"), Some(&Value::Text("0".into())));
        assert_eq!(first.get("tier"), Some(&Value::Text("Tier 3".into())));
        assert_eq!(rows[1].get("tier"), Some(&Value::Text("Unknown".into())));
        assert_eq!(first.get("device_note"), None);
    }

    #[test]
    fn tier_is_unknown_without_country_column() {
        let classifier = TierClassifier::new(&default_tiers());
        let mut control = Table::with_columns(&["user_id", "ab_group"]);
        control
            .push_row(vec![Value::Text("c1".into()), Value::Text("6".into())])
            .unwrap();
        let aligned = align_control_table(&push_table(), control, &classifier);
        let row = aligned.rows().next().unwrap();
        assert_eq!(row.get("tier"), Some(&Value::Text("Unknown".into())));
        assert_eq!(row.get("country"), Some(&Value::Null));
    }

    #[test]
    fn aligned_control_parses_as_push_records() {
        let classifier = TierClassifier::new(&default_tiers());
        let aligned = align_control_table(&push_table(), raw_control(), &classifier);
        let records: Vec<PushRecord> = aligned.to_records().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(PushRecord::is_control));
        assert!(records.iter().all(|r| r.push_bucket == PushBucket::Zero));
    }

    #[test]
    fn every_push_column_has_an_explicit_rule() {
        for column in PushRecord::COLUMNS {
            assert_ne!(fill_rule(column), FillRule::Unclassified, "{column}");
        }
    }

    #[test]
    fn existing_control_values_are_kept() {
        let classifier = TierClassifier::new(&default_tiers());
        let mut control = Table::with_columns(&["user_id", "ab_group", "push_count", "tier"]);
        control
            .push_row(vec![
                Value::Text("c1".into()),
                Value::Text("6".into()),
                Value::Integer(0),
                Value::Text("Other".into()),
            ])
            .unwrap();
        let aligned = align_control_table(&push_table(), control, &classifier);
        let row = aligned.rows().next().unwrap();
        assert_eq!(row.get("tier"), Some(&Value::Text("Other".into())));
    }
}
