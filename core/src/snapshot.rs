//! Processed-data snapshots: loaded tables to/from the processed directory.
//!
//! A snapshot holds the push table, the conversion table and optionally the
//! merged table, one Parquet file each, plus a JSON manifest identifying
//! the run that wrote them. Files are found by name; there is no index.

use crate::{
    columnar,
    error::PushResult,
    model::{ConversionRecord, MergedRecord, PushRecord},
    table::{Table, Tabular},
};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const PUSH_FILE: &str = "push_data.parquet";
pub const CONVERSION_FILE: &str = "conversion_data.parquet";
pub const MERGED_FILE: &str = "merged_data.parquet";
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub run_id: Uuid,
    pub saved_at: NaiveDateTime,
    pub push_rows: usize,
    pub conversion_rows: usize,
    pub merged_rows: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessedData {
    pub manifest: Option<SnapshotManifest>,
    pub push: Vec<PushRecord>,
    pub conversions: Vec<ConversionRecord>,
    pub merged: Option<Vec<MergedRecord>>,
}

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save_processed_data(
        &self,
        push: &[PushRecord],
        conversions: &[ConversionRecord],
        merged: Option<&[MergedRecord]>,
    ) -> PushResult<SnapshotManifest> {
        std::fs::create_dir_all(&self.dir)?;

        columnar::write_parquet(&Table::from_records(push), &self.dir.join(PUSH_FILE))?;
        columnar::write_parquet(
            &Table::from_records(conversions),
            &self.dir.join(CONVERSION_FILE),
        )?;
        if let Some(merged) = merged {
            columnar::write_parquet(&Table::from_records(merged), &self.dir.join(MERGED_FILE))?;
        }

        let manifest = SnapshotManifest {
            run_id: Uuid::new_v4(),
            saved_at: Utc::now().naive_utc(),
            push_rows: push.len(),
            conversion_rows: conversions.len(),
            merged_rows: merged.map(<[MergedRecord]>::len),
        };
        let json = serde_json::to_string_pretty(&manifest)?;
        std::fs::write(self.dir.join(MANIFEST_FILE), json)?;

        log::info!(
            "snapshot: saved run {} ({} push, {} conversion rows) to {}",
            manifest.run_id,
            manifest.push_rows,
            manifest.conversion_rows,
            self.dir.display()
        );
        Ok(manifest)
    }

    /// Read back whatever is present. Missing push or conversion files give
    /// a warning and an empty table.
    pub fn load_processed_data(&self) -> PushResult<ProcessedData> {
        let push = self.load_records::<PushRecord>(PUSH_FILE)?.unwrap_or_else(|| {
            log::warn!("snapshot: no push data in {}", self.dir.display());
            Vec::new()
        });
        let conversions = self
            .load_records::<ConversionRecord>(CONVERSION_FILE)?
            .unwrap_or_else(|| {
                log::warn!("snapshot: no conversion data in {}", self.dir.display());
                Vec::new()
            });
        let merged = self.load_records::<MergedRecord>(MERGED_FILE)?;

        let manifest_path = self.dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Some(serde_json::from_str(&content)?)
        } else {
            None
        };

        log::info!(
            "snapshot: loaded {} push and {} conversion rows",
            push.len(),
            conversions.len()
        );
        Ok(ProcessedData {
            manifest,
            push,
            conversions,
            merged,
        })
    }

    fn load_records<T: Tabular>(&self, file: &str) -> PushResult<Option<Vec<T>>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(None);
        }
        let table = columnar::read_parquet(&path)?;
        Ok(Some(table.to_records()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::PushBucket, tier::Tier};

    fn push_row(user: &str) -> PushRecord {
        PushRecord {
            user_id: user.into(),
            ab_group: "1".into(),
            country: Some("Germany".into()),
            push_count: 3,
            first_push: crate::table::parse_timestamp("2025-05-22 08:00:00"),
            last_push: crate::table::parse_timestamp("2025-05-24 08:00:00"),
            push_days: 3,
            avg_success_rate: Some(0.5),
            campaign_duration_hours: 48.0,
            push_bucket: PushBucket::TwoToThree,
            tier: Tier::Tier1,
        }
    }

    #[test]
    fn saved_snapshot_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let push = vec![push_row("a"), push_row("b")];
        let manifest = store.save_processed_data(&push, &[], None).unwrap();

        let loaded = store.load_processed_data().unwrap();
        assert_eq!(loaded.push, push);
        assert!(loaded.conversions.is_empty());
        assert!(loaded.merged.is_none());
        assert_eq!(loaded.manifest, Some(manifest));
    }

    #[test]
    fn empty_directory_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = SnapshotStore::new(dir.path().join("absent"))
            .load_processed_data()
            .unwrap();
        assert!(loaded.push.is_empty());
        assert!(loaded.manifest.is_none());
    }
}
