//! Disk-backed query result cache.
//!
//! One file per (query, params) pair, named by the BLAKE3 digest of the
//! pair. An entry is served only while its modification time is inside the
//! freshness window. Writers are not coordinated: a torn entry fails to
//! parse and is treated as a miss.

use crate::{
    columnar,
    config::CacheConfig,
    error::PushResult,
    params::QueryParams,
    table::Table,
    types::round_to,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const ENTRY_EXTENSION: &str = "parquet";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheInfo {
    pub files: usize,
    pub total_size_mb: f64,
    pub cache_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct QueryCache {
    dir: PathBuf,
    freshness: Duration,
    enabled: bool,
}

impl QueryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            freshness: Duration::from_secs(config.freshness_secs),
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key(query: &str, params: &QueryParams) -> String {
        let material = format!("{query}_{}", params.render());
        blake3::hash(material.as_bytes()).to_hex().to_string()
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXTENSION}"))
    }

    pub fn get(&self, query: &str, params: &QueryParams) -> Option<Table> {
        if !self.enabled {
            return None;
        }
        let key = Self::key(query, params);
        let path = self.entry_path(&key);

        let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age >= self.freshness {
            log::debug!("cache: entry {} expired ({}s old)", &key[..8], age.as_secs());
            return None;
        }

        match columnar::read_parquet(&path) {
            Ok(table) => {
                log::info!("cache: loaded {} rows from {}...", table.len(), &key[..8]);
                Some(table)
            }
            Err(e) => {
                log::warn!("cache: unreadable entry {}..., refetching: {e}", &key[..8]);
                None
            }
        }
    }

    /// Store a result. Empty results are never cached.
    pub fn put(&self, query: &str, params: &QueryParams, table: &Table) -> PushResult<()> {
        if !self.enabled || table.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let key = Self::key(query, params);
        columnar::write_parquet(table, &self.entry_path(&key))?;
        log::info!("cache: saved {} rows to {}...", table.len(), &key[..8]);
        Ok(())
    }

    pub fn clear(&self) -> PushResult<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
        log::info!("cache: cleared {removed} entries");
        Ok(removed)
    }

    pub fn info(&self) -> PushResult<CacheInfo> {
        let mut total: u64 = 0;
        let files = self.entry_files()?;
        for path in &files {
            total += std::fs::metadata(path)?.len();
        }
        Ok(CacheInfo {
            files: files.len(),
            total_size_mb: round_to(total as f64 / 1024.0 / 1024.0, 2),
            cache_enabled: self.enabled,
        })
    }

    fn entry_files(&self) -> PushResult<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Value;

    fn cache_in(dir: &Path) -> QueryCache {
        QueryCache::new(&CacheConfig {
            dir: dir.to_path_buf(),
            freshness_secs: 3600,
            enabled: true,
        })
    }

    fn sample() -> Table {
        let mut t = Table::with_columns(&["user_id", "push_count"]);
        t.push_row(vec![Value::Text("u1".into()), Value::Integer(4)]).unwrap();
        t
    }

    fn age_entry(cache: &QueryCache, query: &str, params: &QueryParams, by: Duration) {
        let path = cache.entry_path(&QueryCache::key(query, params));
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn key_depends_on_query_and_params() {
        let p1 = QueryParams::new().with("start_date", "2025-05-22");
        let p2 = QueryParams::new().with("start_date", "2025-05-23");
        assert_eq!(QueryCache::key("SELECT 1", &p1), QueryCache::key("SELECT 1", &p1));
        assert_ne!(QueryCache::key("SELECT 1", &p1), QueryCache::key("SELECT 1", &p2));
        assert_ne!(QueryCache::key("SELECT 1", &p1), QueryCache::key("SELECT 2", &p1));
    }

    #[test]
    fn fresh_entry_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let params = QueryParams::new().with("a", 1);
        cache.put("SELECT x", &params, &sample()).unwrap();
        assert_eq!(cache.get("SELECT x", &params), Some(sample()));
    }

    #[test]
    fn stale_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let params = QueryParams::new();
        cache.put("SELECT x", &params, &sample()).unwrap();
        age_entry(&cache, "SELECT x", &params, Duration::from_secs(3601));
        assert_eq!(cache.get("SELECT x", &params), None);
    }

    #[test]
    fn empty_results_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let empty = Table::with_columns(&["user_id"]);
        cache.put("SELECT x", &QueryParams::new(), &empty).unwrap();
        assert_eq!(cache.info().unwrap().files, 0);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        let params = QueryParams::new();
        let path = cache.entry_path(&QueryCache::key("SELECT x", &params));
        std::fs::write(path, b"PAR1\x15\x00torn").unwrap();
        assert_eq!(cache.get("SELECT x", &params), None);
    }

    #[test]
    fn disabled_cache_neither_reads_nor_writes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = QueryCache::new(&CacheConfig {
            dir: dir.path().to_path_buf(),
            freshness_secs: 3600,
            enabled: false,
        });
        cache.put("SELECT x", &QueryParams::new(), &sample()).unwrap();
        assert_eq!(cache.get("SELECT x", &QueryParams::new()), None);
        assert!(!cache.info().unwrap().cache_enabled);
        assert_eq!(cache.info().unwrap().files, 0);
    }

    #[test]
    fn clear_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(dir.path());
        cache.put("SELECT a", &QueryParams::new(), &sample()).unwrap();
        cache.put("SELECT b", &QueryParams::new(), &sample()).unwrap();
        assert_eq!(cache.info().unwrap().files, 2);
        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.info().unwrap().files, 0);
    }
}
