//! Data store gateway.
//!
//! RULE: Only the gateway talks to the external stores.
//! The loader builds query text and parameters; the gateway owns the
//! connections, the cache and the timing/logging around each call.

use crate::{
    cache::{CacheInfo, QueryCache},
    config::{AnalysisConfig, StoreConfig},
    error::{PushError, PushResult},
    params::QueryParams,
    table::{Table, Value},
};
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

/// The two external stores the pipeline reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
    /// Devices, A/B tags and push delivery events.
    PushEvents,
    /// Tracker clicks with deposit/registration conversions, and campaigns.
    Conversions,
}

impl DataSource {
    pub fn name(&self) -> &'static str {
        match self {
            DataSource::PushEvents => "push_events",
            DataSource::Conversions => "conversions",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataSource {
    type Err = PushError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push_events" => Ok(DataSource::PushEvents),
            "conversions" => Ok(DataSource::Conversions),
            other => Err(PushError::UnknownStore {
                name: other.to_string(),
            }),
        }
    }
}

pub struct StoreGateway {
    stores: StoreConfig,
    cache: QueryCache,
    push_events: Option<Connection>,
    conversions: Option<Connection>,
}

impl StoreGateway {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            stores: config.stores.clone(),
            cache: QueryCache::new(&config.cache),
            push_events: None,
            conversions: None,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Open the store on first use; later calls reuse the connection.
    fn connection(&mut self, source: DataSource) -> PushResult<&Connection> {
        let (slot, uri) = match source {
            DataSource::PushEvents => (&mut self.push_events, &self.stores.push_events.uri),
            DataSource::Conversions => (&mut self.conversions, &self.stores.conversions.uri),
        };
        if slot.is_none() {
            let conn = open_store(source, uri)?;
            log::info!("gateway: connected to {source}");
            *slot = Some(conn);
        }
        slot.as_ref().ok_or_else(|| PushError::StoreUnavailable {
            store: source.to_string(),
            reason: "connection slot empty after open".into(),
        })
    }

    /// Run a query against `source`, consulting the cache first when
    /// `use_cache` is set. Failures are logged and returned; never retried.
    pub fn execute(
        &mut self,
        source: DataSource,
        query: &str,
        params: &QueryParams,
        use_cache: bool,
    ) -> PushResult<Table> {
        if use_cache {
            if let Some(table) = self.cache.get(query, params) {
                return Ok(table);
            }
        }

        log::info!("gateway: querying {source}...");
        let started = Instant::now();
        let result = self
            .connection(source)
            .and_then(|conn| run_query(conn, query, params));
        let table = match result {
            Ok(t) => t,
            Err(e) => {
                log::error!("gateway: query against {source} failed: {e}");
                return Err(e);
            }
        };
        log::info!(
            "gateway: {source} answered in {:.2}s with {} rows",
            started.elapsed().as_secs_f64(),
            table.len()
        );

        if use_cache {
            if let Err(e) = self.cache.put(query, params, &table) {
                log::warn!("gateway: could not write cache entry: {e}");
            }
        }
        Ok(table)
    }

    /// Store name variant of `execute`, for callers holding a string.
    pub fn execute_named(
        &mut self,
        store: &str,
        query: &str,
        params: &QueryParams,
        use_cache: bool,
    ) -> PushResult<Table> {
        let source: DataSource = store.parse()?;
        self.execute(source, query, params, use_cache)
    }

    /// Connection check: `SELECT 1` against the store.
    pub fn ping(&mut self, source: DataSource) -> PushResult<()> {
        let conn = self.connection(source)?;
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        log::info!("gateway: {source} ping -> {one}");
        Ok(())
    }

    pub fn clear_cache(&self) -> PushResult<usize> {
        self.cache.clear()
    }

    pub fn cache_info(&self) -> PushResult<CacheInfo> {
        self.cache.info()
    }
}

fn open_store(source: DataSource, uri: &str) -> PushResult<Connection> {
    // Plain paths must already exist; opening would otherwise create an
    // empty database and every query would come back empty.
    if !uri.starts_with("file:") && !Path::new(uri).exists() {
        return Err(PushError::StoreUnavailable {
            store: source.to_string(),
            reason: format!("{uri} does not exist"),
        });
    }
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    Ok(conn)
}

fn run_query(conn: &Connection, query: &str, params: &QueryParams) -> PushResult<Table> {
    let mut stmt = conn.prepare(query)?;
    // Parameters the statement does not reference are part of the cache
    // key only.
    for (name, value) in params.bindings() {
        if let Some(idx) = stmt.parameter_index(&name)? {
            stmt.raw_bind_parameter(idx, value)?;
        }
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut table = Table::new(columns);

    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(Value::from(row.get_ref(i)?));
        }
        table.push_row(values)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with(uri: &str) -> StoreGateway {
        let mut config = AnalysisConfig::default_test();
        config.stores.push_events.uri = uri.into();
        config.stores.conversions.uri = uri.into();
        StoreGateway::new(&config)
    }

    #[test]
    fn store_names_parse() {
        assert_eq!("push_events".parse::<DataSource>().unwrap(), DataSource::PushEvents);
        assert_eq!("conversions".parse::<DataSource>().unwrap(), DataSource::Conversions);
        assert!(matches!(
            "warehouse".parse::<DataSource>(),
            Err(PushError::UnknownStore { .. })
        ));
    }

    #[test]
    fn unknown_store_name_is_rejected_by_execute() {
        let mut gw = gateway_with("file:gw_unknown?mode=memory&cache=shared");
        let err = gw
            .execute_named("warehouse", "SELECT 1", &QueryParams::new(), false)
            .unwrap_err();
        assert!(matches!(err, PushError::UnknownStore { .. }));
    }

    #[test]
    fn missing_store_file_is_unavailable() {
        let mut gw = gateway_with("/nonexistent/dir/store.db");
        let err = gw.ping(DataSource::PushEvents).unwrap_err();
        assert!(matches!(err, PushError::StoreUnavailable { .. }));
    }

    #[test]
    fn binds_only_referenced_parameters() {
        let uri = "file:gw_binds?mode=memory&cache=shared";
        let seed = Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .unwrap();
        seed.execute_batch(
            "CREATE TABLE t (id INTEGER, tag TEXT);
             INSERT INTO t VALUES (1, 'a'), (2, 'b'), (3, 'c');",
        )
        .unwrap();

        let mut gw = gateway_with(uri);
        let params = QueryParams::new()
            .with("tags", vec!["a".to_string(), "c".to_string()])
            .with("unused", "x");
        let sql = format!(
            "SELECT id, tag FROM t WHERE tag IN ({}) ORDER BY id",
            crate::params::list_placeholders("tags", 2)
        );
        let table = gw.execute(DataSource::PushEvents, &sql, &params, false).unwrap();
        assert_eq!(table.columns(), ["id".to_string(), "tag".to_string()]);
        let ids: Vec<i64> = table.rows().map(|r| r.opt_int("id").unwrap().unwrap()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn query_errors_propagate() {
        let mut gw = gateway_with("file:gw_err?mode=memory&cache=shared");
        let err = gw
            .execute(DataSource::Conversions, "SELECT * FROM missing_table", &QueryParams::new(), false)
            .unwrap_err();
        assert!(matches!(err, PushError::Database(_)));
    }
}
