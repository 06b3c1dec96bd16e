//! Data loader. Builds the dataset queries, cleans the results and
//! reconciles push and control data into one table.
//!
//! Empty results are not errors: they are logged as warnings and returned
//! empty so the rest of the pipeline can run on partial data. Store and
//! query failures propagate.

use crate::{
    cache::CacheInfo,
    config::{AnalysisConfig, DateWindow},
    error::PushResult,
    gateway::{DataSource, StoreGateway},
    model::{
        CampaignRecord, ControlRecord, ConversionRecord, DeviceRecord, PushBucket, PushRecord,
        UserType,
    },
    params::{list_placeholders, QueryParams},
    schema::align_control_table,
    table::{Row, Table, Value},
    tier::TierClassifier,
    types::{CampaignId, GroupId, UserId},
};
use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionType {
    Deposit,
    Registration,
}

impl ConversionType {
    pub const ALL: [ConversionType; 2] = [ConversionType::Deposit, ConversionType::Registration];

    pub fn name(&self) -> &'static str {
        match self {
            ConversionType::Deposit => "deposit",
            ConversionType::Registration => "registration",
        }
    }
}

/// Optional filters for the push query.
#[derive(Debug, Clone, Default)]
pub struct PushFilters {
    pub window: Option<DateWindow>,
    pub ab_groups: Option<Vec<GroupId>>,
    pub countries: Option<Vec<String>>,
}

/// Optional filters for the conversion query.
#[derive(Debug, Clone)]
pub struct ConversionFilters {
    pub window: Option<DateWindow>,
    pub campaign_ids: Option<Vec<CampaignId>>,
    pub conversion_types: Vec<ConversionType>,
}

impl Default for ConversionFilters {
    fn default() -> Self {
        Self {
            window: None,
            campaign_ids: None,
            conversion_types: ConversionType::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PushStats {
    pub unique_users: i64,
    pub total_pushes: i64,
    pub ab_groups_count: i64,
    pub countries_count: i64,
    pub avg_delivery_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionStats {
    pub unique_converters: i64,
    pub total_deposits: i64,
    pub total_registrations: i64,
    pub total_revenue: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DataSummary {
    pub period: String,
    pub push_stats: Option<PushStats>,
    pub conversion_stats: Option<ConversionStats>,
    pub generated_at: NaiveDateTime,
}

pub struct DataLoader {
    config: AnalysisConfig,
    gateway: StoreGateway,
    classifier: TierClassifier,
    use_cache: bool,
    target_campaign_ids: Option<Vec<CampaignId>>,
}

impl DataLoader {
    pub fn new(config: AnalysisConfig) -> Self {
        let gateway = StoreGateway::new(&config);
        let classifier = TierClassifier::new(&config.tiers);
        let use_cache = config.cache.enabled;
        Self {
            config,
            gateway,
            classifier,
            use_cache,
            target_campaign_ids: None,
        }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Ping both stores; the first failure is returned.
    pub fn test_connections(&mut self) -> PushResult<()> {
        self.gateway.ping(DataSource::PushEvents)?;
        self.gateway.ping(DataSource::Conversions)?;
        Ok(())
    }

    fn fetch(&mut self, source: DataSource, query: &str, params: &QueryParams) -> PushResult<Table> {
        self.gateway.execute(source, query, params, self.use_cache)
    }

    // ── Push data ────────────────────────────────────────────────────────

    pub fn load_push_data(&mut self, filters: &PushFilters) -> PushResult<Vec<PushRecord>> {
        let window = filters.window.unwrap_or(self.config.push_window);
        log::info!("loader: loading push data for {window}");

        let (query, params) = self.push_query(&window, filters);
        let table = self.fetch(DataSource::PushEvents, &query, &params)?;
        if table.is_empty() {
            log::warn!("loader: no push data found");
            return Ok(Vec::new());
        }

        let records = self.process_push_table(&table)?;
        log::info!(
            "loader: {} push rows for {} users",
            records.len(),
            distinct_users(records.iter().map(|r| r.user_id.as_str()))
        );
        Ok(records)
    }

    fn push_query(&self, window: &DateWindow, filters: &PushFilters) -> (String, QueryParams) {
        let mut conditions = vec![
            "e.event_type = :event_type",
            "e.platform = :platform_type",
            "d.ad_id IS NOT NULL",
            "d.ab_tag IS NOT NULL",
            "date(e.created_at) >= :start_date",
            "date(e.created_at) <= :end_date",
        ]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();

        let ab_groups = filters.ab_groups.clone().filter(|g| !g.is_empty());
        let countries = filters.countries.clone().filter(|c| !c.is_empty());
        if let Some(groups) = &ab_groups {
            conditions.push(format!(
                "d.ab_tag IN ({})",
                list_placeholders("ab_groups", groups.len())
            ));
        }
        if let Some(list) = &countries {
            conditions.push(format!(
                "d.country_name IN ({})",
                list_placeholders("countries", list.len())
            ));
        }

        let query = format!(
            "SELECT
                CAST(d.ad_id AS TEXT) AS user_id,
                d.ab_tag AS ab_group,
                d.country_name AS country,
                COUNT(*) AS push_count,
                MIN(e.created_at) AS first_push,
                MAX(e.created_at) AS last_push,
                COUNT(DISTINCT date(e.created_at)) AS push_days,
                AVG(e.success) AS avg_success_rate
            FROM push_event e
            JOIN device d ON e.device_id = d.id
            WHERE {}
            GROUP BY user_id, ab_group, country
            ORDER BY push_count DESC",
            conditions.join(" AND ")
        );

        let params = QueryParams::new()
            .with("event_type", self.config.push_event_type)
            .with("platform_type", self.config.platform_type)
            .with("start_date", window.start_str())
            .with("end_date", window.end_str())
            .with("ab_groups", ab_groups)
            .with("countries", countries);
        (query, params)
    }

    fn process_push_table(&self, table: &Table) -> PushResult<Vec<PushRecord>> {
        let mut records = Vec::with_capacity(table.len());
        let mut dropped = 0usize;
        let mut control_rows = 0usize;

        for row in table.rows() {
            let Some(user_id) = non_empty(row.opt_text("user_id")?) else {
                dropped += 1;
                continue;
            };
            let Some(ab_group) = row.opt_text("ab_group")? else {
                dropped += 1;
                continue;
            };
            let push_count = row.int_or_zero("push_count")?;
            if push_count <= 0 {
                dropped += 1;
                continue;
            }
            if ab_group == self.config.control_group_id {
                control_rows += 1;
                continue;
            }

            let country = row.opt_text("country")?;
            let first_push = row.opt_timestamp("first_push")?;
            let last_push = row.opt_timestamp("last_push")?;
            records.push(PushRecord {
                tier: self.classifier.classify_opt(country.as_deref()),
                user_id,
                ab_group,
                country,
                push_count,
                first_push,
                last_push,
                push_days: row.int_or_zero("push_days")?,
                avg_success_rate: row.opt_real("avg_success_rate")?,
                campaign_duration_hours: PushRecord::campaign_hours(first_push, last_push),
                push_bucket: PushBucket::for_count(push_count),
            });
        }

        if dropped > 0 {
            log::warn!("loader: dropped {dropped} push rows without user, group or pushes");
        }
        if control_rows > 0 {
            log::warn!(
                "loader: dropped {control_rows} push rows tagged with control group {}",
                self.config.control_group_id
            );
        }
        Ok(records)
    }

    // ── Control group ────────────────────────────────────────────────────

    fn fetch_control_table(&mut self, window: &DateWindow) -> PushResult<Table> {
        let query = "SELECT
                CAST(ad_id AS TEXT) AS user_id,
                ab_tag AS ab_group,
                country_name AS country,
                0 AS push_count,
                NULL AS first_push,
                NULL AS last_push,
                0 AS push_days,
                NULL AS avg_success_rate
            FROM device
            WHERE ab_tag = :control_group
              AND platform = :platform_type
              AND ad_id IS NOT NULL
            GROUP BY user_id, ab_group, country";

        // The window does not filter control users; it scopes the cache entry.
        let params = QueryParams::new()
            .with("control_group", self.config.control_group_id.as_str())
            .with("platform_type", self.config.platform_type)
            .with("start_date", window.start_str())
            .with("end_date", window.end_str());
        self.fetch(DataSource::PushEvents, query, &params)
    }

    /// Derive the push-only columns for control rows and drop rows without
    /// a user or group.
    fn process_control_table(&self, mut table: Table) -> Table {
        table.set_column("campaign_duration_hours", |_| Value::Real(0.0));
        table.set_column("push_bucket", |_| {
            Value::Text(PushBucket::Zero.label().to_string())
        });
        table.set_column("push_days", |_| Value::Integer(0));
        table.set_column("first_push", |_| Value::Null);
        table.set_column("last_push", |_| Value::Null);
        if table.has_column("country") {
            let classifier = &self.classifier;
            table.set_column("tier", |row| {
                let country = row.opt_text("country").ok().flatten();
                Value::Text(classifier.classify_opt(country.as_deref()).label().to_string())
            });
        }

        let before = table.len();
        table.retain(|row| has_identity(row));
        if table.len() < before {
            log::warn!(
                "loader: dropped {} control rows without user or group",
                before - table.len()
            );
        }
        table
    }

    pub fn load_control_group_data(
        &mut self,
        window: Option<DateWindow>,
    ) -> PushResult<Vec<ControlRecord>> {
        let window = window.unwrap_or(self.config.push_window);
        log::info!(
            "loader: loading control group {} for {window}",
            self.config.control_group_id
        );
        let raw = self.fetch_control_table(&window)?;
        if raw.is_empty() {
            log::warn!("loader: control group not found");
            return Ok(Vec::new());
        }
        let processed = self.process_control_table(raw);
        let push_layout = Table::from_records::<PushRecord>(&[]);
        align_control_table(&push_layout, processed, &self.classifier).to_records()
    }

    /// Push data plus, optionally, the control group reconciled onto the
    /// push layout.
    pub fn load_complete_dataset(
        &mut self,
        window: Option<DateWindow>,
        include_control_group: bool,
    ) -> PushResult<Vec<PushRecord>> {
        let window = window.unwrap_or(self.config.push_window);
        log::info!("loader: loading complete dataset (control group: {include_control_group})");

        let push = self.load_push_data(&PushFilters {
            window: Some(window),
            ..PushFilters::default()
        })?;
        if !include_control_group {
            return Ok(push);
        }

        let raw = self.fetch_control_table(&window)?;
        if raw.is_empty() {
            log::warn!("loader: control group not found");
            return Ok(push);
        }

        let push_table = Table::from_records(&push);
        let control = self.process_control_table(raw);
        let control = align_control_table(&push_table, control, &self.classifier);
        let control_rows = control.len();
        let complete: Vec<PushRecord> = push_table.concat(control)?.to_records()?;

        log::info!("loader: added {control_rows} control group users");
        log::info!(
            "loader: {} rows for {} users in total",
            complete.len(),
            distinct_users(complete.iter().map(|r| r.user_id.as_str()))
        );
        Ok(complete)
    }

    // ── Campaigns and conversions ────────────────────────────────────────

    /// Active campaign ids whose name or alias mentions one of `app_names`.
    pub fn find_campaign_groups(&mut self, app_names: &[String]) -> PushResult<Vec<CampaignId>> {
        log::info!("loader: looking up campaigns for {app_names:?}");
        if app_names.is_empty() {
            log::warn!("loader: no application names to match campaigns against");
            return Ok(Vec::new());
        }

        let clauses: Vec<String> = (0..app_names.len())
            .map(|i| format!("name LIKE '%' || :apps_{i} || '%' OR alias LIKE '%' || :apps_{i} || '%'"))
            .collect();
        let query = format!(
            "SELECT DISTINCT id, name, alias, state, created_at, updated_at
            FROM campaign_group
            WHERE ({})
            ORDER BY name",
            clauses.join(" OR ")
        );
        let params = QueryParams::new().with("apps", app_names.to_vec());

        let table = self.fetch(DataSource::Conversions, &query, &params)?;
        if table.is_empty() {
            log::warn!("loader: no campaigns found");
            return Ok(Vec::new());
        }

        let campaigns = table
            .rows()
            .map(|row| CampaignRecord::from_row(&row))
            .collect::<PushResult<Vec<_>>>()?;
        for c in &campaigns {
            log::info!("loader: campaign {} '{}' ({})", c.id, c.name, c.state);
        }
        let ids: Vec<CampaignId> = campaigns
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.id)
            .collect();
        log::info!("loader: {} active campaigns", ids.len());
        Ok(ids)
    }

    pub fn load_conversion_data(
        &mut self,
        filters: &ConversionFilters,
    ) -> PushResult<Vec<ConversionRecord>> {
        let window = filters.window.unwrap_or(self.config.conversion_window);
        log::info!("loader: loading conversions for {window}");

        let campaign_ids = match &filters.campaign_ids {
            Some(ids) => ids.clone(),
            None => {
                if self.target_campaign_ids.is_none() {
                    let apps = self.config.target_apps.clone();
                    self.target_campaign_ids = Some(self.find_campaign_groups(&apps)?);
                }
                self.target_campaign_ids.clone().unwrap_or_default()
            }
        };
        if campaign_ids.is_empty() {
            log::warn!("loader: no campaign ids; conversions are not filtered by campaign");
        }

        let (query, params) = conversion_query(&window, &campaign_ids, &filters.conversion_types);
        let table = self.fetch(DataSource::Conversions, &query, &params)?;
        if table.is_empty() {
            log::warn!("loader: no conversions found");
            return Ok(Vec::new());
        }

        let records = self.process_conversion_table(&table)?;
        log::info!(
            "loader: {} conversion rows for {} users",
            records.len(),
            distinct_users(records.iter().map(|r| r.user_id.as_str()))
        );
        Ok(records)
    }

    fn process_conversion_table(&self, table: &Table) -> PushResult<Vec<ConversionRecord>> {
        let mut records = Vec::with_capacity(table.len());
        let mut dropped = 0usize;
        for row in table.rows() {
            let Some(user_id) = non_empty(row.opt_text("user_id")?) else {
                dropped += 1;
                continue;
            };
            let country = row.opt_text("country")?;
            let total_deposits = row.int_or_zero("total_deposits")?;
            let total_registrations = row.int_or_zero("total_registrations")?;
            let total_revenue = row.real_or_zero("total_revenue")?;
            let conversion_events = row.int_or_zero("conversion_events")?;
            let first_conversion = row.opt_timestamp("first_conversion")?;
            let last_conversion = row.opt_timestamp("last_conversion")?;

            records.push(ConversionRecord {
                tier: self.classifier.classify_opt(country.as_deref()),
                user_id,
                country,
                campaign_id: row.opt_int("campaign_id")?,
                total_deposits,
                total_registrations,
                total_revenue,
                conversion_events,
                first_conversion,
                last_conversion,
                conversion_window_hours: ConversionRecord::window_hours(
                    first_conversion,
                    last_conversion,
                ),
                user_type: UserType::classify(total_deposits, total_registrations),
                arpu: ConversionRecord::arpu_for(total_revenue, conversion_events),
            });
        }
        if dropped > 0 {
            log::warn!("loader: dropped {dropped} conversion rows without user id");
        }
        Ok(records)
    }

    pub fn load_full_dataset(
        &mut self,
        push_filters: &PushFilters,
        conversion_filters: &ConversionFilters,
    ) -> PushResult<(Vec<PushRecord>, Vec<ConversionRecord>)> {
        log::info!("loader: loading full dataset");
        let push = self.load_push_data(push_filters)?;
        let conversions = self.load_conversion_data(conversion_filters)?;
        Ok((push, conversions))
    }

    // ── Summaries and enrichment ─────────────────────────────────────────

    pub fn data_summary(&mut self) -> PushResult<DataSummary> {
        log::info!("loader: collecting headline statistics");
        let push_window = self.config.push_window;
        let conversion_window = self.config.conversion_window;

        let push_query = "SELECT
                COUNT(DISTINCT d.ad_id) AS unique_users,
                COUNT(*) AS total_pushes,
                COUNT(DISTINCT d.ab_tag) AS ab_groups_count,
                COUNT(DISTINCT d.country_name) AS countries_count,
                AVG(e.success) AS avg_delivery_rate
            FROM push_event e
            JOIN device d ON e.device_id = d.id
            WHERE e.event_type = :event_type
              AND e.platform = :platform_type
              AND date(e.created_at) >= :start_date
              AND date(e.created_at) <= :end_date";
        let push_params = QueryParams::new()
            .with("event_type", self.config.push_event_type)
            .with("platform_type", self.config.platform_type)
            .with("start_date", push_window.start_str())
            .with("end_date", push_window.end_str());
        let push_table = self.fetch(DataSource::PushEvents, push_query, &push_params)?;
        let push_stats = match push_table.rows().next() {
            Some(row) => Some(PushStats {
                unique_users: row.int_or_zero("unique_users")?,
                total_pushes: row.int_or_zero("total_pushes")?,
                ab_groups_count: row.int_or_zero("ab_groups_count")?,
                countries_count: row.int_or_zero("countries_count")?,
                avg_delivery_rate: row.opt_real("avg_delivery_rate")?,
            }),
            None => None,
        };

        let conversion_query = "SELECT
                COUNT(DISTINCT external_user_id) AS unique_converters,
                SUM(is_sale) AS total_deposits,
                SUM(is_lead) AS total_registrations,
                SUM(sale_revenue) AS total_revenue
            FROM conversion_click
            WHERE external_user_id IS NOT NULL
              AND date_key >= :start_date
              AND date_key <= :end_date
              AND (is_sale > 0 OR is_lead > 0)";
        let conversion_params = QueryParams::new()
            .with("start_date", conversion_window.start_str())
            .with("end_date", conversion_window.end_str());
        let conversion_table =
            self.fetch(DataSource::Conversions, conversion_query, &conversion_params)?;
        let conversion_stats = match conversion_table.rows().next() {
            Some(row) => Some(ConversionStats {
                unique_converters: row.int_or_zero("unique_converters")?,
                total_deposits: row.int_or_zero("total_deposits")?,
                total_registrations: row.int_or_zero("total_registrations")?,
                total_revenue: row.real_or_zero("total_revenue")?,
            }),
            None => None,
        };

        Ok(DataSummary {
            period: push_window.to_string(),
            push_stats,
            conversion_stats,
            generated_at: Utc::now().naive_utc(),
        })
    }

    /// Device attributes for up to `device_lookup_limit` users.
    pub fn load_device_enrichment(&mut self, user_ids: &[UserId]) -> PushResult<Vec<DeviceRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let limit = self.config.device_lookup_limit;
        let sample: Vec<UserId> = user_ids.iter().take(limit).cloned().collect();
        if sample.len() < user_ids.len() {
            log::warn!(
                "loader: device lookup truncated to {} of {} users",
                sample.len(),
                user_ids.len()
            );
        }
        log::info!("loader: loading device info for {} users", sample.len());

        let query = format!(
            "SELECT
                CAST(ad_id AS TEXT) AS user_id,
                country_name,
                language_name,
                ab_tag AS ab_group,
                platform,
                active,
                timezone,
                created_at AS device_created_at
            FROM device
            WHERE CAST(ad_id AS TEXT) IN ({})",
            list_placeholders("user_ids", sample.len())
        );
        let params = QueryParams::new().with("user_ids", sample);
        let table = self.fetch(DataSource::PushEvents, &query, &params)?;
        let devices = table
            .rows()
            .map(|row| DeviceRecord::from_row(&row))
            .collect::<PushResult<Vec<_>>>()?;
        if !devices.is_empty() {
            log::info!("loader: found {} devices", devices.len());
        }
        Ok(devices)
    }

    pub fn clear_cache(&self) -> PushResult<usize> {
        self.gateway.clear_cache()
    }

    pub fn cache_info(&self) -> PushResult<CacheInfo> {
        self.gateway.cache_info()
    }
}

fn conversion_query(
    window: &DateWindow,
    campaign_ids: &[CampaignId],
    conversion_types: &[ConversionType],
) -> (String, QueryParams) {
    let mut conditions: Vec<String> = vec![
        "external_user_id IS NOT NULL".into(),
        "external_user_id != ''".into(),
        "date_key >= :start_date".into(),
        "date_key <= :end_date".into(),
    ];
    if !campaign_ids.is_empty() {
        conditions.push(format!(
            "campaign_id IN ({})",
            list_placeholders("campaign_ids", campaign_ids.len())
        ));
    }

    let mut type_filter = Vec::new();
    if conversion_types.contains(&ConversionType::Deposit) {
        type_filter.push("is_sale > 0");
    }
    if conversion_types.contains(&ConversionType::Registration) {
        type_filter.push("is_lead > 0");
    }
    if !type_filter.is_empty() {
        conditions.push(format!("({})", type_filter.join(" OR ")));
    }

    let query = format!(
        "SELECT
            external_user_id AS user_id,
            SUM(is_sale) AS total_deposits,
            SUM(is_lead) AS total_registrations,
            MIN(clicked_at) AS first_conversion,
            MAX(clicked_at) AS last_conversion,
            COUNT(*) AS conversion_events,
            SUM(sale_revenue) AS total_revenue,
            country,
            campaign_id
        FROM conversion_click
        WHERE {}
        GROUP BY user_id, country, campaign_id",
        conditions.join(" AND ")
    );

    let types: Vec<String> = conversion_types.iter().map(|t| t.name().to_string()).collect();
    let ids = (!campaign_ids.is_empty()).then(|| campaign_ids.to_vec());
    let params = QueryParams::new()
        .with("start_date", window.start_str())
        .with("end_date", window.end_str())
        .with("campaign_ids", ids)
        .with("conversion_types", types);
    (query, params)
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.trim().is_empty())
}

fn has_identity(row: &Row<'_>) -> bool {
    let user = row.opt_text("user_id").ok().flatten();
    let group = row.opt_text("ab_group").ok().flatten();
    non_empty(user).is_some() && group.is_some()
}

fn distinct_users<'a>(ids: impl Iterator<Item = &'a str>) -> usize {
    ids.collect::<HashSet<_>>().len()
}
