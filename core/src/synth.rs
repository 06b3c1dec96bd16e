//! Demo data seeding.
//!
//! Provisions both stores from `migrations/` and fills them with a
//! deterministic population: push groups, the control group, target and
//! non-target campaigns, and conversions whose deposit odds rise with push
//! volume. Lets the pipeline run end to end without the production stores.
//!
//! Rows that the loader must filter out are seeded on purpose: iOS devices,
//! devices without an advertising id, non-push event types, clicks without
//! a user id and clicks on campaigns outside the target apps.

use crate::{
    config::{AnalysisConfig, DateWindow},
    error::{PushError, PushResult},
    rng::{StreamRng, StreamSlot},
    types::TIMESTAMP_FORMAT,
};
use chrono::{Duration, NaiveDateTime};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;

pub const DEFAULT_USERS_PER_GROUP: usize = 400;

const PUSH_GROUPS: [&str; 5] = ["1", "2", "3", "4", "5"];

const DEMO_COUNTRIES: [Option<&str>; 12] = [
    Some("United States"),
    Some("Germany"),
    Some("United Kingdom"),
    Some("Spain"),
    Some("Brazil"),
    Some("Poland"),
    Some("India"),
    Some("Russian Federation"),
    Some("Ukraine"),
    Some("Kazakhstan"),
    Some("Nigeria"),
    None,
];

const LANGUAGES: [&str; 5] = ["English", "German", "Spanish", "Portuguese", "Russian"];
const TIMEZONES: [&str; 4] = ["UTC", "Europe/Berlin", "America/New_York", "Asia/Kolkata"];

/// (id, name, alias, state)
const CAMPAIGNS: [(i64, &str, &str, &str); 5] = [
    (1, "Michelangelo Android", "mich_android", "active"),
    (2, "Leonardo Main", "leo_main", "active"),
    (3, "Raphael Archive", "raph_old", "paused"),
    (4, "Splinter Promo", "splinter", "active"),
    (5, "Casey Jones", "cj_web", "active"),
];
const TARGET_ACTIVE_CAMPAIGNS: [i64; 3] = [1, 2, 4];
const NON_TARGET_CAMPAIGN: i64 = 5;

const IOS_PLATFORM: i64 = 2;
const OTHER_EVENT_TYPE: i64 = 3;

/// Open connections to the seeded stores. In-memory stores live only as
/// long as a connection to them is open, so callers hold this for the run.
pub struct DemoStores {
    pub push_events: Connection,
    pub conversions: Connection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DemoSummary {
    pub devices: usize,
    pub push_events: usize,
    pub campaigns: usize,
    pub conversion_clicks: usize,
}

struct DemoDevice {
    id: i64,
    ad_id: Option<String>,
    ab_tag: String,
    country: Option<&'static str>,
    platform: i64,
}

pub fn open_store_for_seeding(uri: &str) -> PushResult<Connection> {
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI,
    )?;
    Ok(conn)
}

/// Apply the store schemas. Safe to call on already-migrated stores.
pub fn migrate(push_events: &Connection, conversions: &Connection) -> PushResult<()> {
    push_events.execute_batch(include_str!("../../migrations/001_push_events.sql"))?;
    conversions.execute_batch(include_str!("../../migrations/002_conversions.sql"))?;
    Ok(())
}

/// What seeding does with a file-backed store that already holds rows.
/// In-memory stores are always replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingRows {
    Refuse,
    Replace,
}

pub fn is_memory_uri(uri: &str) -> bool {
    uri == ":memory:" || uri.contains("mode=memory")
}

/// True when any of `tables` exists in the store and has a row.
fn holds_rows(conn: &Connection, tables: &[&str]) -> PushResult<bool> {
    for table in tables {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )?;
        if !exists {
            continue;
        }
        let has_rows: bool =
            conn.query_row(&format!("SELECT EXISTS(SELECT 1 FROM {table})"), [], |row| {
                row.get(0)
            })?;
        if has_rows {
            return Ok(true);
        }
    }
    Ok(false)
}

fn guard_store(
    name: &str,
    uri: &str,
    conn: &Connection,
    tables: &[&str],
    existing: ExistingRows,
) -> PushResult<()> {
    if existing == ExistingRows::Replace || is_memory_uri(uri) {
        return Ok(());
    }
    if holds_rows(conn, tables)? {
        return Err(PushError::SeedRefused {
            store: name.to_string(),
            uri: uri.to_string(),
        });
    }
    Ok(())
}

/// Create, migrate and fill both configured stores. Existing demo rows are
/// replaced, so the same seed always yields the same data. A file-backed
/// store that already holds rows is left alone unless `existing` is
/// `Replace`.
pub fn seed_demo_stores(
    config: &AnalysisConfig,
    seed: u64,
    users_per_group: usize,
    existing: ExistingRows,
) -> PushResult<(DemoStores, DemoSummary)> {
    let push_uri = &config.stores.push_events.uri;
    let conversions_uri = &config.stores.conversions.uri;
    let mut push_events = open_store_for_seeding(push_uri)?;
    let mut conversions = open_store_for_seeding(conversions_uri)?;
    guard_store(
        "push_events",
        push_uri,
        &push_events,
        &["device", "push_event"],
        existing,
    )?;
    guard_store(
        "conversions",
        conversions_uri,
        &conversions,
        &["campaign_group", "conversion_click"],
        existing,
    )?;
    migrate(&push_events, &conversions)?;

    let mut summary = DemoSummary::default();
    let devices = seed_devices(&mut push_events, config, seed, users_per_group)?;
    summary.devices = devices.len();

    let push_counts = seed_push_events(&mut push_events, config, seed, &devices)?;
    summary.push_events = push_counts.iter().map(|&n| n as usize).sum();

    summary.campaigns = seed_campaigns(&conversions, &config.conversion_window)?;
    summary.conversion_clicks =
        seed_conversions(&mut conversions, config, seed, &devices, &push_counts)?;

    log::info!(
        "synth: seeded {} devices, {} push events, {} campaigns, {} clicks (seed {seed})",
        summary.devices,
        summary.push_events,
        summary.campaigns,
        summary.conversion_clicks
    );
    Ok((
        DemoStores {
            push_events,
            conversions,
        },
        summary,
    ))
}

// ── Push-event store ─────────────────────────────────────────────────────────

fn seed_devices(
    conn: &mut Connection,
    config: &AnalysisConfig,
    seed: u64,
    users_per_group: usize,
) -> PushResult<Vec<DemoDevice>> {
    let mut rng = StreamRng::new(seed, StreamSlot::Devices);
    let created_base = window_start(&config.push_window) - Duration::days(90);

    let groups: Vec<&str> = PUSH_GROUPS
        .iter()
        .copied()
        .filter(|g| *g != config.control_group_id)
        .chain(std::iter::once(config.control_group_id.as_str()))
        .collect();

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM push_event", [])?;
    tx.execute("DELETE FROM device", [])?;

    let mut devices = Vec::with_capacity(groups.len() * users_per_group);
    {
        let mut insert = tx.prepare(
            "INSERT INTO device
                (id, ad_id, ab_tag, country_name, platform, language_name, timezone, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        let mut next_id = 1i64;
        for group in &groups {
            for _ in 0..users_per_group {
                let id = next_id;
                next_id += 1;
                let ad_id = (!rng.chance(0.02)).then(|| format!("gadid-{id:06}"));
                let platform = if rng.chance(0.1) {
                    IOS_PLATFORM
                } else {
                    config.platform_type
                };
                let country = rng.pick(&DEMO_COUNTRIES).copied().flatten();
                let created_at = created_base + Duration::hours(rng.next_u64_below(24 * 80) as i64);

                insert.execute(params![
                    id,
                    ad_id,
                    group,
                    country,
                    platform,
                    rng.pick(&LANGUAGES).copied(),
                    rng.pick(&TIMEZONES).copied(),
                    rng.chance(0.9) as i64,
                    format_ts(created_at),
                ])?;
                devices.push(DemoDevice {
                    id,
                    ad_id,
                    ab_tag: group.to_string(),
                    country,
                    platform,
                });
            }
        }
    }
    tx.commit()?;
    Ok(devices)
}

/// Insert push events for every push-group device; returns the number of
/// qualifying pushes per device (zero for the control group).
fn seed_push_events(
    conn: &mut Connection,
    config: &AnalysisConfig,
    seed: u64,
    devices: &[DemoDevice],
) -> PushResult<Vec<i64>> {
    let mut rng = StreamRng::new(seed, StreamSlot::Pushes);
    let span = window_hours(&config.push_window);
    let start = window_start(&config.push_window);

    let tx = conn.transaction()?;
    let mut counts = Vec::with_capacity(devices.len());
    {
        let mut insert = tx.prepare(
            "INSERT INTO push_event (device_id, event_type, platform, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for device in devices {
            if device.ab_tag == config.control_group_id {
                counts.push(0);
                continue;
            }
            let pushes = (rng.pareto(1.0, 1.1).floor() as i64).clamp(1, 20);
            for _ in 0..pushes {
                let at = start + Duration::hours(rng.next_u64_below(span) as i64);
                insert.execute(params![
                    device.id,
                    config.push_event_type,
                    device.platform,
                    rng.chance(0.85) as i64,
                    format_ts(at),
                ])?;
            }
            if rng.chance(0.2) {
                let at = start + Duration::hours(rng.next_u64_below(span) as i64);
                insert.execute(params![device.id, OTHER_EVENT_TYPE, device.platform, 1i64, format_ts(at)])?;
            }
            counts.push(pushes);
        }
    }
    tx.commit()?;
    Ok(counts)
}

// ── Conversion store ─────────────────────────────────────────────────────────

fn seed_campaigns(conn: &Connection, window: &DateWindow) -> PushResult<usize> {
    conn.execute("DELETE FROM campaign_group", [])?;
    let stamp = format_ts(window_start(window) - Duration::days(30));
    for (id, name, alias, state) in CAMPAIGNS {
        conn.execute(
            "INSERT INTO campaign_group (id, name, alias, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, alias, state, stamp],
        )?;
    }
    Ok(CAMPAIGNS.len())
}

fn seed_conversions(
    conn: &mut Connection,
    config: &AnalysisConfig,
    seed: u64,
    devices: &[DemoDevice],
    push_counts: &[i64],
) -> PushResult<usize> {
    let mut rng = StreamRng::new(seed, StreamSlot::Conversions);
    let span = window_hours(&config.conversion_window);
    let start = window_start(&config.conversion_window);

    let tx = conn.transaction()?;
    tx.execute("DELETE FROM conversion_click", [])?;
    let mut clicks = 0usize;
    {
        let mut insert = tx.prepare(
            "INSERT INTO conversion_click
                (external_user_id, campaign_id, country, is_sale, is_lead, sale_revenue, clicked_at, date_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        let mut click = |rng: &mut StreamRng,
                         user: Option<&str>,
                         campaign: i64,
                         country: Option<&str>,
                         sale: bool,
                         revenue: f64|
         -> PushResult<()> {
            let at = start + Duration::hours(rng.next_u64_below(span) as i64);
            insert.execute(params![
                user,
                campaign,
                country,
                sale as i64,
                (!sale) as i64,
                revenue,
                format_ts(at),
                at.format("%Y-%m-%d").to_string(),
            ])?;
            clicks += 1;
            Ok(())
        };

        for (device, &pushes) in devices.iter().zip(push_counts) {
            let Some(user) = device.ad_id.as_deref() else {
                continue;
            };
            let campaign = rng.pick(&TARGET_ACTIVE_CAMPAIGNS).copied().unwrap_or(1);
            let deposit_p = 0.04 + 0.006 * pushes.min(10) as f64;

            if rng.chance(0.25) {
                click(&mut rng, Some(user), campaign, device.country, false, 0.0)?;
            }
            if rng.chance(deposit_p) {
                let deposits = 1 + rng.next_u64_below(3);
                for _ in 0..deposits {
                    let revenue = (rng.pareto(10.0, 2.0) * 100.0).round() / 100.0;
                    click(&mut rng, Some(user), campaign, device.country, true, revenue)?;
                }
            }
            if rng.chance(0.05) {
                click(&mut rng, Some(user), NON_TARGET_CAMPAIGN, device.country, true, 25.0)?;
            }
        }

        for _ in 0..devices.len() / 50 {
            click(&mut rng, None, 1, Some("Germany"), true, 10.0)?;
        }
    }
    tx.commit()?;
    Ok(clicks)
}

fn window_start(window: &DateWindow) -> NaiveDateTime {
    window.start.and_hms_opt(0, 0, 0).unwrap_or_default()
}

/// Hours in the window, counting the end date as a full day.
fn window_hours(window: &DateWindow) -> u64 {
    ((window.end - window.start).num_days().max(0) as u64 + 1) * 24
}

fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tag: &str) -> AnalysisConfig {
        let mut config = AnalysisConfig::default_test();
        config.stores.push_events.uri = format!("file:synth_push_{tag}?mode=memory&cache=shared");
        config.stores.conversions.uri = format!("file:synth_conv_{tag}?mode=memory&cache=shared");
        config
    }

    #[test]
    fn seeding_is_deterministic() {
        let (_a, first) = seed_demo_stores(&config("det_a"), 11, 20, ExistingRows::Refuse).unwrap();
        let (_b, second) = seed_demo_stores(&config("det_b"), 11, 20, ExistingRows::Refuse).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.devices, 120);
        assert_eq!(first.campaigns, CAMPAIGNS.len());
    }

    #[test]
    fn control_devices_receive_no_pushes() {
        let cfg = config("control");
        let (stores, _) = seed_demo_stores(&cfg, 3, 30, ExistingRows::Refuse).unwrap();
        let pushed: i64 = stores
            .push_events
            .query_row(
                "SELECT COUNT(*) FROM push_event e JOIN device d ON e.device_id = d.id
                 WHERE d.ab_tag = ?1",
                [&cfg.control_group_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(pushed, 0);
    }

    #[test]
    fn reseeding_replaces_rows() {
        let cfg = config("reseed");
        let (_first, a) = seed_demo_stores(&cfg, 5, 10, ExistingRows::Refuse).unwrap();
        let (stores, b) = seed_demo_stores(&cfg, 5, 10, ExistingRows::Refuse).unwrap();
        assert_eq!(a, b);
        let devices: i64 = stores
            .push_events
            .query_row("SELECT COUNT(*) FROM device", [], |row| row.get(0))
            .unwrap();
        assert_eq!(devices as usize, b.devices);
    }

    #[test]
    fn pushes_fall_inside_the_window() {
        let cfg = config("window");
        let (stores, _) = seed_demo_stores(&cfg, 9, 15, ExistingRows::Refuse).unwrap();
        let outside: i64 = stores
            .push_events
            .query_row(
                "SELECT COUNT(*) FROM push_event
                 WHERE date(created_at) < ?1 OR date(created_at) > ?2",
                [cfg.push_window.start_str(), cfg.push_window.end_str()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(outside, 0);
    }

    #[test]
    fn file_stores_with_rows_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AnalysisConfig::default_test();
        cfg.stores.push_events.uri = dir.path().join("push.db").display().to_string();
        cfg.stores.conversions.uri = dir.path().join("conv.db").display().to_string();

        // Fresh files are empty, so seeding goes ahead.
        let (first, summary) = seed_demo_stores(&cfg, 4, 5, ExistingRows::Refuse).unwrap();
        drop(first);

        let err = seed_demo_stores(&cfg, 4, 5, ExistingRows::Refuse).err();
        assert!(matches!(err, Some(PushError::SeedRefused { ref store, .. }) if store == "push_events"));

        let (stores, again) = seed_demo_stores(&cfg, 4, 5, ExistingRows::Replace).unwrap();
        assert_eq!(again, summary);
        let devices: i64 = stores
            .push_events
            .query_row("SELECT COUNT(*) FROM device", [], |row| row.get(0))
            .unwrap();
        assert_eq!(devices as usize, summary.devices);
    }

    #[test]
    fn memory_uris_are_recognised() {
        assert!(is_memory_uri(":memory:"));
        assert!(is_memory_uri("file:push?mode=memory&cache=shared"));
        assert!(!is_memory_uri("data/push_events.db"));
    }
}
