//! push-lift: batch runner for the push-notification lift analysis.
//!
//! Usage:
//!   push-lift --config data/analysis_config.json --out outputs
//!   push-lift --seed-demo 42 --save-processed
//!   push-lift --seed-demo 42 --replace-stores   (overwrite file stores that hold rows)
//!   push-lift --cache-info
//!   push-lift --clear-cache

use anyhow::{Context, Result};
use pushlift_core::{
    analyzer::{AbGroupSummary, EffectivenessReport, GroupType, PushAnalyzer},
    config::AnalysisConfig,
    loader::{ConversionFilters, DataLoader},
    snapshot::SnapshotStore,
    synth::{self, ExistingRows, DEFAULT_USERS_PER_GROUP},
};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "./data/analysis_config.json";
const DEFAULT_OUT: &str = "./outputs";

#[derive(Serialize)]
struct RunOverview {
    generated_at: chrono::NaiveDateTime,
    push_window: String,
    conversion_window: String,
    control_group_id: String,
    include_control_group: bool,
    push_rows: usize,
    conversion_rows: usize,
    merged_rows: usize,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let config_path = arg_value(&args, "--config").unwrap_or(DEFAULT_CONFIG);
    let out_dir = PathBuf::from(arg_value(&args, "--out").unwrap_or(DEFAULT_OUT));
    let demo_seed: Option<u64> = arg_value(&args, "--seed-demo")
        .map(|s| s.parse().context("--seed-demo expects an integer seed"))
        .transpose()?;
    let users_per_group = parse_arg(&args, "--users-per-group", DEFAULT_USERS_PER_GROUP);
    let no_cache = has_flag(&args, "--no-cache");
    let include_control = !has_flag(&args, "--no-control");
    let save_processed = has_flag(&args, "--save-processed");
    let existing_rows = if has_flag(&args, "--replace-stores") {
        ExistingRows::Replace
    } else {
        ExistingRows::Refuse
    };

    let mut config = AnalysisConfig::load(config_path)?;
    if no_cache {
        config.cache.enabled = false;
    }

    println!("push-lift");
    println!("  config:        {config_path}");
    println!("  push window:   {}", config.push_window);
    println!("  conv window:   {}", config.conversion_window);
    println!("  control group: {}", config.control_group_id);
    println!("  cache:         {}", if config.cache.enabled { "on" } else { "off" });
    println!();

    let mut loader = DataLoader::new(config.clone());

    if has_flag(&args, "--clear-cache") {
        let removed = loader.clear_cache()?;
        println!("cleared {removed} cache entries");
        return Ok(());
    }
    if has_flag(&args, "--cache-info") {
        let info = loader.cache_info()?;
        println!(
            "cache: {} files, {:.2} MB, enabled: {}",
            info.files, info.total_size_mb, info.cache_enabled
        );
        return Ok(());
    }

    // Held for the whole run: in-memory demo stores vanish with their
    // last connection.
    let _demo = match demo_seed {
        Some(seed) => {
            let (stores, summary) =
                synth::seed_demo_stores(&config, seed, users_per_group, existing_rows)?;
            println!(
                "seeded demo stores: {} devices, {} pushes, {} clicks",
                summary.devices, summary.push_events, summary.conversion_clicks
            );
            Some(stores)
        }
        None => None,
    };

    loader.test_connections()?;
    let analyzer = PushAnalyzer::new(&config);

    let complete = loader.load_complete_dataset(None, include_control)?;
    let conversions = loader.load_conversion_data(&ConversionFilters::default())?;
    let merged = analyzer.merge_data(&complete, &conversions);

    let ab_stats = analyzer.ab_analysis(&merged);
    let geo_stats = analyzer.geo_analysis(&merged);
    let bucket_stats = analyzer.bucket_analysis(&merged);
    let effectiveness = analyzer.calculate_push_effectiveness(&ab_stats);

    print_ab_table(&ab_stats);
    print_effectiveness(&effectiveness);

    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Cannot create {}", out_dir.display()))?;
    write_json(&out_dir, "ab_summary.json", &ab_stats)?;
    write_json(&out_dir, "geo_summary.json", &geo_stats)?;
    write_json(&out_dir, "bucket_summary.json", &bucket_stats)?;
    write_json(&out_dir, "push_effectiveness.json", &effectiveness)?;
    write_json(
        &out_dir,
        "run_overview.json",
        &RunOverview {
            generated_at: chrono::Utc::now().naive_utc(),
            push_window: config.push_window.to_string(),
            conversion_window: config.conversion_window.to_string(),
            control_group_id: config.control_group_id.clone(),
            include_control_group: include_control,
            push_rows: complete.len(),
            conversion_rows: conversions.len(),
            merged_rows: merged.len(),
        },
    )?;
    println!();
    println!("results written to {}", out_dir.display());

    if save_processed {
        let manifest = SnapshotStore::new(config.processed_dir.clone()).save_processed_data(
            &complete,
            &conversions,
            Some(merged.as_slice()),
        )?;
        println!(
            "processed data saved to {} (run {})",
            config.processed_dir.display(),
            manifest.run_id
        );
    }

    Ok(())
}

fn print_ab_table(stats: &[AbGroupSummary]) {
    println!("=== A/B GROUPS ===");
    println!(
        "  {:<6} {:<14} {:>8} {:>8} {:>10} {:>10} {:>10}",
        "group", "type", "users", "pushes", "dep conv%", "reg conv%", "arpu"
    );
    for s in stats {
        let type_label = match s.group_type {
            GroupType::Control => "Control Group",
            GroupType::Push => "Push Group",
        };
        println!(
            "  {:<6} {:<14} {:>8} {:>8.2} {:>10.3} {:>10.3} {:>10.4}",
            s.ab_group,
            type_label,
            s.metrics.total_users,
            s.metrics.avg_pushes,
            s.metrics.deposit_conversion,
            s.metrics.reg_conversion,
            s.metrics.arpu
        );
    }
}

fn print_effectiveness(report: &EffectivenessReport) {
    println!();
    println!("=== PUSH EFFECTIVENESS ===");
    match report {
        EffectivenessReport::Unavailable { error } => {
            println!("  not available: {error}");
        }
        EffectivenessReport::Evaluated(e) => {
            let c = &e.control_group;
            println!("  control group {}:", c.group_id);
            println!("    users:       {}", c.users);
            println!("    deposits:    {}", c.deposits);
            println!("    conversion:  {:.3}%", c.conversion_rate);
            println!("    arpu:        {:.4}", c.arpu);

            let avg = &e.push_groups_average;
            println!("  push groups (average):");
            println!("    conversion:  {:.3}%", avg.conversion_rate);
            println!("    lift:        {:+.3} pp", avg.improvement_vs_control);
            println!("    relative:    {:+.1}%", avg.relative_improvement_pct);

            let best = &e.best_push_group;
            println!("  best push group {}:", best.group_id);
            println!("    conversion:  {:.3}%", best.conversion_rate);
            println!("    lift:        {:+.3} pp", best.improvement_vs_control);

            let verdict = if e.summary.push_effective {
                "push notifications lift deposit conversion"
            } else {
                "no positive effect from push notifications"
            };
            println!("  verdict: {verdict}");
        }
    }
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, file: &str, value: &T) -> Result<()> {
    let path = dir.join(file);
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, json).with_context(|| format!("Cannot write {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
