//! CLI tool for gputel

#[cfg(feature = "cli")]
use clap::{Parser, ValueEnum};
#[cfg(feature = "cli")]
use std::path::PathBuf;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "gputel")]
#[command(about = "GPU telemetry: temperature, memory and utilization from every detected backend", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: ~/.config/gputel/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override a backend option, e.g. `--set amd=true --set amd-refresh=500ms`
    #[arg(short, long = "set", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    overrides: Vec<(String, String)>,

    /// Print interval in seconds (default: general.update_interval_ms)
    #[arg(short, long)]
    interval: Option<f64>,

    /// Number of reports to print before exiting (0 = forever)
    #[arg(short = 'n', long, default_value_t = 1)]
    count: u64,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Ask backends for per-device usage
    #[arg(long)]
    per_device: bool,
}

#[cfg(feature = "cli")]
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[cfg(feature = "cli")]
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.trim().to_string()))
}

#[cfg(feature = "cli")]
fn parse_interval(secs: f64) -> Result<std::time::Duration, String> {
    if secs <= 0.0 {
        return Err(format!("invalid interval: {}", secs));
    }
    std::time::Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("invalid interval {}: {}", secs, e))
}

#[cfg(feature = "cli")]
#[derive(serde::Serialize)]
struct Report {
    timestamp: chrono::DateTime<chrono::Utc>,
    temperatures: std::collections::BTreeMap<String, i32>,
    memory: std::collections::BTreeMap<String, gputel::MemoryInfo>,
    usage: std::collections::BTreeMap<String, i32>,
    errors: std::collections::BTreeMap<String, String>,
}

#[cfg(feature = "cli")]
fn collect(registry: &gputel::Registry, per_device: bool) -> Report {
    use std::collections::HashMap;

    let mut temps = HashMap::new();
    let mut mems = HashMap::new();
    let mut usage = HashMap::new();
    let mut errors = registry.update_temperatures(&mut temps);
    errors.extend(registry.update_memory(&mut mems));
    errors.extend(registry.update_usage(&mut usage, per_device));

    Report {
        timestamp: chrono::Utc::now(),
        temperatures: temps.into_iter().collect(),
        memory: mems.into_iter().collect(),
        usage: usage.into_iter().collect(),
        errors: errors
            .into_iter()
            .map(|(label, err)| (label, err.to_string()))
            .collect(),
    }
}

#[cfg(feature = "cli")]
fn print_report(registry: &gputel::Registry, report: &Report) {
    println!("=== {} ===", report.timestamp.format("%Y-%m-%d %H:%M:%S"));
    for (key, status) in registry.statuses() {
        match registry.last_updated(key) {
            Some(at) => println!("  {:<8} {} (updated {})", key, status, at.format("%H:%M:%S")),
            None => println!("  {:<8} {}", key, status),
        }
    }

    let labels: std::collections::BTreeSet<&String> = report
        .temperatures
        .keys()
        .chain(report.memory.keys())
        .chain(report.usage.keys())
        .collect();
    if labels.is_empty() {
        println!("No GPU readings");
    }
    for label in labels {
        println!("{}:", label);
        if let Some(usage) = report.usage.get(label) {
            println!("  Utilization: {}%", usage);
        }
        if let Some(mem) = report.memory.get(label) {
            println!(
                "  Memory: {} / {} MB ({:.1}%)",
                mem.used / 1024 / 1024,
                mem.total / 1024 / 1024,
                mem.used_percent
            );
        }
        if let Some(temp) = report.temperatures.get(label) {
            println!("  Temperature: {}°C", temp);
        }
    }
    for (label, err) in &report.errors {
        println!("! {}: {}", label, err);
    }
}

#[cfg(feature = "cli")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use gputel::Config;

    let cli = Cli::parse();

    env_logger::init();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    for (key, value) in &cli.overrides {
        config.set(key.clone(), value.clone());
    }

    let registry = gputel::registry::global();
    registry.run_startup(&config.vars())?;

    let interval = match cli.interval {
        Some(secs) => parse_interval(secs)?,
        None => config.update_interval(),
    };

    let mut printed = 0u64;
    loop {
        let report = collect(registry, cli.per_device);
        match cli.format {
            Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            Format::Text => print_report(registry, &report),
        }
        printed += 1;
        if cli.count != 0 && printed >= cli.count {
            break;
        }
        std::thread::sleep(interval);
    }

    registry.shutdown();
    Ok(())
}


#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Build with --features cli");
    std::process::exit(1);
}
