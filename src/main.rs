//! isodb - walks through the read anomalies each isolation level allows

use anyhow::{Context, Result};
use clap::Parser as ClapParser;
use isodb::{Engine, EngineConfig, IsolationLevel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod scenarios;

/// Demonstrates dirty reads, non-repeatable reads and phantoms per isolation level
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Only run this level (e.g. "read-committed", "serializable")
    #[arg(short, long)]
    level: Option<IsolationLevel>,

    /// Row lock wait timeout in milliseconds; 0 fails contended writes at once
    #[arg(long)]
    lock_timeout_ms: Option<u64>,

    /// JSON engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = args.lock_timeout_ms {
        config = config.with_lock_wait_timeout(Duration::from_millis(ms));
    }
    log::info!("engine config: {:?}", config);

    let engine = Arc::new(Engine::new(config));
    scenarios::seed(&engine).context("Failed to seed accounts")?;

    let levels = match args.level {
        Some(level) => vec![level],
        None => IsolationLevel::ALL.to_vec(),
    };

    for level in levels {
        println!("=== {} ===", level);
        scenarios::run(&engine, level)
            .await
            .with_context(|| format!("{} demonstration failed", level))?;
        scenarios::reset(&engine).context("Failed to reset accounts")?;
        println!();
    }

    let stats = engine.stats();
    log::info!(
        "done at {}: {} rows, {} versions",
        stats.current_timestamp,
        stats.version_chains,
        stats.total_versions
    );
    Ok(())
}
