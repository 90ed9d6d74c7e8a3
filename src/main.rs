use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use skyboard::config::EngineConfig;
use skyboard::Engine;
use skyboard_core::{CategoryKey, SourceCatalog, UnitSystem};
use std::path::PathBuf;
use std::time::Duration;

/// skyboard - A live environmental measurements dashboard engine
#[derive(Parser, Debug, Clone)]
#[command(name = "skyboard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug verbosity level (0=quiet, 1=info, 2=debug, 3=trace)
    #[arg(short = 'd', long = "debug", value_name = "LEVEL", default_value = "0")]
    debug: u8,

    /// Display units, overriding the configuration (metric or imperial)
    #[arg(short = 'u', long = "units", value_name = "SYSTEM")]
    units: Option<UnitSystem>,

    /// List loaded sources and exit
    #[arg(long = "list-sources")]
    list_sources: bool,

    /// List every known key and exit
    #[arg(long = "list-keys")]
    list_keys: bool,

    /// Keys to print as they change (all keys when none given)
    #[arg(short = 'w', long = "watch", value_name = "KEY", num_args = 1..)]
    watch: Vec<String>,

    /// Stop after this many seconds
    #[arg(long = "duration", value_name = "SECS")]
    duration: Option<u64>,
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) if path.exists() => EngineConfig::load_from_path(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        Some(path) => {
            warn!("{} does not exist, using defaults", path.display());
            EngineConfig::default()
        }
        None => EngineConfig::load().unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {:#}", e);
            EngineConfig::default()
        }),
    };
    if let Some(units) = cli.units {
        config.units = units;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Level 0 (default): warn only
    // Level 1: info
    // Level 2: debug
    // Level 3+: trace
    let log_level = match cli.debug {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // Allow RUST_LOG to override CLI setting
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Starting skyboard v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    let watch = cli
        .watch
        .iter()
        .map(|key| CategoryKey::parse(key))
        .collect::<Result<Vec<_>, _>>()?;

    let mut catalog = SourceCatalog::new();
    skyboard_sources::register_all(&mut catalog);
    let engine = Engine::new(&config, &catalog, tokio::runtime::Handle::current());

    for (name, error) in &engine.report().skipped {
        warn!("Source '{}' not loaded: {}", name, error);
    }

    if cli.list_sources {
        for source in engine.sources() {
            println!(
                "{:<12} {:<10} {:>3} keys  {}",
                source.name,
                format!("{:?}", source.state),
                source.keys,
                source.description
            );
        }
        return Ok(());
    }

    if cli.list_keys {
        for (key, title) in engine.keys() {
            println!("{:<48} {}", key.to_string(), title);
        }
        return Ok(());
    }

    engine.start();
    engine
        .watch(watch, cli.duration.map(Duration::from_secs))
        .await?;
    engine.stop();

    info!("skyboard stopped");
    Ok(())
}
