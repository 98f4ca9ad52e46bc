use std::path::PathBuf;
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use common::utils::format_bytes;
use config::ConfigManager;
use hardware_profiler::HardwareDetector;
use model_manager::ModelRef;
use model_serve::ModelServe;

/// Weight materialization and device allocation for model serving
#[derive(Debug, Parser)]
#[command(name = "model-serve", version, about)]
struct Cli {
    /// Deploy config file (JSON, YAML or TOML); falls back to MODEL_SERVE_DEPLOY_CONFIG
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List discovered devices, configured overrides applied
    Devices,

    /// Inspect or empty the weight cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Materialize a configured model's weights and print their paths
    Fetch {
        /// Model as `id` or `id@version`
        model: String,
    },

    /// Report credentials the configured weight sources need but lack
    CheckSecrets,
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Print usage and hit counters as JSON
    Stats,
    /// List entries, least recently used first
    Ls,
    /// Remove every entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let manager = ConfigManager::load(cli.config.as_deref())?;
    let config = manager.config().clone();
    let _guard = logging::init_logging(&config.log)?;

    match cli.command {
        Command::Devices => {
            for device in HardwareDetector::new().discover(&config.devices) {
                println!(
                    "{:<10} {:<12} {:>12}  {}",
                    device.id,
                    device.kind,
                    format_bytes(device.total_memory_bytes),
                    device.name
                );
            }
        }
        Command::Cache { action } => {
            let serve = ModelServe::start(config).await?;
            let cache = serve.cache();
            match action {
                CacheAction::Stats => {
                    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
                }
                CacheAction::Ls => {
                    for entry in cache.entries() {
                        println!(
                            "{:>12}  {}  {}",
                            format_bytes(entry.size_bytes),
                            entry.last_accessed_at.format("%Y-%m-%d %H:%M:%S"),
                            entry.cache_path
                        );
                    }
                }
                CacheAction::Clear => {
                    let (bytes, count) = cache.clear().await?;
                    println!("removed {} entries ({})", count, format_bytes(bytes));
                }
            }
        }
        Command::Fetch { model } => {
            let model: ModelRef = model.parse()?;
            let serve = ModelServe::start(config).await?;
            for (slot, path) in serve.fetch_model(&model).await? {
                println!("{}\t{}", slot, path.display());
            }
        }
        Command::CheckSecrets => {
            let missing = config.missing_secrets();
            if !missing.is_empty() {
                bail!("missing secrets: {}", missing.join(", "));
            }
            println!("all required secrets are set");
        }
    }

    Ok(())
}
