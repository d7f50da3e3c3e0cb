//! pageperf: Web Vitals telemetry endpoint and operator CLI.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use pageperf::cache::{CacheStorage, HttpNetwork, MemoryCacheStorage, ServiceWorker};
use pageperf::{canonical_passes, classify, score_with, DeviceTier, EnvironmentSignals, VitalsRecord};
use pageperf_server::{load_optimizer_config, resolve_listen_addr, serve, AppState};

#[derive(Parser)]
#[command(
    name = "pageperf",
    about = "Web Vitals telemetry endpoint and page optimization tooling",
    version
)]
struct Cli {
    /// Path to an optimizer config JSON file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the telemetry endpoint (default).
    Serve {
        /// Listen address (host:port). Also reads PAGEPERF_ADDR.
        #[arg(long)]
        addr: Option<String>,
    },

    /// Score a vitals record JSON file.
    Score {
        file: PathBuf,

        /// Device tier the record came from (mobile, tablet, desktop).
        #[arg(long, default_value = "mobile")]
        device: String,
    },

    /// Classify environment signals from a JSON file and list the passes that apply.
    Classify { file: PathBuf },

    /// Print the canonical pass registry.
    Passes,

    /// Dry-run a service worker install and activation against a live origin.
    Precache {
        /// Site origin, e.g. https://example.com
        #[arg(long)]
        origin: String,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   pageperf completions bash > ~/.local/share/bash-completion/completions/pageperf
    ///   pageperf completions zsh > ~/.zfunc/_pageperf
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_optimizer_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve { addr: None }) {
        Commands::Serve { addr } => {
            let addr = resolve_listen_addr(addr.as_deref());
            let state = Arc::new(AppState::new(config));
            serve(&addr, state).await?;
        }

        Commands::Score { file, device } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let record: VitalsRecord = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;
            let tier: DeviceTier = serde_json::from_value(serde_json::Value::String(device.clone()))
                .with_context(|| format!("unknown device tier '{device}'"))?;

            let result = score_with(&record, &config.thresholds_for(tier));
            let out = serde_json::json!({
                "score": result.value,
                "issues": result.issues(),
                "deductions": result.deductions,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Classify { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let signals: EnvironmentSignals = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;

            let ctx = classify(&signals);
            let registry = canonical_passes(&config.passes)?;
            let applicable: Vec<&str> = registry
                .passes()
                .iter()
                .filter(|pass| pass.applies_when(&ctx))
                .map(|pass| pass.id())
                .collect();

            let out = serde_json::json!({
                "context": ctx,
                "passes": applicable,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }

        Commands::Passes => {
            let registry = canonical_passes(&config.passes)?;
            for pass in registry.passes() {
                let after = pass.dependencies().join(", ");
                if after.is_empty() {
                    println!("{:<20} {}", pass.id(), pass.weight());
                } else {
                    println!("{:<20} {:<6} after {after}", pass.id(), pass.weight());
                }
            }
        }

        Commands::Precache { origin } => {
            let manifest = config.cache.manifest();
            println!("Manifest: {} ({} urls)", manifest.cache_name, manifest.urls.len());

            let storage = Arc::new(MemoryCacheStorage::new());
            let network = Arc::new(HttpNetwork::new(Duration::from_secs(10))?);
            let mut worker = ServiceWorker::new(manifest, &origin, storage.clone(), network)?;

            worker.install().await?;
            worker.activate().await?;

            for key in storage.entries(worker.cache_name()).await {
                println!("  {key}");
            }
            println!("State: {}", worker.state());
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pageperf", &mut std::io::stdout());
        }
    }

    Ok(())
}
