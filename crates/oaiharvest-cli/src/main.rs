use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use oaiharvest_client::{RegistryReader, ReqwestEndpoint};
use oaiharvest_core::{
    EndpointProgress, Harvester, HarvesterConfig, ProgressStore, Provider, TracingHarvestReporter,
};

#[derive(Parser)]
#[command(name = "oaiharvest", version, about = "OAI-PMH harvest manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one harvest cycle
    Harvest {
        /// Configuration file
        #[arg(short, long, env = "OAIHARVEST_CONFIG", default_value = "config.toml")]
        config: PathBuf,

        /// Progress overview file (defaults to the one named in the configuration)
        #[arg(short, long, env = "OAIHARVEST_OVERVIEW")]
        overview: Option<PathBuf>,

        /// Only report which providers would be harvested
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Show the progress of every endpoint
    Status {
        /// Configuration file
        #[arg(short, long, env = "OAIHARVEST_CONFIG", default_value = "config.toml")]
        config: PathBuf,

        /// Progress overview file
        #[arg(short, long, env = "OAIHARVEST_OVERVIEW")]
        overview: Option<PathBuf>,
    },

    /// List the endpoints and sets of a registry catalog
    Registry {
        /// Catalog URL
        #[arg(short, long)]
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("oaiharvest=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest {
            config,
            overview,
            dry_run,
        } => cmd_harvest(&config, overview, dry_run).await?,
        Commands::Status { config, overview } => cmd_status(&config, overview)?,
        Commands::Registry { url } => cmd_registry(&url).await?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<HarvesterConfig> {
    HarvesterConfig::load(path)
        .with_context(|| format!("Failed to load configuration: {}", path.display()))
}

async fn cmd_harvest(config_path: &Path, overview: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let providers = collect_providers(&config).await;
    if providers.is_empty() {
        tracing::warn!("No providers configured");
    }

    let overview = overview.unwrap_or_else(|| config.overview_path());
    let store = config
        .progress_store(Some(&overview))
        .with_context(|| format!("Failed to open overview: {}", overview.display()))?;
    let endpoint = ReqwestEndpoint::new().context("Failed to create HTTP client")?;

    let sequences = config.action_sequences();
    for sequence in &sequences {
        tracing::info!(%sequence, "Action sequence");
    }

    let harvester = Harvester::new(endpoint, sequences, Arc::new(store), TracingHarvestReporter)
        .with_max_jobs(config.settings.max_jobs())
        .with_dry_run(dry_run || config.settings.dry_run);
    let summary = harvester.run(providers).await;

    println!(
        "Harvested {} providers, {} failed, {} skipped; {} records delivered",
        summary.harvested(),
        summary.failed(),
        summary.skipped(),
        summary.delivered()
    );
    Ok(())
}

/// Providers from the configuration file plus any imported from a registry.
async fn collect_providers(config: &HarvesterConfig) -> Vec<Provider> {
    let mut providers = config.providers();
    let Some(import) = &config.import else {
        return providers;
    };

    let imported = match RegistryReader::new() {
        Ok(reader) => reader.endpoint_sets(&import.registry).await,
        Err(e) => Err(e),
    };
    match imported {
        Ok(endpoints) => {
            let before = providers.len();
            providers.extend(import.providers(&endpoints, &config.settings));
            tracing::info!(
                registry = %import.registry,
                imported = providers.len() - before,
                "Imported providers"
            );
        }
        Err(e) => {
            tracing::error!(registry = %import.registry, error = %e, "Registry import failed");
        }
    }
    providers
}

fn cmd_status(config_path: &Path, overview: Option<PathBuf>) -> Result<()> {
    let overview = match overview {
        Some(path) => path,
        None => load_config(config_path)?.overview_path(),
    };
    if !overview.exists() {
        println!("No overview at {}", overview.display());
        return Ok(());
    }
    let store = ProgressStore::open(&overview)
        .with_context(|| format!("Failed to open overview: {}", overview.display()))?;

    let properties = store.properties();
    println!(
        "Cycle mode: {}, date: {}, scenario: {}\n",
        properties.mode, properties.date, properties.scenario
    );

    let endpoints = store.endpoints();
    for endpoint in &endpoints {
        println!("  {}", status_line(endpoint));
    }
    println!("\nTotal: {} endpoints", endpoints.len());
    Ok(())
}

fn status_line(progress: &EndpointProgress) -> String {
    let date = |t: Option<DateTime<Utc>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string())
    };
    let mut flags = Vec::new();
    if progress.blocked {
        flags.push("blocked");
    }
    if progress.retry {
        flags.push("retry");
    }
    if !progress.incremental {
        flags.push("full");
    }
    let group = if progress.group.is_empty() {
        String::new()
    } else {
        format!(" [{}]", progress.group)
    };
    format!(
        "{}{} {} harvested: {}, attempted: {}, count: {} (+{}){}",
        progress.uri,
        group,
        progress.scenario,
        date(progress.harvested),
        date(progress.attempted),
        progress.count,
        progress.increment,
        if flags.is_empty() {
            String::new()
        } else {
            format!(" ({})", flags.join(", "))
        }
    )
}

async fn cmd_registry(url: &str) -> Result<()> {
    let reader = RegistryReader::new().context("Failed to create HTTP client")?;
    let endpoints = reader
        .endpoint_sets(url)
        .await
        .with_context(|| format!("Failed to read registry: {url}"))?;

    for (endpoint, sets) in &endpoints {
        println!("{endpoint}");
        for set in sets {
            println!("  {} ({})", set.set_spec, set.set_type);
        }
    }
    println!("\nTotal: {} endpoints", endpoints.len());
    Ok(())
}
