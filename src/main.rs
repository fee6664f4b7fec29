use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use slow_tiles::catalog::earth_engine::{EarthEngineOptions, S2_SR_HARMONIZED};
use slow_tiles::catalog::earth_search::SENTINEL_2_C1_L2A;
use slow_tiles::catalog::{Catalog, EarthEngineCatalog, StacCatalog};
use slow_tiles::config::{self, AcquisitionConfig, Backend, Mode};
use slow_tiles::credentials::{CredentialsStore, PromptAuthenticator};
use slow_tiles::engine::Engine;
use slow_tiles::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Acquire Sentinel-2 tiles covering an area of interest.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the AOI and fetch or export every tile
    Run(RunArgs),
    /// Print the tile ids that intersect the AOI
    Resolve(RunArgs),
    /// Write a template acquisition file
    Template {
        #[arg(default_value = "inputs/acquisition.toml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Acquisition file
    #[arg(short, long, default_value = "inputs/acquisition.toml")]
    config: PathBuf,
    #[arg(long)]
    start_date: Option<String>,
    #[arg(long)]
    end_date: Option<String>,
    #[arg(long)]
    max_cloud_cover: Option<f64>,
    #[arg(long)]
    max_workers: Option<usize>,
    #[arg(long)]
    max_tiles: Option<usize>,
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    Fetch,
    Export,
}

impl RunArgs {
    fn load(&self) -> Result<AcquisitionConfig> {
        let mut config = AcquisitionConfig::read(&self.config)?;
        if let Some(start_date) = &self.start_date {
            config.start_date = start_date.clone();
        }
        if let Some(end_date) = &self.end_date {
            config.end_date = end_date.clone();
        }
        if let Some(max_cloud_cover) = self.max_cloud_cover {
            config.max_cloud_cover = max_cloud_cover;
        }
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if self.max_tiles.is_some() {
            config.max_tiles = self.max_tiles;
        }
        if let Some(mode) = self.mode {
            config.mode = match mode {
                ModeArg::Fetch => Mode::Fetch,
                ModeArg::Export => Mode::Export,
            };
        }
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = cache_dir.clone();
        }
        Ok(config)
    }
}

async fn build_catalog(
    config: &AcquisitionConfig,
    request_timeout: Duration,
) -> Result<Arc<dyn Catalog>> {
    let catalog: Arc<dyn Catalog> = match config.catalog.backend {
        Backend::EarthEngine => {
            let store = CredentialsStore::new(&config.catalog.credentials);
            let catalog = store
                .connect(&PromptAuthenticator, |credentials| async move {
                    let project = config
                        .catalog
                        .project
                        .clone()
                        .or_else(|| credentials.project.clone())
                        .ok_or_else(|| {
                            Error::Config(
                                "No Earth Engine project set in the config or the credentials file"
                                    .to_string(),
                            )
                        })?;
                    let options = EarthEngineOptions {
                        collection: config
                            .catalog
                            .collection
                            .clone()
                            .unwrap_or_else(|| S2_SR_HARMONIZED.to_string()),
                        high_volume: config.catalog.high_volume,
                        request_timeout,
                        ..EarthEngineOptions::new(project)
                    };
                    let catalog = EarthEngineCatalog::new(credentials, options)?;
                    catalog.verify_credentials().await?;
                    Ok(catalog)
                })
                .await?;
            Arc::new(catalog)
        }
        Backend::EarthSearch => {
            let collection = config
                .catalog
                .collection
                .as_deref()
                .unwrap_or(SENTINEL_2_C1_L2A);
            Arc::new(StacCatalog::new(collection, request_timeout)?)
        }
    };
    Ok(catalog)
}

async fn engine(args: &RunArgs) -> Result<Engine> {
    let config = args.load()?;
    let settings = config
        .validate()
        .with_context(|| format!("Invalid acquisition file {}", args.config.display()))?;
    let catalog = build_catalog(&config, settings.request_timeout).await?;
    Ok(Engine::new(settings, catalog))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match &cli.command {
        Command::Run(args) => {
            let report = engine(args).await?.run().await?;
            if report.failures() > 0 {
                info!(
                    failed = report.failures(),
                    tiles = report.tile_count(),
                    "Some tiles did not complete; rerun to retry them"
                );
            }
        }
        Command::Resolve(args) => {
            for tile_id in engine(args).await?.resolve().await? {
                println!("{tile_id}");
            }
        }
        Command::Template { output } => {
            let config = AcquisitionConfig::from_template(&config::template())?;
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            config.write(output)?;
            info!(path = %output.display(), "Wrote template acquisition file");
        }
    }

    Ok(())
}
