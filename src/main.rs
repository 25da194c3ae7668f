use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use debfarm::runtime::DockerCli;
use debfarm::store::JsonStore;
use debfarm::{CatalogHandle, Config, Engine};

#[derive(Parser, Debug)]
#[command(author, version, about = "Package build farm controller", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "debfarm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch all package indices and reconcile the catalog
    Fetch,
    /// Build everything currently missing or stale
    Build,
    /// Pull the base image and commit a fresh build image
    RefreshImage,
    /// Print catalog status counts
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let store = JsonStore::new(config.store_path.clone());
    let catalog = CatalogHandle::spawn(Box::new(store));
    catalog.load().await?;

    let engine = Engine::new(config, catalog.clone(), Arc::new(DockerCli::new()));

    match cli.command {
        Command::Fetch => engine.run_fetch_cycle().await?,
        Command::Build => engine.run_build_cycle().await?,
        Command::RefreshImage => engine.refresh_base_image().await?,
        Command::Status => {
            let counts = catalog.counts().await?;
            let last_update = catalog.last_update().await?;
            println!("stale:    {}", counts.stale);
            println!("missing:  {}", counts.missing);
            println!("built:    {}", counts.built);
            println!("error:    {}", counts.error);
            println!("queued:   {}", counts.queued);
            println!("building: {}", counts.building);
            match last_update {
                Some(t) => println!("last update: {t}"),
                None => println!("last update: never"),
            }
        }
    }

    Ok(())
}
