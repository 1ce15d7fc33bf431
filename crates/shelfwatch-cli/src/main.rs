use anyhow::Result;
use clap::{Parser, Subcommand};
use shelfwatch_storage::ListingStore;
use shelfwatch_sync::{load_source_registry, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shelfwatch")]
#[command(about = "Shelfwatch: scrape listing sources and reconcile the storefront")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full pass over every enabled source.
    Run,
    /// Create the per-source tables for every registered source.
    InitDb,
    /// List the configured sources.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = shelfwatch_sync::run_once_from_env().await?;
            println!(
                "run complete: run_id={} sources={} failed={} listings={} new={} updated={} retired={}",
                summary.run_id,
                summary.sources_run,
                summary.sources_failed,
                summary.listings_seen,
                summary.new,
                summary.updated,
                summary.retired,
            );
            if let Some(storefront) = summary.storefront {
                println!(
                    "storefront: handles={} products={} changed={} deactivated={} submitted={}",
                    storefront.scraped_handles,
                    storefront.storefront_products,
                    storefront.status_changes,
                    storefront.missing_deactivations,
                    storefront.submitted,
                );
            }
        }
        Commands::InitDb => {
            let config = SyncConfig::from_env();
            let registry = load_source_registry(&config.sources_path).await?;
            if let Some(parent) = config.database_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let store = ListingStore::open(&config.database_path).await?;
            for source in &registry.sources {
                store.ensure_table(&source.source_id).await?;
            }
            println!(
                "initialized {} tables in {}",
                registry.sources.len(),
                config.database_path.display()
            );
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = load_source_registry(&config.sources_path).await?;
            for source in &registry.sources {
                println!(
                    "{} {} ({:?}){}{}",
                    if source.enabled { "[on] " } else { "[off]" },
                    source.source_id,
                    source.retirement,
                    if source.storefront_sync { " +storefront" } else { "" },
                    if source.upload_new_products { " +uploads" } else { "" },
                );
            }
        }
    }

    Ok(())
}
