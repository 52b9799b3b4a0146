use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mtbo_storage::{EventStore, StoreConfig};
use mtbo_sync::{SyncConfig, SyncRunSummary};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "mtbo-cli")]
#[command(about = "MTBO event archive command-line interface")]
struct Cli {
    /// Overrides MTBO_INDEX_PATH.
    #[arg(long, global = true)]
    index_path: Option<PathBuf>,
    /// Overrides MTBO_DATA_ROOT.
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the configured scrape batch into the archive.
    Sync {
        /// Overrides MTBO_BATCH_PATH.
        #[arg(long)]
        batch: Option<PathBuf>,
        /// Comma-separated source ids; overrides MTBO_SOURCES.
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,
        /// Directory of hand-written event.yaml files; overrides MTBO_MANUAL_DIR.
        #[arg(long)]
        manual_dir: Option<PathBuf>,
        /// Marks the run as a refresh in the commit message; does not change what is fetched.
        #[arg(long)]
        refresh: bool,
    },
    /// Remove events (and their start list files) by id.
    Purge {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Print partition and source counters from the index.
    Stats,
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        let mut config = StoreConfig::from_env();
        if let Some(path) = &self.index_path {
            config.index_path = path.clone();
        }
        if let Some(root) = &self.data_root {
            config.data_root = root.clone();
        }
        config
    }
}

fn print_sync_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} sources={} fetched={} archived={} startlists={}",
        summary.run_id,
        summary.sources.join(","),
        summary.fetched_events,
        summary.archived_events,
        summary.startlists_written
    );
    if !summary.failed_sources.is_empty() {
        eprintln!("failed sources: {}", summary.failed_sources.join(","));
    }
    println!("{}", summary.commit_message);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let store_config = cli.store_config();

    match cli.command.unwrap_or(Commands::Sync {
        batch: None,
        sources: Vec::new(),
        manual_dir: None,
        refresh: false,
    }) {
        Commands::Sync {
            batch,
            sources,
            manual_dir,
            refresh,
        } => {
            let mut config = SyncConfig::from_env()?;
            config.store = store_config;
            if let Some(batch) = batch {
                config.batch_path = batch;
            }
            if !sources.is_empty() {
                config.sources = sources;
            }
            if manual_dir.is_some() {
                config.manual_dir = manual_dir;
            }
            config.refresh |= refresh;
            let summary = mtbo_sync::run_sync_once(config).await?;
            print_sync_summary(&summary);
        }
        Commands::Purge { ids } => {
            let store = EventStore::new(store_config);
            let removed = store.purge(&ids).await?;
            if removed.is_empty() {
                println!("no matching events; archive untouched");
            } else {
                println!("purged {}: {}", removed.len(), removed.join(","));
            }
        }
        Commands::Stats => {
            let store = EventStore::new(store_config);
            let index = store.load_index().await?;
            println!("schema_version={} last_scraped_at={}", index.schema_version, index.last_scraped_at);
            for (year, entry) in &index.partitions {
                println!("partition {year}: {} events, updated {}", entry.count, entry.last_updated_at);
            }
            for (source, entry) in &index.sources {
                println!("source {source}: {} events, updated {}", entry.count, entry.last_updated_at);
            }
        }
    }

    Ok(())
}
