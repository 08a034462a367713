//! Army of 7 squad indexer
//!
//! Rebuilds an owner's squad tree from slot contract payouts, caches it in
//! SQLite, and prints or exports the result.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use squad_indexer::config::{Config, FileConfig, mask_api_key};
use squad_indexer::gateway::RequestGateway;
use squad_indexer::{
    Address, CacheService, CacheStore, SqliteStore, SquadIndex, TonIndexClient, constants, reports,
};

/// Load config file or exit with helpful message
fn load_config_file(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        anyhow::bail!(
            "Config file '{}' not found.\n\n\
            To get started:\n\
            1. Copy config.toml.example to {}\n\
            2. Set indexer.contract_address (and optionally an API key)\n\n\
            See config.toml.example for the required format.",
            path.display(),
            constants::CONFIG_FILENAME
        );
    }

    FileConfig::load(path)
}

#[derive(Parser, Debug)]
#[command(name = "squad-indexer")]
#[command(about = "Reconstruct Army of 7 squads from slot contract payouts")]
struct Args {
    /// Data directory for the cache database
    #[arg(short, long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Config file
    #[arg(short, long, default_value = constants::CONFIG_FILENAME, global = true)]
    config: PathBuf,

    /// Indexer base URL (overrides config)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch new payouts and print the owner's squad
    Hierarchy {
        /// Owner address (raw or friendly)
        owner: String,
    },
    /// List the direct members under an address
    Members {
        address: String,
        /// Rebuild even if the cached list is fresh
        #[arg(long)]
        force_refresh: bool,
    },
    /// Refresh, waiting a bounded time for new payouts
    Refresh {
        owner: String,
        /// How long to wait before falling back to the cached squad
        #[arg(long)]
        wait_ms: Option<u64>,
    },
    /// Keep the owner's squad fresh until interrupted
    Watch { owner: String },
    /// Export the owner's squad to CSV
    Export { owner: String, file: PathBuf },
    /// Show both encodings of an address
    Address { address: String },
    /// Show cache statistics
    Stats,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,squad_indexer=debug"
    } else {
        "warn,squad_indexer=info"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parse_address(input: &str) -> Result<Address> {
    input
        .parse()
        .with_context(|| format!("'{}' is not a valid address", input))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Command::Address { address } = &args.command {
        return print_address(address);
    }

    // Open cache database (in data directory)
    std::fs::create_dir_all(&args.data_dir)?;
    let store = Arc::new(SqliteStore::open(&args.data_dir.join(constants::CACHE_FILENAME)).await?);
    let cache = CacheService::open(store.clone() as Arc<dyn CacheStore>).await?;

    if let Command::Stats = &args.command {
        let (entries, bytes) = store.size().await?;
        println!("Cache: {}", cache.stats());
        println!("Store: {} entries, {} KiB", entries, bytes / 1024);
        return Ok(());
    }

    let file_config = load_config_file(&args.config)?;
    let mut config = Config::from_file(&file_config, args.base_url.clone())?;
    if let Command::Refresh {
        wait_ms: Some(wait_ms),
        ..
    } = &args.command
    {
        config.timing.update_wait = Duration::from_millis(*wait_ms);
    }

    info!(
        base_url = %config.base_url,
        api_key = %config.api_key.as_deref().map(mask_api_key).unwrap_or_else(|| "none".to_string()),
        contract = %config.contract,
        "configuration loaded"
    );

    let gateway = RequestGateway::new(
        &config.base_url,
        config.api_key.clone(),
        config.timing.request_delay,
    );
    let api = TonIndexClient::new(gateway, config.retry.clone()).into_api();
    let index = SquadIndex::new(api, cache, &config);

    handle_command(args.command, &index).await
}

async fn handle_command(command: Command, index: &SquadIndex) -> Result<()> {
    match command {
        Command::Hierarchy { owner } => {
            let owner = parse_address(&owner)?;
            let hierarchy = index.build_complete_hierarchy(&owner).await;
            reports::print_hierarchy(&hierarchy);
        }

        Command::Members {
            address,
            force_refresh,
        } => {
            let address = parse_address(&address)?;
            let members = index.get_squad_members(&address, force_refresh).await;
            if members.is_empty() {
                println!("No members under {}", address.to_friendly(false, false));
            } else {
                for member in &members {
                    println!("{}  {}", member.to_friendly(false, false), member);
                }
                println!("\n{} member(s)", members.len());
            }
        }

        Command::Refresh { owner, .. } => {
            let owner = parse_address(&owner)?;
            let hierarchy = index.fetch_payouts_and_update_hierarchy(&owner).await;
            reports::print_hierarchy(&hierarchy);

            // Let a refresh that outlived the wait finish and persist before exiting
            for result in index.finish_background().await {
                println!(
                    "\nBackground refresh finished: {} new payout(s), {} members{}",
                    result.new_messages,
                    result.hierarchy.total_members,
                    if result.complete { "" } else { " (incomplete)" }
                );
            }
        }

        Command::Watch { owner } => {
            let owner = parse_address(&owner)?;
            println!("Watching {} (Ctrl-C to stop)", owner.to_friendly(false, false));

            let shutdown = async {
                let _ = tokio::signal::ctrl_c().await;
            };
            index
                .watch(&owner, shutdown, |result| {
                    println!(
                        "[{}] {} new payout(s), {} members{}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        result.new_messages,
                        result.hierarchy.total_members,
                        if result.complete { "" } else { " (incomplete)" }
                    );
                })
                .await;
        }

        Command::Export { owner, file } => {
            let owner = parse_address(&owner)?;
            let hierarchy = index.get_or_refresh(&owner).await;
            reports::export_hierarchy_csv(&file, &hierarchy)?;
            println!(
                "Wrote {} member(s) to {}",
                hierarchy.total_members,
                file.display()
            );
        }

        Command::Address { .. } | Command::Stats => {
            unreachable!("address and stats are handled before the index is built")
        }
    }

    Ok(())
}

fn print_address(input: &str) -> Result<()> {
    let address = parse_address(input)?;
    println!("Raw:                      {}", address);
    println!("Bounceable:               {}", address.to_friendly(true, false));
    println!("Non-bounceable:           {}", address.to_friendly(false, false));
    println!("Non-bounceable (testnet): {}", address.to_friendly(false, true));
    Ok(())
}
