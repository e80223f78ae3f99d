//! `skjold`: operator CLI for the result cache.
//!
//! Opens the cache backend named in the resolved configuration and
//! inspects or maintains it. Does not run generations.
//!
//! Build: `cargo build --bin skjold --features cli`

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use skjold::cache::CacheStore;
use skjold::config::Config;

// ── CLI ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "skjold", version = skjold::PKG_VERSION, about = "inspect and maintain the skjold cache")]
struct Args {
    /// path to config.toml
    #[arg(short, long, env = "SKJOLD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// cache maintenance
    #[command(subcommand)]
    Cache(CacheCommand),
    /// print the resolved configuration (secrets omitted)
    Config,
    /// print version and build metadata
    Version {
        /// emit build metadata as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// show backend and entry count
    Stats,
    /// delete every entry
    Clear,
    /// delete expired and unreadable entries
    Purge,
    /// print the cached value for a logical key
    Get {
        /// logical cache key (hashed before lookup)
        key: String,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

// ── commands ────────────────────────────────────────────────────────

fn open_store(config: &Config) -> Result<CacheStore<serde_json::Value>, Box<dyn std::error::Error>> {
    match config.cache.open_backend()? {
        Some(backend) => Ok(CacheStore::new(backend, config.cache.ttl())),
        None => Err("caching is disabled (cache.backend = \"none\")".into()),
    }
}

async fn cache_command(config: &Config, command: CacheCommand) -> CliResult {
    let store = open_store(config)?;
    match command {
        CacheCommand::Stats => {
            let stats = store.stats().await;
            println!("backend: {}", stats.backend);
            println!("entries: {}", stats.entries);
            println!("ttl:     {}h", config.cache.ttl_hours);
        }
        CacheCommand::Clear => {
            let before = store.stats().await.entries;
            store.clear().await;
            let after = store.stats().await.entries;
            println!("removed {} entr(ies).", before.saturating_sub(after));
        }
        CacheCommand::Purge => {
            let removed = store.purge_expired().await;
            println!("purged {removed} expired entr(ies).");
        }
        CacheCommand::Get { key } => match store.get(&key).await {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => {
                eprintln!("no live entry for key '{key}'.");
                process::exit(1);
            }
        },
    }
    Ok(())
}

fn print_version(json: bool) -> CliResult {
    let info = skjold::BuildInfo::current();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("skjold {info}");
        println!("built:  {}", info.built_at);
        println!("target: {}{}", info.target, if info.debug { " (debug)" } else { "" });
    }
    Ok(())
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let result: CliResult = match args.command {
        Command::Version { json } => print_version(json),
        Command::Config => Config::load(args.config.as_deref())
            .and_then(|config| config.to_toml())
            .map(|rendered| print!("{rendered}"))
            .map_err(Into::into),
        Command::Cache(command) => match Config::load(args.config.as_deref()) {
            Ok(config) => cache_command(&config, command).await,
            Err(e) => Err(e.into()),
        },
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}
