//! ArborDB inspection tool

use std::path::PathBuf;

use anyhow::Context;
use arbor_core::{Config, Database, VERSION};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbor", version, about = "Inspect and maintain ArborDB data files")]
struct Cli {
    /// Config file (TOML). Missing files fall back to defaults.
    #[arg(short, long, default_value = "arbor.toml")]
    config: PathBuf,

    /// Verbose logging and recovery diagnostics
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a data file with an empty root
    Init { path: Option<PathBuf> },
    /// Print layout and allocation statistics
    Info { path: Option<PathBuf> },
    /// Flush everything and persist the superblock
    Checkpoint { path: Option<PathBuf> },
}

fn get_env_filter(debug: bool) -> EnvFilter {
    if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else if debug {
        EnvFilter::new("arbor_core=debug")
    } else {
        EnvFilter::new("arbor_core=info")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(get_env_filter(cli.debug))
        .with_target(false)
        .compact()
        .init();

    let mut config = Config::load_from_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.debug {
        config.debug = true;
    }

    match cli.command {
        Command::Init { path } => {
            let config = with_path(config, path);
            let db = Database::open(config).await?;
            println!(
                "{} {}",
                "Initialized".bright_green(),
                db.path().display().to_string().bright_cyan()
            );
            db.close().await?;
        }
        Command::Info { path } => {
            let config = with_path(config, path);
            if !config.path.exists() {
                anyhow::bail!("{} does not exist", config.path.display());
            }
            let db = Database::open(config).await?;
            print_info(&db);
            db.close().await?;
        }
        Command::Checkpoint { path } => {
            let config = with_path(config, path);
            let db = Database::open(config).await?;
            db.wait_for_idle().await?;
            println!("{}", "Checkpoint complete".bright_green());
            db.close().await?;
        }
    }

    Ok(())
}

fn with_path(mut config: Config, path: Option<PathBuf>) -> Config {
    if let Some(path) = path {
        config.path = path;
    }
    config
}

fn print_info(db: &Database) {
    let stats = db.stats();

    println!("{} {}", "ArborDB".bright_blue().bold(), VERSION);
    println!("  File: {}", db.path().display().to_string().bright_cyan());
    match db.root() {
        Some(root) => println!("  Root: {}", root.to_string().bright_cyan()),
        None => println!("  Root: {}", "none".yellow()),
    }
    println!("Blocks:");
    println!("  Extent: {}", stats.allocator.extent.to_string().bright_cyan());
    println!("  Free: {}", stats.allocator.free_blocks.to_string().bright_cyan());
    println!(
        "  Heap pages: {} ({} free units)",
        stats.allocator.heap_pages.to_string().bright_cyan(),
        stats.allocator.free_heap_units
    );
    println!("Cache:");
    println!(
        "  Page cache: {} / {} blocks ({:.1} MB)",
        stats.pager.cached,
        stats.pager.capacity,
        db.config().cache_megabytes()
    );
    println!("  Structure cache limit: {}", stats.struct_cache_limit);
}
