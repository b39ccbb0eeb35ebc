//! Coffer CLI - inspect and migrate coffer stores

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "coffer")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a store's identity, schema version and history position
    Status {
        /// Path to the store file
        store: PathBuf,

        /// Schema directory, to report pending migrations
        #[arg(short, long)]
        schemas: Option<PathBuf>,
    },

    /// Print the store's transaction log
    History {
        /// Path to the store file
        store: PathBuf,

        /// Only transactions after this token
        #[arg(short, long)]
        after: Option<u64>,

        /// Print one JSON object per transaction
        #[arg(long)]
        json: bool,
    },

    /// Bring a store up to the latest schema version
    Migrate {
        /// Path to the store file
        store: PathBuf,

        /// Directory holding *.schema.json and *.mapping.json files
        #[arg(short, long, default_value = "./schemas")]
        schemas: PathBuf,

        /// Show the steps that would run without applying them
        #[arg(long)]
        dry_run: bool,

        /// Rewrite the store in place instead of copy and swap
        #[arg(long)]
        in_place: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Status { store, schemas } => {
            commands::status::execute(store, schemas)?;
        }
        Commands::History { store, after, json } => {
            commands::history::execute(store, after, json)?;
        }
        Commands::Migrate {
            store,
            schemas,
            dry_run,
            in_place,
        } => {
            commands::migrate::execute(store, schemas, dry_run, in_place)?;
        }
    }

    Ok(())
}
