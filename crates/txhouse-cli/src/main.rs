//! txhouse CLI (txctl)
//!
//! Command-line tool for loading transactions into txhouse storage and querying them.
//!
//! ## Quick Start
//!
//! ```bash
//! export TXHOUSE_DATA_DIR=./data
//!
//! # (Re)create the transactions table
//! txctl schema reset
//!
//! # Load JSON-lines, one transaction per line
//! txctl load transactions.jsonl --queue-partitions 4
//!
//! # Top category by maximum amount per state
//! txctl query top-category
//!
//! # Introspection and maintenance
//! txctl partitions
//! txctl count --partition 201901
//! txctl compact
//! txctl drop 201901
//! ```
//!
//! ## Configuration
//!
//! - `TXHOUSE_CONFIG`: optional TOML config file (see `config.rs`)
//! - `TXHOUSE_DATA_DIR`: data directory, overrides the config file
//! - `RUST_LOG`: log filter (default: info), logs go to stderr

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "txctl")]
#[command(about = "txhouse command-line tool", long_about = None)]
struct Cli {
    /// Data directory
    #[arg(short, long, env = "TXHOUSE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long, env = "TXHOUSE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Table definition commands
    Schema {
        #[command(subcommand)]
        command: commands::schema::SchemaCommands,
    },
    /// Load JSON-lines transactions through the ingestion pipeline
    Load(commands::load::LoadArgs),
    /// Analytical queries
    Query {
        #[command(subcommand)]
        command: commands::query::QueryCommands,
    },
    /// Count rows, optionally for a partition range
    Count(commands::admin::PartitionArgs),
    /// List partitions with run, row and byte counts
    Partitions,
    /// Compact one partition, or every partition with more than one run
    Compact {
        /// Partition key (YYYYMM)
        #[arg(short, long)]
        partition: Option<u32>,
    },
    /// Drop a partition and all its runs
    Drop {
        /// Partition key (YYYYMM)
        partition: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?.with_data_dir(cli.data_dir);
    let format = cli.format;

    match cli.command {
        Commands::Schema { command } => commands::schema::handle(command, &config, format).await?,
        Commands::Load(args) => commands::load::handle(args, &config, format).await?,
        Commands::Query { command } => commands::query::handle(command, &config, format).await?,
        Commands::Count(args) => commands::admin::count(args, &config, format).await?,
        Commands::Partitions => commands::admin::partitions(&config, format).await?,
        Commands::Compact { partition } => {
            commands::admin::compact(partition, &config, format).await?
        }
        Commands::Drop { partition } => commands::admin::drop(partition, &config, format).await?,
    }

    Ok(())
}
