//! Command-line utility for inspecting a courier job store
//!
//! Reads the store named in the queue configuration and can:
//! - List job records, optionally by status
//! - Show counts by status and lane
//! - Purge permanently failed records

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use courier::{commands, config};
use courier_common::{JobStatus, logging};

/// Command-line utility for inspecting a courier job store
#[derive(Parser, Debug)]
#[command(name = "courierctl")]
#[command(about = "Inspect and maintain a courier job store", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file, instead of searching the usual locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List job records in insertion order
    List {
        /// Filter by status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
    /// Show job counts by status and lane
    Stats,
    /// Delete all permanently failed job records
    PurgeFailed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StatusFilter {
    Ready,
    Executing,
    Failed,
}

impl From<StatusFilter> for JobStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Ready => Self::Ready,
            StatusFilter::Executing => Self::Executing,
            StatusFilter::Failed => Self::PermanentlyFailed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::find_config_file()?,
    };
    let config = config::load(&config_path)?;
    let store = config.store.into_store().await?;

    match cli.command {
        Commands::List { status } => {
            let records = commands::list(store.as_ref(), status.map(JobStatus::from)).await?;
            println!("{}", commands::render_list(&records));
        }
        Commands::Stats => {
            println!("{}", commands::stats(store.as_ref()).await?);
        }
        Commands::PurgeFailed => {
            let purged = commands::purge_failed(store.as_ref()).await?;
            println!("Purged {purged} failed job(s)");
        }
    }

    Ok(())
}
