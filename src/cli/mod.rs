pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::EngineConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging for the engine
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Options of a new crawl; unset values come from the configuration
#[derive(clap::Args, Debug, Clone)]
pub struct CrawlArgs {
    /// Base URL to start crawling from
    #[arg(required = true)]
    pub url: String,

    /// Deepest level to crawl (1-10)
    #[arg(short, long)]
    pub depth: Option<u32>,

    /// Maximum pages per level (1-50)
    #[arg(short = 'n', long)]
    pub max_urls: Option<usize>,

    /// Follow links to other hosts too
    #[arg(long)]
    pub all_domains: bool,

    /// Comma-separated substrings; matching links are skipped
    #[arg(short, long)]
    pub exclude: Option<String>,

    /// Minimum milliseconds between fetch starts
    #[arg(long)]
    pub delay: Option<u64>,

    /// Bypass cached results
    #[arg(long)]
    pub fresh: bool,

    /// Run under this job id instead of a derived one
    #[arg(long)]
    pub job_id: Option<String>,

    /// Queue the job for workers and return immediately
    #[arg(long)]
    pub detach: bool,

    /// Write the result JSON here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a site breadth-first from a base URL
    Crawl(CrawlArgs),

    /// Execute queued jobs until interrupted
    Worker {
        /// Jobs processed concurrently
        #[arg(short = 'j', long, default_value_t = 1)]
        concurrency: usize,
    },

    /// Show the status and latest progress of a job
    Status {
        #[arg(required = true)]
        job_id: String,
    },

    /// Print the result of a finished job
    Result {
        #[arg(required = true)]
        job_id: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Stream progress events of a job until it finishes
    Watch {
        #[arg(required = true)]
        job_id: String,
    },

    /// Stop a job at its next level boundary
    Cancel {
        #[arg(required = true)]
        job_id: String,
    },

    /// Show the configuration in effect
    Config {
        /// Print the full configuration, not just its location
        #[arg(short, long)]
        show: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Crawl(args) => {
            info!("Starting crawl on {}", args.url);
            commands::crawl(&config, args).await
        }
        Commands::Worker { concurrency } => {
            info!("Starting {} worker(s)", concurrency);
            commands::worker(&config, concurrency).await
        }
        Commands::Status { job_id } => commands::status(&config, &job_id).await,
        Commands::Result { job_id, output } => commands::result(&config, &job_id, output).await,
        Commands::Watch { job_id } => commands::watch(&config, &job_id).await,
        Commands::Cancel { job_id } => {
            info!("Cancelling job {}", job_id);
            commands::cancel(&config, &job_id).await
        }
        Commands::Config { show } => commands::show_config(&config, cli.config, show),
    }
}
