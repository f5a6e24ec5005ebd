mod listener;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docket_core::config::Config;
use docket_core::engine::Tracker;
use docket_core::fetcher::HttpFetcher;

/// Track the evolution of legal documents published by online services.
#[derive(Parser, Debug)]
#[command(name = "docket", version, about, arg_required_else_help = true)]
struct Cli {
    /// Configuration file
    #[arg(
        short = 'C',
        long = "config",
        default_value = "docket.toml",
        global = true
    )]
    config: PathBuf,

    /// Increase stderr verbosity (`-v` = debug, `-vv` = trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch every declared document, archive snapshots, and record versions
    Track {
        /// Service ids to track; all declared services when omitted
        services: Vec<String>,
    },
    /// Re-derive versions from the latest archived snapshots, without fetching
    Refilter {
        /// Service ids to refilter; all declared services when omitted
        services: Vec<String>,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("docket={default_level},docket_core={default_level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Config::load(&cli.config)?;
    let fetcher = HttpFetcher::new()?;

    let mut tracker = Tracker::new(config, fetcher)?;
    tracker.init()?;
    tracker.attach(Arc::new(listener::LogListener));

    match cli.command {
        Commands::Track { services } => tracker.track_changes(&services).await?,
        Commands::Refilter { services } => tracker.refilter_and_record(&services).await?,
    }

    Ok(())
}
