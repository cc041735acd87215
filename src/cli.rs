use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// TOML configuration file (defaults apply when omitted).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch one URL with retries and print the outcome as JSON.
    Fetch(FetchArgs),
    /// Probe a site root for location endpoints without persisting anything.
    Discover(DiscoverArgs),
    Site {
        #[command(subcommand)]
        command: SiteCommand,
    },
    /// Run one discovery sweep and one content sweep against the data dir.
    Sweep(SweepArgs),
    /// Print change statistics for a trailing window.
    Stats(StatsArgs),
}

#[derive(Debug, Subcommand)]
pub enum SiteCommand {
    /// Register a site in the data dir.
    Add(SiteAddArgs),
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// URL to fetch (must be http/https).
    #[arg(long)]
    pub url: String,

    /// Attempts before giving up (overrides config).
    #[arg(long)]
    pub attempts: Option<u32>,
}

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    /// Site root URL (must be http/https).
    #[arg(long)]
    pub url: String,
}

#[derive(Debug, Args)]
pub struct SiteAddArgs {
    /// Site root URL (must be http/https).
    #[arg(long)]
    pub url: String,

    /// Domain label; defaults to the URL host.
    #[arg(long)]
    pub domain: Option<String>,
}

#[derive(Debug, Args)]
pub struct SweepArgs {
    /// Only run the content sweep.
    #[arg(long, default_value_t = false)]
    pub skip_discovery: bool,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    /// Window size in days.
    #[arg(long, default_value_t = 30)]
    pub days: u32,
}
