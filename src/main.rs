use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use serde::Serialize;

use sitewatch::app::orchestrator::{DiscoverySummary, Orchestrator, Outcome, SweepSummary};
use sitewatch::app::store::{LocalFsStore, MemoryStore, SiteRegistration, Store, register_site};
use sitewatch::change::ChangeDetector;
use sitewatch::cli::{Cli, Command, SiteCommand};
use sitewatch::config::WatchConfig;
use sitewatch::discovery::DiscoveryEngine;
use sitewatch::fetch::{FetchError, HttpFetcher, RetryPolicy, fetch_with_retry};
use sitewatch::model::{MonitoredSite, PageMetadata};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[derive(Debug, Serialize)]
struct FetchReport {
    url: String,
    success: bool,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<PageMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<FetchError>,
}

#[derive(Debug, Serialize)]
struct SiteAddReport {
    created: bool,
    site: MonitoredSite,
}

#[derive(Debug, Serialize)]
struct SweepReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    discovery: Option<Outcome<DiscoverySummary>>,
    content: Outcome<SweepSummary>,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

async fn try_main() -> anyhow::Result<()> {
    sitewatch::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let config = WatchConfig::load(cli.config.as_deref()).context("load config")?;

    match cli.command {
        Command::Fetch(args) => {
            let fetcher = HttpFetcher::new(config.http_fetcher_config());
            let base = config.retry_policy();
            let policy = match args.attempts {
                Some(attempts) => RetryPolicy::new(attempts, base.backoff_base),
                None => base,
            };

            let outcome = fetch_with_retry(&fetcher, &args.url, policy).await;
            fetcher.shutdown().await;

            let attempts = outcome.attempts;
            let report = match outcome.result {
                Ok(page) => FetchReport {
                    url: page.url,
                    success: true,
                    attempts,
                    content: Some(page.content),
                    metadata: Some(page.metadata),
                    error: None,
                },
                Err(err) => FetchReport {
                    url: args.url.clone(),
                    success: false,
                    attempts,
                    content: None,
                    metadata: None,
                    error: Some(err),
                },
            };
            print_json(&report)?;
            if !report.success {
                anyhow::bail!("fetch failed: {}", args.url);
            }
        }
        Command::Discover(args) => {
            let site = MonitoredSite::from_url(&args.url, None)?;
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            store.create_site(&site).await.context("store site")?;

            let fetcher = Arc::new(HttpFetcher::new(config.http_fetcher_config()));
            let engine = DiscoveryEngine::new(fetcher.clone(), store);
            let endpoints = engine.discover(&site).await.context("discover")?;
            fetcher.shutdown().await;
            print_json(&endpoints)?;
        }
        Command::Site {
            command: SiteCommand::Add(args),
        } => {
            let site = MonitoredSite::from_url(&args.url, args.domain.as_deref())?;
            let store = LocalFsStore::new(&config.data_dir);
            let registration = register_site(&store, site).await.context("register site")?;
            let created = matches!(registration, SiteRegistration::Created(_));
            print_json(&SiteAddReport {
                created,
                site: registration.into_site(),
            })?;
        }
        Command::Sweep(args) => {
            let store: Arc<dyn Store> = Arc::new(LocalFsStore::new(&config.data_dir));
            let fetcher = Arc::new(HttpFetcher::new(config.http_fetcher_config()));
            let orchestrator = Orchestrator::new(
                store,
                fetcher.clone(),
                config.build_analyzer()?,
                config.orchestrator_settings(),
            );

            let discovery = if args.skip_discovery {
                None
            } else {
                Some(
                    orchestrator
                        .run_discovery_sweep()
                        .await
                        .context("discovery sweep")?,
                )
            };
            let content = orchestrator
                .run_content_sweep()
                .await
                .context("content sweep")?;
            fetcher.shutdown().await;
            print_json(&SweepReport { discovery, content })?;
        }
        Command::Stats(args) => {
            let store: Arc<dyn Store> = Arc::new(LocalFsStore::new(&config.data_dir));
            let stats = ChangeDetector::new(store)
                .change_statistics(args.days)
                .await
                .context("change statistics")?;
            print_json(&stats)?;
        }
    }

    Ok(())
}
