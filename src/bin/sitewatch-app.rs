use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

use sitewatch::app::orchestrator::Orchestrator;
use sitewatch::app::routes::{AppState, router};
use sitewatch::app::scheduler;
use sitewatch::app::store::{LocalFsStore, SiteRegistration, Store, register_site};
use sitewatch::config::WatchConfig;
use sitewatch::fetch::HttpFetcher;
use sitewatch::model::MonitoredSite;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// TOML configuration file (defaults apply when omitted).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serve the HTTP API without the periodic discovery/content/health loops.
    #[arg(long, default_value_t = false)]
    no_schedule: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    sitewatch::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting sitewatch-app");

    let config = WatchConfig::load(args.config.as_deref()).context("load config")?;
    tracing::info!(data_dir = %config.data_dir.display(), "using local filesystem store");

    let store: Arc<dyn Store> = Arc::new(LocalFsStore::new(config.data_dir.clone()));
    for entry in &config.sites {
        let site = MonitoredSite::from_url(&entry.url, entry.domain.as_deref())
            .with_context(|| format!("configured site: {}", entry.url))?;
        if let SiteRegistration::Existing(site) = register_site(store.as_ref(), site).await? {
            tracing::debug!(site_id = %site.id, url = %site.url, "configured site already registered");
        }
    }

    let fetcher = Arc::new(HttpFetcher::new(config.http_fetcher_config()));
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        fetcher.clone(),
        config.build_analyzer()?,
        config.orchestrator_settings(),
    ));

    let scheduler = if args.no_schedule {
        tracing::info!("periodic scheduling disabled");
        None
    } else {
        Some(scheduler::spawn(
            Arc::clone(&orchestrator),
            config.schedule_intervals(),
        ))
    };

    let app = router(AppState { orchestrator });

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    fetcher.shutdown().await;
    tracing::info!("sitewatch-app stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
