use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::analysis::{AnalysisRequest, Analyzer};
use crate::app::single_flight::SingleFlight;
use crate::app::store::Store;
use crate::change::{ChangeDetection, ChangeDetector};
use crate::discovery::DiscoveryEngine;
use crate::fetch::{Fetcher, RetryPolicy, fetch_with_retry};
use crate::model::{
    ChangeType, Endpoint, EndpointUpdate, FetchJob, FetchJobStatus, LifecycleStatus,
    MonitoredSite,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub courtesy_delay: Duration,
    pub analysis_timeout: Duration,
    pub max_discovery_failures: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            courtesy_delay: Duration::from_secs(2),
            analysis_timeout: Duration::from_secs(30),
            max_discovery_failures: 3,
        }
    }
}

/// Result of a guarded operation. A busy guard is a normal outcome, not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome<T> {
    Completed(T),
    AlreadyRunning,
}

impl<T> Outcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::AlreadyRunning => None,
        }
    }

    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub endpoint_id: String,
    pub url: String,
    pub fetch_job_id: String,
    pub job_status: FetchJobStatus,
    pub attempts: u32,
    pub has_changes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub analyzed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub endpoints_total: usize,
    pub fetched: usize,
    pub failed: usize,
    pub changed: usize,
    pub analyzed: usize,
    pub endpoints: Vec<EndpointReport>,
}

impl SweepSummary {
    fn new(endpoints_total: usize) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            endpoints_total,
            fetched: 0,
            failed: 0,
            changed: 0,
            analyzed: 0,
            endpoints: Vec::with_capacity(endpoints_total),
        }
    }

    fn record(&mut self, report: EndpointReport) {
        match report.job_status {
            FetchJobStatus::Completed => self.fetched += 1,
            _ => self.failed += 1,
        }
        if report.has_changes {
            self.changed += 1;
        }
        if report.analyzed {
            self.analyzed += 1;
        }
        self.endpoints.push(report);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteDiscoveryReport {
    pub site_id: String,
    pub site_status: LifecycleStatus,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoverySummary {
    pub sites_checked: usize,
    pub sites_skipped: usize,
    pub endpoints_discovered: usize,
    pub sites: Vec<SiteDiscoveryReport>,
}

/// Ties discovery, fetching, change detection and analysis together.
///
/// Content work (full sweeps and single-endpoint fetches) shares one
/// single-flight guard; discovery has its own.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn Fetcher>,
    analyzer: Arc<dyn Analyzer>,
    discovery: DiscoveryEngine,
    detector: ChangeDetector,
    content_guard: SingleFlight,
    discovery_guard: SingleFlight,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn Fetcher>,
        analyzer: Arc<dyn Analyzer>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            discovery: DiscoveryEngine::new(Arc::clone(&fetcher), Arc::clone(&store)),
            detector: ChangeDetector::new(Arc::clone(&store)),
            store,
            fetcher,
            analyzer,
            content_guard: SingleFlight::new(),
            discovery_guard: SingleFlight::new(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn detector(&self) -> &ChangeDetector {
        &self.detector
    }

    pub fn is_content_sweep_running(&self) -> bool {
        self.content_guard.is_active()
    }

    pub fn is_discovery_running(&self) -> bool {
        self.discovery_guard.is_active()
    }

    /// Fetches every active endpoint in turn. Endpoint failures are recorded
    /// on their fetch job; only store failures abort the sweep.
    pub async fn run_content_sweep(&self) -> anyhow::Result<Outcome<SweepSummary>> {
        let Some(_permit) = self.content_guard.try_enter() else {
            tracing::warn!("content sweep already running; trigger ignored");
            return Ok(Outcome::AlreadyRunning);
        };

        let endpoints = self
            .store
            .get_active_endpoints()
            .await
            .context("load active endpoints")?;
        tracing::info!(endpoints = endpoints.len(), "content sweep started");

        let mut summary = SweepSummary::new(endpoints.len());
        for (index, endpoint) in endpoints.iter().enumerate() {
            if index > 0 && !self.settings.courtesy_delay.is_zero() {
                tokio::time::sleep(self.settings.courtesy_delay).await;
            }
            let report = self.process_endpoint(endpoint).await?;
            summary.record(report);
        }
        summary.finished_at = Utc::now();

        tracing::info!(
            fetched = summary.fetched,
            failed = summary.failed,
            changed = summary.changed,
            "content sweep finished"
        );
        Ok(Outcome::Completed(summary))
    }

    /// Fetches one endpoint out-of-band under the content guard. `None` when
    /// the endpoint does not exist.
    pub async fn trigger_endpoint_fetch(
        &self,
        endpoint_id: &str,
    ) -> anyhow::Result<Option<Outcome<EndpointReport>>> {
        let Some(endpoint) = self
            .store
            .get_endpoint(endpoint_id)
            .await
            .context("load endpoint")?
        else {
            return Ok(None);
        };

        let Some(_permit) = self.content_guard.try_enter() else {
            tracing::warn!(endpoint_id, "content sweep already running; fetch trigger ignored");
            return Ok(Some(Outcome::AlreadyRunning));
        };

        let report = self.process_endpoint(&endpoint).await?;
        Ok(Some(Outcome::Completed(report)))
    }

    /// Discovers endpoints for every active site that has none.
    pub async fn run_discovery_sweep(&self) -> anyhow::Result<Outcome<DiscoverySummary>> {
        let Some(_permit) = self.discovery_guard.try_enter() else {
            tracing::warn!("discovery sweep already running; trigger ignored");
            return Ok(Outcome::AlreadyRunning);
        };

        let sites = self
            .store
            .get_active_sites()
            .await
            .context("load active sites")?;
        tracing::info!(sites = sites.len(), "discovery sweep started");

        let mut summary = DiscoverySummary::default();
        for site in sites {
            let active = self
                .store
                .get_endpoints_for_site(&site.id)
                .await
                .with_context(|| format!("list endpoints for site {}", site.id))?
                .iter()
                .filter(|e| e.is_active())
                .count();
            if active > 0 {
                tracing::debug!(site_id = %site.id, active, "site already has endpoints");
                summary.sites_skipped += 1;
                continue;
            }

            let endpoints = self.discovery.discover(&site).await?;
            let site = self.record_discovery(site, endpoints.len()).await?;
            summary.sites_checked += 1;
            summary.endpoints_discovered += endpoints.len();
            summary.sites.push(SiteDiscoveryReport {
                site_id: site.id,
                site_status: site.status,
                endpoints,
            });
        }

        tracing::info!(
            checked = summary.sites_checked,
            skipped = summary.sites_skipped,
            discovered = summary.endpoints_discovered,
            "discovery sweep finished"
        );
        Ok(Outcome::Completed(summary))
    }

    /// Retires a site's endpoints and rediscovers them. `None` when the site
    /// does not exist.
    pub async fn trigger_site_discovery(
        &self,
        site_id: &str,
    ) -> anyhow::Result<Option<Outcome<SiteDiscoveryReport>>> {
        let Some(site) = self.store.get_site(site_id).await.context("load site")? else {
            return Ok(None);
        };

        let Some(_permit) = self.discovery_guard.try_enter() else {
            tracing::warn!(site_id, "discovery already running; trigger ignored");
            return Ok(Some(Outcome::AlreadyRunning));
        };

        let endpoints = self.discovery.refresh(&site).await?;
        let site = self.record_discovery(site, endpoints.len()).await?;
        Ok(Some(Outcome::Completed(SiteDiscoveryReport {
            site_id: site.id,
            site_status: site.status,
            endpoints,
        })))
    }

    /// Returns whether the page runtime is healthy; an unhealthy runtime is
    /// torn down so the next fetch starts a fresh one.
    pub async fn run_health_check(&self) -> bool {
        if self.fetcher.health_check().await {
            tracing::debug!("page runtime healthy");
            return true;
        }
        tracing::warn!("page runtime health check failed; resetting runtime");
        self.fetcher.reset().await;
        false
    }

    async fn record_discovery(
        &self,
        mut site: MonitoredSite,
        found: usize,
    ) -> anyhow::Result<MonitoredSite> {
        let now = Utc::now();
        site.last_checked_at = Some(now);
        site.updated_at = now;

        if found == 0 {
            site.consecutive_failures = site.consecutive_failures.saturating_add(1);
            if site.is_active() && site.consecutive_failures >= self.settings.max_discovery_failures
            {
                site.status = LifecycleStatus::Failed;
                tracing::warn!(
                    site_id = %site.id,
                    failures = site.consecutive_failures,
                    "site marked failed after repeated empty discoveries"
                );
            }
        } else {
            site.consecutive_failures = 0;
            if site.status == LifecycleStatus::Failed {
                site.status = LifecycleStatus::Active;
                tracing::info!(site_id = %site.id, "site reactivated by discovery");
            }
        }

        self.store
            .update_site(&site)
            .await
            .with_context(|| format!("save site {}", site.id))?;
        Ok(site)
    }

    async fn process_endpoint(&self, endpoint: &Endpoint) -> anyhow::Result<EndpointReport> {
        let mut job = FetchJob::pending(&endpoint.id);
        self.store
            .create_fetch_job(&job)
            .await
            .context("create fetch job")?;
        job.mark_running()?;
        self.store
            .update_fetch_job(&job)
            .await
            .context("save fetch job")?;

        tracing::info!(endpoint_id = %endpoint.id, url = %endpoint.url, "fetching endpoint");
        let outcome = fetch_with_retry(self.fetcher.as_ref(), &endpoint.url, self.settings.retry).await;
        let attempts = outcome.attempts;
        let retries = outcome.retry_count();

        let page = match outcome.result {
            Ok(page) => page,
            Err(err) => {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    url = %endpoint.url,
                    attempts,
                    error = %err,
                    "endpoint fetch failed"
                );
                job.mark_failed(retries, err.to_string())?;
                self.store
                    .update_fetch_job(&job)
                    .await
                    .context("save fetch job")?;
                return Ok(EndpointReport {
                    endpoint_id: endpoint.id.clone(),
                    url: endpoint.url.clone(),
                    fetch_job_id: job.id,
                    job_status: FetchJobStatus::Failed,
                    attempts,
                    has_changes: false,
                    change_type: None,
                    change_id: None,
                    analyzed: false,
                    error: Some(err.to_string()),
                });
            }
        };

        let detection = match self
            .detector
            .detect_and_record(&endpoint.id, &page.content, page.metadata)
            .await
        {
            Ok(detection) => detection,
            Err(err) => {
                if let Err(save_err) = self.abandon_job(&mut job, retries, &err).await {
                    tracing::warn!(
                        endpoint_id = %endpoint.id,
                        fetch_job_id = %job.id,
                        err = ?save_err,
                        "failed to mark fetch job failed; it may remain running"
                    );
                }
                return Err(err.context(format!("record content for endpoint {}", endpoint.id)));
            }
        };

        job.mark_completed(retries)?;
        self.store
            .update_fetch_job(&job)
            .await
            .context("save fetch job")?;
        self.store
            .update_endpoint(
                &endpoint.id,
                &EndpointUpdate {
                    status: None,
                    last_scraped_at: Some(Utc::now()),
                },
            )
            .await
            .context("update endpoint")?;

        let analyzed = if detection.has_changes {
            self.forward_to_analysis(endpoint, &detection).await
        } else {
            false
        };

        Ok(EndpointReport {
            endpoint_id: endpoint.id.clone(),
            url: endpoint.url.clone(),
            fetch_job_id: job.id,
            job_status: FetchJobStatus::Completed,
            attempts,
            has_changes: detection.has_changes,
            change_type: detection.change_type,
            change_id: detection.change.map(|c| c.id),
            analyzed,
            error: None,
        })
    }

    async fn abandon_job(
        &self,
        job: &mut FetchJob,
        retries: u32,
        err: &anyhow::Error,
    ) -> anyhow::Result<()> {
        job.mark_failed(retries, format!("{err:#}"))?;
        self.store.update_fetch_job(job).await
    }

    /// Best-effort: every failure here is logged and swallowed. Returns
    /// whether the analysis service acknowledged the change.
    async fn forward_to_analysis(&self, endpoint: &Endpoint, detection: &ChangeDetection) -> bool {
        let request = AnalysisRequest {
            content: detection.new_content.clone().unwrap_or_default(),
            previous_content: detection.previous_content.clone().unwrap_or_default(),
            url: endpoint.url.clone(),
            endpoint_id: endpoint.id.clone(),
        };

        let response = match tokio::time::timeout(
            self.settings.analysis_timeout,
            self.analyzer.analyze(&request),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                tracing::warn!(endpoint_id = %endpoint.id, ?err, "analysis request failed");
                return false;
            }
            Err(_) => {
                tracing::warn!(
                    endpoint_id = %endpoint.id,
                    timeout_ms = self.settings.analysis_timeout.as_millis() as u64,
                    "analysis request timed out"
                );
                return false;
            }
        };

        if !response.success {
            tracing::warn!(
                endpoint_id = %endpoint.id,
                error = response.error.as_deref().unwrap_or("unknown"),
                "analysis unsuccessful"
            );
            return false;
        }

        tracing::info!(
            endpoint_id = %endpoint.id,
            has_location_info = response.has_location_info,
            confidence = response.confidence,
            locations = response.locations.len(),
            changes = response.changes.len(),
            "analysis completed"
        );
        if response.is_high_confidence() {
            tracing::info!(
                endpoint_id = %endpoint.id,
                summary = response.summary.as_deref().unwrap_or(""),
                "high-confidence location data detected"
            );
        }

        if let Some(change) = &detection.change
            && let Err(err) = self.store.mark_change_processed(&change.id).await
        {
            tracing::warn!(change_id = %change.id, ?err, "failed to acknowledge change");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::app::analysis::AnalysisResponse;
    use crate::app::store::MemoryStore;
    use crate::fetch::{FetchError, FetchErrorKind, FetchedPage};
    use crate::model::{ContentChange, ContentSnapshot, PageMetadata, PageType};

    use super::*;

    #[derive(Default)]
    struct PageFixture {
        pages: Mutex<HashMap<String, String>>,
        gate: Option<Arc<Notify>>,
        unhealthy: AtomicBool,
        resets: AtomicUsize,
        fetched_at: Mutex<Vec<tokio::time::Instant>>,
    }

    impl PageFixture {
        fn serve(&self, url: &str, body: &str) {
            self.pages
                .lock()
                .unwrap()
                .insert(url.to_string(), body.to_string());
        }
    }

    #[async_trait]
    impl Fetcher for PageFixture {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.fetched_at.lock().unwrap().push(tokio::time::Instant::now());
            let body = self.pages.lock().unwrap().get(url).cloned();
            match body {
                Some(content) => Ok(FetchedPage {
                    url: url.to_string(),
                    content,
                    metadata: PageMetadata::default(),
                }),
                None => Err(FetchError::new(
                    FetchErrorKind::HttpStatus(503),
                    format!("GET {url}: HTTP 503"),
                )),
            }
        }

        async fn health_check(&self) -> bool {
            !self.unhealthy.load(Ordering::SeqCst)
        }

        async fn reset(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingAnalyzer {
        requests: Mutex<Vec<AnalysisRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl Analyzer for RecordingAnalyzer {
        async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse> {
            self.requests.lock().unwrap().push(request.clone());
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(AnalysisResponse {
                success: true,
                has_location_info: true,
                confidence: 0.9,
                ..AnalysisResponse::default()
            })
        }
    }

    /// Delegates to a [`MemoryStore`] but refuses selected writes on demand.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_fetch_jobs: AtomicBool,
        fail_snapshots: AtomicBool,
        fail_terminal_job_updates: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn create_site(&self, site: &MonitoredSite) -> anyhow::Result<()> {
            self.inner.create_site(site).await
        }
        async fn get_site(&self, site_id: &str) -> anyhow::Result<Option<MonitoredSite>> {
            self.inner.get_site(site_id).await
        }
        async fn update_site(&self, site: &MonitoredSite) -> anyhow::Result<()> {
            self.inner.update_site(site).await
        }
        async fn list_sites(&self) -> anyhow::Result<Vec<MonitoredSite>> {
            self.inner.list_sites().await
        }
        async fn create_endpoint(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
            self.inner.create_endpoint(endpoint).await
        }
        async fn get_endpoint(&self, endpoint_id: &str) -> anyhow::Result<Option<Endpoint>> {
            self.inner.get_endpoint(endpoint_id).await
        }
        async fn update_endpoint(
            &self,
            endpoint_id: &str,
            update: &EndpointUpdate,
        ) -> anyhow::Result<Option<Endpoint>> {
            self.inner.update_endpoint(endpoint_id, update).await
        }
        async fn get_endpoints_for_site(&self, site_id: &str) -> anyhow::Result<Vec<Endpoint>> {
            self.inner.get_endpoints_for_site(site_id).await
        }
        async fn create_snapshot(&self, snapshot: &ContentSnapshot) -> anyhow::Result<()> {
            if self.fail_snapshots.load(Ordering::SeqCst) {
                anyhow::bail!("snapshot volume unreachable");
            }
            self.inner.create_snapshot(snapshot).await
        }
        async fn get_latest_snapshot(
            &self,
            endpoint_id: &str,
        ) -> anyhow::Result<Option<ContentSnapshot>> {
            self.inner.get_latest_snapshot(endpoint_id).await
        }
        async fn list_snapshots(&self, endpoint_id: &str) -> anyhow::Result<Vec<ContentSnapshot>> {
            self.inner.list_snapshots(endpoint_id).await
        }
        async fn create_change(&self, change: &ContentChange) -> anyhow::Result<()> {
            self.inner.create_change(change).await
        }
        async fn get_change(&self, change_id: &str) -> anyhow::Result<Option<ContentChange>> {
            self.inner.get_change(change_id).await
        }
        async fn list_changes(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ContentChange>> {
            self.inner.list_changes(since).await
        }
        async fn get_unprocessed_changes(&self) -> anyhow::Result<Vec<ContentChange>> {
            self.inner.get_unprocessed_changes().await
        }
        async fn mark_change_processed(&self, change_id: &str) -> anyhow::Result<bool> {
            self.inner.mark_change_processed(change_id).await
        }
        async fn create_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()> {
            if self.fail_fetch_jobs.load(Ordering::SeqCst) {
                anyhow::bail!("store unreachable");
            }
            self.inner.create_fetch_job(job).await
        }
        async fn update_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()> {
            if self.fail_terminal_job_updates.load(Ordering::SeqCst)
                && matches!(job.status, FetchJobStatus::Completed | FetchJobStatus::Failed)
            {
                anyhow::bail!("fetch job volume unreachable");
            }
            self.inner.update_fetch_job(job).await
        }
        async fn get_fetch_job(&self, job_id: &str) -> anyhow::Result<Option<FetchJob>> {
            self.inner.get_fetch_job(job_id).await
        }
        async fn list_fetch_jobs(&self, endpoint_id: &str) -> anyhow::Result<Vec<FetchJob>> {
            self.inner.list_fetch_jobs(endpoint_id).await
        }
    }

    fn fast_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            retry: RetryPolicy::new(2, Duration::ZERO),
            courtesy_delay: Duration::ZERO,
            analysis_timeout: Duration::from_secs(5),
            max_discovery_failures: 3,
        }
    }

    async fn seed_endpoint(store: &dyn Store, url: &str) -> Endpoint {
        let site = MonitoredSite::new("https://example.com", "example.com");
        store.create_site(&site).await.unwrap();
        let endpoint = Endpoint::new(&site.id, url, PageType::Sitemap);
        store.create_endpoint(&endpoint).await.unwrap();
        endpoint
    }

    #[tokio::test]
    async fn second_sweep_detects_change_and_forwards_it_once() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(PageFixture::default());
        let analyzer = Arc::new(RecordingAnalyzer::default());
        let endpoint = seed_endpoint(store.as_ref(), "https://example.com/sitemap.xml").await;
        fetcher.serve(&endpoint.url, "<urlset>a</urlset>");

        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher.clone(),
            analyzer.clone(),
            fast_settings(),
        );

        let first = orchestrator.run_content_sweep().await.unwrap().completed().unwrap();
        assert_eq!(first.fetched, 1);
        assert_eq!(first.changed, 0);
        assert!(analyzer.requests.lock().unwrap().is_empty());

        fetcher.serve(&endpoint.url, "<urlset>b</urlset>");
        let second = orchestrator.run_content_sweep().await.unwrap().completed().unwrap();
        assert_eq!(second.changed, 1);
        assert_eq!(second.analyzed, 1);
        assert_eq!(
            second.endpoints[0].change_type,
            Some(ChangeType::ModifiedContent)
        );

        let requests = analyzer.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].previous_content, "<urlset>a</urlset>");
        assert_eq!(requests[0].content, "<urlset>b</urlset>");
        assert_eq!(requests[0].endpoint_id, endpoint.id);

        assert!(store.get_unprocessed_changes().await.unwrap().is_empty());
        let jobs = store.list_fetch_jobs(&endpoint.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == FetchJobStatus::Completed));
        let refreshed = store.get_endpoint(&endpoint.id).await.unwrap().unwrap();
        assert!(refreshed.last_scraped_at.is_some());
    }

    #[tokio::test]
    async fn failing_endpoint_does_not_abort_the_sweep() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(PageFixture::default());
        let broken = seed_endpoint(store.as_ref(), "https://broken.example/locations").await;
        let healthy = seed_endpoint(store.as_ref(), "https://example.com/sitemap.xml").await;
        fetcher.serve(&healthy.url, "<urlset/>");

        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );
        let summary = orchestrator.run_content_sweep().await.unwrap().completed().unwrap();

        assert_eq!(summary.endpoints_total, 2);
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.failed, 1);

        let jobs = store.list_fetch_jobs(&broken.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, FetchJobStatus::Failed);
        assert_eq!(jobs[0].retry_count, 1);
        assert!(jobs[0].error.as_deref().unwrap().contains("503"));
        assert!(store.get_latest_snapshot(&healthy.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_trigger_is_a_noop_and_guard_clears() {
        let store = Arc::new(MemoryStore::new());
        let gate = Arc::new(Notify::new());
        let fetcher = Arc::new(PageFixture {
            gate: Some(gate.clone()),
            ..PageFixture::default()
        });
        let endpoint = seed_endpoint(store.as_ref(), "https://example.com/sitemap.xml").await;
        fetcher.serve(&endpoint.url, "<urlset/>");

        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        ));

        let running = Arc::clone(&orchestrator);
        let first = tokio::spawn(async move { running.run_content_sweep().await });
        while !orchestrator.is_content_sweep_running() {
            tokio::task::yield_now().await;
        }

        assert!(orchestrator.run_content_sweep().await.unwrap().is_already_running());
        assert!(
            orchestrator
                .trigger_endpoint_fetch(&endpoint.id)
                .await
                .unwrap()
                .unwrap()
                .is_already_running()
        );

        gate.notify_one();
        let summary = first.await.unwrap().unwrap().completed().unwrap();
        assert_eq!(summary.fetched, 1);
        assert!(!orchestrator.is_content_sweep_running());
        assert_eq!(store.list_fetch_jobs(&endpoint.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_aborts_sweep_but_releases_guard() {
        let store = Arc::new(FlakyStore::default());
        let fetcher = Arc::new(PageFixture::default());
        let endpoint = seed_endpoint(store.as_ref(), "https://example.com/sitemap.xml").await;
        fetcher.serve(&endpoint.url, "<urlset/>");
        store.fail_fetch_jobs.store(true, Ordering::SeqCst);

        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );

        let err = orchestrator.run_content_sweep().await.unwrap_err();
        assert!(format!("{err:#}").contains("store unreachable"));
        assert!(!orchestrator.is_content_sweep_running());

        store.fail_fetch_jobs.store(false, Ordering::SeqCst);
        let summary = orchestrator.run_content_sweep().await.unwrap().completed().unwrap();
        assert_eq!(summary.fetched, 1);
    }

    #[tokio::test]
    async fn snapshot_failure_marks_job_failed_and_aborts_sweep() {
        let store = Arc::new(FlakyStore::default());
        let fetcher = Arc::new(PageFixture::default());
        let endpoint = seed_endpoint(store.as_ref(), "https://example.com/locations").await;
        fetcher.serve(&endpoint.url, "Main Street gym");
        store.fail_snapshots.store(true, Ordering::SeqCst);

        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );

        let err = orchestrator.run_content_sweep().await.unwrap_err();
        assert!(format!("{err:#}").contains("snapshot volume unreachable"));
        assert!(!orchestrator.is_content_sweep_running());

        let jobs = store.list_fetch_jobs(&endpoint.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, FetchJobStatus::Failed);
        assert!(jobs[0].error.as_deref().unwrap().contains("snapshot volume unreachable"));
    }

    #[tokio::test]
    async fn unsaved_abandoned_job_still_surfaces_the_original_error() {
        let store = Arc::new(FlakyStore::default());
        let fetcher = Arc::new(PageFixture::default());
        let endpoint = seed_endpoint(store.as_ref(), "https://example.com/locations").await;
        fetcher.serve(&endpoint.url, "Main Street gym");
        store.fail_snapshots.store(true, Ordering::SeqCst);
        store.fail_terminal_job_updates.store(true, Ordering::SeqCst);

        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );

        let err = orchestrator.run_content_sweep().await.unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("snapshot volume unreachable"));
        assert!(!rendered.contains("fetch job volume unreachable"));
        assert!(!orchestrator.is_content_sweep_running());

        let jobs = store.list_fetch_jobs(&endpoint.id).await.unwrap();
        assert_eq!(jobs[0].status, FetchJobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn courtesy_delay_spaces_consecutive_fetches() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(PageFixture::default());
        for path in ["a", "b", "c"] {
            let endpoint =
                seed_endpoint(store.as_ref(), &format!("https://example.com/{path}")).await;
            fetcher.serve(&endpoint.url, path);
        }

        let orchestrator = Orchestrator::new(
            store,
            fetcher.clone(),
            Arc::new(RecordingAnalyzer::default()),
            OrchestratorSettings::default(),
        );

        let started = tokio::time::Instant::now();
        let summary = orchestrator.run_content_sweep().await.unwrap().completed().unwrap();
        assert_eq!(summary.fetched, 3);

        let fetched_at = fetcher.fetched_at.lock().unwrap().clone();
        assert_eq!(fetched_at.len(), 3);
        assert_eq!(fetched_at[0] - started, Duration::ZERO);
        assert_eq!(fetched_at[1] - fetched_at[0], Duration::from_secs(2));
        assert_eq!(fetched_at[2] - fetched_at[1], Duration::from_secs(2));
    }

    #[tokio::test]
    async fn analysis_failure_keeps_change_unprocessed() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(PageFixture::default());
        let analyzer = Arc::new(RecordingAnalyzer {
            fail: true,
            ..RecordingAnalyzer::default()
        });
        let endpoint = seed_endpoint(store.as_ref(), "https://example.com/locations").await;

        let orchestrator =
            Orchestrator::new(store.clone(), fetcher.clone(), analyzer.clone(), fast_settings());

        fetcher.serve(&endpoint.url, "old");
        orchestrator.run_content_sweep().await.unwrap();
        fetcher.serve(&endpoint.url, "new");
        let summary = orchestrator.run_content_sweep().await.unwrap().completed().unwrap();

        assert_eq!(summary.changed, 1);
        assert_eq!(summary.analyzed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(analyzer.requests.lock().unwrap().len(), 1);
        assert_eq!(store.get_unprocessed_changes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_endpoint_trigger_returns_none() {
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PageFixture::default()),
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );
        assert!(orchestrator.trigger_endpoint_fetch("nope").await.unwrap().is_none());
        assert!(orchestrator.trigger_site_discovery("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discovery_sweep_skips_sites_with_endpoints_and_fails_empty_ones() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(PageFixture::default());
        fetcher.serve("https://found.example/sitemap.xml", "<urlset/>");

        let found = MonitoredSite::new("https://found.example", "found.example");
        let empty = MonitoredSite::new("https://empty.example", "empty.example");
        store.create_site(&found).await.unwrap();
        store.create_site(&empty).await.unwrap();
        seed_endpoint(store.as_ref(), "https://example.com/sitemap.xml").await;

        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );

        let summary = orchestrator.run_discovery_sweep().await.unwrap().completed().unwrap();
        assert_eq!(summary.sites_checked, 2);
        assert_eq!(summary.sites_skipped, 1);
        assert_eq!(summary.endpoints_discovered, 1);

        let stored = store.get_site(&found.id).await.unwrap().unwrap();
        assert!(stored.last_checked_at.is_some());
        assert_eq!(stored.consecutive_failures, 0);

        for _ in 0..2 {
            orchestrator.run_discovery_sweep().await.unwrap();
        }
        let failed = store.get_site(&empty.id).await.unwrap().unwrap();
        assert_eq!(failed.consecutive_failures, 3);
        assert_eq!(failed.status, LifecycleStatus::Failed);

        let after = orchestrator.run_discovery_sweep().await.unwrap().completed().unwrap();
        assert_eq!(after.sites_checked, 0);
        assert!(!orchestrator.is_discovery_running());
    }

    #[tokio::test]
    async fn site_trigger_refreshes_endpoints() {
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(PageFixture::default());
        fetcher.serve("https://example.com/sitemap.xml", "<urlset/>");
        let old = seed_endpoint(store.as_ref(), "https://example.com/sitemap.xml").await;

        let orchestrator = Orchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );
        let report = orchestrator
            .trigger_site_discovery(&old.site_id)
            .await
            .unwrap()
            .unwrap()
            .completed()
            .unwrap();

        assert_eq!(report.endpoints.len(), 1);
        let retired = store.get_endpoint(&old.id).await.unwrap().unwrap();
        assert_eq!(retired.status, LifecycleStatus::Inactive);
    }

    #[tokio::test]
    async fn failed_health_check_resets_runtime() {
        let fetcher = Arc::new(PageFixture::default());
        let orchestrator = Orchestrator::new(
            Arc::new(MemoryStore::new()),
            fetcher.clone(),
            Arc::new(RecordingAnalyzer::default()),
            fast_settings(),
        );

        assert!(orchestrator.run_health_check().await);
        assert_eq!(fetcher.resets.load(Ordering::SeqCst), 0);

        fetcher.unhealthy.store(true, Ordering::SeqCst);
        assert!(!orchestrator.run_health_check().await);
        assert_eq!(fetcher.resets.load(Ordering::SeqCst), 1);
    }
}
