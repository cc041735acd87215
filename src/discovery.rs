use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Context as _;
use url::Url;

use crate::app::store::Store;
use crate::fetch::{FetchError, Fetcher};
use crate::model::{Endpoint, EndpointUpdate, LifecycleStatus, MonitoredSite, PageType};

pub const SITEMAP_PATHS: &[&str] = &[
    "/sitemap.xml",
    "/sitemap_index.xml",
    "/sitemaps.xml",
    "/robots.txt",
];

pub const LOCATION_PATHS: &[&str] = &[
    "/locations",
    "/stores",
    "/branches",
    "/find-us",
    "/find-a-store",
    "/store-finder",
    "/our-locations",
    "/gym-locations",
    "/fitness-centers",
    "/clubs",
    "/centers",
];

pub const STORE_LOCATOR_PATHS: &[&str] = &[
    "/store-locator",
    "/find-store",
    "/locator",
    "/store-finder",
    "/find-location",
    "/nearest-store",
];

const LOCATION_KEYWORDS: &[&str] = &[
    "location",
    "address",
    "store",
    "branch",
    "gym",
    "fitness center",
    "find us",
    "visit us",
    "contact",
    "directions",
    "hours",
    "opening times",
];

const STORE_LOCATOR_KEYWORDS: &[&str] = &[
    "store locator",
    "find store",
    "search location",
    "enter zip",
    "enter postal code",
    "map",
    "distance",
    "nearest",
    "nearby",
];

pub const MIN_LOCATION_KEYWORDS: usize = 3;

fn distinct_keyword_matches(content: &str, keywords: &[&str]) -> usize {
    let lower = content.to_lowercase();
    keywords.iter().filter(|kw| lower.contains(**kw)).count()
}

/// At least three distinct location keywords.
pub fn is_location_page(content: &str) -> bool {
    distinct_keyword_matches(content, LOCATION_KEYWORDS) >= MIN_LOCATION_KEYWORDS
}

/// At least one store-locator keyword.
pub fn is_store_locator_page(content: &str) -> bool {
    distinct_keyword_matches(content, STORE_LOCATOR_KEYWORDS) >= 1
}

/// Joins a probe path onto a site root, dropping one trailing `/` of the root.
pub fn candidate_url(root: &str, path: &str) -> String {
    let root = root.trim();
    let root = root.strip_suffix('/').unwrap_or(root);
    if path.starts_with('/') {
        format!("{root}{path}")
    } else {
        format!("{root}/{path}")
    }
}

/// `Sitemap:` directives of a robots.txt body, resolved against `base`.
/// Unresolvable entries are dropped.
pub fn sitemaps_from_robots(robots: &str, base: &str) -> Vec<String> {
    let base = Url::parse(base).ok();
    robots
        .lines()
        .map(str::trim_start)
        .filter(|line| {
            line.get(..8)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("sitemap:"))
        })
        .filter_map(|line| {
            let target = line[8..].trim();
            if target.is_empty() {
                return None;
            }
            match &base {
                Some(base) => base.join(target).ok().map(|u| u.to_string()),
                None => Url::parse(target).ok().map(|u| u.to_string()),
            }
        })
        .collect()
}

/// Probes fixed candidate paths under a site root and persists the pages that
/// look like they carry location data.
#[derive(Clone)]
pub struct DiscoveryEngine {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn Store>,
}

/// Per-run state: fetch cache, already-active URLs, URLs accepted so far.
struct DiscoveryRun<'a> {
    site: &'a MonitoredSite,
    known_active: HashSet<String>,
    accepted: HashSet<String>,
    cache: HashMap<String, Option<String>>,
    endpoints: Vec<Endpoint>,
}

impl DiscoveryEngine {
    pub fn new(fetcher: Arc<dyn Fetcher>, store: Arc<dyn Store>) -> Self {
        Self { fetcher, store }
    }

    /// Runs all three probe phases for a site and persists every hit.
    /// Probe failures count as "not found"; only store failures are errors.
    pub async fn discover(&self, site: &MonitoredSite) -> anyhow::Result<Vec<Endpoint>> {
        tracing::info!(site_id = %site.id, url = %site.url, "starting discovery");

        let known_active = self
            .store
            .get_endpoints_for_site(&site.id)
            .await
            .with_context(|| format!("list endpoints for site {}", site.id))?
            .into_iter()
            .filter(Endpoint::is_active)
            .map(|e| e.url)
            .collect();

        let mut run = DiscoveryRun {
            site,
            known_active,
            accepted: HashSet::new(),
            cache: HashMap::new(),
            endpoints: Vec::new(),
        };

        self.find_sitemaps(&mut run).await?;
        self.find_pages(&mut run, LOCATION_PATHS, PageType::Locations, is_location_page)
            .await?;
        self.find_pages(
            &mut run,
            STORE_LOCATOR_PATHS,
            PageType::StoreLocator,
            is_store_locator_page,
        )
        .await?;

        tracing::info!(
            site_id = %site.id,
            discovered = run.endpoints.len(),
            "discovery finished"
        );
        Ok(run.endpoints)
    }

    /// Retires every endpoint of the site, then discovers from scratch.
    pub async fn refresh(&self, site: &MonitoredSite) -> anyhow::Result<Vec<Endpoint>> {
        let retired = self.retire_active_endpoints(site).await?;
        tracing::info!(site_id = %site.id, retired, "endpoints retired before rediscovery");

        self.discover(site).await
    }

    /// Flips the site's active endpoints to inactive; returns how many flipped.
    async fn retire_active_endpoints(&self, site: &MonitoredSite) -> anyhow::Result<usize> {
        let existing = self
            .store
            .get_endpoints_for_site(&site.id)
            .await
            .with_context(|| format!("list endpoints for site {}", site.id))?;

        let retire = EndpointUpdate {
            status: Some(LifecycleStatus::Inactive),
            last_scraped_at: None,
        };
        let mut retired = 0usize;
        for endpoint in existing.iter().filter(|e| e.is_active()) {
            self.store
                .update_endpoint(&endpoint.id, &retire)
                .await
                .with_context(|| format!("retire endpoint {}", endpoint.id))?;
            retired += 1;
        }
        Ok(retired)
    }

    async fn find_sitemaps(&self, run: &mut DiscoveryRun<'_>) -> anyhow::Result<()> {
        for path in SITEMAP_PATHS {
            let url = candidate_url(&run.site.url, path);
            let Some(content) = self.probe(run, &url).await else {
                continue;
            };
            self.accept(run, url.clone(), PageType::Sitemap).await?;

            if *path == "/robots.txt" {
                for sitemap in sitemaps_from_robots(&content, &url) {
                    if run.known_active.contains(&sitemap) {
                        continue;
                    }
                    self.accept(run, sitemap, PageType::Sitemap).await?;
                }
            }
        }
        Ok(())
    }

    async fn find_pages(
        &self,
        run: &mut DiscoveryRun<'_>,
        paths: &[&str],
        page_type: PageType,
        classify: fn(&str) -> bool,
    ) -> anyhow::Result<()> {
        for path in paths {
            let url = candidate_url(&run.site.url, path);
            let Some(content) = self.probe(run, &url).await else {
                continue;
            };
            if classify(&content) {
                self.accept(run, url, page_type).await?;
            } else {
                tracing::debug!(url = %url, ?page_type, "page did not match keywords");
            }
        }
        Ok(())
    }

    /// Fetches a candidate once per run. Already-active URLs, failed fetches
    /// and empty pages all read as absent.
    async fn probe(&self, run: &mut DiscoveryRun<'_>, url: &str) -> Option<String> {
        if run.known_active.contains(url) {
            tracing::debug!(url, "skipping probe of active endpoint");
            return None;
        }
        if let Some(cached) = run.cache.get(url) {
            return cached.clone();
        }

        let content = match self.fetcher.fetch(url).await {
            Ok(page) if !page.content.trim().is_empty() => Some(page.content),
            Ok(_) => {
                tracing::debug!(url, "probe returned empty page");
                None
            }
            Err(FetchError { kind, message }) => {
                tracing::debug!(url, ?kind, error = %message, "probe failed");
                None
            }
        };
        run.cache.insert(url.to_owned(), content.clone());
        content
    }

    async fn accept(
        &self,
        run: &mut DiscoveryRun<'_>,
        url: String,
        page_type: PageType,
    ) -> anyhow::Result<()> {
        if !run.accepted.insert(url.clone()) {
            return Ok(());
        }
        let endpoint = Endpoint::new(&run.site.id, url, page_type);
        self.store
            .create_endpoint(&endpoint)
            .await
            .with_context(|| format!("store endpoint {}", endpoint.url))?;
        tracing::info!(site_id = %run.site.id, url = %endpoint.url, ?page_type, "endpoint discovered");
        run.endpoints.push(endpoint);
        Ok(())
    }
}
