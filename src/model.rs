use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Active,
    Inactive,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PageType {
    Sitemap,
    Locations,
    StoreLocator,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    NewContent,
    ModifiedContent,
    RemovedContent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FetchJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FetchJobStatus {
    /// Jobs only move forward: pending -> running -> completed | failed.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

/// A root domain under observation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoredSite {
    pub id: String,
    pub url: String,
    pub domain: String,
    pub status: LifecycleStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoredSite {
    pub fn new(url: impl Into<String>, domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            url: url.into(),
            domain: domain.into(),
            status: LifecycleStatus::Active,
            last_checked_at: None,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validates an operator-supplied root URL. The domain defaults to the
    /// URL host.
    pub fn from_url(raw_url: &str, domain: Option<&str>) -> anyhow::Result<Self> {
        let url = url::Url::parse(raw_url.trim())
            .map_err(|err| anyhow::anyhow!("invalid site url {raw_url:?}: {err}"))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("site url must be http/https: {url}");
        }
        let Some(host) = url.host_str() else {
            anyhow::bail!("site url has no host: {url}");
        };
        let domain = domain
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(host)
            .to_ascii_lowercase();
        Ok(Self::new(url.to_string(), domain))
    }

    pub fn is_active(&self) -> bool {
        self.status == LifecycleStatus::Active
    }
}

/// A URL under a site believed to carry location data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Endpoint {
    pub id: String,
    pub site_id: String,
    pub url: String,
    pub page_type: PageType,
    pub status: LifecycleStatus,
    pub last_scraped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    pub fn new(site_id: impl Into<String>, url: impl Into<String>, page_type: PageType) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            site_id: site_id.into(),
            url: url.into(),
            page_type,
            status: LifecycleStatus::Active,
            last_scraped_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == LifecycleStatus::Active
    }
}

/// Partial update applied through `Store::update_endpoint`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointUpdate {
    pub status: Option<LifecycleStatus>,
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl EndpointUpdate {
    pub fn apply(&self, endpoint: &mut Endpoint) {
        if let Some(status) = self.status {
            endpoint.status = status;
        }
        if let Some(at) = self.last_scraped_at {
            endpoint.last_scraped_at = Some(at);
        }
        endpoint.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageMetadata {
    pub final_url: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub content_length: usize,
    pub fetch_duration_ms: u64,
    pub user_agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

/// One immutable fetch result for an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentSnapshot {
    pub id: String,
    pub endpoint_id: String,
    pub content: String,
    pub content_hash: String,
    pub metadata: PageMetadata,
    pub captured_at: DateTime<Utc>,
}

impl ContentSnapshot {
    pub fn new(
        endpoint_id: impl Into<String>,
        content: impl Into<String>,
        content_hash: impl Into<String>,
        metadata: PageMetadata,
    ) -> Self {
        Self {
            id: new_id(),
            endpoint_id: endpoint_id.into(),
            content: content.into(),
            content_hash: content_hash.into(),
            metadata,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentChange {
    pub id: String,
    pub endpoint_id: String,
    pub previous_hash: String,
    pub new_hash: String,
    pub change_type: ChangeType,
    pub detected_at: DateTime<Utc>,
    pub processed: bool,
}

impl ContentChange {
    pub fn new(
        endpoint_id: impl Into<String>,
        previous_hash: impl Into<String>,
        new_hash: impl Into<String>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            id: new_id(),
            endpoint_id: endpoint_id.into(),
            previous_hash: previous_hash.into(),
            new_hash: new_hash.into(),
            change_type,
            detected_at: Utc::now(),
            processed: false,
        }
    }
}

/// Audit record for one fetch of an endpoint (all attempts included).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchJob {
    pub id: String,
    pub endpoint_id: String,
    pub status: FetchJobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl FetchJob {
    pub fn pending(endpoint_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            endpoint_id: endpoint_id.into(),
            status: FetchJobStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
        }
    }

    pub fn mark_running(&mut self) -> anyhow::Result<()> {
        self.transition(FetchJobStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_completed(&mut self, retry_count: u32) -> anyhow::Result<()> {
        self.transition(FetchJobStatus::Completed)?;
        self.retry_count = retry_count;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, retry_count: u32, error: impl Into<String>) -> anyhow::Result<()> {
        self.transition(FetchJobStatus::Failed)?;
        self.retry_count = retry_count;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn transition(&mut self, next: FetchJobStatus) -> anyhow::Result<()> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(
                "fetch job {} cannot move from {:?} to {next:?}",
                self.id,
                self.status
            );
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_type_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&PageType::StoreLocator).unwrap();
        assert_eq!(json, "\"store-locator\"");
        let parsed: PageType = serde_json::from_str("\"sitemap\"").unwrap();
        assert_eq!(parsed, PageType::Sitemap);
    }

    #[test]
    fn change_type_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&ChangeType::ModifiedContent).unwrap();
        assert_eq!(json, "\"modified_content\"");
    }

    #[test]
    fn site_from_url_defaults_domain_to_host() {
        let site = MonitoredSite::from_url(" https://Example.com ", None).unwrap();
        assert_eq!(site.url, "https://example.com/");
        assert_eq!(site.domain, "example.com");
        assert!(site.is_active());

        let site = MonitoredSite::from_url("https://shop.example.com", Some("Example.com")).unwrap();
        assert_eq!(site.domain, "example.com");

        assert!(MonitoredSite::from_url("ftp://example.com", None).is_err());
        assert!(MonitoredSite::from_url("example.com", None).is_err());
    }

    #[test]
    fn fetch_job_moves_forward_only() {
        let mut job = FetchJob::pending("ep-1");
        job.mark_running().unwrap();
        assert!(job.started_at.is_some());
        job.mark_failed(2, "timeout").unwrap();
        assert_eq!(job.status, FetchJobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error.as_deref(), Some("timeout"));

        let err = job.mark_running().unwrap_err().to_string();
        assert!(err.contains("cannot move"));
        assert_eq!(job.status, FetchJobStatus::Failed);
    }

    #[test]
    fn pending_job_cannot_complete_without_running() {
        let mut job = FetchJob::pending("ep-1");
        assert!(job.mark_completed(0).is_err());
        assert_eq!(job.status, FetchJobStatus::Pending);
    }

    #[test]
    fn endpoint_update_applies_only_set_fields() {
        let mut endpoint = Endpoint::new("site-1", "https://example.com/locations", PageType::Locations);
        let at = Utc::now();
        EndpointUpdate {
            status: None,
            last_scraped_at: Some(at),
        }
        .apply(&mut endpoint);
        assert_eq!(endpoint.status, LifecycleStatus::Active);
        assert_eq!(endpoint.last_scraped_at, Some(at));

        EndpointUpdate {
            status: Some(LifecycleStatus::Inactive),
            last_scraped_at: None,
        }
        .apply(&mut endpoint);
        assert_eq!(endpoint.status, LifecycleStatus::Inactive);
        assert_eq!(endpoint.last_scraped_at, Some(at));
    }
}
