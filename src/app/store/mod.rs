//! Persistence collaborator.
//!
//! The pipeline only talks to storage through [`Store`]. Two backends ship with
//! the crate: [`MemoryStore`] (process-local tables) and [`LocalFsStore`]
//! (one JSON document per record under a data directory).

mod local_fs;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    ContentChange, ContentSnapshot, Endpoint, EndpointUpdate, FetchJob, MonitoredSite,
};

pub use local_fs::LocalFsStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone)]
pub enum SiteRegistration {
    Created(MonitoredSite),
    Existing(MonitoredSite),
}

impl SiteRegistration {
    pub fn into_site(self) -> MonitoredSite {
        match self {
            Self::Created(site) | Self::Existing(site) => site,
        }
    }
}

/// Stores `site` unless a site with the same root URL already exists.
pub async fn register_site(
    store: &dyn Store,
    site: MonitoredSite,
) -> anyhow::Result<SiteRegistration> {
    let existing = store.list_sites().await?;
    if let Some(found) = existing.into_iter().find(|s| s.url == site.url) {
        return Ok(SiteRegistration::Existing(found));
    }
    store.create_site(&site).await?;
    tracing::info!(site_id = %site.id, url = %site.url, "site registered");
    Ok(SiteRegistration::Created(site))
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_site(&self, site: &MonitoredSite) -> anyhow::Result<()>;
    async fn get_site(&self, site_id: &str) -> anyhow::Result<Option<MonitoredSite>>;
    async fn update_site(&self, site: &MonitoredSite) -> anyhow::Result<()>;
    /// All sites regardless of status, oldest first.
    async fn list_sites(&self) -> anyhow::Result<Vec<MonitoredSite>>;

    async fn create_endpoint(&self, endpoint: &Endpoint) -> anyhow::Result<()>;
    async fn get_endpoint(&self, endpoint_id: &str) -> anyhow::Result<Option<Endpoint>>;
    /// Returns the updated endpoint, or `None` when the id is unknown.
    async fn update_endpoint(
        &self,
        endpoint_id: &str,
        update: &EndpointUpdate,
    ) -> anyhow::Result<Option<Endpoint>>;
    async fn get_endpoints_for_site(&self, site_id: &str) -> anyhow::Result<Vec<Endpoint>>;

    async fn create_snapshot(&self, snapshot: &ContentSnapshot) -> anyhow::Result<()>;
    async fn get_latest_snapshot(
        &self,
        endpoint_id: &str,
    ) -> anyhow::Result<Option<ContentSnapshot>>;
    /// Snapshots of one endpoint in capture order.
    async fn list_snapshots(&self, endpoint_id: &str) -> anyhow::Result<Vec<ContentSnapshot>>;

    async fn create_change(&self, change: &ContentChange) -> anyhow::Result<()>;
    async fn get_change(&self, change_id: &str) -> anyhow::Result<Option<ContentChange>>;
    /// Changes detected at or after `since`, oldest first.
    async fn list_changes(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ContentChange>>;
    async fn get_unprocessed_changes(&self) -> anyhow::Result<Vec<ContentChange>>;
    /// Returns `false` when the change does not exist.
    async fn mark_change_processed(&self, change_id: &str) -> anyhow::Result<bool>;

    async fn create_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()>;
    async fn update_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()>;
    async fn get_fetch_job(&self, job_id: &str) -> anyhow::Result<Option<FetchJob>>;
    async fn list_fetch_jobs(&self, endpoint_id: &str) -> anyhow::Result<Vec<FetchJob>>;

    async fn get_active_sites(&self) -> anyhow::Result<Vec<MonitoredSite>> {
        Ok(self
            .list_sites()
            .await?
            .into_iter()
            .filter(MonitoredSite::is_active)
            .collect())
    }

    /// Active endpoints belonging to active sites.
    async fn get_active_endpoints(&self) -> anyhow::Result<Vec<Endpoint>> {
        let mut endpoints = Vec::new();
        for site in self.get_active_sites().await? {
            endpoints.extend(
                self.get_endpoints_for_site(&site.id)
                    .await?
                    .into_iter()
                    .filter(Endpoint::is_active),
            );
        }
        Ok(endpoints)
    }
}
