use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    ContentChange, ContentSnapshot, Endpoint, EndpointUpdate, FetchJob, MonitoredSite,
};

use super::Store;

#[derive(Default)]
struct Tables {
    sites: Vec<MonitoredSite>,
    endpoints: Vec<Endpoint>,
    snapshots: HashMap<String, Vec<ContentSnapshot>>,
    changes: Vec<ContentChange>,
    fetch_jobs: Vec<FetchJob>,
}

/// Process-local store. Records keep insertion order.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> anyhow::Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_site(&self, site: &MonitoredSite) -> anyhow::Result<()> {
        self.write()?.sites.push(site.clone());
        Ok(())
    }

    async fn get_site(&self, site_id: &str) -> anyhow::Result<Option<MonitoredSite>> {
        Ok(self.read()?.sites.iter().find(|s| s.id == site_id).cloned())
    }

    async fn update_site(&self, site: &MonitoredSite) -> anyhow::Result<()> {
        let mut tables = self.write()?;
        let Some(slot) = tables.sites.iter_mut().find(|s| s.id == site.id) else {
            anyhow::bail!("site not found: {}", site.id);
        };
        *slot = site.clone();
        Ok(())
    }

    async fn list_sites(&self) -> anyhow::Result<Vec<MonitoredSite>> {
        Ok(self.read()?.sites.clone())
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
        self.write()?.endpoints.push(endpoint.clone());
        Ok(())
    }

    async fn get_endpoint(&self, endpoint_id: &str) -> anyhow::Result<Option<Endpoint>> {
        Ok(self
            .read()?
            .endpoints
            .iter()
            .find(|e| e.id == endpoint_id)
            .cloned())
    }

    async fn update_endpoint(
        &self,
        endpoint_id: &str,
        update: &EndpointUpdate,
    ) -> anyhow::Result<Option<Endpoint>> {
        let mut tables = self.write()?;
        Ok(tables
            .endpoints
            .iter_mut()
            .find(|e| e.id == endpoint_id)
            .map(|endpoint| {
                update.apply(endpoint);
                endpoint.clone()
            }))
    }

    async fn get_endpoints_for_site(&self, site_id: &str) -> anyhow::Result<Vec<Endpoint>> {
        Ok(self
            .read()?
            .endpoints
            .iter()
            .filter(|e| e.site_id == site_id)
            .cloned()
            .collect())
    }

    async fn create_snapshot(&self, snapshot: &ContentSnapshot) -> anyhow::Result<()> {
        self.write()?
            .snapshots
            .entry(snapshot.endpoint_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn get_latest_snapshot(
        &self,
        endpoint_id: &str,
    ) -> anyhow::Result<Option<ContentSnapshot>> {
        Ok(self
            .read()?
            .snapshots
            .get(endpoint_id)
            .and_then(|list| list.last())
            .cloned())
    }

    async fn list_snapshots(&self, endpoint_id: &str) -> anyhow::Result<Vec<ContentSnapshot>> {
        Ok(self
            .read()?
            .snapshots
            .get(endpoint_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_change(&self, change: &ContentChange) -> anyhow::Result<()> {
        self.write()?.changes.push(change.clone());
        Ok(())
    }

    async fn get_change(&self, change_id: &str) -> anyhow::Result<Option<ContentChange>> {
        Ok(self
            .read()?
            .changes
            .iter()
            .find(|c| c.id == change_id)
            .cloned())
    }

    async fn list_changes(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ContentChange>> {
        Ok(self
            .read()?
            .changes
            .iter()
            .filter(|c| c.detected_at >= since)
            .cloned()
            .collect())
    }

    async fn get_unprocessed_changes(&self) -> anyhow::Result<Vec<ContentChange>> {
        Ok(self
            .read()?
            .changes
            .iter()
            .filter(|c| !c.processed)
            .cloned()
            .collect())
    }

    async fn mark_change_processed(&self, change_id: &str) -> anyhow::Result<bool> {
        let mut tables = self.write()?;
        match tables.changes.iter_mut().find(|c| c.id == change_id) {
            Some(change) => {
                change.processed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()> {
        self.write()?.fetch_jobs.push(job.clone());
        Ok(())
    }

    async fn update_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()> {
        let mut tables = self.write()?;
        let Some(slot) = tables.fetch_jobs.iter_mut().find(|j| j.id == job.id) else {
            anyhow::bail!("fetch job not found: {}", job.id);
        };
        *slot = job.clone();
        Ok(())
    }

    async fn get_fetch_job(&self, job_id: &str) -> anyhow::Result<Option<FetchJob>> {
        Ok(self
            .read()?
            .fetch_jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn list_fetch_jobs(&self, endpoint_id: &str) -> anyhow::Result<Vec<FetchJob>> {
        Ok(self
            .read()?
            .fetch_jobs
            .iter()
            .filter(|j| j.endpoint_id == endpoint_id)
            .cloned()
            .collect())
    }
}
