use std::path::{Path, PathBuf};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::model::{
    ContentChange, ContentSnapshot, Endpoint, EndpointUpdate, FetchJob, MonitoredSite,
};

use super::Store;

/// One pretty-printed JSON document per record:
///
/// ```text
/// <base>/sites/<site_id>.json
/// <base>/endpoints/<endpoint_id>.json
/// <base>/snapshots/<endpoint_id>/<snapshot_id>.json
/// <base>/changes/<change_id>.json
/// <base>/fetch_jobs/<job_id>.json
/// ```
#[derive(Debug, Clone)]
pub struct LocalFsStore {
    base_dir: PathBuf,
}

impl LocalFsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn sites_dir(&self) -> PathBuf {
        self.base_dir.join("sites")
    }

    fn endpoints_dir(&self) -> PathBuf {
        self.base_dir.join("endpoints")
    }

    fn snapshots_dir(&self, endpoint_id: &str) -> Option<PathBuf> {
        is_safe_id(endpoint_id).then(|| self.base_dir.join("snapshots").join(endpoint_id))
    }

    fn changes_dir(&self) -> PathBuf {
        self.base_dir.join("changes")
    }

    fn fetch_jobs_dir(&self) -> PathBuf {
        self.base_dir.join("fetch_jobs")
    }
}

#[async_trait]
impl Store for LocalFsStore {
    async fn create_site(&self, site: &MonitoredSite) -> anyhow::Result<()> {
        let path = record_path(&self.sites_dir(), &site.id)?;
        write_json_atomic(&path, site).await.context("write site")
    }

    async fn get_site(&self, site_id: &str) -> anyhow::Result<Option<MonitoredSite>> {
        read_record(&self.sites_dir(), site_id).await
    }

    async fn update_site(&self, site: &MonitoredSite) -> anyhow::Result<()> {
        let path = record_path(&self.sites_dir(), &site.id)?;
        write_json_atomic(&path, site).await.context("write site")
    }

    async fn list_sites(&self) -> anyhow::Result<Vec<MonitoredSite>> {
        let mut sites: Vec<MonitoredSite> = read_json_dir(&self.sites_dir()).await?;
        sites.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sites)
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
        let path = record_path(&self.endpoints_dir(), &endpoint.id)?;
        write_json_atomic(&path, endpoint)
            .await
            .context("write endpoint")
    }

    async fn get_endpoint(&self, endpoint_id: &str) -> anyhow::Result<Option<Endpoint>> {
        read_record(&self.endpoints_dir(), endpoint_id).await
    }

    async fn update_endpoint(
        &self,
        endpoint_id: &str,
        update: &EndpointUpdate,
    ) -> anyhow::Result<Option<Endpoint>> {
        let Some(mut endpoint) = self.get_endpoint(endpoint_id).await? else {
            return Ok(None);
        };
        update.apply(&mut endpoint);
        let path = record_path(&self.endpoints_dir(), endpoint_id)?;
        write_json_atomic(&path, &endpoint)
            .await
            .context("write endpoint")?;
        Ok(Some(endpoint))
    }

    async fn get_endpoints_for_site(&self, site_id: &str) -> anyhow::Result<Vec<Endpoint>> {
        let mut endpoints: Vec<Endpoint> = read_json_dir(&self.endpoints_dir()).await?;
        endpoints.retain(|e| e.site_id == site_id);
        endpoints.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.url.cmp(&b.url))
        });
        Ok(endpoints)
    }

    async fn create_snapshot(&self, snapshot: &ContentSnapshot) -> anyhow::Result<()> {
        let dir = self
            .snapshots_dir(&snapshot.endpoint_id)
            .ok_or_else(|| anyhow::anyhow!("invalid endpoint id: {:?}", snapshot.endpoint_id))?;
        let path = record_path(&dir, &snapshot.id)?;
        write_json_atomic(&path, snapshot)
            .await
            .context("write snapshot")
    }

    async fn get_latest_snapshot(
        &self,
        endpoint_id: &str,
    ) -> anyhow::Result<Option<ContentSnapshot>> {
        Ok(self.list_snapshots(endpoint_id).await?.pop())
    }

    async fn list_snapshots(&self, endpoint_id: &str) -> anyhow::Result<Vec<ContentSnapshot>> {
        let Some(dir) = self.snapshots_dir(endpoint_id) else {
            return Ok(Vec::new());
        };
        let mut snapshots: Vec<ContentSnapshot> = read_json_dir(&dir).await?;
        snapshots.sort_by(|a, b| a.captured_at.cmp(&b.captured_at));
        Ok(snapshots)
    }

    async fn create_change(&self, change: &ContentChange) -> anyhow::Result<()> {
        let path = record_path(&self.changes_dir(), &change.id)?;
        write_json_atomic(&path, change)
            .await
            .context("write change")
    }

    async fn get_change(&self, change_id: &str) -> anyhow::Result<Option<ContentChange>> {
        read_record(&self.changes_dir(), change_id).await
    }

    async fn list_changes(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ContentChange>> {
        let mut changes: Vec<ContentChange> = read_json_dir(&self.changes_dir()).await?;
        changes.retain(|c| c.detected_at >= since);
        changes.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(changes)
    }

    async fn get_unprocessed_changes(&self) -> anyhow::Result<Vec<ContentChange>> {
        let mut changes: Vec<ContentChange> = read_json_dir(&self.changes_dir()).await?;
        changes.retain(|c| !c.processed);
        changes.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(changes)
    }

    async fn mark_change_processed(&self, change_id: &str) -> anyhow::Result<bool> {
        let Some(mut change) = self.get_change(change_id).await? else {
            return Ok(false);
        };
        change.processed = true;
        let path = record_path(&self.changes_dir(), change_id)?;
        write_json_atomic(&path, &change)
            .await
            .context("write change")?;
        Ok(true)
    }

    async fn create_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()> {
        let path = record_path(&self.fetch_jobs_dir(), &job.id)?;
        write_json_atomic(&path, job)
            .await
            .context("write fetch job")
    }

    async fn update_fetch_job(&self, job: &FetchJob) -> anyhow::Result<()> {
        let path = record_path(&self.fetch_jobs_dir(), &job.id)?;
        write_json_atomic(&path, job)
            .await
            .context("write fetch job")
    }

    async fn get_fetch_job(&self, job_id: &str) -> anyhow::Result<Option<FetchJob>> {
        read_record(&self.fetch_jobs_dir(), job_id).await
    }

    async fn list_fetch_jobs(&self, endpoint_id: &str) -> anyhow::Result<Vec<FetchJob>> {
        let mut jobs: Vec<FetchJob> = read_json_dir(&self.fetch_jobs_dir()).await?;
        jobs.retain(|j| j.endpoint_id == endpoint_id);
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(jobs)
    }
}

/// Ids end up as file names; anything outside `[A-Za-z0-9_-]` is refused.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn record_path(dir: &Path, id: &str) -> anyhow::Result<PathBuf> {
    if !is_safe_id(id) {
        anyhow::bail!("invalid record id: {id:?}");
    }
    Ok(dir.join(format!("{id}.json")))
}

async fn read_record<T: serde::de::DeserializeOwned>(
    dir: &Path,
    id: &str,
) -> anyhow::Result<Option<T>> {
    if !is_safe_id(id) {
        return Ok(None);
    }
    let path = dir.join(format!("{id}.json"));
    read_json(&path)
        .await
        .with_context(|| format!("read: {}", path.display()))
}

async fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read dir: {}", dir.display()));
        }
    };

    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("read dir entry: {}", dir.display()))?
    {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if let Some(value) = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
        {
            out.push(value);
        }
    }
    Ok(out)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
