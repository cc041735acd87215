use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest as _, Sha256};

use crate::app::store::Store;
use crate::model::{ChangeType, ContentChange, ContentSnapshot, PageMetadata};

const MOST_ACTIVE_LIMIT: usize = 10;

const NEW_LOCATION_INDICATORS: &[&str] = &[
    "new location",
    "new store",
    "new gym",
    "new branch",
    "opening soon",
    "now open",
    "grand opening",
    "new address",
    "relocated",
    "moved to",
];

/// Lowercase hex SHA-256 of the content. Empty content still hashes.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Classifies a transition between two distinct content values.
pub fn classify_change(previous: &str, new: &str) -> ChangeType {
    if previous.is_empty() {
        ChangeType::NewContent
    } else if new.is_empty() {
        ChangeType::RemovedContent
    } else {
        ChangeType::ModifiedContent
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeDetection {
    pub has_changes: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_type: Option<ChangeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change: Option<ContentChange>,
    /// Snapshot written by this call; `None` when the content was unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ContentSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

impl ChangeDetection {
    fn unchanged(snapshot: Option<ContentSnapshot>) -> Self {
        Self {
            has_changes: false,
            change_type: None,
            change: None,
            snapshot,
            previous_content: None,
            new_content: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ChangeTypeCounts {
    pub new_content: usize,
    pub modified_content: usize,
    pub removed_content: usize,
}

impl ChangeTypeCounts {
    fn record(&mut self, change_type: ChangeType) {
        match change_type {
            ChangeType::NewContent => self.new_content += 1,
            ChangeType::ModifiedContent => self.modified_content += 1,
            ChangeType::RemovedContent => self.removed_content += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndpointActivity {
    pub endpoint_id: String,
    pub change_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChangeStatistics {
    pub window_days: u32,
    pub total_changes: usize,
    pub by_type: ChangeTypeCounts,
    pub most_active: Vec<EndpointActivity>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecentChangeAnalysis {
    pub endpoint_id: String,
    pub recent_changes: usize,
    pub significant_changes: bool,
    pub new_locations_detected: bool,
    pub matched_indicators: Vec<String>,
    pub report: String,
}

/// Hash-based change detection over the snapshot history of each endpoint.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn Store>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records `content` for an endpoint. The first observation only sets the
    /// baseline; identical content is a no-op; anything else writes one
    /// change row and one snapshot.
    pub async fn detect_and_record(
        &self,
        endpoint_id: &str,
        content: &str,
        metadata: PageMetadata,
    ) -> anyhow::Result<ChangeDetection> {
        let new_hash = content_hash(content);
        let previous = self
            .store
            .get_latest_snapshot(endpoint_id)
            .await
            .with_context(|| format!("load latest snapshot for endpoint {endpoint_id}"))?;

        let Some(previous) = previous else {
            let snapshot = ContentSnapshot::new(endpoint_id, content, new_hash, metadata);
            self.store
                .create_snapshot(&snapshot)
                .await
                .context("store baseline snapshot")?;
            tracing::info!(endpoint_id, "baseline snapshot recorded");
            return Ok(ChangeDetection::unchanged(Some(snapshot)));
        };

        if previous.content_hash == new_hash {
            tracing::debug!(endpoint_id, "content unchanged");
            return Ok(ChangeDetection::unchanged(None));
        }

        let change_type = classify_change(&previous.content, content);
        let change = ContentChange::new(
            endpoint_id,
            previous.content_hash.clone(),
            new_hash.clone(),
            change_type,
        );
        self.store
            .create_change(&change)
            .await
            .context("store content change")?;

        let snapshot = ContentSnapshot::new(endpoint_id, content, new_hash, metadata);
        self.store
            .create_snapshot(&snapshot)
            .await
            .context("store snapshot")?;

        tracing::info!(endpoint_id, change_id = %change.id, ?change_type, "content change detected");

        Ok(ChangeDetection {
            has_changes: true,
            change_type: Some(change_type),
            change: Some(change),
            snapshot: Some(snapshot),
            previous_content: Some(previous.content),
            new_content: Some(content.to_owned()),
        })
    }

    /// Aggregates every change detected in the trailing window. Read-only.
    pub async fn change_statistics(&self, window_days: u32) -> anyhow::Result<ChangeStatistics> {
        let since = Utc::now() - chrono::Duration::days(i64::from(window_days));
        let changes = self
            .store
            .list_changes(since)
            .await
            .context("list changes")?;

        let mut by_type = ChangeTypeCounts::default();
        let mut per_endpoint: HashMap<&str, usize> = HashMap::new();
        for change in &changes {
            by_type.record(change.change_type);
            *per_endpoint.entry(change.endpoint_id.as_str()).or_default() += 1;
        }

        let mut most_active: Vec<EndpointActivity> = per_endpoint
            .into_iter()
            .map(|(endpoint_id, change_count)| EndpointActivity {
                endpoint_id: endpoint_id.to_owned(),
                change_count,
            })
            .collect();
        most_active.sort_by(|a, b| {
            b.change_count
                .cmp(&a.change_count)
                .then_with(|| a.endpoint_id.cmp(&b.endpoint_id))
        });
        most_active.truncate(MOST_ACTIVE_LIMIT);

        Ok(ChangeStatistics {
            window_days,
            total_changes: changes.len(),
            by_type,
            most_active,
        })
    }

    /// Acknowledges every unprocessed change of an endpoint.
    pub async fn mark_changes_processed(&self, endpoint_id: &str) -> anyhow::Result<usize> {
        let pending = self
            .store
            .get_unprocessed_changes()
            .await
            .context("list unprocessed changes")?;

        let mut marked = 0;
        for change in pending.iter().filter(|c| c.endpoint_id == endpoint_id) {
            if self
                .store
                .mark_change_processed(&change.id)
                .await
                .with_context(|| format!("mark change {} processed", change.id))?
            {
                marked += 1;
            }
        }
        tracing::info!(endpoint_id, marked, "changes marked processed");
        Ok(marked)
    }

    /// Keyword heuristic over the latest snapshot of an endpoint with recent
    /// unprocessed changes.
    pub async fn analyze_recent_changes(
        &self,
        endpoint_id: &str,
        days: u32,
    ) -> anyhow::Result<RecentChangeAnalysis> {
        let since = Utc::now() - chrono::Duration::days(i64::from(days));
        let recent: Vec<ContentChange> = self
            .store
            .get_unprocessed_changes()
            .await
            .context("list unprocessed changes")?
            .into_iter()
            .filter(|c| c.endpoint_id == endpoint_id && c.detected_at >= since)
            .collect();

        let mut analysis = RecentChangeAnalysis {
            endpoint_id: endpoint_id.to_owned(),
            recent_changes: recent.len(),
            significant_changes: false,
            new_locations_detected: false,
            matched_indicators: Vec::new(),
            report: String::new(),
        };

        if recent.is_empty() {
            analysis.report = "No recent changes detected".to_string();
            return Ok(analysis);
        }

        let Some(latest) = self
            .store
            .get_latest_snapshot(endpoint_id)
            .await
            .context("load latest snapshot")?
        else {
            analysis.report = "No content available for analysis".to_string();
            return Ok(analysis);
        };

        analysis.matched_indicators = new_location_indicators(&latest.content);
        analysis.new_locations_detected = !analysis.matched_indicators.is_empty();
        analysis.significant_changes = recent.len() > 1 || analysis.new_locations_detected;
        analysis.report = render_report(&recent, analysis.new_locations_detected);
        Ok(analysis)
    }
}

fn new_location_indicators(content: &str) -> Vec<String> {
    let lower = content.to_lowercase();
    NEW_LOCATION_INDICATORS
        .iter()
        .filter(|indicator| lower.contains(*indicator))
        .map(|indicator| (*indicator).to_string())
        .collect()
}

fn render_report(changes: &[ContentChange], new_locations_detected: bool) -> String {
    let mut counts = ChangeTypeCounts::default();
    for change in changes {
        counts.record(change.change_type);
    }

    let mut report = format!("Analysis of {} recent changes:\n", changes.len());
    for (label, count) in [
        ("new_content", counts.new_content),
        ("modified_content", counts.modified_content),
        ("removed_content", counts.removed_content),
    ] {
        if count > 0 {
            report.push_str(&format!("- {label}: {count} occurrences\n"));
        }
    }
    if new_locations_detected {
        report.push_str("- Potential new locations detected in content\n");
    }
    report
}
