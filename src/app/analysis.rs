use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const DEFAULT_ANALYSIS_URL: &str = "http://localhost:8081/ai-analysis";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub content: String,
    pub previous_content: String,
    pub url: String,
    pub endpoint_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisResponse {
    pub success: bool,
    pub has_location_info: bool,
    pub confidence: f64,
    pub locations: Vec<serde_json::Value>,
    pub changes: Vec<serde_json::Value>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl AnalysisResponse {
    pub fn is_high_confidence(&self) -> bool {
        self.has_location_info && self.confidence > 0.7
    }

    fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// Downstream consumer of detected changes. Best-effort from the caller's
/// point of view: errors are logged, never propagated into a sweep.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse>;
}

#[derive(Clone)]
pub struct HttpAnalyzer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAnalyzer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            anyhow::bail!("analysis endpoint is empty");
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build analysis http client")?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let raw = response.text().await.context("read analysis response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or(raw);
            anyhow::bail!("analysis service error ({status}): {message}");
        }

        let parsed: AnalysisResponse =
            serde_json::from_str(&raw).context("parse analysis response")?;
        Ok(parsed.normalized())
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let error = value.get("error")?;
    error
        .as_str()
        .or_else(|| error.get("message").and_then(|m| m.as_str()))
        .map(str::to_owned)
}

/// Used when no analysis service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAnalyzer;

#[async_trait]
impl Analyzer for NoopAnalyzer {
    async fn analyze(&self, _request: &AnalysisRequest) -> anyhow::Result<AnalysisResponse> {
        Ok(AnalysisResponse {
            error: Some("analysis disabled".to_string()),
            ..AnalysisResponse::default()
        })
    }
}
