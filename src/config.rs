use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::app::analysis::{Analyzer, DEFAULT_ANALYSIS_URL, HttpAnalyzer, NoopAnalyzer};
use crate::app::orchestrator::OrchestratorSettings;
use crate::app::scheduler::ScheduleIntervals;
use crate::fetch::{DEFAULT_MAX_BODY_BYTES, DEFAULT_USER_AGENT, HttpFetcherConfig, RetryPolicy};

/// Service configuration: optional TOML file, then `SITEWATCH_*` overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub data_dir: PathBuf,
    pub user_agent: String,
    pub fetch: FetchSection,
    pub schedule: ScheduleSection,
    pub analysis: AnalysisSection,
    pub discovery: DiscoverySection,
    pub sites: Vec<SiteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSection {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub courtesy_delay_ms: u64,
    pub max_body_bytes: usize,
    pub health_check_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleSection {
    pub discovery_interval_secs: u64,
    pub content_interval_secs: u64,
    pub health_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisSection {
    pub enabled: bool,
    pub url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
    pub max_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SiteEntry {
    pub url: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("sitewatch-data"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            fetch: FetchSection::default(),
            schedule: ScheduleSection::default(),
            analysis: AnalysisSection::default(),
            discovery: DiscoverySection::default(),
            sites: Vec::new(),
        }
    }
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 1000,
            courtesy_delay_ms: 2000,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            health_check_url: None,
        }
    }
}

impl Default for ScheduleSection {
    fn default() -> Self {
        let intervals = ScheduleIntervals::default();
        Self {
            discovery_interval_secs: intervals.discovery.as_secs(),
            content_interval_secs: intervals.content.as_secs(),
            health_interval_secs: intervals.health.as_secs(),
        }
    }
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_ANALYSIS_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self { max_failures: 3 }
    }
}

impl WatchConfig {
    /// Reads the file (when given), applies process environment overrides and
    /// validates the result.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("parse toml")
    }

    /// Applies `SITEWATCH_*` overrides read through `lookup`.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(dir) = get("SITEWATCH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(agent) = get("SITEWATCH_USER_AGENT") {
            self.user_agent = agent;
        }
        if let Some(url) = get("SITEWATCH_ANALYSIS_URL") {
            self.analysis.url = url;
            self.analysis.enabled = true;
        }
        if let Some(raw) = get("SITEWATCH_COURTESY_DELAY_MS") {
            self.fetch.courtesy_delay_ms = parse_env("SITEWATCH_COURTESY_DELAY_MS", &raw)?;
        }
        if let Some(raw) = get("SITEWATCH_FETCH_TIMEOUT_SECS") {
            self.fetch.timeout_secs = parse_env("SITEWATCH_FETCH_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = get("SITEWATCH_MAX_ATTEMPTS") {
            self.fetch.max_attempts = parse_env("SITEWATCH_MAX_ATTEMPTS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fetch.max_attempts == 0 {
            anyhow::bail!("fetch.max_attempts must be at least 1");
        }
        if self.fetch.timeout_secs == 0 {
            anyhow::bail!("fetch.timeout_secs must be at least 1");
        }
        if self.fetch.max_body_bytes == 0 {
            anyhow::bail!("fetch.max_body_bytes must be positive");
        }
        for (name, secs) in [
            ("schedule.discovery_interval_secs", self.schedule.discovery_interval_secs),
            ("schedule.content_interval_secs", self.schedule.content_interval_secs),
            ("schedule.health_interval_secs", self.schedule.health_interval_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{name} must be at least 1");
            }
        }
        if self.analysis.enabled && self.analysis.url.trim().is_empty() {
            anyhow::bail!("analysis.url is required when analysis is enabled");
        }
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent must not be empty");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.fetch.max_attempts,
            Duration::from_millis(self.fetch.backoff_base_ms),
        )
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            retry: self.retry_policy(),
            courtesy_delay: Duration::from_millis(self.fetch.courtesy_delay_ms),
            analysis_timeout: Duration::from_secs(self.analysis.timeout_secs),
            max_discovery_failures: self.discovery.max_failures.max(1),
        }
    }

    pub fn http_fetcher_config(&self) -> HttpFetcherConfig {
        HttpFetcherConfig {
            user_agent: self.user_agent.clone(),
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            max_body_bytes: self.fetch.max_body_bytes,
            health_check_url: self.fetch.health_check_url.clone(),
        }
    }

    pub fn schedule_intervals(&self) -> ScheduleIntervals {
        ScheduleIntervals {
            discovery: Duration::from_secs(self.schedule.discovery_interval_secs),
            content: Duration::from_secs(self.schedule.content_interval_secs),
            health: Duration::from_secs(self.schedule.health_interval_secs),
        }
    }

    pub fn build_analyzer(&self) -> anyhow::Result<Arc<dyn Analyzer>> {
        if !self.analysis.enabled {
            tracing::info!("analysis disabled");
            return Ok(Arc::new(NoopAnalyzer));
        }
        let analyzer = HttpAnalyzer::new(
            self.analysis.url.clone(),
            Duration::from_secs(self.analysis.timeout_secs),
        )
        .context("build analysis client")?;
        tracing::info!(endpoint = %analyzer.endpoint(), "analysis enabled");
        Ok(Arc::new(analyzer))
    }
}

fn parse_env<T>(key: &str, raw: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}"))
}
