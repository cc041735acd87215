use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LAST_MODIFIED};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use url::Url;

use crate::model::PageMetadata;

pub const DEFAULT_USER_AGENT: &str = "sitewatch/0.1 (+location monitoring)";
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];
const HEALTH_CHECK_HTML: &str = "<html><body>Health Check</body></html>";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "status")]
pub enum FetchErrorKind {
    InvalidUrl,
    Timeout,
    Connect,
    HttpStatus(u16),
    Body,
    Request,
    Runtime,
}

/// Failure surfaced by a [`Fetcher`]. Always a value, never a panic.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_request(url: &Url, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FetchErrorKind::Timeout
        } else if err.is_connect() {
            FetchErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            FetchErrorKind::Body
        } else {
            FetchErrorKind::Request
        };
        Self::new(kind, format!("GET {url}: {}", error_chain(err)))
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub content: String,
    pub metadata: PageMetadata,
}

/// Page runtime used by discovery and content sweeps.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;

    /// Confirms the runtime can still render pages.
    async fn health_check(&self) -> bool;

    /// Tears the runtime down; the next fetch initializes a fresh one.
    async fn reset(&self) {}
}

#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub user_agent: String,
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub health_check_url: Option<String>,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            health_check_url: None,
        }
    }
}

/// HTTP page runtime. The client is built lazily, carries no cookie store and
/// keeps no idle connections, so every fetch runs in an isolated context.
pub struct HttpFetcher {
    config: HttpFetcherConfig,
    runtime: tokio::sync::Mutex<Option<reqwest::Client>>,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Self {
        Self {
            config,
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    pub async fn shutdown(&self) {
        self.reset().await;
        tracing::info!("page runtime shut down");
    }

    async fn client(&self) -> Result<reqwest::Client, FetchError> {
        let mut runtime = self.runtime.lock().await;
        if let Some(client) = runtime.as_ref() {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .user_agent(self.config.user_agent.clone())
            .timeout(self.config.timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|err| {
                FetchError::new(
                    FetchErrorKind::Runtime,
                    format!("initialize page runtime: {}", error_chain(&err)),
                )
            })?;
        tracing::info!(user_agent = %self.config.user_agent, "page runtime initialized");
        *runtime = Some(client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let url = parse_http_url(url)?;
        let client = self.client().await?;

        let started = Instant::now();
        let response = client
            .get(url.clone())
            .header(
                ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,text/plain;q=0.8,*/*;q=0.5",
            )
            .send()
            .await
            .map_err(|err| FetchError::from_request(&url, &err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FetchErrorKind::HttpStatus(status.as_u16()),
                format!("GET {url}: HTTP {status}"),
            ));
        }

        let final_url = response.url().to_string();
        let content_type = header_string(&response, CONTENT_TYPE);
        let last_modified = header_string(&response, LAST_MODIFIED);

        let body = read_body_limited(response, self.config.max_body_bytes)
            .await
            .map_err(|err| FetchError::from_request(&url, &err))?;
        let fetch_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut metadata = PageMetadata {
            final_url,
            status_code: status.as_u16(),
            content_type: content_type.clone(),
            content_length: body.byte_len,
            fetch_duration_ms,
            user_agent: self.config.user_agent.clone(),
            last_modified,
            truncated: body.truncated,
            ..PageMetadata::default()
        };

        let content = if is_html(content_type.as_deref(), &body.text) {
            let page = extract_page(&body.text);
            metadata.title = page.title;
            metadata.description = page.description;
            metadata.canonical_url = page.canonical_url;
            page.text
        } else {
            body.text.trim().to_owned()
        };

        tracing::debug!(
            url = %url,
            bytes = body.byte_len,
            chars = content.len(),
            fetch_duration_ms,
            "fetched page"
        );

        Ok(FetchedPage {
            url: url.to_string(),
            content,
            metadata,
        })
    }

    async fn health_check(&self) -> bool {
        if let Err(err) = self.client().await {
            tracing::warn!(error = %err, "page runtime failed to initialize");
            return false;
        }

        if extract_page(HEALTH_CHECK_HTML).text != "Health Check" {
            tracing::warn!("page runtime failed to render static document");
            return false;
        }

        let Some(url) = self.config.health_check_url.as_deref() else {
            return true;
        };
        match self.fetch(url).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(url, error = %err, "health check fetch failed");
                false
            }
        }
    }

    async fn reset(&self) {
        if self.runtime.lock().await.take().is_some() {
            tracing::info!("page runtime reset; it will be reinitialized on next use");
        }
    }
}

fn parse_http_url(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw.trim()).map_err(|err| {
        FetchError::new(FetchErrorKind::InvalidUrl, format!("invalid url {raw:?}: {err}"))
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(FetchError::new(
            FetchErrorKind::InvalidUrl,
            format!("url must be http/https: {url}"),
        ));
    }
    Ok(url)
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

struct LimitedBody {
    text: String,
    byte_len: usize,
    truncated: bool,
}

async fn read_body_limited(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<LimitedBody, reqwest::Error> {
    let mut out: Vec<u8> = Vec::new();
    let mut truncated = false;

    while let Some(chunk) = response.chunk().await? {
        if out.len() + chunk.len() > limit {
            let remaining = limit.saturating_sub(out.len());
            out.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            break;
        }
        out.extend_from_slice(&chunk);
    }

    Ok(LimitedBody {
        byte_len: out.len(),
        text: String::from_utf8_lossy(&out).into_owned(),
        truncated,
    })
}

fn is_html(content_type: Option<&str>, body: &str) -> bool {
    match content_type {
        Some(content_type) => {
            let content_type = content_type.to_ascii_lowercase();
            content_type.starts_with("text/html")
                || content_type.starts_with("application/xhtml+xml")
        }
        None => looks_like_html(body),
    }
}

fn looks_like_html(body: &str) -> bool {
    let trimmed = body.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<!doctype html")
        || trimmed.starts_with("<html")
        || trimmed.contains("<body")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    pub text: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub canonical_url: Option<String>,
}

/// Reduces an HTML document to its visible text plus head metadata.
pub fn extract_page(html: &str) -> ExtractedPage {
    let doc = Html::parse_document(html);

    let title = select_first(&doc, "title")
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|s| !s.is_empty());
    let description = select_first(&doc, r#"meta[name="description"]"#)
        .and_then(|el| el.value().attr("content"))
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty());
    let canonical_url = select_first(&doc, r#"link[rel="canonical"]"#)
        .and_then(|el| el.value().attr("href"))
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty());

    ExtractedPage {
        text: visible_text(&doc),
        title,
        description,
        canonical_url,
    }
}

fn select_first<'a>(doc: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    doc.select(&selector).next()
}

fn visible_text(doc: &Html) -> String {
    let Some(body) = select_first(doc, "body") else {
        return String::new();
    };

    let mut lines = Vec::new();
    for node in body.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|el| HIDDEN_ELEMENTS.contains(&el.name()))
        });
        if hidden {
            continue;
        }
        let line = collapse_whitespace(text);
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    /// Delay after the given 1-based attempt fails: `base * 2^attempt`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

#[derive(Debug)]
pub struct RetryOutcome {
    pub result: Result<FetchedPage, FetchError>,
    pub attempts: u32,
}

impl RetryOutcome {
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Retries failed fetches with exponential backoff. A successful fetch is
/// returned as-is, even when its content is empty.
pub async fn fetch_with_retry(fetcher: &dyn Fetcher, url: &str, policy: RetryPolicy) -> RetryOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        tracing::debug!(url, attempt, max_attempts, "fetch attempt");
        match fetcher.fetch(url).await {
            Ok(page) => {
                return RetryOutcome {
                    result: Ok(page),
                    attempts: attempt,
                };
            }
            Err(err) => {
                tracing::debug!(url, attempt, error = %err, "fetch attempt failed");
                last_error = Some(err);
            }
        }

        if attempt < max_attempts {
            let delay = policy.backoff_after(attempt);
            tracing::debug!(url, delay_ms = delay.as_millis() as u64, "waiting before retry");
            tokio::time::sleep(delay).await;
        }
    }

    let last = last_error
        .unwrap_or_else(|| FetchError::new(FetchErrorKind::Runtime, "no fetch attempt was made"));
    RetryOutcome {
        result: Err(FetchError::new(
            last.kind,
            format!("failed after {max_attempts} attempts: {}", last.message),
        )),
        attempts: max_attempts,
    }
}
