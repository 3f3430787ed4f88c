//! Fetch-and-sanitize layer.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{info, warn};
use url::Url;

use crate::bridge::inject_bridge;
use crate::config::{NavigationMode, ProxyConfig, ScriptPolicy};
use crate::rewrite::{RewriteTarget, rewrite};
use crate::sanitize::sanitize;
use crate::{Error, Result};

pub const HTML_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
pub const XML_ACCEPT: &str = "application/xml,text/xml;q=0.9,*/*;q=0.8";

/// A validated absolute http(s) target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    target_url: Url,
}

impl FetchRequest {
    /// Rejects anything that is not an absolute http(s) URL. Runs before any
    /// network access.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidUrl("missing url".into()));
        }
        let target_url =
            Url::parse(trimmed).map_err(|e| Error::InvalidUrl(format!("{trimmed}: {e}")))?;
        if !matches!(target_url.scheme(), "http" | "https") || target_url.host_str().is_none() {
            return Err(Error::InvalidUrl(format!(
                "{trimmed}: only absolute http(s) URLs are supported"
            )));
        }
        Ok(Self { target_url })
    }

    pub fn target_url(&self) -> &Url {
        &self.target_url
    }
}

impl From<Url> for FetchRequest {
    fn from(target_url: Url) -> Self {
        Self { target_url }
    }
}

/// Raw upstream response.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedBody {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        self.content_type.as_deref().is_some_and(|content_type| {
            let mime = content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            mime == "text/html" || mime == "application/xhtml+xml"
        })
    }
}

/// One GET against an upstream. Redirects follow the transport default.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &Url, accept: &str) -> Result<FetchedBody>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &Url, accept: &str) -> Result<FetchedBody> {
        info!(url = %url, "fetching upstream");
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, accept)
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "upstream request failed");
                if e.is_timeout() {
                    Error::UpstreamFetch(format!("timed out fetching {url}"))
                } else {
                    Error::UpstreamFetch(format!("{url}: {e}"))
                }
            })?;

        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .map_err(|e| Error::UpstreamFetch(format!("{url}: reading body: {e}")))?;

        Ok(FetchedBody {
            final_url,
            status,
            content_type,
            body,
        })
    }
}

/// Rewritten, re-servable copy of a fetched page. Never patched in place; a
/// navigation produces a fresh one.
#[derive(Debug, Clone)]
pub struct ProxiedDocument {
    pub html: String,
    pub origin: String,
    /// URL the page was served from after redirects; relative references in
    /// the original markup resolved against this.
    pub base_url: Url,
    pub fetched_at: DateTime<Utc>,
    pub navigation: NavigationMode,
    pub scripts: ScriptPolicy,
}

/// Fetches `request` and runs the sanitize → rewrite → bridge pipeline.
pub async fn fetch_document(
    fetcher: &dyn PageFetcher,
    request: &FetchRequest,
    config: &ProxyConfig,
) -> Result<ProxiedDocument> {
    let url = request.target_url();
    let fetched = fetcher.get(url, HTML_ACCEPT).await?;

    if !fetched.is_success() {
        warn!(url = %url, status = fetched.status, "upstream returned non-success status");
        return Err(Error::UpstreamStatus {
            url: url.to_string(),
            status: fetched.status,
        });
    }
    // A missing content type is tolerated for live previews; snapshots must be HTML.
    let html_required = fetched.content_type.is_some() || config.scripts == ScriptPolicy::Snapshot;
    if html_required && !fetched.is_html() {
        let content_type = fetched.content_type.clone().unwrap_or_default();
        warn!(url = %url, content_type = %content_type, "upstream content is not html");
        return Err(Error::UnsupportedContentType(content_type));
    }

    let html = process_markup(&fetched.body, &fetched.final_url, config)?;
    info!(url = %fetched.final_url, bytes = html.len(), mode = %config.navigation, scripts = %config.scripts, "document proxied");

    Ok(ProxiedDocument {
        html,
        origin: fetched.final_url.origin().ascii_serialization(),
        base_url: fetched.final_url,
        fetched_at: Utc::now(),
        navigation: config.navigation,
        scripts: config.scripts,
    })
}

/// The markup half of [`fetch_document`], usable on already-fetched HTML.
pub fn process_markup(html: &str, page_url: &Url, config: &ProxyConfig) -> Result<String> {
    let sanitized = sanitize(html, config.scripts)?;
    let rewritten = rewrite(
        &sanitized,
        &RewriteTarget {
            page_url,
            navigation: config.navigation,
            endpoint: &config.endpoint,
        },
    )?;
    match config.scripts {
        ScriptPolicy::Interactive => inject_bridge(&rewritten, config),
        ScriptPolicy::Snapshot => Ok(rewritten),
    }
}
