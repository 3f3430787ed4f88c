use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use url::Url;
use url::form_urlencoded;

use crate::{Error, Result};

pub const DEFAULT_PROXY_PATH: &str = "/api/proxy";
pub const DEFAULT_USER_AGENT: &str =
    concat!("reco-preview/", env!("CARGO_PKG_VERSION"), " (+live widget preview)");

// Stand-in origin for resolving path-only endpoint URLs.
const ENDPOINT_PARSE_BASE: &str = "http://reco.invalid/";

/// How navigation out of a proxied document is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NavigationMode {
    /// Link, form and refresh targets are rewritten to re-enter the proxy.
    Routed,
    /// Targets stay absolute; the bridge reports navigations to the embedder.
    #[default]
    Bridged,
}

impl NavigationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Routed => "routed",
            Self::Bridged => "bridged",
        }
    }
}

impl fmt::Display for NavigationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NavigationMode {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "routed" => Ok(Self::Routed),
            "bridged" => Ok(Self::Bridged),
            other => Err(Error::Settings(format!("unknown navigation mode: {other}"))),
        }
    }
}

/// What happens to page scripts in the proxied copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScriptPolicy {
    /// Scripts stay; the navigation bridge is injected.
    #[default]
    Interactive,
    /// Scripts and inline handlers are stripped and pointer input is disabled.
    Snapshot,
}

impl ScriptPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for ScriptPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptPolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "snapshot" => Ok(Self::Snapshot),
            other => Err(Error::Settings(format!("unknown script policy: {other}"))),
        }
    }
}

/// Where routed navigations re-enter the proxy, e.g. `/api/proxy?url={url}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    path: String,
    param: String,
    fixed: Vec<(String, String)>,
    // Wrapped URLs must be absolute once the document carries a `<base>`
    // pointing at the upstream origin; without one they stay path-absolute.
    origin: Option<Url>,
}

impl Default for ProxyEndpoint {
    fn default() -> Self {
        Self {
            path: DEFAULT_PROXY_PATH.to_string(),
            param: "url".to_string(),
            fixed: Vec::new(),
            origin: None,
        }
    }
}

impl ProxyEndpoint {
    /// Parses a template whose query names the target parameter with a
    /// `{url}` placeholder. A bare path uses `url` as the parameter name.
    pub fn from_template(template: &str) -> Result<Self> {
        let base = Url::parse(ENDPOINT_PARSE_BASE).map_err(|e| Error::Internal(e.to_string()))?;
        let parsed = base
            .join(template.trim())
            .map_err(|e| Error::Settings(format!("invalid proxy endpoint {template:?}: {e}")))?;

        let mut param = None;
        let mut fixed = Vec::new();
        for (key, value) in parsed.query_pairs() {
            if value == "{url}" {
                param = Some(key.into_owned());
            } else {
                fixed.push((key.into_owned(), value.into_owned()));
            }
        }
        Ok(Self {
            path: parsed.path().to_string(),
            param: param.unwrap_or_else(|| "url".to_string()),
            fixed,
            origin: None,
        })
    }

    /// Origin the proxy is served from, e.g. `http://127.0.0.1:3000`.
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn param(&self) -> &str {
        &self.param
    }

    pub fn fixed_params(&self) -> &[(String, String)] {
        &self.fixed
    }

    /// Adds (or replaces) a constant query parameter carried on every wrapped URL.
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.fixed.retain(|(existing, _)| existing != key);
        self.fixed.push((key.to_string(), value.to_string()));
        self
    }

    /// Proxy URL that fetches `target` through this endpoint.
    pub fn wrap(&self, target: &Url) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.fixed {
            query.append_pair(key, value);
        }
        query.append_pair(&self.param, target.as_str());
        let relative = format!("{}?{}", self.path, query.finish());
        match self.origin.as_ref().and_then(|origin| origin.join(&relative).ok()) {
            Some(absolute) => absolute.to_string(),
            None => relative,
        }
    }

    /// Recovers the target of a URL produced by [`ProxyEndpoint::wrap`].
    pub fn unwrap(&self, href: &str) -> Option<Url> {
        let base = match &self.origin {
            Some(origin) => origin.clone(),
            None => Url::parse(ENDPOINT_PARSE_BASE).ok()?,
        };
        let joined = base.join(href.trim()).ok()?;
        if joined.origin() != base.origin() || joined.path() != self.path {
            return None;
        }
        let target = joined
            .query_pairs()
            .find(|(key, _)| *key == self.param)
            .map(|(_, value)| value.into_owned())?;
        Url::parse(&target)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?", self.path)?;
        for (key, value) in &self.fixed {
            write!(f, "{key}={value}&")?;
        }
        write!(f, "{}={{url}}", self.param)
    }
}

/// Strategy for one proxied document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub navigation: NavigationMode,
    pub scripts: ScriptPolicy,
    pub endpoint: ProxyEndpoint,
}

impl ProxyConfig {
    pub fn new(navigation: NavigationMode, scripts: ScriptPolicy) -> Self {
        Self {
            navigation,
            scripts,
            endpoint: ProxyEndpoint::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: ProxyEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn snapshot() -> Self {
        Self::new(NavigationMode::Bridged, ScriptPolicy::Snapshot)
    }

    /// Endpoint for links inside a document proxied with this config. Modes
    /// that differ from the service defaults ride along on the wrapped URL.
    pub fn endpoint_for_links(&self, defaults: &ProxyConfig) -> ProxyEndpoint {
        let mut endpoint = self.endpoint.clone();
        if self.navigation != defaults.navigation {
            endpoint = endpoint.with_param("nav", self.navigation.as_str());
        }
        if self.scripts != defaults.scripts {
            endpoint = endpoint.with_param("scripts", self.scripts.as_str());
        }
        endpoint
    }
}

/// Command-line and environment configuration for the preview service.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "reco-preview",
    version,
    about = "Live proxy and widget preview service"
)]
pub struct ServiceConfig {
    #[arg(long, env = "RECO_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    #[arg(long, env = "RECO_USER_AGENT", default_value = DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Upstream request timeout
    #[arg(long, env = "RECO_TIMEOUT_SECS", default_value_t = 15)]
    pub timeout_secs: u64,

    #[arg(long, env = "RECO_NAVIGATION", value_enum, default_value_t = NavigationMode::Bridged)]
    pub navigation: NavigationMode,

    #[arg(long, env = "RECO_SCRIPTS", value_enum, default_value_t = ScriptPolicy::Interactive)]
    pub scripts: ScriptPolicy,

    #[arg(long, env = "RECO_PROXY_PATH", default_value = DEFAULT_PROXY_PATH)]
    pub proxy_path: String,

    /// `max-age` of the private cache directive on proxied documents
    #[arg(long, env = "RECO_CACHE_MAX_AGE", default_value_t = 60)]
    pub cache_max_age: u64,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "RECO_LOG", default_value = "info")]
    pub log: String,
}

impl ServiceConfig {
    pub fn proxy_config(&self) -> Result<ProxyConfig> {
        let endpoint = ProxyEndpoint::from_template(&self.proxy_path)?;
        Ok(ProxyConfig::new(self.navigation, self.scripts).with_endpoint(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn endpoint_wraps_and_unwraps_targets() -> Result<()> {
        let endpoint = ProxyEndpoint::from_template("/api/proxy?url={url}")?;
        let target = Url::parse("https://shop.test/a b?q=1&x=2#frag")
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let wrapped = endpoint.wrap(&target);
        assert!(wrapped.starts_with("/api/proxy?url=https%3A%2F%2Fshop.test%2F"));
        assert_eq!(endpoint.unwrap(&wrapped), Some(target));
        assert_eq!(endpoint.unwrap("/elsewhere?url=https%3A%2F%2Fa.test%2F"), None);
        assert_eq!(endpoint.unwrap("/api/proxy?url=javascript%3Aalert(1)"), None);
        assert_eq!(endpoint.unwrap("https://other.test/api/proxy?url=https%3A%2F%2Fa.test%2F"), None);
        Ok(())
    }

    #[test]
    fn endpoint_with_origin_produces_absolute_urls() -> Result<()> {
        let origin = Url::parse("http://127.0.0.1:3000").map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let endpoint = ProxyEndpoint::default().with_origin(origin);
        let target = Url::parse("https://a.test/p").map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let wrapped = endpoint.wrap(&target);
        assert_eq!(wrapped, "http://127.0.0.1:3000/api/proxy?url=https%3A%2F%2Fa.test%2Fp");
        assert_eq!(endpoint.unwrap(&wrapped), Some(target.clone()));
        assert_eq!(endpoint.unwrap("/api/proxy?url=https%3A%2F%2Fa.test%2Fp"), Some(target));
        Ok(())
    }

    #[test]
    fn endpoint_template_keeps_fixed_params() -> Result<()> {
        let endpoint = ProxyEndpoint::from_template("/p?mode=lite&target={url}")?;
        assert_eq!(endpoint.path(), "/p");
        assert_eq!(endpoint.param(), "target");
        let target = Url::parse("https://a.test/").map_err(|e| Error::InvalidUrl(e.to_string()))?;
        assert_eq!(
            endpoint.wrap(&target),
            "/p?mode=lite&target=https%3A%2F%2Fa.test%2F"
        );
        assert_eq!(endpoint.to_string(), "/p?mode=lite&target={url}");
        Ok(())
    }

    #[test]
    fn non_default_modes_travel_with_links() {
        let defaults = ProxyConfig::default();
        let routed = ProxyConfig::new(NavigationMode::Routed, ScriptPolicy::Interactive);
        let endpoint = routed.endpoint_for_links(&defaults);
        assert_eq!(endpoint.fixed_params(), &[("nav".to_string(), "routed".to_string())]);
        assert!(defaults.endpoint_for_links(&defaults).fixed_params().is_empty());
    }

    #[test]
    fn modes_parse_case_insensitively() -> Result<()> {
        assert_eq!("ROUTED".parse::<NavigationMode>()?, NavigationMode::Routed);
        assert_eq!(" snapshot ".parse::<ScriptPolicy>()?, ScriptPolicy::Snapshot);
        assert!("sideways".parse::<NavigationMode>().is_err());
        Ok(())
    }

    #[test]
    fn service_config_parses_flags() -> Result<()> {
        let config = ServiceConfig::try_parse_from([
            "reco-preview",
            "--navigation",
            "routed",
            "--proxy-path",
            "/proxy?u={url}",
            "--cache-max-age",
            "5",
        ])
        .map_err(|e| Error::Settings(e.to_string()))?;
        let proxy = config.proxy_config()?;
        assert_eq!(proxy.navigation, NavigationMode::Routed);
        assert_eq!(proxy.scripts, ScriptPolicy::Interactive);
        assert_eq!(proxy.endpoint.param(), "u");
        assert_eq!(config.cache_max_age, 5);
        Ok(())
    }
}
