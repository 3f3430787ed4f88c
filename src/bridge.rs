//! Navigation Bridge.
//!
//! [`BRIDGE_SCRIPT`] is what runs inside a proxied document. [`NavigationBridge`]
//! is the same interception logic driven by [`crate::frame::Frame`], so the
//! "exactly one event per navigation attempt" contract can be checked without
//! a browser.

use std::cell::Cell;

use lol_html::html_content::ContentType;
use lol_html::{Settings, element};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::config::{NavigationMode, ProxyConfig, ProxyEndpoint};
use crate::rewrite::{insert_after_prologue, run_rewriter};
use crate::{Error, Result};

pub const BRIDGE_SCRIPT: &str = include_str!("bridge.js");

pub const NAVIGATION_MESSAGE_TYPE: &str = "navigation";

const EXCLUDED_SCHEMES: &[&str] = &["javascript:", "mailto:", "tel:"];

/// Fragment-only, `javascript:`, `mailto:` and `tel:` hrefs never leave the page.
pub fn is_excluded_href(href: &str) -> bool {
    let href = href.trim();
    href.starts_with('#')
        || EXCLUDED_SCHEMES.iter().any(|scheme| {
            href.get(..scheme.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationOrigin {
    Link,
    History,
    Assign,
    Form,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub url: Url,
    pub origin: NavigationOrigin,
}

/// Cross-context message posted to the embedding page in bridged mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

impl NavigationMessage {
    pub fn new(url: &Url) -> Self {
        Self {
            kind: NAVIGATION_MESSAGE_TYPE.to_string(),
            url: url.to_string(),
        }
    }

    /// Accepts only well-formed navigation messages carrying an absolute
    /// http(s) URL; anything else posted by the page is ignored by callers.
    pub fn parse(raw: &str) -> Result<Url> {
        let message: Self = serde_json::from_str(raw)
            .map_err(|e| Error::InvalidUrl(format!("malformed navigation message: {e}")))?;
        if message.kind != NAVIGATION_MESSAGE_TYPE {
            return Err(Error::InvalidUrl(format!(
                "unexpected message type {:?}",
                message.kind
            )));
        }
        let url = Url::parse(&message.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(message.url));
        }
        Ok(url)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Internal(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeAction {
    /// Routed: the frame re-enters the proxy at this URL.
    Fetch { proxy_url: String },
    /// Bridged: the embedder receives this message and re-issues the fetch.
    PostMessage(NavigationMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeDispatch {
    pub event: NavigationEvent,
    pub action: BridgeAction,
}

#[derive(Debug, Clone)]
pub struct NavigationBridge {
    mode: NavigationMode,
    endpoint: ProxyEndpoint,
    dispatches: Vec<BridgeDispatch>,
}

impl NavigationBridge {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            mode: config.navigation,
            endpoint: config.endpoint.clone(),
            dispatches: Vec::new(),
        }
    }

    pub fn mode(&self) -> NavigationMode {
        self.mode
    }

    /// Real target of `href`: routed links are unwrapped, everything else is
    /// resolved against `base`. Non-http(s) results are not navigations.
    pub fn resolve_href(&self, href: &str, base: &Url) -> Option<Url> {
        let resolved = self
            .endpoint
            .unwrap(href)
            .or_else(|| base.join(href.trim()).ok())?;
        matches!(resolved.scheme(), "http" | "https").then_some(resolved)
    }

    /// Capture-phase click on a hyperlink. Returns true when the click was
    /// intercepted (default must be prevented).
    pub fn on_link_click(&mut self, href: &str, base: &Url) -> bool {
        if is_excluded_href(href) {
            return false;
        }
        let Some(url) = self.resolve_href(href, base) else {
            return false;
        };
        self.emit(url, NavigationOrigin::Link);
        true
    }

    /// Called after a `pushState`/`replaceState` has been applied. State-only
    /// calls and fragment changes keep the route and report nothing.
    pub fn on_history_change(&mut self, url: &Url, previous: &Url) -> bool {
        if url[..url::Position::AfterQuery] == previous[..url::Position::AfterQuery] {
            return false;
        }
        self.emit(url.clone(), NavigationOrigin::History);
        true
    }

    /// Back/forward traversal landed on `url`.
    pub fn on_traversal(&mut self, url: &Url) {
        self.emit(url.clone(), NavigationOrigin::History);
    }

    /// `location.assign`/`location.replace`. Hash-only changes stay in the
    /// page; returns true when the navigation was taken over.
    pub fn on_location_change(&mut self, url: &Url, current: &Url) -> bool {
        if is_same_document(url, current) {
            return false;
        }
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        self.emit(url.clone(), NavigationOrigin::Assign);
        true
    }

    pub fn on_form_submit(&mut self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        self.emit(url.clone(), NavigationOrigin::Form);
        true
    }

    /// GET submission target for a form whose action resolved to `action`.
    /// Routed forms carry their real action in the endpoint parameter, and the
    /// endpoint's own fields are not part of the submission.
    pub fn form_target(&self, action: &Url, fields: &[(String, String)]) -> Option<Url> {
        let mut target = action.clone();
        let mut submitted: Vec<&(String, String)> = fields.iter().collect();
        if self.mode == NavigationMode::Routed {
            let carried = fields
                .iter()
                .find(|(name, _)| name == self.endpoint.param())
                .and_then(|(_, value)| Url::parse(value).ok());
            if let Some(inner) = carried.or_else(|| self.endpoint.unwrap(action.as_str())) {
                target = inner;
            }
            submitted.retain(|(name, _)| {
                name != self.endpoint.param()
                    && !self
                        .endpoint
                        .fixed_params()
                        .iter()
                        .any(|(fixed, _)| fixed == name)
            });
        }
        if !matches!(target.scheme(), "http" | "https") {
            return None;
        }
        target.set_fragment(None);
        if !submitted.is_empty() {
            target
                .query_pairs_mut()
                .extend_pairs(submitted.iter().map(|(name, value)| (name, value)));
        }
        Some(target)
    }

    pub fn take_dispatches(&mut self) -> Vec<BridgeDispatch> {
        std::mem::take(&mut self.dispatches)
    }

    pub fn pending(&self) -> &[BridgeDispatch] {
        &self.dispatches
    }

    fn emit(&mut self, url: Url, origin: NavigationOrigin) {
        let action = match self.mode {
            NavigationMode::Routed => BridgeAction::Fetch {
                proxy_url: self.endpoint.wrap(&url),
            },
            NavigationMode::Bridged => BridgeAction::PostMessage(NavigationMessage::new(&url)),
        };
        tracing::debug!(url = %url, ?origin, mode = %self.mode, "navigation intercepted");
        self.dispatches.push(BridgeDispatch {
            event: NavigationEvent { url, origin },
            action,
        });
    }
}

fn is_same_document(next: &Url, current: &Url) -> bool {
    next.fragment().is_some()
        && next[..url::Position::AfterQuery] == current[..url::Position::AfterQuery]
}

/// The bridge script with this config's mode and endpoint filled in.
pub fn render_bridge_script(config: &ProxyConfig) -> String {
    let endpoint = &config.endpoint;
    let endpoint_json = json!({
        "path": endpoint.path(),
        "param": endpoint.param(),
        "fixed": endpoint.fixed_params(),
        "origin": endpoint.origin().map(|origin| origin.origin().ascii_serialization()),
    });
    let script = BRIDGE_SCRIPT
        .replace("__RECO_MODE__", &json!(config.navigation.as_str()).to_string())
        .replace("__RECO_ENDPOINT__", &endpoint_json.to_string())
        .replace("</", "<\\/");
    format!("<script data-reco=\"bridge\">{script}</script>")
}

/// Places the bridge at the start of the first `<head>` so it is installed
/// before any page script runs.
pub fn inject_bridge(html: &str, config: &ProxyConfig) -> Result<String> {
    let script = render_bridge_script(config);
    let injected = Cell::new(false);
    let output = run_rewriter(
        html,
        Settings {
            element_content_handlers: vec![element!("head", |el| {
                if !injected.get() {
                    el.prepend(&script, ContentType::Html);
                    injected.set(true);
                }
                Ok(())
            })],
            ..Settings::default()
        },
    )?;
    if injected.get() {
        Ok(output)
    } else {
        Ok(insert_after_prologue(&output, &script))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptPolicy;
    use pretty_assertions::assert_eq;

    fn url(raw: &str) -> Url {
        Url::parse(raw).expect("test url")
    }

    #[test]
    fn excluded_hrefs_match_case_insensitively() {
        for href in ["#top", " #", "JavaScript:void(0)", "mailto:a@b.test", "TEL:+90"] {
            assert!(is_excluded_href(href), "{href}");
        }
        for href in ["", "/cart", "https://a.test/#x", "javascript", "telemetry.html"] {
            assert!(!is_excluded_href(href), "{href}");
        }
    }

    #[test]
    fn bridged_link_click_posts_one_message() {
        let mut bridge = NavigationBridge::new(&ProxyConfig::default());
        let base = url("https://shop.test/c/shoes?page=2");
        assert!(bridge.on_link_click("../p/7", &base));
        assert!(!bridge.on_link_click("mailto:x@shop.test", &base));

        let dispatches = bridge.take_dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].event.url, url("https://shop.test/p/7"));
        assert_eq!(dispatches[0].event.origin, NavigationOrigin::Link);
        assert_eq!(
            dispatches[0].action,
            BridgeAction::PostMessage(NavigationMessage::new(&url("https://shop.test/p/7")))
        );
        assert!(bridge.take_dispatches().is_empty());
    }

    #[test]
    fn history_changes_report_only_new_routes() {
        let mut bridge = NavigationBridge::new(&ProxyConfig::default());
        let current = url("https://shop.test/p?id=1");
        assert!(!bridge.on_history_change(&current, &current));
        assert!(!bridge.on_history_change(&url("https://shop.test/p?id=1#tab"), &current));
        assert!(bridge.on_history_change(&url("https://shop.test/p?id=2"), &current));

        let dispatches = bridge.take_dispatches();
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].event.origin, NavigationOrigin::History);
    }

    #[test]
    fn routed_links_are_unwrapped_before_reporting() {
        let config = ProxyConfig::new(NavigationMode::Routed, ScriptPolicy::Interactive);
        let mut bridge = NavigationBridge::new(&config);
        let target = url("https://shop.test/p/7");
        let wrapped = config.endpoint.wrap(&target);

        assert!(bridge.on_link_click(&wrapped, &url("https://shop.test/")));
        let dispatches = bridge.take_dispatches();
        assert_eq!(dispatches[0].event.url, target);
        assert_eq!(
            dispatches[0].action,
            BridgeAction::Fetch { proxy_url: wrapped }
        );
    }

    #[test]
    fn hash_only_location_changes_stay_in_page() {
        let mut bridge = NavigationBridge::new(&ProxyConfig::default());
        let current = url("https://shop.test/p?x=1");
        assert!(!bridge.on_location_change(&url("https://shop.test/p?x=1#reviews"), &current));
        assert!(bridge.on_location_change(&url("https://shop.test/q"), &current));
        assert_eq!(bridge.take_dispatches()[0].event.origin, NavigationOrigin::Assign);
    }

    #[test]
    fn routed_forms_submit_to_the_carried_action() {
        let config = ProxyConfig::new(NavigationMode::Routed, ScriptPolicy::Interactive);
        let bridge = NavigationBridge::new(&config);
        let fields = vec![
            ("url".to_string(), "https://shop.test/search?lang=tr".to_string()),
            ("q".to_string(), "red shoes".to_string()),
        ];
        assert_eq!(
            bridge.form_target(&url("https://shop.test/api/proxy"), &fields),
            Some(url("https://shop.test/search?lang=tr&q=red+shoes"))
        );

        let bridged = NavigationBridge::new(&ProxyConfig::default());
        assert_eq!(
            bridged.form_target(&url("https://shop.test/search#top"), &fields[1..]),
            Some(url("https://shop.test/search?q=red+shoes"))
        );
    }

    #[test]
    fn navigation_messages_round_trip_through_json() -> Result<()> {
        let message = NavigationMessage::new(&url("https://shop.test/a"));
        let json = message.to_json()?;
        assert_eq!(json, r#"{"type":"navigation","url":"https://shop.test/a"}"#);
        assert_eq!(NavigationMessage::parse(&json)?, url("https://shop.test/a"));
        assert!(NavigationMessage::parse(r#"{"type":"resize","url":"https://a.test/"}"#).is_err());
        assert!(NavigationMessage::parse(r#"{"type":"navigation","url":"javascript:alert(1)"}"#).is_err());
        Ok(())
    }

    #[test]
    fn rendered_script_embeds_mode_and_endpoint() {
        let script = render_bridge_script(&ProxyConfig::new(
            NavigationMode::Routed,
            ScriptPolicy::Interactive,
        ));
        assert!(script.starts_with("<script data-reco=\"bridge\">"));
        assert!(script.contains(r#"var MODE = "routed";"#));
        assert!(script.contains(r#""path":"/api/proxy""#));
        assert!(!script.contains("__RECO_"));
        assert_eq!(script.matches("</script>").count(), 1);
    }

    #[test]
    fn script_leaves_location_methods_alone() {
        // Location methods cannot be replaced; assignments there would throw.
        assert!(!BRIDGE_SCRIPT.contains("window.location[name] ="));
        assert!(BRIDGE_SCRIPT.contains("dest.sameDocument"));
        assert!(BRIDGE_SCRIPT.contains("if (route(next) !== route(before)) emit(next);"));
    }

    #[test]
    fn bridge_is_injected_once_at_head_start() -> Result<()> {
        let out = inject_bridge(
            "<html><head><title>x</title></head><body></body></html>",
            &ProxyConfig::default(),
        )?;
        assert!(out.starts_with("<html><head><script data-reco=\"bridge\">"));
        assert_eq!(out.matches("data-reco=\"bridge\"").count(), 1);
        Ok(())
    }
}
