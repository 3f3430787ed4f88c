//! URL rewriter for proxied documents.
//!
//! Every reference that would otherwise resolve against the proxy's own
//! origin is made absolute against the fetched page, a single `<base>` is
//! guaranteed, and outbound navigation points (links, refresh, forms) are
//! either routed back through the proxy or left absolute for the bridge.
//! The output carries a marker so a second pass leaves it untouched.

use std::cell::{Cell, RefCell};
use std::sync::OnceLock;

use fancy_regex::Regex;
use lol_html::html_content::ContentType;
use lol_html::{HtmlRewriter, Settings, element};
use url::Url;

use crate::bridge::is_excluded_href;
use crate::config::{NavigationMode, ProxyEndpoint};
use crate::html::escape_attr;
use crate::{Error, Result};

pub const MARKER_NAME: &str = "reco-proxied";

const SRC_SELECTOR: &str = "img[src], script[src], iframe[src], frame[src], embed[src], \
source[src], video[src], audio[src], track[src], input[src]";

const NON_NAVIGABLE_SCHEMES: &[&str] = &["data:", "blob:", "javascript:", "about:"];

/// Runs one streaming rewrite over a whole document.
pub(crate) fn run_rewriter(html: &str, settings: Settings<'_, '_>) -> Result<String> {
    let mut output = Vec::with_capacity(html.len());
    let mut rewriter = HtmlRewriter::new(settings, |chunk: &[u8]| output.extend_from_slice(chunk));
    rewriter
        .write(html.as_bytes())
        .map_err(|e| Error::Rewrite(e.to_string()))?;
    rewriter.end().map_err(|e| Error::Rewrite(e.to_string()))?;
    String::from_utf8(output).map_err(|e| Error::Rewrite(e.to_string()))
}

/// Inserts `fragment` after any leading doctype and comments, so a document
/// that lacks `<head>` keeps its doctype first and stays in standards mode.
pub(crate) fn insert_after_prologue(html: &str, fragment: &str) -> String {
    let mut at = 0;
    loop {
        let rest = html[at..].trim_start_matches(|ch: char| ch.is_ascii_whitespace() || ch == '\u{feff}');
        let skipped = html.len() - at - rest.len();
        let end = if rest.starts_with("<!--") {
            rest.find("-->").map(|close| close + 3)
        } else if rest
            .get(..9)
            .is_some_and(|head| head.eq_ignore_ascii_case("<!doctype"))
        {
            rest.find('>').map(|close| close + 1)
        } else {
            None
        };
        match end {
            Some(end) => at += skipped + end,
            None => break,
        }
    }
    format!("{}{fragment}{}", &html[..at], &html[at..])
}

/// Where rewritten references point and how links leave the page.
#[derive(Debug, Clone)]
pub struct RewriteTarget<'a> {
    pub page_url: &'a Url,
    pub navigation: NavigationMode,
    pub endpoint: &'a ProxyEndpoint,
}

#[derive(Debug, Default)]
struct DocumentShape {
    marked: bool,
    base_href: Option<String>,
    has_head: bool,
}

fn inspect(html: &str) -> Result<DocumentShape> {
    let marked = Cell::new(false);
    let base_href: RefCell<Option<String>> = RefCell::new(None);
    let has_head = Cell::new(false);

    run_rewriter(
        html,
        Settings {
            element_content_handlers: vec![
                element!("meta[name]", |el| {
                    if el
                        .get_attribute("name")
                        .is_some_and(|name| name.eq_ignore_ascii_case(MARKER_NAME))
                    {
                        marked.set(true);
                    }
                    Ok(())
                }),
                element!("base[href]", |el| {
                    let mut slot = base_href.borrow_mut();
                    if slot.is_none() {
                        *slot = el.get_attribute("href");
                    }
                    Ok(())
                }),
                element!("head", |_el| {
                    has_head.set(true);
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
    )?;

    Ok(DocumentShape {
        marked: marked.get(),
        base_href: base_href.into_inner(),
        has_head: has_head.get(),
    })
}

/// True when `html` already went through [`rewrite`].
pub fn is_rewritten(html: &str) -> Result<bool> {
    Ok(inspect(html)?.marked)
}

/// Resolves `value` against `base`, or `None` when it should stay untouched.
pub fn absolutify(value: &str, base: &Url) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || has_scheme(trimmed, NON_NAVIGABLE_SCHEMES) {
        return None;
    }
    base.join(trimmed).ok().map(String::from)
}

fn has_scheme(value: &str, schemes: &[&str]) -> bool {
    schemes.iter().any(|scheme| {
        value
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

/// Absolutifies every candidate of a `srcset` list, keeping descriptors.
pub fn absolutify_srcset(value: &str, base: &Url) -> String {
    if has_scheme(value.trim(), &["data:"]) {
        return value.to_string();
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|candidate| !candidate.is_empty())
        .map(|candidate| {
            let (url, descriptor) = match candidate.split_once(char::is_whitespace) {
                Some((url, descriptor)) => (url, descriptor.trim()),
                None => (candidate, ""),
            };
            let url = absolutify(url, base).unwrap_or_else(|| url.to_string());
            if descriptor.is_empty() {
                url
            } else {
                format!("{url} {descriptor}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn refresh_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r#"(?i)^\s*(\d+(?:\.\d+)?)\s*[;,]\s*(?:url\s*=\s*)?(['"]?)(.*?)\2\s*$"#).ok()
        })
        .as_ref()
}

/// Splits a meta refresh `content` into delay and target.
pub fn parse_refresh(content: &str) -> Option<(String, String)> {
    let captures = refresh_pattern()?.captures(content).ok()??;
    let delay = captures.get(1)?.as_str().to_string();
    let target = captures.get(3)?.as_str().trim().to_string();
    (!target.is_empty()).then_some((delay, target))
}

fn add_rel_token(rel: Option<String>, token: &str) -> String {
    let rel = rel.unwrap_or_default();
    if rel.split_whitespace().any(|existing| existing.eq_ignore_ascii_case(token)) {
        return rel;
    }
    if rel.trim().is_empty() {
        token.to_string()
    } else {
        format!("{} {token}", rel.trim())
    }
}

impl RewriteTarget<'_> {
    fn navigation_target(&self, url: &Url) -> String {
        match self.navigation {
            NavigationMode::Routed => self.endpoint.wrap(url),
            NavigationMode::Bridged => url.to_string(),
        }
    }

    fn head_prefix(&self, shape: &DocumentShape, doc_base: &Url) -> String {
        let mut prefix = String::new();
        if shape.base_href.is_none() {
            prefix.push_str(&format!(
                "<base href=\"{}\" target=\"_self\">",
                escape_attr(doc_base.as_str())
            ));
        }
        prefix.push_str(&format!(
            "<meta name=\"{MARKER_NAME}\" content=\"1\" data-navigation=\"{}\">",
            self.navigation.as_str()
        ));
        prefix
    }
}

/// Rewrites `html` fetched from `target.page_url`. Already-rewritten input is
/// returned unchanged.
pub fn rewrite(html: &str, target: &RewriteTarget<'_>) -> Result<String> {
    let shape = inspect(html)?;
    if shape.marked {
        return Ok(html.to_string());
    }

    let doc_base = shape
        .base_href
        .as_deref()
        .and_then(|href| target.page_url.join(href.trim()).ok())
        .unwrap_or_else(|| target.page_url.clone());
    let head_prefix = target.head_prefix(&shape, &doc_base);
    let synthesize_head = !shape.has_head;

    let keeps_base = shape.base_href.is_some();
    let base_kept = Cell::new(false);
    let head_done = Cell::new(false);
    let html_done = Cell::new(false);

    let output = run_rewriter(
        html,
        Settings {
            element_content_handlers: vec![
                element!("head", |el| {
                    if !head_done.get() {
                        el.prepend(&head_prefix, ContentType::Html);
                        head_done.set(true);
                    }
                    Ok(())
                }),
                element!("html", |el| {
                    if synthesize_head && !html_done.get() {
                        el.prepend(&format!("<head>{head_prefix}</head>"), ContentType::Html);
                        html_done.set(true);
                    }
                    Ok(())
                }),
                element!("base", |el| {
                    // Only the base the document URL was derived from survives.
                    if keeps_base && !base_kept.get() && el.has_attribute("href") {
                        el.set_attribute("target", "_self")?;
                        base_kept.set(true);
                    } else {
                        el.remove();
                    }
                    Ok(())
                }),
                element!(SRC_SELECTOR, |el| {
                    if let Some(value) = el.get_attribute("src") {
                        if let Some(absolute) = absolutify(&value, &doc_base) {
                            el.set_attribute("src", &absolute)?;
                        }
                    }
                    Ok(())
                }),
                element!("video[poster]", |el| {
                    if let Some(value) = el.get_attribute("poster") {
                        if let Some(absolute) = absolutify(&value, &doc_base) {
                            el.set_attribute("poster", &absolute)?;
                        }
                    }
                    Ok(())
                }),
                element!("img[srcset], source[srcset]", |el| {
                    if let Some(value) = el.get_attribute("srcset") {
                        el.set_attribute("srcset", &absolutify_srcset(&value, &doc_base))?;
                    }
                    Ok(())
                }),
                element!("link[href]", |el| {
                    if let Some(value) = el.get_attribute("href") {
                        if let Some(absolute) = absolutify(&value, &doc_base) {
                            el.set_attribute("href", &absolute)?;
                        }
                    }
                    Ok(())
                }),
                element!("a[href], area[href]", |el| {
                    let Some(href) = el.get_attribute("href") else {
                        return Ok(());
                    };
                    if is_excluded_href(&href) {
                        return Ok(());
                    }
                    if let Some(resolved) = doc_base.join(href.trim()).ok().filter(|url| {
                        matches!(url.scheme(), "http" | "https")
                    }) {
                        el.set_attribute("href", &target.navigation_target(&resolved))?;
                    }
                    if el
                        .get_attribute("target")
                        .is_some_and(|value| !value.trim().eq_ignore_ascii_case("_self"))
                    {
                        el.remove_attribute("target");
                    }
                    el.set_attribute("rel", &add_rel_token(el.get_attribute("rel"), "noopener"))?;
                    Ok(())
                }),
                element!("meta[http-equiv]", |el| {
                    let is_refresh = el
                        .get_attribute("http-equiv")
                        .is_some_and(|value| value.trim().eq_ignore_ascii_case("refresh"));
                    if !is_refresh {
                        return Ok(());
                    }
                    let Some((delay, refresh_target)) =
                        el.get_attribute("content").as_deref().and_then(parse_refresh)
                    else {
                        return Ok(());
                    };
                    if let Ok(resolved) = doc_base.join(&refresh_target) {
                        let routed = target.navigation_target(&resolved);
                        el.set_attribute("content", &format!("{delay};url={routed}"))?;
                    }
                    Ok(())
                }),
                element!("form", |el| {
                    let action = el.get_attribute("action").unwrap_or_default();
                    let resolved = if action.trim().is_empty() {
                        Some(target.page_url.clone())
                    } else {
                        doc_base.join(action.trim()).ok()
                    };
                    let Some(resolved) = resolved else {
                        el.set_attribute("method", "get")?;
                        el.remove_attribute("target");
                        return Ok(());
                    };
                    match target.navigation {
                        NavigationMode::Bridged => {
                            el.set_attribute("action", resolved.as_str())?;
                            el.set_attribute("method", "get")?;
                            el.remove_attribute("target");
                        }
                        NavigationMode::Routed => {
                            // GET submission drops the action's query, so the
                            // proxy parameters travel as hidden fields.
                            let endpoint = target.endpoint;
                            let action = match endpoint.origin() {
                                Some(origin) => origin
                                    .join(endpoint.path())
                                    .map(String::from)
                                    .unwrap_or_else(|_| endpoint.path().to_string()),
                                None => endpoint.path().to_string(),
                            };
                            el.set_attribute("action", &action)?;
                            el.set_attribute("method", "get")?;
                            el.remove_attribute("target");
                            let mut hidden = String::new();
                            for (key, value) in endpoint
                                .fixed_params()
                                .iter()
                                .map(|(k, v)| (k.as_str(), v.as_str()))
                                .chain([(endpoint.param(), resolved.as_str())])
                            {
                                hidden.push_str(&format!(
                                    "<input type=\"hidden\" name=\"{}\" value=\"{}\">",
                                    escape_attr(key),
                                    escape_attr(value)
                                ));
                            }
                            el.prepend(&hidden, ContentType::Html);
                        }
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
    )?;

    if synthesize_head && !html_done.get() && !head_done.get() {
        return Ok(insert_after_prologue(&output, &format!("<head>{head_prefix}</head>")));
    }
    Ok(output)
}
