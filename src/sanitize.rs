//! Removes what stops a fetched page from rendering inside the editor frame.

use std::cell::Cell;

use lol_html::html_content::ContentType;
use lol_html::{Settings, element};

use crate::Result;
use crate::config::ScriptPolicy;
use crate::rewrite::{insert_after_prologue, run_rewriter};

/// Injected into snapshot documents: the copy is read-only and fills the frame.
pub const SNAPSHOT_STYLE: &str = "<style data-reco=\"snapshot\">html, body { height: 100%; } \
body { margin: 0 !important; } * { pointer-events: none !important; }</style>";

const FRAMING_DIRECTIVES: &[&str] = &[
    "content-security-policy",
    "content-security-policy-report-only",
    "x-frame-options",
];

pub fn is_framing_directive(http_equiv: &str) -> bool {
    let http_equiv = http_equiv.trim();
    FRAMING_DIRECTIVES
        .iter()
        .any(|directive| http_equiv.eq_ignore_ascii_case(directive))
}

/// Drops framing meta directives. Under [`ScriptPolicy::Snapshot`] it also
/// strips scripts and inline `on*` handlers and injects [`SNAPSHOT_STYLE`].
pub fn sanitize(html: &str, scripts: ScriptPolicy) -> Result<String> {
    let snapshot = scripts == ScriptPolicy::Snapshot;
    let styled = Cell::new(false);

    let output = run_rewriter(
        html,
        Settings {
            element_content_handlers: vec![
                element!("meta[http-equiv]", |el| {
                    if el
                        .get_attribute("http-equiv")
                        .is_some_and(|value| is_framing_directive(&value))
                    {
                        el.remove();
                    }
                    Ok(())
                }),
                element!("script", |el| {
                    if snapshot {
                        el.remove();
                    }
                    Ok(())
                }),
                element!("*", |el| {
                    if snapshot {
                        let handlers: Vec<String> = el
                            .attributes()
                            .iter()
                            .map(|attr| attr.name())
                            .filter(|name| name.starts_with("on"))
                            .collect();
                        for name in handlers {
                            el.remove_attribute(&name);
                        }
                    }
                    Ok(())
                }),
                element!("head", |el| {
                    if snapshot && !styled.get() {
                        el.prepend(SNAPSHOT_STYLE, ContentType::Html);
                        styled.set(true);
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
    )?;

    if snapshot && !styled.get() {
        return Ok(insert_after_prologue(&output, SNAPSHOT_STYLE));
    }
    Ok(output)
}
