//! Widget theme tokens and their CSS custom-property rendering.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Static widget stylesheet; every colour and size reads a `--rs-*` variable.
pub const WIDGET_CSS: &str = include_str!("widget.css");

pub const DEFAULT_FONT_FAMILY: &str = r#"ui-sans-serif, system-ui, -apple-system, "Segoe UI", Roboto, Arial, "Noto Sans", "Apple Color Emoji", "Segoe UI Emoji""#;

/// A radius given either as pixels or as a CSS length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CssLength {
    Px(f64),
    Raw(String),
}

impl fmt::Display for CssLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Px(value) => write!(f, "{value}px"),
            Self::Raw(raw) => {
                let raw = raw.trim();
                if raw.parse::<f64>().is_ok() {
                    write!(f, "{raw}px")
                } else {
                    f.write_str(raw)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThemeConfig {
    pub accent: String,
    pub card_bg: String,
    pub card_border: String,
    pub title_color: String,
    pub text: String,
    pub price: String,
    pub radius: CssLength,
    pub shadow: String,
    pub dot: String,
    pub arrow_bg: String,
    pub badge_bg: String,
    pub badge_color: String,
    pub font_family: String,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            accent: "#111827".into(),
            card_bg: "#ffffff".into(),
            card_border: "rgba(0,0,0,.06)".into(),
            title_color: "#1f2937".into(),
            text: "#374151".into(),
            price: "#111827".into(),
            radius: CssLength::Px(12.0),
            shadow: "0 10px 30px rgba(0,0,0,.08)".into(),
            dot: "#d1d5db".into(),
            arrow_bg: "#ffffff".into(),
            badge_bg: "rgba(0,0,0,.8)".into(),
            badge_color: "#ffffff".into(),
            font_family: DEFAULT_FONT_FAMILY.into(),
        }
    }
}

impl ThemeConfig {
    fn vars(&self) -> [(&'static str, String); 13] {
        [
            ("--rs-accent", self.accent.clone()),
            ("--rs-card-bg", self.card_bg.clone()),
            ("--rs-card-border", self.card_border.clone()),
            ("--rs-title", self.title_color.clone()),
            ("--rs-text", self.text.clone()),
            ("--rs-price", self.price.clone()),
            ("--rs-radius", self.radius.to_string()),
            ("--rs-shadow", self.shadow.clone()),
            ("--rs-dot", self.dot.clone()),
            ("--rs-arrow-bg", self.arrow_bg.clone()),
            ("--rs-badge-bg", self.badge_bg.clone()),
            ("--rs-badge-color", self.badge_color.clone()),
            ("--rs-font", self.font_family.clone()),
        ]
    }

    /// Variable block for the shadow host.
    pub fn to_css_vars(&self) -> String {
        let mut out = String::from(":host{\n");
        for (name, value) in self.vars() {
            out.push_str("  ");
            out.push_str(name);
            out.push(':');
            out.push_str(&css_value(&value));
            out.push_str(";\n");
        }
        out.push_str("}\n");
        out
    }
}

// Theme values land inside a <style> block; drop anything that could end
// the declaration, the rule or the element.
fn css_value(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !matches!(ch, '{' | '}' | ';' | '<' | '>' | '\n' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Any subset of [`ThemeConfig`]; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThemePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_bg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_border: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<CssLength>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arrow_bg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge_bg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
}

fn merge<T: PartialEq + Clone>(slot: &mut T, value: &Option<T>) -> bool {
    match value {
        Some(value) if slot != value => {
            *slot = value.clone();
            true
        }
        _ => false,
    }
}

impl ThemePatch {
    /// Applies the patch; true only when some value actually changed.
    pub fn apply(&self, theme: &mut ThemeConfig) -> bool {
        let mut changed = false;
        changed |= merge(&mut theme.accent, &self.accent);
        changed |= merge(&mut theme.card_bg, &self.card_bg);
        changed |= merge(&mut theme.card_border, &self.card_border);
        changed |= merge(&mut theme.title_color, &self.title_color);
        changed |= merge(&mut theme.text, &self.text);
        changed |= merge(&mut theme.price, &self.price);
        changed |= merge(&mut theme.radius, &self.radius);
        changed |= merge(&mut theme.shadow, &self.shadow);
        changed |= merge(&mut theme.dot, &self.dot);
        changed |= merge(&mut theme.arrow_bg, &self.arrow_bg);
        changed |= merge(&mut theme.badge_bg, &self.badge_bg);
        changed |= merge(&mut theme.badge_color, &self.badge_color);
        changed |= merge(&mut theme.font_family, &self.font_family);
        changed
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Owner of the current theme. Subscribers are notified only when a patch
/// changes at least one value.
#[derive(Debug)]
pub struct ThemeStore {
    sender: watch::Sender<ThemeConfig>,
}

impl Default for ThemeStore {
    fn default() -> Self {
        Self::new(ThemeConfig::default())
    }
}

impl ThemeStore {
    pub fn new(theme: ThemeConfig) -> Self {
        let (sender, _) = watch::channel(theme);
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<ThemeConfig> {
        self.sender.subscribe()
    }

    pub fn current(&self) -> ThemeConfig {
        self.sender.borrow().clone()
    }

    pub fn patch(&self, patch: &ThemePatch) -> bool {
        self.sender.send_if_modified(|theme| patch.apply(theme))
    }

    pub fn replace(&self, next: ThemeConfig) -> bool {
        self.sender.send_if_modified(|theme| {
            if *theme == next {
                return false;
            }
            *theme = next;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_vars_match_the_stock_theme() {
        let css = ThemeConfig::default().to_css_vars();
        assert!(css.starts_with(":host{\n"));
        assert!(css.contains("  --rs-accent:#111827;\n"));
        assert!(css.contains("  --rs-radius:12px;\n"));
        assert!(css.contains("  --rs-shadow:0 10px 30px rgba(0,0,0,.08);\n"));
        assert!(css.contains(r#"--rs-font:ui-sans-serif, system-ui"#));
        assert_eq!(css.matches(';').count(), 13);
    }

    #[test]
    fn radius_accepts_numbers_and_lengths() -> serde_json::Result<()> {
        let theme: ThemeConfig = serde_json::from_str(r#"{"radius": 8}"#)?;
        assert_eq!(theme.radius.to_string(), "8px");
        let theme: ThemeConfig = serde_json::from_str(r#"{"radius": "14"}"#)?;
        assert_eq!(theme.radius.to_string(), "14px");
        let theme: ThemeConfig = serde_json::from_str(r#"{"radius": "1.5rem"}"#)?;
        assert_eq!(theme.radius.to_string(), "1.5rem");
        assert_eq!(theme.accent, "#111827");
        Ok(())
    }

    #[test]
    fn values_cannot_escape_the_style_block() {
        let theme = ThemeConfig {
            accent: "red;}</style><script>x()</script>".into(),
            ..ThemeConfig::default()
        };
        let css = theme.to_css_vars();
        assert!(!css.contains("</style"));
        assert_eq!(css.matches('}').count(), 1);
    }

    #[test]
    fn patches_report_real_changes_only() -> serde_json::Result<()> {
        let patch: ThemePatch = serde_json::from_str(r##"{"accent":"#ff0000","cardBg":"#ffffff"}"##)?;
        let mut theme = ThemeConfig::default();
        assert!(patch.apply(&mut theme));
        assert_eq!(theme.accent, "#ff0000");
        assert!(!patch.apply(&mut theme));
        assert!(ThemePatch::default().is_empty());
        assert_eq!(
            serde_json::to_string(&ThemePatch {
                badge_color: Some("#000".into()),
                ..ThemePatch::default()
            })?,
            r##"{"badgeColor":"#000"}"##
        );
        Ok(())
    }

    #[test]
    fn store_notifies_only_on_change() {
        let store = ThemeStore::default();
        let mut receiver = store.subscribe();
        assert!(!receiver.has_changed().unwrap_or(true));

        let same = ThemePatch {
            accent: Some("#111827".into()),
            ..ThemePatch::default()
        };
        assert!(!store.patch(&same));
        assert!(!receiver.has_changed().unwrap_or(true));

        let dot = ThemePatch {
            dot: Some("#000000".into()),
            ..ThemePatch::default()
        };
        assert!(store.patch(&dot));
        assert!(receiver.has_changed().unwrap_or(false));
        assert_eq!(receiver.borrow_and_update().dot, "#000000");
        assert_eq!(store.current().dot, "#000000");
    }
}
