//! Editor settings persisted as one JSON file.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::feed::PriceMode;
use crate::mount::AnchorPlacement;
use crate::picker::AnchorSelector;
use crate::widget::{BadgeOverrides, DisplayFlags, ProductCount};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EditorSettings {
    pub feed_url: String,
    pub preview_url: String,
    pub show_preview: bool,
    pub price_mode: PriceMode,
    pub product_count: ProductCount,
    #[serde(flatten)]
    pub display: DisplayFlags,
    pub badge_overrides: BadgeOverrides,
    pub anchor_selector: String,
    pub anchor_placement: AnchorPlacement,
}

impl EditorSettings {
    /// The saved selector, if it is not blank.
    pub fn anchor(&self) -> Option<AnchorSelector> {
        AnchorSelector::new(self.anchor_selector.as_str())
    }

    pub fn set_anchor(&mut self, selector: Option<&AnchorSelector>) {
        self.anchor_selector = selector.map(|s| s.as_str().to_string()).unwrap_or_default();
    }
}

/// Settings loaded once at startup and written back after every change.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: EditorSettings,
}

impl SettingsStore {
    /// A missing or unreadable file yields the defaults.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                debug!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
                EditorSettings::default()
            }),
            Err(e) if e.kind() == IoErrorKind::NotFound => EditorSettings::default(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
                EditorSettings::default()
            }
        };
        Self { path, settings }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> &EditorSettings {
        &self.settings
    }

    /// Applies `change` and persists the result when anything differs.
    pub fn update(&mut self, change: impl FnOnce(&mut EditorSettings)) -> Result<bool> {
        let mut next = self.settings.clone();
        change(&mut next);
        if next == self.settings {
            return Ok(false);
        }
        self.settings = next;
        self.save()?;
        Ok(true)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Settings(format!("{}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(&self.settings)
            .map_err(|e| Error::Settings(e.to_string()))?;
        fs::write(&self.path, json)
            .map_err(|e| Error::Settings(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}
