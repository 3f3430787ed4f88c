//! Anchor Picker: lets the user click an element of the rendered page to
//! choose where the widget is mounted.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dom::{Dom, NodeId};
use crate::selector::css_escape;

/// Ancestor segments kept in a computed selector.
pub const MAX_SELECTOR_SEGMENTS: usize = 6;

/// Opaque CSS selector naming the anchor element. Best effort: it may match a
/// different element, or nothing, after the page changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchorSelector(String);

impl AnchorSelector {
    /// `None` for blank input.
    pub fn new(selector: impl Into<String>) -> Option<Self> {
        let selector = selector.into();
        let trimmed = selector.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AnchorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PickerState {
    #[default]
    Idle,
    Picking,
}

#[derive(Debug, Clone, Default)]
pub struct AnchorPicker {
    state: PickerState,
    selector: Option<AnchorSelector>,
}

impl AnchorPicker {
    pub fn new(selector: Option<AnchorSelector>) -> Self {
        Self {
            state: PickerState::Idle,
            selector,
        }
    }

    pub fn state(&self) -> PickerState {
        self.state
    }

    pub fn is_picking(&self) -> bool {
        self.state == PickerState::Picking
    }

    pub fn selector(&self) -> Option<&AnchorSelector> {
        self.selector.as_ref()
    }

    /// Direct user edit of the selector.
    pub fn set_selector(&mut self, selector: Option<AnchorSelector>) {
        self.selector = selector;
    }

    pub fn activate(&mut self) {
        self.state = PickerState::Picking;
    }

    /// Leaves picking mode without a click; the prior selector is kept.
    pub fn deactivate(&mut self) {
        self.state = PickerState::Idle;
    }

    /// Consumes a click while picking. Returns the newly emitted selector, or
    /// `None` when idle (the click belongs to the page).
    pub fn handle_click(&mut self, dom: &Dom, target: NodeId) -> Option<AnchorSelector> {
        if !self.is_picking() {
            return None;
        }
        self.state = PickerState::Idle;
        let selector = compute_selector(dom, target)?;
        self.selector = Some(selector.clone());
        Some(selector)
    }
}

/// Short, best-effort-unique selector for `node`: its own id when it has
/// one, otherwise up to [`MAX_SELECTOR_SEGMENTS`] `tag.class:nth-child(i)`
/// segments, stopping at the first ancestor with an id.
pub fn compute_selector(dom: &Dom, node: NodeId) -> Option<AnchorSelector> {
    let element = dom.element(node)?;
    if let Some(id) = element.id() {
        return AnchorSelector::new(format!("#{}", css_escape(id)));
    }

    let mut parts: Vec<String> = Vec::new();
    let mut cursor = Some(node);
    while let Some(current) = cursor {
        if parts.len() >= MAX_SELECTOR_SEGMENTS {
            break;
        }
        let Some(element) = dom.element(current) else {
            break;
        };
        let tag = element.tag_name().to_ascii_lowercase();
        if let Some(id) = element.id() {
            parts.push(format!("{tag}#{}", css_escape(id)));
            break;
        }
        match dom.parent_element(current) {
            Some(parent) => {
                let index = dom.element_index(current).unwrap_or(1);
                let class = element
                    .first_class()
                    .map(|class| format!(".{}", css_escape(class)))
                    .unwrap_or_default();
                parts.push(format!("{tag}{class}:nth-child({index})"));
                cursor = Some(parent);
            }
            None => {
                parts.push(tag);
                break;
            }
        }
    }
    parts.reverse();
    AnchorSelector::new(parts.join(" > "))
}
