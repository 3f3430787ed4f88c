//! In-process model of the rendered preview.
//!
//! A [`Frame`] owns the DOM of one proxied document together with the pieces
//! of browser behaviour the preview depends on: event dispatch through
//! capture, target and bubble phases, link and form default actions, the
//! session history stack, and the two listeners the preview installs at the
//! document root (the navigation bridge and the anchor picker).

use std::collections::HashMap;

use tracing::{debug, trace};
use url::Url;

use crate::bridge::{BridgeDispatch, NavigationBridge, is_excluded_href};
use crate::config::{ProxyConfig, ScriptPolicy};
use crate::dom::{Dom, NodeId, NodeType};
use crate::fetch::ProxiedDocument;
use crate::html::parse_html;
use crate::picker::{AnchorPicker, AnchorSelector};
use crate::{Error, Result};

const LINK_SELECTOR: &str = "a[href], area[href]";
const SUBMITTER_SELECTOR: &str = "button, input[type=\"submit\"], input[type=\"image\"]";

pub const CAPTURING_PHASE: i32 = 1;
pub const AT_TARGET: i32 = 2;
pub const BUBBLING_PHASE: i32 = 3;

/// Scripted page behaviour attached with [`Frame::add_listener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    PushState(Option<String>),
    ReplaceState(Option<String>),
    AssignLocation(String),
    ReplaceLocation(String),
    PreventDefault,
    StopPropagation,
    StopImmediatePropagation,
    /// Appends the label to the frame's event log.
    #[cfg(test)]
    Log(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenerHandler {
    Picker,
    Bridge,
    Page(PageAction),
}

impl ListenerHandler {
    // Preview-owned handlers behave like one shared callback reference.
    fn is_singleton(&self) -> bool {
        matches!(self, Self::Picker | Self::Bridge)
    }
}

#[derive(Debug, Clone)]
struct Listener {
    capture: bool,
    handler: ListenerHandler,
}

#[derive(Debug, Default)]
struct ListenerStore {
    map: HashMap<NodeId, HashMap<String, Vec<Listener>>>,
}

impl ListenerStore {
    fn add(&mut self, node_id: NodeId, event: &str, listener: Listener, first: bool) {
        let listeners = self
            .map
            .entry(node_id)
            .or_default()
            .entry(event.to_string())
            .or_default();

        if listener.handler.is_singleton()
            && listeners.iter().any(|existing| {
                existing.capture == listener.capture && existing.handler == listener.handler
            })
        {
            return;
        }

        if first {
            listeners.insert(0, listener);
        } else {
            listeners.push(listener);
        }
    }

    fn get(&self, node_id: NodeId, event: &str, capture: bool) -> Vec<Listener> {
        self.map
            .get(&node_id)
            .and_then(|events| events.get(event))
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|listener| listener.capture == capture)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct EventState {
    pub event_type: String,
    pub target: NodeId,
    pub current_target: NodeId,
    pub event_phase: i32,
    pub bubbles: bool,
    pub cancelable: bool,
    pub default_prevented: bool,
    pub propagation_stopped: bool,
    pub immediate_propagation_stopped: bool,
    /// Button or input that triggered a `submit`.
    pub submitter: Option<NodeId>,
}

impl EventState {
    pub fn new(event_type: &str, target: NodeId) -> Self {
        Self {
            event_type: event_type.to_string(),
            target,
            current_target: target,
            event_phase: AT_TARGET,
            bubbles: true,
            cancelable: true,
            default_prevented: false,
            propagation_stopped: false,
            immediate_propagation_stopped: false,
            submitter: None,
        }
    }

    fn prevent_default(&mut self) {
        if self.cancelable {
            self.default_prevented = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationNavigationKind {
    Assign,
    Replace,
    Link,
    Form,
    Reload,
}

/// A navigation the frame performed itself, i.e. one nothing intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationNavigation {
    pub kind: LocationNavigationKind,
    pub from: Url,
    pub to: Url,
}

impl LocationNavigation {
    pub fn is_hash_only(&self) -> bool {
        is_hash_only_navigation(&self.from, &self.to)
    }
}

/// Same document, different fragment.
pub fn is_hash_only_navigation(from: &Url, to: &Url) -> bool {
    from[..url::Position::AfterQuery] == to[..url::Position::AfterQuery]
        && from.fragment() != to.fragment()
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    url: Url,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClickOutcome {
    pub target: NodeId,
    pub default_prevented: bool,
    /// Selector emitted when the click ended a picking session.
    pub picked: Option<AnchorSelector>,
}

#[derive(Debug)]
pub struct Frame {
    dom: Dom,
    listeners: ListenerStore,
    document_url: Url,
    history_entries: Vec<HistoryEntry>,
    history_index: usize,
    location_navigations: Vec<LocationNavigation>,
    bridge: Option<NavigationBridge>,
    picker: AnchorPicker,
    picked: Option<AnchorSelector>,
    #[cfg(test)]
    event_log: Vec<String>,
}

impl Frame {
    pub fn new(dom: Dom, document_url: Url) -> Self {
        let mut frame = Self {
            dom,
            listeners: ListenerStore::default(),
            history_entries: vec![HistoryEntry {
                url: document_url.clone(),
            }],
            document_url,
            history_index: 0,
            location_navigations: Vec::new(),
            bridge: None,
            picker: AnchorPicker::default(),
            picked: None,
            #[cfg(test)]
            event_log: Vec::new(),
        };
        let root = frame.dom.root();
        frame.listeners.add(
            root,
            "click",
            Listener {
                capture: true,
                handler: ListenerHandler::Picker,
            },
            true,
        );
        frame
    }

    pub fn from_html(html: &str, document_url: Url) -> Result<Self> {
        Ok(Self::new(parse_html(html)?, document_url))
    }

    /// Loads a proxied document. Interactive documents carry the bridge.
    pub fn from_document(document: &ProxiedDocument, config: &ProxyConfig) -> Result<Self> {
        let mut frame = Self::from_html(&document.html, document.base_url.clone())?;
        if document.scripts == ScriptPolicy::Interactive {
            frame.install_bridge(config);
        }
        Ok(frame)
    }

    pub fn dom(&self) -> &Dom {
        &self.dom
    }

    pub fn dom_mut(&mut self) -> &mut Dom {
        &mut self.dom
    }

    pub fn document_url(&self) -> &Url {
        &self.document_url
    }

    /// Document base URL: the first `<base href>` resolved against the
    /// document URL.
    pub fn base_url(&self) -> Url {
        self.dom
            .query_selector("base[href]")
            .ok()
            .flatten()
            .and_then(|base| self.dom.attr(base, "href"))
            .and_then(|href| self.document_url.join(href.trim()).ok())
            .unwrap_or_else(|| self.document_url.clone())
    }

    /// Installs the bridge listeners once; later calls keep the first bridge.
    pub fn install_bridge(&mut self, config: &ProxyConfig) {
        if self.bridge.is_some() {
            return;
        }
        self.bridge = Some(NavigationBridge::new(config));
        let root = self.dom.root();
        for event in ["click", "submit"] {
            self.listeners.add(
                root,
                event,
                Listener {
                    capture: true,
                    handler: ListenerHandler::Bridge,
                },
                false,
            );
        }
    }

    pub fn bridge(&self) -> Option<&NavigationBridge> {
        self.bridge.as_ref()
    }

    pub fn add_listener(&mut self, node: NodeId, event: &str, capture: bool, action: PageAction) {
        self.listeners.add(
            node,
            event,
            Listener {
                capture,
                handler: ListenerHandler::Page(action),
            },
            false,
        );
    }

    #[cfg(test)]
    pub(crate) fn event_log(&self) -> &[String] {
        &self.event_log
    }

    pub fn picker(&self) -> &AnchorPicker {
        &self.picker
    }

    pub fn begin_picking(&mut self) {
        self.picker.activate();
    }

    pub fn cancel_picking(&mut self) {
        self.picker.deactivate();
    }

    pub fn take_navigation_dispatches(&mut self) -> Vec<BridgeDispatch> {
        self.bridge
            .as_mut()
            .map(NavigationBridge::take_dispatches)
            .unwrap_or_default()
    }

    pub fn take_location_navigations(&mut self) -> Vec<LocationNavigation> {
        std::mem::take(&mut self.location_navigations)
    }

    pub fn history_len(&self) -> usize {
        self.history_entries.len()
    }

    pub fn history_index(&self) -> usize {
        self.history_index
    }

    pub fn dispatch_event(&mut self, target: NodeId, event_type: &str) -> Result<EventState> {
        self.dispatch_prepared_event(EventState::new(event_type, target))
    }

    fn dispatch_prepared_event(&mut self, mut event: EventState) -> Result<EventState> {
        let target = event.target;
        if !self.dom.is_valid_node(target) {
            return Err(Error::Internal(format!("dispatch to unknown node {target:?}")));
        }

        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(node) = cursor {
            path.push(node);
            cursor = self.dom.parent(node).or_else(|| self.dom.shadow_host(node));
        }
        path.reverse();

        // Capture phase.
        for node in &path[..path.len() - 1] {
            event.event_phase = CAPTURING_PHASE;
            event.current_target = *node;
            self.invoke_listeners(*node, &mut event, true)?;
            if event.propagation_stopped {
                return Ok(self.event_done(event, "propagation_stopped"));
            }
        }

        // Target phase: capture listeners first.
        event.event_phase = AT_TARGET;
        event.current_target = target;
        self.invoke_listeners(target, &mut event, true)?;
        if event.propagation_stopped {
            return Ok(self.event_done(event, "propagation_stopped"));
        }
        self.invoke_listeners(target, &mut event, false)?;
        if event.propagation_stopped {
            return Ok(self.event_done(event, "propagation_stopped"));
        }

        // Bubble phase.
        if event.bubbles {
            for node in path[..path.len() - 1].iter().rev() {
                event.event_phase = BUBBLING_PHASE;
                event.current_target = *node;
                self.invoke_listeners(*node, &mut event, false)?;
                if event.propagation_stopped {
                    return Ok(self.event_done(event, "propagation_stopped"));
                }
            }
        }

        Ok(self.event_done(event, "completed"))
    }

    fn event_done(&self, event: EventState, outcome: &str) -> EventState {
        trace!(
            event = %event.event_type,
            target = ?event.target,
            default_prevented = event.default_prevented,
            outcome,
            "event dispatched"
        );
        event
    }

    fn invoke_listeners(&mut self, node: NodeId, event: &mut EventState, capture: bool) -> Result<()> {
        for listener in self.listeners.get(node, &event.event_type, capture) {
            self.run_handler(&listener.handler, event)?;
            if event.immediate_propagation_stopped {
                break;
            }
        }
        Ok(())
    }

    fn run_handler(&mut self, handler: &ListenerHandler, event: &mut EventState) -> Result<()> {
        match handler {
            ListenerHandler::Picker => {
                if !self.picker.is_picking() {
                    return Ok(());
                }
                // Clicks inside an isolated subtree (the widget itself) are
                // swallowed without ending the picking session.
                if !self.is_in_shadow_tree(event.target) {
                    self.picked = self.picker.handle_click(&self.dom, event.target);
                }
                event.prevent_default();
                event.propagation_stopped = true;
                event.immediate_propagation_stopped = true;
            }
            ListenerHandler::Bridge => match event.event_type.as_str() {
                "click" => self.bridge_link_click(event)?,
                "submit" => self.bridge_form_submit(event)?,
                _ => {}
            },
            ListenerHandler::Page(action) => self.run_page_action(action, event)?,
        }
        Ok(())
    }

    fn run_page_action(&mut self, action: &PageAction, event: &mut EventState) -> Result<()> {
        match action {
            PageAction::PushState(url) => self.push_state(url.as_deref())?,
            PageAction::ReplaceState(url) => self.replace_state(url.as_deref())?,
            PageAction::AssignLocation(url) => self.location_assign(url)?,
            PageAction::ReplaceLocation(url) => self.location_replace(url)?,
            PageAction::PreventDefault => event.prevent_default(),
            PageAction::StopPropagation => event.propagation_stopped = true,
            PageAction::StopImmediatePropagation => {
                event.propagation_stopped = true;
                event.immediate_propagation_stopped = true;
            }
            #[cfg(test)]
            PageAction::Log(label) => self.event_log.push(label.clone()),
        }
        Ok(())
    }

    fn bridge_link_click(&mut self, event: &mut EventState) -> Result<()> {
        if event.default_prevented {
            return Ok(());
        }
        let Some(link) = self.dom.closest(event.target, LINK_SELECTOR)? else {
            return Ok(());
        };
        if self.dom.element(link).is_some_and(|el| el.has_attr("download")) {
            return Ok(());
        }
        let href = self.dom.attr(link, "href").unwrap_or_default().to_string();
        let base = self.base_url();
        if let Some(bridge) = self.bridge.as_mut() {
            if bridge.on_link_click(&href, &base) {
                event.prevent_default();
            }
        }
        Ok(())
    }

    fn bridge_form_submit(&mut self, event: &mut EventState) -> Result<()> {
        if event.default_prevented || !self.dom.is_tag(event.target, "form") {
            return Ok(());
        }
        let submission = self.form_submission(event.target, event.submitter)?;
        if !submission.is_get {
            return Ok(());
        }
        let Some(bridge) = self.bridge.as_mut() else {
            return Ok(());
        };
        if let Some(url) = bridge.form_target(&submission.action, &submission.fields) {
            if bridge.on_form_submit(&url) {
                event.prevent_default();
            }
        }
        Ok(())
    }

    /// Clicks `node` (text nodes click their parent element) and runs the
    /// link or submit default unless a listener prevented it.
    pub fn click(&mut self, node: NodeId) -> Result<ClickOutcome> {
        let target = match self.dom.node_type(node) {
            Some(NodeType::Element(_)) => node,
            Some(_) => self
                .dom
                .parent_element(node)
                .ok_or_else(|| Error::Internal(format!("click on detached node {node:?}")))?,
            None => return Err(Error::Internal(format!("click on unknown node {node:?}"))),
        };

        self.picked = None;
        let event = self.dispatch_event(target, "click")?;
        let picked = self.picked.take();

        if !event.default_prevented {
            self.run_click_default(target)?;
        }

        Ok(ClickOutcome {
            target,
            default_prevented: event.default_prevented,
            picked,
        })
    }

    pub fn click_selector(&mut self, selector: &str) -> Result<ClickOutcome> {
        let node = self
            .dom
            .query_selector(selector)?
            .ok_or_else(|| Error::SelectorNotFound(selector.to_string()))?;
        self.click(node)
    }

    fn run_click_default(&mut self, target: NodeId) -> Result<()> {
        if let Some(link) = self.dom.closest(target, LINK_SELECTOR)? {
            return self.follow_link(link);
        }
        let Some(submitter) = self.dom.closest(target, SUBMITTER_SELECTOR)? else {
            return Ok(());
        };
        if !self.is_submit_button(submitter) {
            return Ok(());
        }
        if let Some(form) = self.dom.closest(submitter, "form")? {
            self.submit_with(form, Some(submitter))?;
        }
        Ok(())
    }

    fn follow_link(&mut self, link: NodeId) -> Result<()> {
        let href = self.dom.attr(link, "href").unwrap_or_default().trim().to_string();
        if is_excluded_href(&href) && !href.starts_with('#') {
            debug!(href = %href, "link has no navigable target");
            return Ok(());
        }
        let Ok(to) = self.base_url().join(&href) else {
            return Ok(());
        };
        self.navigate_location(to, LocationNavigationKind::Link);
        Ok(())
    }

    fn is_submit_button(&self, node: NodeId) -> bool {
        let kind = self
            .dom
            .attr(node, "type")
            .map(str::to_ascii_lowercase);
        if self.dom.is_tag(node, "button") {
            return kind.as_deref().is_none_or(|kind| kind == "submit");
        }
        matches!(kind.as_deref(), Some("submit" | "image"))
    }

    pub fn submit(&mut self, form: NodeId) -> Result<()> {
        self.submit_with(form, None)
    }

    fn submit_with(&mut self, form: NodeId, submitter: Option<NodeId>) -> Result<()> {
        if !self.dom.is_tag(form, "form") {
            return Err(Error::Internal(format!("{form:?} is not a form")));
        }
        let mut event = EventState::new("submit", form);
        event.submitter = submitter;
        let event = self.dispatch_prepared_event(event)?;
        if event.default_prevented {
            return Ok(());
        }

        let submission = self.form_submission(form, submitter)?;
        let mut to = submission.action;
        if submission.is_get {
            to.set_fragment(None);
            if !submission.fields.is_empty() {
                to.query_pairs_mut().extend_pairs(submission.fields);
            }
        }
        self.navigate_location(to, LocationNavigationKind::Form);
        Ok(())
    }

    fn form_submission(&self, form: NodeId, submitter: Option<NodeId>) -> Result<FormSubmission> {
        let action = match self.dom.attr(form, "action").map(str::trim) {
            Some(action) if !action.is_empty() => self.resolve(action)?,
            _ => self.document_url.clone(),
        };
        let is_get = self
            .dom
            .attr(form, "method")
            .is_none_or(|method| method.trim().eq_ignore_ascii_case("get"));
        Ok(FormSubmission {
            action,
            is_get,
            fields: self.form_fields(form, submitter),
        })
    }

    fn form_fields(&self, form: NodeId, submitter: Option<NodeId>) -> Vec<(String, String)> {
        let mut controls = Vec::new();
        self.dom.collect_elements_descendants_dfs(form, &mut controls);

        let mut fields = Vec::new();
        for control in controls {
            let Some(element) = self.dom.element(control) else {
                continue;
            };
            let Some(name) = element.attr("name").filter(|name| !name.is_empty()) else {
                continue;
            };
            if element.has_attr("disabled") {
                continue;
            }
            let value = match element.tag_name().to_ascii_lowercase().as_str() {
                "input" => {
                    let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();
                    match kind.as_str() {
                        "submit" | "image" | "button" if submitter == Some(control) => {
                            element.attr("value").unwrap_or_default().to_string()
                        }
                        "submit" | "image" | "button" | "reset" | "file" => continue,
                        "checkbox" | "radio" => {
                            if !element.has_attr("checked") {
                                continue;
                            }
                            element.attr("value").unwrap_or("on").to_string()
                        }
                        _ => element.attr("value").unwrap_or_default().to_string(),
                    }
                }
                "button" if submitter == Some(control) => {
                    element.attr("value").unwrap_or_default().to_string()
                }
                "select" => match self.selected_option_value(control) {
                    Some(value) => value,
                    None => continue,
                },
                "textarea" => self.dom.text_content(control),
                _ => continue,
            };
            fields.push((name.to_string(), value));
        }
        fields
    }

    fn selected_option_value(&self, select: NodeId) -> Option<String> {
        let mut descendants = Vec::new();
        self.dom.collect_elements_descendants_dfs(select, &mut descendants);
        let options: Vec<NodeId> = descendants
            .into_iter()
            .filter(|node| self.dom.is_tag(*node, "option"))
            .collect();
        let option = options
            .iter()
            .copied()
            .find(|option| self.dom.element(*option).is_some_and(|el| el.has_attr("selected")))
            .or_else(|| options.first().copied())?;
        Some(
            self.dom
                .attr(option, "value")
                .map(str::to_string)
                .unwrap_or_else(|| self.dom.text_content(option).trim().to_string()),
        )
    }

    fn resolve(&self, raw: &str) -> Result<Url> {
        self.base_url()
            .join(raw.trim())
            .map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))
    }

    fn is_in_shadow_tree(&self, node: NodeId) -> bool {
        let mut cursor = Some(node);
        while let Some(current) = cursor {
            if matches!(self.dom.node_type(current), Some(NodeType::ShadowRoot { .. })) {
                return true;
            }
            cursor = self.dom.parent(current);
        }
        false
    }

    /// `history.pushState`: the entry is recorded first, then the bridge
    /// reports the new URL.
    pub fn push_state(&mut self, url: Option<&str>) -> Result<()> {
        self.history_state(url, false)
    }

    pub fn replace_state(&mut self, url: Option<&str>) -> Result<()> {
        self.history_state(url, true)
    }

    fn history_state(&mut self, url: Option<&str>, replace: bool) -> Result<()> {
        let next_url = match url {
            Some(url) => self.resolve(url)?,
            None => self.document_url.clone(),
        };
        let previous = std::mem::replace(&mut self.document_url, next_url.clone());
        if replace {
            self.history_replace_current_entry(next_url.clone());
        } else {
            self.history_push_entry(next_url.clone());
        }
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.on_history_change(&next_url, &previous);
        }
        Ok(())
    }

    pub fn location_assign(&mut self, url: &str) -> Result<()> {
        self.location_change(url, LocationNavigationKind::Assign)
    }

    pub fn location_replace(&mut self, url: &str) -> Result<()> {
        self.location_change(url, LocationNavigationKind::Replace)
    }

    fn location_change(&mut self, url: &str, kind: LocationNavigationKind) -> Result<()> {
        let to = self.resolve(url)?;
        let current = self.document_url.clone();
        if let Some(bridge) = self.bridge.as_mut() {
            if bridge.on_location_change(&to, &current) {
                return Ok(());
            }
        }
        self.navigate_location(to, kind);
        Ok(())
    }

    pub fn reload(&mut self) {
        let to = self.document_url.clone();
        self.navigate_location(to, LocationNavigationKind::Reload);
    }

    fn navigate_location(&mut self, to: Url, kind: LocationNavigationKind) {
        let from = self.document_url.clone();
        self.document_url = to.clone();
        match kind {
            LocationNavigationKind::Replace => self.history_replace_current_entry(to.clone()),
            LocationNavigationKind::Assign
            | LocationNavigationKind::Link
            | LocationNavigationKind::Form => self.history_push_entry(to.clone()),
            LocationNavigationKind::Reload => {}
        }
        if !is_hash_only_navigation(&from, &to) {
            debug!(from = %from, to = %to, ?kind, "frame navigated without interception");
        }
        self.location_navigations
            .push(LocationNavigation { kind, from, to });
    }

    fn history_push_entry(&mut self, url: Url) {
        self.history_entries.truncate(self.history_index + 1);
        self.history_entries.push(HistoryEntry { url });
        self.history_index = self.history_entries.len() - 1;
    }

    fn history_replace_current_entry(&mut self, url: Url) {
        match self.history_entries.get_mut(self.history_index) {
            Some(entry) => entry.url = url,
            None => {
                self.history_entries.push(HistoryEntry { url });
                self.history_index = self.history_entries.len() - 1;
            }
        }
    }

    /// `history.go(delta)`. Out-of-range deltas are ignored; `0` reloads.
    /// A traversal fires `popstate` and is reported by the bridge.
    pub fn history_go(&mut self, delta: i64) -> Result<()> {
        if delta == 0 {
            self.reload();
            return Ok(());
        }

        let current = self.history_index as i64;
        let target = current.saturating_add(delta);
        if target < 0 || target >= self.history_entries.len() as i64 {
            return Ok(());
        }
        let target = target as usize;
        if target == self.history_index {
            return Ok(());
        }

        self.history_index = target;
        let url = self.history_entries[target].url.clone();
        self.document_url = url.clone();

        let mut popstate = EventState::new("popstate", self.dom.root());
        popstate.bubbles = false;
        popstate.cancelable = false;
        self.dispatch_prepared_event(popstate)?;

        if let Some(bridge) = self.bridge.as_mut() {
            bridge.on_traversal(&url);
        }
        Ok(())
    }

    pub fn history_back(&mut self) -> Result<()> {
        self.history_go(-1)
    }

    pub fn history_forward(&mut self) -> Result<()> {
        self.history_go(1)
    }
}

struct FormSubmission {
    action: Url,
    is_get: bool,
    fields: Vec<(String, String)>,
}
