//! Isolated Mount: places the widget container next to the anchor element and
//! keeps the widget behind an isolation boundary so page styles cannot reach
//! it.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dom::{Dom, Element, NodeId};
use crate::html::parse_fragment_into;
use crate::picker::AnchorSelector;
use crate::theme::{ThemeConfig, WIDGET_CSS};
use crate::{Error, Result};

pub const MOUNT_ID: &str = "reco-mount";
pub const MOUNT_STYLE: &str = "all:initial; display:block; width:100%; contain:content;";

const THEME_STYLE_MARK: &str = "theme";
const WIDGET_STYLE_MARK: &str = "widget";
const CONTENT_CLASS: &str = "rs-root";

/// Where the container goes relative to the resolved anchor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorPlacement {
    Before,
    #[default]
    After,
    Append,
}

impl fmt::Display for AnchorPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Before => "before",
            Self::After => "after",
            Self::Append => "append",
        })
    }
}

/// The document operations the mount needs. Implemented over [`Dom`] by
/// [`DomIsolationHost`]; tests substitute their own.
pub trait IsolationHost {
    type Node: Copy + Eq + fmt::Debug;

    /// `Ok(None)` when nothing matches; `Err` for selectors the host rejects.
    fn resolve_anchor(&self, selector: &AnchorSelector) -> Result<Option<Self::Node>>;
    /// The root element, the head, or anything inside the head.
    fn is_document_level(&self, node: Self::Node) -> bool;
    /// The body, created if the document lacks one.
    fn fallback_target(&mut self) -> Result<Self::Node>;

    fn find_container(&self) -> Option<Self::Node>;
    fn create_isolated_container(&mut self) -> Result<Self::Node>;
    fn set_anchor(
        &mut self,
        container: Self::Node,
        target: Self::Node,
        placement: AnchorPlacement,
    ) -> Result<()>;
    fn append_to_fallback(&mut self, container: Self::Node) -> Result<()>;
    fn discard_container(&mut self, container: Self::Node) -> Result<()>;

    fn boundary(&self, container: Self::Node) -> Option<Self::Node>;
    /// Creates the boundary with the theme variable block and the static
    /// widget stylesheet.
    fn attach_boundary(&mut self, container: Self::Node, theme_css: &str) -> Result<Self::Node>;
    fn theme_vars(&self, boundary: Self::Node) -> Option<String>;
    fn set_theme_vars(&mut self, boundary: Self::Node, theme_css: &str) -> Result<()>;
    fn render_content(&mut self, boundary: Self::Node, html: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountHandle<N> {
    pub container: N,
    pub boundary: N,
    pub created: bool,
    pub boundary_created: bool,
    pub theme_updated: bool,
    /// The container ended up appended to the body instead of at the anchor.
    pub fell_back: bool,
}

impl<N: Copy + Eq + fmt::Debug> MountHandle<N> {
    pub fn render<H: IsolationHost<Node = N>>(&self, host: &mut H, html: &str) -> Result<()> {
        host.render_content(self.boundary, html)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsolatedMount {
    pub placement: AnchorPlacement,
}

impl IsolatedMount {
    pub fn new(placement: AnchorPlacement) -> Self {
        Self { placement }
    }

    /// Idempotent: a second call with the same inputs reuses the container
    /// and boundary and changes nothing. Selector and placement failures fall
    /// back to the body and are never reported as errors.
    pub fn ensure_mount<H: IsolationHost>(
        &self,
        host: &mut H,
        selector: Option<&AnchorSelector>,
        theme: &ThemeConfig,
    ) -> Result<MountHandle<H::Node>> {
        let anchor = selector.and_then(|selector| match host.resolve_anchor(selector) {
            Ok(Some(node)) if !host.is_document_level(node) => Some(node),
            Ok(Some(_)) => {
                debug!(selector = %selector, "anchor is document-level; using body");
                None
            }
            Ok(None) => {
                debug!(selector = %selector, "anchor selector matched nothing; using body");
                None
            }
            Err(err) => {
                debug!(selector = %selector, error = %err, "anchor selector rejected; using body");
                None
            }
        });
        let mut fell_back = selector.is_some() && anchor.is_none();
        let (target, placement) = match anchor {
            Some(node) => (node, self.placement),
            None => (host.fallback_target()?, AnchorPlacement::Append),
        };

        let (container, created) = match host.find_container() {
            Some(container) => (container, false),
            None => (host.create_isolated_container()?, true),
        };
        if let Err(err) = host.set_anchor(container, target, placement) {
            debug!(error = %err, %placement, "container placement failed; appending to body");
            host.append_to_fallback(container)?;
            fell_back = true;
        }

        let theme_css = theme.to_css_vars();
        let (boundary, boundary_created, theme_updated) = match host.boundary(container) {
            Some(boundary) => {
                let stale = host.theme_vars(boundary).as_deref() != Some(theme_css.as_str());
                if stale {
                    host.set_theme_vars(boundary, &theme_css)?;
                }
                (boundary, false, stale)
            }
            None => (host.attach_boundary(container, &theme_css)?, true, false),
        };

        Ok(MountHandle {
            container,
            boundary,
            created,
            boundary_created,
            theme_updated,
            fell_back,
        })
    }

    /// Theme-only change: rewrites the variable block and nothing else.
    pub fn apply_theme<H: IsolationHost>(
        host: &mut H,
        handle: &MountHandle<H::Node>,
        theme: &ThemeConfig,
    ) -> Result<bool> {
        let theme_css = theme.to_css_vars();
        if host.theme_vars(handle.boundary).as_deref() == Some(theme_css.as_str()) {
            return Ok(false);
        }
        host.set_theme_vars(handle.boundary, &theme_css)?;
        Ok(true)
    }
}

/// [`IsolationHost`] over the frame's DOM; the boundary is a shadow root.
pub struct DomIsolationHost<'a> {
    dom: &'a mut Dom,
}

impl<'a> DomIsolationHost<'a> {
    pub fn new(dom: &'a mut Dom) -> Self {
        Self { dom }
    }

    fn marked_style(&self, boundary: NodeId, mark: &str) -> Option<NodeId> {
        self.dom
            .children(boundary)
            .iter()
            .copied()
            .find(|child| self.dom.is_tag(*child, "style") && self.dom.attr(*child, "data-reco") == Some(mark))
    }

    fn content_root(&self, boundary: NodeId) -> Option<NodeId> {
        self.dom.children(boundary).iter().copied().find(|child| {
            self.dom
                .element(*child)
                .is_some_and(|element| element.has_class(CONTENT_CLASS))
        })
    }

    fn style_element(&mut self, boundary: NodeId, mark: &str, css: &str) -> Result<NodeId> {
        let style = self.dom.create_element(
            boundary,
            Element::with_attrs("style", vec![("data-reco".into(), mark.into())]),
        );
        self.dom.set_text_content(style, css)?;
        Ok(style)
    }
}

fn mount_error(err: Error) -> Error {
    match err {
        Error::Mount(_) => err,
        other => Error::Mount(other.to_string()),
    }
}

impl IsolationHost for DomIsolationHost<'_> {
    type Node = NodeId;

    fn resolve_anchor(&self, selector: &AnchorSelector) -> Result<Option<NodeId>> {
        self.dom.query_selector(selector.as_str())
    }

    fn is_document_level(&self, node: NodeId) -> bool {
        if Some(node) == self.dom.document_element() {
            return true;
        }
        self.dom
            .head()
            .is_some_and(|head| node == head || self.dom.is_descendant_of(node, head))
    }

    fn fallback_target(&mut self) -> Result<NodeId> {
        self.dom.ensure_body().map_err(mount_error)
    }

    fn find_container(&self) -> Option<NodeId> {
        self.dom.by_id(MOUNT_ID)
    }

    fn create_isolated_container(&mut self) -> Result<NodeId> {
        Ok(self.dom.create_detached_element(Element::with_attrs(
            "div",
            vec![
                ("id".into(), MOUNT_ID.into()),
                ("style".into(), MOUNT_STYLE.into()),
            ],
        )))
    }

    fn set_anchor(&mut self, container: NodeId, target: NodeId, placement: AnchorPlacement) -> Result<()> {
        if target == container || self.dom.is_descendant_of(target, container) {
            return Err(Error::Mount("anchor lies inside the mount container".into()));
        }
        let placed = match placement {
            AnchorPlacement::After => self.dom.insert_after(target, container),
            AnchorPlacement::Append => self.dom.append_child(target, container),
            AnchorPlacement::Before => {
                let parent = self
                    .dom
                    .parent_element(target)
                    .ok_or_else(|| Error::Mount("anchor has no parent element".into()))?;
                self.dom.insert_before(parent, container, target)
            }
        };
        placed.map_err(mount_error)
    }

    fn append_to_fallback(&mut self, container: NodeId) -> Result<()> {
        let body = self.fallback_target()?;
        self.dom.append_child(body, container).map_err(mount_error)
    }

    fn discard_container(&mut self, container: NodeId) -> Result<()> {
        self.dom.remove_node(container).map_err(mount_error)
    }

    fn boundary(&self, container: NodeId) -> Option<NodeId> {
        self.dom.shadow_root(container)
    }

    fn attach_boundary(&mut self, container: NodeId, theme_css: &str) -> Result<NodeId> {
        let shadow = self.dom.attach_shadow(container)?;
        self.style_element(shadow, THEME_STYLE_MARK, theme_css)?;
        self.style_element(shadow, WIDGET_STYLE_MARK, WIDGET_CSS)?;
        self.dom.create_element(
            shadow,
            Element::with_attrs("div", vec![("class".into(), CONTENT_CLASS.into())]),
        );
        Ok(shadow)
    }

    fn theme_vars(&self, boundary: NodeId) -> Option<String> {
        self.marked_style(boundary, THEME_STYLE_MARK)
            .map(|style| self.dom.text_content(style))
    }

    fn set_theme_vars(&mut self, boundary: NodeId, theme_css: &str) -> Result<()> {
        match self.marked_style(boundary, THEME_STYLE_MARK) {
            Some(style) => self.dom.set_text_content(style, theme_css).map_err(mount_error),
            None => {
                let style = self.style_element(boundary, THEME_STYLE_MARK, theme_css)?;
                self.dom.prepend_child(boundary, style).map_err(mount_error)
            }
        }
    }

    fn render_content(&mut self, boundary: NodeId, html: &str) -> Result<()> {
        let root = match self.content_root(boundary) {
            Some(root) => root,
            None => self.dom.create_element(
                boundary,
                Element::with_attrs("div", vec![("class".into(), CONTENT_CLASS.into())]),
            ),
        };
        self.dom.clear_children(root);
        parse_fragment_into(self.dom, root, html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::parse_html;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r#"<html><head><title>t</title></head><body><header id="top"></header><main><section class="hero"></section><p>after</p></main></body></html>"#;

    fn selector(raw: &str) -> AnchorSelector {
        AnchorSelector::new(raw).expect("selector")
    }

    #[test]
    fn mounts_after_the_anchor_with_two_style_blocks() -> Result<()> {
        let mut dom = parse_html(PAGE)?;
        let handle = IsolatedMount::default().ensure_mount(
            &mut DomIsolationHost::new(&mut dom),
            Some(&selector(".hero")),
            &ThemeConfig::default(),
        )?;
        assert!(handle.created && handle.boundary_created && !handle.fell_back);

        let hero = dom.query_selector(".hero")?.expect("hero");
        assert_eq!(dom.next_element_sibling(hero), Some(handle.container));
        assert_eq!(dom.attr(handle.container, "style"), Some(MOUNT_STYLE));

        let styles = dom.query_selector_all_from(handle.boundary, "style")?;
        assert_eq!(styles.len(), 2);
        assert!(dom.text_content(styles[0]).contains("--rs-accent:#111827"));
        assert_eq!(dom.text_content(styles[1]), WIDGET_CSS);
        // The boundary stays out of document queries but is serialized as
        // declarative shadow DOM inside the container.
        assert!(dom.query_selector("style")?.is_none());
        let html = dom.to_html();
        assert!(html.contains(r#"<div id="reco-mount""#));
        assert!(html.contains(r#"<template shadowrootmode="open"><style data-reco="theme">"#));
        assert!(html.contains("--rs-accent:#111827"));
        Ok(())
    }

    #[test]
    fn second_call_is_a_no_op() -> Result<()> {
        let mut dom = parse_html(PAGE)?;
        let mount = IsolatedMount::default();
        let theme = ThemeConfig::default();
        let first = mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), Some(&selector("#top")), &theme)?;
        let html = dom.to_html();
        let second = mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), Some(&selector("#top")), &theme)?;

        assert_eq!(first.container, second.container);
        assert_eq!(first.boundary, second.boundary);
        assert!(!second.created && !second.boundary_created && !second.theme_updated);
        assert_eq!(dom.to_html(), html);
        assert_eq!(dom.query_selector_all("#reco-mount")?.len(), 1);
        Ok(())
    }

    #[test]
    fn unresolvable_and_document_level_anchors_fall_back_to_body() -> Result<()> {
        for raw in ["#missing", "head", "title", "html", "p:unknown-pseudo"] {
            let mut dom = parse_html(PAGE)?;
            let handle = IsolatedMount::default().ensure_mount(
                &mut DomIsolationHost::new(&mut dom),
                Some(&selector(raw)),
                &ThemeConfig::default(),
            )?;
            let body = dom.body().expect("body");
            assert_eq!(dom.parent(handle.container), Some(body), "{raw}");
            assert_eq!(dom.children(body).last(), Some(&handle.container), "{raw}");
            assert!(handle.fell_back, "{raw}");
        }
        Ok(())
    }

    #[test]
    fn placements_position_the_container() -> Result<()> {
        let cases = [
            (AnchorPlacement::Before, "<main><div id=\"reco-mount\""),
            (AnchorPlacement::Append, "<p>after</p><div id=\"reco-mount\""),
        ];
        for (placement, expected) in cases {
            let mut dom = parse_html(PAGE)?;
            IsolatedMount::new(placement).ensure_mount(
                &mut DomIsolationHost::new(&mut dom),
                Some(&selector(if placement == AnchorPlacement::Before { ".hero" } else { "main" })),
                &ThemeConfig::default(),
            )?;
            assert!(dom.to_html().contains(expected), "{placement}: {}", dom.to_html());
        }
        Ok(())
    }

    #[test]
    fn anchor_change_repositions_the_existing_container() -> Result<()> {
        let mut dom = parse_html(PAGE)?;
        let mount = IsolatedMount::default();
        let theme = ThemeConfig::default();
        let first = mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), Some(&selector("#top")), &theme)?;
        let second = mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), Some(&selector("main p")), &theme)?;
        assert_eq!(first.container, second.container);
        let p = dom.query_selector("main p")?.expect("p");
        assert_eq!(dom.next_element_sibling(p), Some(second.container));
        Ok(())
    }

    #[test]
    fn anchoring_inside_the_container_falls_back() -> Result<()> {
        let mut dom = parse_html(PAGE)?;
        let mount = IsolatedMount::default();
        let theme = ThemeConfig::default();
        mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), Some(&selector(".hero")), &theme)?;
        let handle = mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), Some(&selector("#reco-mount")), &theme)?;
        assert!(handle.fell_back);
        assert_eq!(dom.parent(handle.container), dom.body());
        Ok(())
    }

    #[test]
    fn theme_change_updates_only_the_variable_block() -> Result<()> {
        let mut dom = parse_html(PAGE)?;
        let mount = IsolatedMount::default();
        let first = mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), None, &ThemeConfig::default())?;
        first.render(&mut DomIsolationHost::new(&mut dom), "<div class=\"rs-wrap\">w</div>")?;

        let theme = ThemeConfig {
            accent: "#ff0000".into(),
            ..ThemeConfig::default()
        };
        let second = mount.ensure_mount(&mut DomIsolationHost::new(&mut dom), None, &theme)?;
        assert_eq!(first.boundary, second.boundary);
        assert!(second.theme_updated);

        let mut host = DomIsolationHost::new(&mut dom);
        assert!(host.theme_vars(second.boundary).is_some_and(|css| css.contains("#ff0000")));
        assert!(!IsolatedMount::apply_theme(&mut host, &second, &theme)?);
        assert_eq!(dom.query_selector_from(second.boundary, ".rs-wrap")?.map(|n| dom.text_content(n)), Some("w".into()));
        Ok(())
    }

    #[test]
    fn rendering_replaces_previous_content() -> Result<()> {
        let mut dom = parse_html(PAGE)?;
        let handle = IsolatedMount::default().ensure_mount(&mut DomIsolationHost::new(&mut dom), None, &ThemeConfig::default())?;
        let mut host = DomIsolationHost::new(&mut dom);
        handle.render(&mut host, "<p class=\"one\">1</p>")?;
        handle.render(&mut host, "<p class=\"two\">2</p>")?;
        assert!(dom.query_selector_from(handle.boundary, ".one")?.is_none());
        assert!(dom.query_selector_from(handle.boundary, ".two")?.is_some());
        Ok(())
    }
}
