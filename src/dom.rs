use std::collections::HashMap;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone)]
pub enum NodeType {
    Document,
    Doctype(String),
    Element(Element),
    Text(String),
    Comment(String),
    /// Encapsulated subtree owned by a host element. Never part of the
    /// host's regular children, so document queries and serialization skip it.
    ShadowRoot { host: NodeId },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) node_type: NodeType,
}

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub(crate) tag_name: String,
    pub(crate) attrs: Vec<(String, String)>,
    pub(crate) shadow_root: Option<NodeId>,
}

impl Element {
    pub fn new(tag_name: &str) -> Self {
        Self {
            tag_name: tag_name.to_ascii_lowercase(),
            attrs: Vec::new(),
            shadow_root: None,
        }
    }

    pub fn with_attrs(tag_name: &str, attrs: Vec<(String, String)>) -> Self {
        let mut element = Self::new(tag_name);
        for (name, value) in attrs {
            element.set_attr(&name, &value);
        }
        element
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        if let Some(slot) = self.attrs.iter_mut().find(|(key, _)| *key == name) {
            slot.1 = value.to_string();
        } else {
            self.attrs.push((name, value.to_string()));
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> bool {
        let before = self.attrs.len();
        self.attrs.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before != self.attrs.len()
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id").filter(|id| !id.is_empty())
    }

    pub fn has_class(&self, class_name: &str) -> bool {
        self.attr("class")
            .map(|classes| classes.split_whitespace().any(|c| c == class_name))
            .unwrap_or(false)
    }

    pub fn first_class(&self) -> Option<&str> {
        self.attr("class")
            .and_then(|classes| classes.split_whitespace().next())
    }
}

/// Arena-backed document tree for a rendered copy of a proxied page.
#[derive(Debug, Clone)]
pub struct Dom {
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: NodeId,
    pub(crate) id_index: HashMap<String, Vec<NodeId>>,
}

impl Default for Dom {
    fn default() -> Self {
        Self::new()
    }
}

impl Dom {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                children: Vec::new(),
                node_type: NodeType::Document,
            }],
            root: NodeId(0),
            id_index: HashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(node_id.0)
    }

    pub fn node_type(&self, node_id: NodeId) -> Option<&NodeType> {
        self.nodes.get(node_id.0).map(|node| &node.node_type)
    }

    pub(crate) fn create_node(&mut self, parent: Option<NodeId>, node_type: NodeType) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            node_type,
        });
        if let Some(parent_id) = parent {
            self.nodes[parent_id.0].children.push(id);
        }
        id
    }

    pub fn create_element(&mut self, parent: NodeId, element: Element) -> NodeId {
        let id_attr = element.id().map(str::to_string);
        let id = self.create_node(Some(parent), NodeType::Element(element));
        if let Some(id_attr) = id_attr {
            if self.is_connected(id) {
                self.id_index.entry(id_attr).or_default().push(id);
            }
        }
        id
    }

    pub fn create_detached_element(&mut self, element: Element) -> NodeId {
        self.create_node(None, NodeType::Element(element))
    }

    pub fn create_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.create_node(Some(parent), NodeType::Text(text.to_string()))
    }

    pub fn create_comment(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.create_node(Some(parent), NodeType::Comment(text.to_string()))
    }

    pub fn create_doctype(&mut self, parent: NodeId, name: &str) -> NodeId {
        self.create_node(Some(parent), NodeType::Doctype(name.to_string()))
    }

    pub fn element(&self, node_id: NodeId) -> Option<&Element> {
        match self.nodes.get(node_id.0).map(|node| &node.node_type) {
            Some(NodeType::Element(element)) => Some(element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, node_id: NodeId) -> Option<&mut Element> {
        match self.nodes.get_mut(node_id.0).map(|node| &mut node.node_type) {
            Some(NodeType::Element(element)) => Some(element),
            _ => None,
        }
    }

    pub fn tag_name(&self, node_id: NodeId) -> Option<&str> {
        self.element(node_id).map(Element::tag_name)
    }

    pub fn is_tag(&self, node_id: NodeId, tag: &str) -> bool {
        self.tag_name(node_id)
            .is_some_and(|name| name.eq_ignore_ascii_case(tag))
    }

    pub fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes.get(node_id.0).and_then(|node| node.parent)
    }

    pub fn parent_element(&self, node_id: NodeId) -> Option<NodeId> {
        self.parent(node_id)
            .filter(|parent| self.element(*parent).is_some())
    }

    pub fn children(&self, node_id: NodeId) -> &[NodeId] {
        self.nodes
            .get(node_id.0)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn attr(&self, node_id: NodeId, name: &str) -> Option<&str> {
        self.element(node_id).and_then(|element| element.attr(name))
    }

    pub fn set_attr(&mut self, node_id: NodeId, name: &str, value: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Internal("setAttribute target is not an element".into()))?;
        element.set_attr(name, value);
        if name.eq_ignore_ascii_case("id") {
            self.rebuild_id_index();
        }
        Ok(())
    }

    pub fn remove_attr(&mut self, node_id: NodeId, name: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::Internal("removeAttribute target is not an element".into()))?;
        let removed = element.remove_attr(name);
        if removed && name.eq_ignore_ascii_case("id") {
            self.rebuild_id_index();
        }
        Ok(())
    }

    pub fn is_valid_node(&self, node_id: NodeId) -> bool {
        node_id.0 < self.nodes.len()
    }

    pub fn can_have_children(&self, node_id: NodeId) -> bool {
        matches!(
            self.node_type(node_id),
            Some(NodeType::Document | NodeType::Element(_) | NodeType::ShadowRoot { .. })
        )
    }

    pub fn is_connected(&self, node_id: NodeId) -> bool {
        let mut cursor = Some(node_id);
        while let Some(node) = cursor {
            if node == self.root {
                return true;
            }
            cursor = self.parent(node);
        }
        false
    }

    pub fn is_descendant_of(&self, node_id: NodeId, ancestor: NodeId) -> bool {
        let mut cursor = self.parent(node_id);
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    pub(crate) fn rebuild_id_index(&mut self) {
        let mut next: HashMap<String, Vec<NodeId>> = HashMap::new();
        let mut stack = vec![self.root];
        while let Some(node) = stack.pop() {
            if let NodeType::Element(element) = &self.nodes[node.0].node_type {
                if let Some(id) = element.id() {
                    next.entry(id.to_string()).or_default().push(node);
                }
            }
            for child in self.nodes[node.0].children.iter().rev() {
                stack.push(*child);
            }
        }
        self.id_index = next;
    }

    pub fn by_id(&self, id: &str) -> Option<NodeId> {
        self.id_index
            .get(id)
            .and_then(|nodes| nodes.first().copied())
    }

    pub(crate) fn by_id_all(&self, id: &str) -> Vec<NodeId> {
        self.id_index.get(id).cloned().unwrap_or_default()
    }

    fn ensure_insertable(&self, parent: NodeId, child: NodeId, op: &str) -> Result<()> {
        if !self.can_have_children(parent) {
            return Err(Error::Internal(format!("{op} target cannot have children")));
        }
        if child == self.root || child == parent || !self.is_valid_node(child) {
            return Err(Error::Internal(format!("invalid {op} node")));
        }
        if matches!(self.node_type(child), Some(NodeType::ShadowRoot { .. })) {
            return Err(Error::Internal(format!("{op} cannot move a shadow root")));
        }
        let mut cursor = Some(parent);
        while let Some(node) = cursor {
            if node == child {
                return Err(Error::Internal(format!("{op} would create a cycle")));
            }
            cursor = self.parent(node);
        }
        Ok(())
    }

    fn detach(&mut self, child: NodeId) {
        if let Some(old_parent) = self.parent(child) {
            self.nodes[old_parent.0].children.retain(|id| *id != child);
        }
        self.nodes[child.0].parent = None;
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.ensure_insertable(parent, child, "appendChild")?;
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
        self.rebuild_id_index();
        Ok(())
    }

    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        match self.children(parent).first().copied() {
            Some(reference) if reference != child => self.insert_before(parent, child, reference),
            Some(_) => Ok(()),
            None => self.append_child(parent, child),
        }
    }

    pub fn insert_before(&mut self, parent: NodeId, child: NodeId, reference: NodeId) -> Result<()> {
        self.ensure_insertable(parent, child, "insertBefore")?;
        if self.parent(reference) != Some(parent) {
            return Err(Error::Internal(
                "insertBefore reference is not a direct child".into(),
            ));
        }
        if child == reference {
            return Ok(());
        }
        self.detach(child);
        let index = self.nodes[parent.0]
            .children
            .iter()
            .position(|id| *id == reference)
            .ok_or_else(|| Error::Internal("insertBefore reference is missing".into()))?;
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(index, child);
        self.rebuild_id_index();
        Ok(())
    }

    /// Places `child` as the next sibling of `target`.
    pub fn insert_after(&mut self, target: NodeId, child: NodeId) -> Result<()> {
        let parent = self
            .parent(target)
            .ok_or_else(|| Error::Internal("afterend target is detached".into()))?;
        if matches!(self.node_type(parent), Some(NodeType::Document)) {
            return Err(Error::Internal("afterend target has no parent element".into()));
        }
        if target == child {
            return Ok(());
        }
        self.detach(child);
        let pos = self.nodes[parent.0]
            .children
            .iter()
            .position(|id| *id == target)
            .ok_or_else(|| Error::Internal("afterend target is detached".into()))?;
        match self.nodes[parent.0].children.get(pos + 1).copied() {
            Some(next) => self.insert_before(parent, child, next),
            None => self.append_child(parent, child),
        }
    }

    pub fn remove_node(&mut self, node: NodeId) -> Result<()> {
        if node == self.root {
            return Err(Error::Internal("cannot remove document root".into()));
        }
        if self.parent(node).is_none() {
            return Ok(());
        }
        self.detach(node);
        self.rebuild_id_index();
        Ok(())
    }

    pub fn clear_children(&mut self, parent: NodeId) {
        let children = std::mem::take(&mut self.nodes[parent.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
        self.rebuild_id_index();
    }

    pub fn set_text_content(&mut self, node: NodeId, text: &str) -> Result<()> {
        if !self.can_have_children(node) {
            return Err(Error::Internal("textContent target cannot have children".into()));
        }
        self.clear_children(node);
        if !text.is_empty() {
            self.create_text(node, text);
        }
        Ok(())
    }

    pub fn text_content(&self, node_id: NodeId) -> String {
        match self.node_type(node_id) {
            Some(NodeType::Text(text)) => text.clone(),
            Some(NodeType::Element(_) | NodeType::Document | NodeType::ShadowRoot { .. }) => {
                let mut out = String::new();
                for child in self.children(node_id) {
                    out.push_str(&self.text_content(*child));
                }
                out
            }
            _ => String::new(),
        }
    }

    /// Attaches an encapsulated subtree to `host`, returning the existing one
    /// if the host already carries it.
    pub fn attach_shadow(&mut self, host: NodeId) -> Result<NodeId> {
        let existing = self
            .element(host)
            .ok_or_else(|| Error::Mount("attachShadow target is not an element".into()))?
            .shadow_root;
        if let Some(existing) = existing {
            return Ok(existing);
        }
        let shadow = self.create_node(None, NodeType::ShadowRoot { host });
        if let Some(element) = self.element_mut(host) {
            element.shadow_root = Some(shadow);
        }
        Ok(shadow)
    }

    pub fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.element(host).and_then(|element| element.shadow_root)
    }

    pub fn shadow_host(&self, shadow: NodeId) -> Option<NodeId> {
        match self.node_type(shadow) {
            Some(NodeType::ShadowRoot { host }) => Some(*host),
            _ => None,
        }
    }

    pub(crate) fn collect_elements_dfs(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        if self.element(node_id).is_some() {
            out.push(node_id);
        }
        for child in self.children(node_id) {
            self.collect_elements_dfs(*child, out);
        }
    }

    pub(crate) fn collect_elements_descendants_dfs(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        for child in self.children(node_id) {
            self.collect_elements_dfs(*child, out);
        }
    }

    pub fn child_elements(&self, node_id: NodeId) -> Vec<NodeId> {
        self.children(node_id)
            .iter()
            .copied()
            .filter(|child| self.element(*child).is_some())
            .collect()
    }

    pub fn first_element_child(&self, node_id: NodeId) -> Option<NodeId> {
        self.children(node_id)
            .iter()
            .copied()
            .find(|child| self.element(*child).is_some())
    }

    /// 1-based position among the parent's element children.
    pub fn element_index(&self, node_id: NodeId) -> Option<usize> {
        let parent = self.parent(node_id)?;
        self.children(parent)
            .iter()
            .filter(|child| self.element(**child).is_some())
            .position(|child| *child == node_id)
            .map(|pos| pos + 1)
    }

    pub fn next_element_sibling(&self, node_id: NodeId) -> Option<NodeId> {
        let parent = self.parent(node_id)?;
        let children = self.children(parent);
        let pos = children.iter().position(|id| *id == node_id)?;
        children[pos + 1..]
            .iter()
            .copied()
            .find(|sibling| self.element(*sibling).is_some())
    }

    pub fn previous_element_sibling(&self, node_id: NodeId) -> Option<NodeId> {
        let parent = self.parent(node_id)?;
        let children = self.children(parent);
        let pos = children.iter().position(|id| *id == node_id)?;
        children[..pos]
            .iter()
            .rev()
            .copied()
            .find(|sibling| self.element(*sibling).is_some())
    }

    pub fn document_element(&self) -> Option<NodeId> {
        self.first_element_child(self.root)
    }

    fn html_child(&self, tags: &[&str]) -> Option<NodeId> {
        let document_element = self.document_element()?;
        if !self.is_tag(document_element, "html") {
            return None;
        }
        self.child_elements(document_element)
            .into_iter()
            .find(|child| tags.iter().any(|tag| self.is_tag(*child, tag)))
    }

    pub fn head(&self) -> Option<NodeId> {
        self.html_child(&["head"])
            .or_else(|| self.query_selector("head").ok().flatten())
    }

    pub fn body(&self) -> Option<NodeId> {
        self.html_child(&["body", "frameset"])
            .or_else(|| self.query_selector("body").ok().flatten())
    }

    /// Returns the body element, synthesizing `html`/`body` wrappers for
    /// fragments that never declared one.
    pub fn ensure_body(&mut self) -> Result<NodeId> {
        if let Some(body) = self.body() {
            return Ok(body);
        }
        let html = match self.document_element() {
            Some(node) if self.is_tag(node, "html") => node,
            _ => {
                let loose = self.children(self.root).to_vec();
                let html = self.create_element(self.root, Element::new("html"));
                for child in loose {
                    if !matches!(self.node_type(child), Some(NodeType::Doctype(_))) {
                        self.append_child(html, child)?;
                    }
                }
                html
            }
        };
        let body = self.create_element(html, Element::new("body"));
        let strays = self
            .children(html)
            .iter()
            .copied()
            .filter(|child| *child != body && !self.is_tag(*child, "head"))
            .collect::<Vec<_>>();
        for child in strays {
            self.append_child(body, child)?;
        }
        Ok(body)
    }

    pub fn to_html(&self) -> String {
        self.serialize_node(self.root)
    }

    pub fn serialize_node(&self, node_id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(node_id, &mut out);
        out
    }

    pub fn inner_html(&self, node_id: NodeId) -> String {
        let mut out = String::new();
        for child in self.children(node_id) {
            self.write_node(*child, &mut out);
        }
        out
    }

    fn write_node(&self, node_id: NodeId, out: &mut String) {
        stacker::maybe_grow(64 * 1024, 1024 * 1024, || match self.node_type(node_id) {
            Some(NodeType::Document | NodeType::ShadowRoot { .. }) => {
                for child in self.children(node_id) {
                    self.write_node(*child, out);
                }
            }
            Some(NodeType::Doctype(name)) => {
                out.push_str("<!DOCTYPE ");
                out.push_str(name);
                out.push('>');
            }
            Some(NodeType::Comment(text)) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            Some(NodeType::Text(text)) => {
                let raw_parent = self
                    .parent(node_id)
                    .and_then(|parent| self.tag_name(parent))
                    .is_some_and(crate::html::is_unescaped_text_tag);
                if raw_parent {
                    out.push_str(text);
                } else {
                    out.push_str(&crate::html::escape_text(text));
                }
            }
            Some(NodeType::Element(element)) => {
                out.push('<');
                out.push_str(&element.tag_name);
                for (name, value) in &element.attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&crate::html::escape_attr(value));
                    out.push('"');
                }
                out.push('>');
                if crate::html::is_void_tag(&element.tag_name) {
                    return;
                }
                // Declarative shadow DOM, so the serialized copy keeps the boundary.
                if let Some(shadow) = element.shadow_root {
                    out.push_str("<template shadowrootmode=\"open\">");
                    for child in self.children(shadow) {
                        self.write_node(*child, out);
                    }
                    out.push_str("</template>");
                }
                for child in self.children(node_id) {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
            }
            None => {}
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Dom, NodeId, NodeId) {
        let mut dom = Dom::new();
        let html = dom.create_element(dom.root(), Element::new("html"));
        let body = dom.create_element(html, Element::new("body"));
        let main = dom.create_element(
            body,
            Element::with_attrs("main", vec![("id".into(), "content".into())]),
        );
        (dom, body, main)
    }

    #[test]
    fn insert_after_places_node_as_next_sibling() -> Result<()> {
        let (mut dom, body, main) = sample();
        let footer = dom.create_element(body, Element::new("footer"));
        let mount = dom.create_detached_element(Element::new("div"));
        dom.insert_after(main, mount)?;
        assert_eq!(dom.children(body), &[main, mount, footer]);
        dom.insert_after(main, mount)?;
        assert_eq!(dom.children(body), &[main, mount, footer]);
        Ok(())
    }

    #[test]
    fn insert_after_rejects_document_level_target() {
        let (mut dom, _, _) = sample();
        let html = dom.document_element().expect("html");
        let mount = dom.create_detached_element(Element::new("div"));
        assert!(dom.insert_after(html, mount).is_err());
    }

    #[test]
    fn append_child_rejects_cycles() {
        let (mut dom, body, main) = sample();
        assert!(dom.append_child(main, body).is_err());
    }

    #[test]
    fn id_index_tracks_moves_and_removal() -> Result<()> {
        let (mut dom, body, main) = sample();
        assert_eq!(dom.by_id("content"), Some(main));
        dom.remove_node(main)?;
        assert_eq!(dom.by_id("content"), None);
        dom.append_child(body, main)?;
        assert_eq!(dom.by_id("content"), Some(main));
        Ok(())
    }

    #[test]
    fn shadow_root_serializes_as_template_but_stays_unindexed() -> Result<()> {
        let (mut dom, _, main) = sample();
        let shadow = dom.attach_shadow(main)?;
        dom.create_element(
            shadow,
            Element::with_attrs("span", vec![("id".into(), "inner".into())]),
        );
        assert_eq!(dom.attach_shadow(main)?, shadow);
        assert_eq!(dom.shadow_host(shadow), Some(main));
        assert_eq!(dom.by_id("inner"), None);
        assert_eq!(
            dom.to_html(),
            "<html><body><main id=\"content\"><template shadowrootmode=\"open\"><span id=\"inner\"></span></template></main></body></html>"
        );
        assert_eq!(dom.inner_html(main), "");
        Ok(())
    }

    #[test]
    fn ensure_body_wraps_loose_content() -> Result<()> {
        let mut dom = Dom::new();
        let p = dom.create_element(dom.root(), Element::new("p"));
        let body = dom.ensure_body()?;
        assert_eq!(dom.parent(p), Some(body));
        assert_eq!(dom.to_html(), "<html><body><p></p></body></html>");
        Ok(())
    }
}
