//! Markup tree used by the compiler.
//!
//! Nodes live in an arena and are addressed by `NodeId`. Detached nodes stay
//! in the arena; they are simply not reachable from any parent. Parsing goes
//! through html5ever and is flattened into the arena.

use html5ever::parse_document;
use tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData as RcNodeData, RcDom};
use serde::{Deserialize, Serialize};

use crate::error::{CompileError, Result, ERR_PARSE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Text,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomAttr {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
enum NodeData {
    Element { tag: String, attrs: Vec<DomAttr> },
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct DomNode {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

#[derive(Debug, Default, Clone)]
pub struct Dom {
    nodes: Vec<DomNode>,
}

impl Dom {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(DomNode {
            data,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    fn node(&self, id: NodeId) -> &DomNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut DomNode {
        &mut self.nodes[id.0 as usize]
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CREATION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeData::Element {
            tag: tag.to_lowercase(),
            attrs: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Text(text.to_string()))
    }

    pub fn create_comment(&mut self, text: &str) -> NodeId {
        self.push(NodeData::Comment(text.to_string()))
    }

    /// Deep copy of `id`. The copy is detached.
    pub fn clone_subtree(&mut self, id: NodeId) -> NodeId {
        let data = self.node(id).data.clone();
        let copy = self.push(data);
        let children = self.node(id).children.clone();
        for child in children {
            let child_copy = self.clone_subtree(child);
            self.append_child(copy, child_copy);
        }
        copy
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // INSPECTION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn kind(&self, id: NodeId) -> NodeKind {
        match self.node(id).data {
            NodeData::Element { .. } => NodeKind::Element,
            NodeData::Text(_) => NodeKind::Text,
            NodeData::Comment(_) => NodeKind::Comment,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.kind(id) == NodeKind::Element
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).data {
            NodeData::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn attrs(&self, id: NodeId) -> &[DomAttr] {
        match &self.node(id).data {
            NodeData::Element { attrs, .. } => attrs,
            _ => &[],
        }
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.attrs(id)
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .map(|a| a.value.as_str())
    }

    /// Text of a text or comment node.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).data {
            NodeData::Text(t) | NodeData::Comment(t) => Some(t),
            NodeData::Element { .. } => None,
        }
    }

    pub fn text_content(&self, id: NodeId) -> String {
        match &self.node(id).data {
            NodeData::Text(t) => t.clone(),
            NodeData::Comment(_) => String::new(),
            NodeData::Element { .. } => self
                .children(id)
                .iter()
                .map(|c| self.text_content(*c))
                .collect(),
        }
    }

    /// Whitespace-only text and comments carry no content.
    pub fn is_blank(&self, id: NodeId) -> bool {
        match &self.node(id).data {
            NodeData::Text(t) => t.trim().is_empty(),
            NodeData::Comment(_) => true,
            NodeData::Element { .. } => false,
        }
    }

    pub fn class_tokens(&self, id: NodeId) -> Vec<String> {
        self.attr(id, "class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.class_tokens(id).iter().any(|c| c == class)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // NAVIGATION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let idx = self.index_in_parent(id)?;
        self.children(parent).get(idx + 1).copied()
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let idx = self.index_in_parent(id)?;
        idx.checked_sub(1).map(|i| self.children(parent)[i])
    }

    /// `id` itself followed by each ancestor.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = vec![id];
        let mut current = self.parent(id);
        while let Some(p) = current {
            chain.push(p);
            current = self.parent(p);
        }
        chain
    }

    /// Pre-order list of `id` and everything below it.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = vec![id];
        for child in self.children(id) {
            out.extend(self.descendants(*child));
        }
        out
    }

    pub fn contains(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.ancestors(id).contains(&ancestor)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MUTATION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let NodeData::Element { attrs, .. } = &mut self.node_mut(id).data {
            if let Some(existing) = attrs.iter_mut().find(|a| a.name.eq_ignore_ascii_case(name)) {
                existing.value = value.to_string();
            } else {
                attrs.push(DomAttr {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        if let NodeData::Element { attrs, .. } = &mut self.node_mut(id).data {
            attrs.retain(|a| !a.name.eq_ignore_ascii_case(name));
        }
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        let mut tokens = self.class_tokens(id);
        if !tokens.iter().any(|t| t == class) {
            tokens.push(class.to_string());
            self.set_attr(id, "class", &tokens.join(" "));
        }
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) {
        if self.is_element(id) {
            self.empty(id);
            let child = self.create_text(text);
            self.append_child(id, child);
        } else if let NodeData::Text(t) | NodeData::Comment(t) = &mut self.node_mut(id).data {
            *t = text.to_string();
        }
    }

    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.node(id).parent {
            self.node_mut(parent).children.retain(|c| *c != id);
            self.node_mut(id).parent = None;
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.node_mut(parent).children.push(child);
        self.node_mut(child).parent = Some(parent);
    }

    pub fn insert_at(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        let children = &mut self.node_mut(parent).children;
        let index = index.min(children.len());
        children.insert(index, child);
        self.node_mut(child).parent = Some(parent);
    }

    /// Inserts `new` right after `reference`. Returns false when `reference`
    /// has no parent.
    pub fn insert_after(&mut self, reference: NodeId, new: NodeId) -> bool {
        let Some(parent) = self.parent(reference) else {
            return false;
        };
        self.detach(new);
        let idx = self.index_in_parent(reference).unwrap_or(0);
        self.insert_at(parent, idx + 1, new);
        true
    }

    /// Puts `new` where `old` is and detaches `old`.
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        if old == new {
            return;
        }
        self.detach(new);
        if let (Some(parent), Some(idx)) = (self.parent(old), self.index_in_parent(old)) {
            self.node_mut(parent).children[idx] = new;
            self.node_mut(new).parent = Some(parent);
            self.node_mut(old).parent = None;
        }
    }

    /// Detaches and returns every child of `id`.
    pub fn empty(&mut self, id: NodeId) -> Vec<NodeId> {
        let children = std::mem::take(&mut self.node_mut(id).children);
        for child in &children {
            self.node_mut(*child).parent = None;
        }
        children
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SERIALIZATION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn start_tag(&self, id: NodeId) -> String {
        match &self.node(id).data {
            NodeData::Element { tag, attrs } => {
                let mut out = format!("<{}", tag);
                for attr in attrs {
                    if attr.value.is_empty() {
                        out.push_str(&format!(" {}", attr.name));
                    } else {
                        out.push_str(&format!(" {}=\"{}\"", attr.name, escape_attr(&attr.value)));
                    }
                }
                out.push('>');
                out
            }
            NodeData::Text(t) => escape_text(t),
            NodeData::Comment(c) => format!("<!--{}-->", c),
        }
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        match &self.node(id).data {
            NodeData::Element { tag, .. } => {
                let mut out = self.start_tag(id);
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return out;
                }
                out.push_str(&self.inner_html(id));
                out.push_str(&format!("</{}>", tag));
                out
            }
            _ => self.start_tag(id),
        }
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        self.children(id)
            .iter()
            .map(|c| self.outer_html(*c))
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PARSING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Parses an HTML fragment into detached top-level nodes.
    pub fn parse_html(&mut self, html: &str) -> Result<Vec<NodeId>> {
        let rc_dom = parse_document(RcDom::default(), Default::default())
            .from_utf8()
            .read_from(&mut html.as_bytes())
            .map_err(|e| CompileError::new(ERR_PARSE, &format!("Failed to parse HTML: {}", e)))?;

        let has_html_in_src = html.to_lowercase().contains("<html");
        let mut roots = Vec::new();
        self.collect_body_content(&rc_dom.document, has_html_in_src, &mut roots);
        Ok(roots)
    }

    fn collect_body_content(&mut self, handle: &Handle, has_html_in_src: bool, roots: &mut Vec<NodeId>) {
        match &handle.data {
            RcNodeData::Document => {
                for child in handle.children.borrow().iter() {
                    self.collect_body_content(child, has_html_in_src, roots);
                }
            }
            RcNodeData::Element { name, .. } => {
                let tag = name.local.to_string().to_lowercase();
                // html5ever always synthesizes html/head/body; only keep them
                // when the source actually had a document.
                let is_wrapper = tag == "html" || tag == "head" || tag == "body";
                if is_wrapper && !has_html_in_src {
                    for child in handle.children.borrow().iter() {
                        self.collect_body_content(child, has_html_in_src, roots);
                    }
                } else if let Some(id) = self.import_rc_node(handle) {
                    roots.push(id);
                }
            }
            _ => {
                if let Some(id) = self.import_rc_node(handle) {
                    roots.push(id);
                }
            }
        }
    }

    fn import_rc_node(&mut self, handle: &Handle) -> Option<NodeId> {
        match &handle.data {
            RcNodeData::Element { name, attrs, .. } => {
                let id = self.create_element(&name.local);
                for attr in attrs.borrow().iter() {
                    let attr_name = attr.name.local.to_string();
                    self.set_attr(id, &attr_name, &attr.value);
                }
                for child in handle.children.borrow().iter() {
                    if let Some(child_id) = self.import_rc_node(child) {
                        self.append_child(id, child_id);
                    }
                }
                Some(id)
            }
            RcNodeData::Text { contents } => Some(self.create_text(&contents.borrow())),
            RcNodeData::Comment { contents } => Some(self.create_comment(contents)),
            _ => None,
        }
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
