//! Arena DOM used as the render target of the runtime.
//!
//! Nodes live in one arena owned by a [`Document`] and are addressed by
//! [`NodeId`]. Removed nodes stay in the arena, detached. The arena is never
//! borrowed while listeners run, so listeners may mutate the document.

use html5ever::{parse_fragment, LocalName, Namespace, QualName};
use indexmap::{IndexMap, IndexSet};
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tendril::TendrilSink;

use crate::codegen::{escape_attribute, escape_text, RAW_TEXT_PARENTS, VOID_ELEMENTS};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type Listener = Rc<dyn Fn(&Value)>;

#[derive(Debug, Clone, Default)]
pub struct ElementData {
    pub tag: String,
    pub attributes: IndexMap<String, String>,
    pub styles: IndexMap<String, String>,
    pub properties: IndexMap<String, Value>,
    pub shadow_root: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Fragment,
    ShadowRoot { host: NodeId },
    Element(ElementData),
    Text(String),
    Comment(String),
    Template { data: ElementData, content: NodeId },
}

struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    listeners: Vec<(String, Listener)>,
}

struct Arena {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Arena {
    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            kind,
            parent: None,
            children: Vec::new(),
            listeners: Vec::new(),
        });
        id
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.node_mut(id).parent.take() {
            self.node_mut(parent).children.retain(|c| *c != id);
        }
    }

    fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.node(id).kind {
            NodeKind::Element(data) | NodeKind::Template { data, .. } => Some(data),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match &mut self.node_mut(id).kind {
            NodeKind::Element(data) | NodeKind::Template { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// Start and end boundary of a dynamic region. A region without an end
/// boundary extends to the end of its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub start: NodeId,
    pub end: Option<NodeId>,
}

#[derive(Clone)]
pub struct Document {
    arena: Rc<RefCell<Arena>>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut arena = Arena {
            nodes: Vec::new(),
            root: NodeId(0),
        };
        let root = arena.push(NodeKind::Fragment);
        arena.root = root;
        Document {
            arena: Rc::new(RefCell::new(arena)),
        }
    }

    /// The connected root; nodes reachable from it are connected.
    pub fn root(&self) -> NodeId {
        self.arena.borrow().root
    }

    pub fn ptr_eq(&self, other: &Document) -> bool {
        Rc::ptr_eq(&self.arena, &other.arena)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CREATION
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn create_fragment(&self) -> NodeId {
        self.arena.borrow_mut().push(NodeKind::Fragment)
    }

    pub fn create_element(&self, tag: &str) -> NodeId {
        let tag = tag.to_ascii_lowercase();
        let mut arena = self.arena.borrow_mut();
        if tag == "template" {
            let content = arena.push(NodeKind::Fragment);
            return arena.push(NodeKind::Template {
                data: ElementData {
                    tag,
                    ..Default::default()
                },
                content,
            });
        }
        arena.push(NodeKind::Element(ElementData {
            tag,
            ..Default::default()
        }))
    }

    pub fn create_text(&self, text: &str) -> NodeId {
        self.arena.borrow_mut().push(NodeKind::Text(text.to_string()))
    }

    pub fn create_comment(&self, data: &str) -> NodeId {
        self.arena.borrow_mut().push(NodeKind::Comment(data.to_string()))
    }

    /// Attach (or return the existing) shadow root of `host`.
    pub fn attach_shadow(&self, host: NodeId) -> NodeId {
        let mut arena = self.arena.borrow_mut();
        if let Some(existing) = arena.element(host).and_then(|e| e.shadow_root) {
            return existing;
        }
        let shadow = arena.push(NodeKind::ShadowRoot { host });
        if let Some(data) = arena.element_mut(host) {
            data.shadow_root = Some(shadow);
        }
        shadow
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // TREE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fragments are unpacked: their children move into `parent`.
    pub fn insert_before(&self, parent: NodeId, child: NodeId, reference: Option<NodeId>) {
        let mut arena = self.arena.borrow_mut();
        let moving: Vec<NodeId> = match arena.node(child).kind {
            NodeKind::Fragment => std::mem::take(&mut arena.node_mut(child).children),
            _ => vec![child],
        };
        for node in &moving {
            arena.detach(*node);
        }
        let position = reference
            .and_then(|r| arena.node(parent).children.iter().position(|c| *c == r))
            .unwrap_or(arena.node(parent).children.len());
        for (offset, node) in moving.iter().enumerate() {
            arena.node_mut(*node).parent = Some(parent);
            arena
                .node_mut(parent)
                .children
                .insert(position + offset, *node);
        }
    }

    pub fn append_child(&self, parent: NodeId, child: NodeId) {
        self.insert_before(parent, child, None);
    }

    pub fn remove(&self, node: NodeId) {
        self.arena.borrow_mut().detach(node);
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.arena.borrow().node(node).parent
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.arena.borrow().node(node).children.clone()
    }

    pub fn next_sibling(&self, node: NodeId) -> Option<NodeId> {
        let arena = self.arena.borrow();
        let parent = arena.node(node).parent?;
        let siblings = &arena.node(parent).children;
        let index = siblings.iter().position(|c| *c == node)?;
        siblings.get(index + 1).copied()
    }

    /// Nearest element ancestor, not crossing a shadow root.
    pub fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.parent(node)?;
        self.is_element(parent).then_some(parent)
    }

    pub fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.arena.borrow().element(host).and_then(|e| e.shadow_root)
    }

    pub fn shadow_host(&self, shadow: NodeId) -> Option<NodeId> {
        match self.arena.borrow().node(shadow).kind {
            NodeKind::ShadowRoot { host } => Some(host),
            _ => None,
        }
    }

    /// Whether `node` is reachable from the root, crossing shadow boundaries.
    pub fn is_connected(&self, node: NodeId) -> bool {
        let arena = self.arena.borrow();
        let mut current = node;
        loop {
            if current == arena.root {
                return true;
            }
            let entry = arena.node(current);
            current = match (&entry.kind, entry.parent) {
                (_, Some(parent)) => parent,
                (NodeKind::ShadowRoot { host }, None) => *host,
                _ => return false,
            };
        }
    }

    /// Pre-order descendants of `node` (excluding itself). Template contents
    /// and shadow roots are not entered.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let arena = self.arena.borrow();
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = arena.node(node).children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(arena.node(current).children.iter().rev().copied());
        }
        out
    }

    /// `node` and its descendants, entering shadow roots of elements.
    pub fn shadow_including_inclusive_descendants(&self, node: NodeId) -> Vec<NodeId> {
        let arena = self.arena.borrow();
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            out.push(current);
            let entry = arena.node(current);
            stack.extend(entry.children.iter().rev().copied());
            if let Some(shadow) = arena.element(current).and_then(|e| e.shadow_root) {
                stack.push(shadow);
            }
        }
        out
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // NODE DATA
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn kind(&self, node: NodeId) -> NodeKind {
        self.arena.borrow().node(node).kind.clone()
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.arena.borrow().element(node).is_some()
    }

    pub fn tag_name(&self, node: NodeId) -> Option<String> {
        self.arena.borrow().element(node).map(|e| e.tag.clone())
    }

    pub fn comment_data(&self, node: NodeId) -> Option<String> {
        match &self.arena.borrow().node(node).kind {
            NodeKind::Comment(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn template_content(&self, node: NodeId) -> Option<NodeId> {
        match self.arena.borrow().node(node).kind {
            NodeKind::Template { content, .. } => Some(content),
            _ => None,
        }
    }

    pub fn set_text(&self, node: NodeId, text: &str) {
        if let NodeKind::Text(current) = &mut self.arena.borrow_mut().node_mut(node).kind {
            *current = text.to_string();
        }
    }

    /// Concatenated text of `node` and its descendants.
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        for id in std::iter::once(node).chain(self.descendants(node)) {
            if let NodeKind::Text(text) = &self.arena.borrow().node(id).kind {
                out.push_str(text);
            }
        }
        out
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.arena
            .borrow()
            .element(node)
            .and_then(|e| e.attributes.get(name).cloned())
    }

    pub fn has_attribute(&self, node: NodeId, name: &str) -> bool {
        self.arena
            .borrow()
            .element(node)
            .is_some_and(|e| e.attributes.contains_key(name))
    }

    pub fn set_attribute(&self, node: NodeId, name: &str, value: &str) {
        if let Some(data) = self.arena.borrow_mut().element_mut(node) {
            data.attributes.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_attribute(&self, node: NodeId, name: &str) {
        if let Some(data) = self.arena.borrow_mut().element_mut(node) {
            data.attributes.shift_remove(name);
        }
    }

    pub fn classes(&self, node: NodeId) -> IndexSet<String> {
        self.attribute(node, "class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.classes(node).contains(class)
    }

    pub fn toggle_class(&self, node: NodeId, class: &str, on: bool) {
        let mut classes = self.classes(node);
        let changed = if on {
            classes.insert(class.to_string())
        } else {
            classes.shift_remove(class)
        };
        if changed {
            let joined = classes.into_iter().collect::<Vec<_>>().join(" ");
            self.set_attribute(node, "class", &joined);
        }
    }

    pub fn set_style_property(&self, node: NodeId, name: &str, value: &str) {
        if let Some(data) = self.arena.borrow_mut().element_mut(node) {
            data.styles.insert(name.to_string(), value.to_string());
        }
    }

    pub fn style_property(&self, node: NodeId, name: &str) -> Option<String> {
        self.arena
            .borrow()
            .element(node)
            .and_then(|e| e.styles.get(name).cloned())
    }

    pub fn set_property(&self, node: NodeId, name: &str, value: Value) {
        if let Some(data) = self.arena.borrow_mut().element_mut(node) {
            data.properties.insert(name.to_string(), value);
        }
    }

    pub fn property(&self, node: NodeId, name: &str) -> Option<Value> {
        self.arena
            .borrow()
            .element(node)
            .and_then(|e| e.properties.get(name).cloned())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // EVENTS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn add_event_listener(&self, node: NodeId, event: &str, listener: impl Fn(&Value) + 'static) {
        self.arena
            .borrow_mut()
            .node_mut(node)
            .listeners
            .push((event.to_string(), Rc::new(listener)));
    }

    pub fn listener_count(&self, node: NodeId, event: &str) -> usize {
        self.arena
            .borrow()
            .node(node)
            .listeners
            .iter()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// Invoke the listeners of `node` for `event` with `payload`.
    pub fn dispatch_event(&self, node: NodeId, event: &str, payload: &Value) {
        let listeners: Vec<Listener> = self
            .arena
            .borrow()
            .node(node)
            .listeners
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(payload);
        }
    }

    /// Event object exposing `type` and a `target` snapshot of the element's properties.
    pub fn event_payload(&self, node: NodeId, event: &str) -> Value {
        let target = {
            let arena = self.arena.borrow();
            let properties = arena
                .element(node)
                .map(|e| e.properties.clone())
                .unwrap_or_default();
            Value::object(properties)
        };
        Value::object([("type", Value::from(event)), ("target", target)])
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // CLONING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Deep clone, detached. Listeners, properties and shadow roots are not cloned.
    pub fn clone_node(&self, node: NodeId) -> NodeId {
        let mut arena = self.arena.borrow_mut();
        clone_into(&mut arena, node)
    }

    /// A detached fragment holding clones of the template's content.
    pub fn clone_template_content(&self, template: NodeId) -> NodeId {
        let mut arena = self.arena.borrow_mut();
        let fragment = arena.push(NodeKind::Fragment);
        if let NodeKind::Template { content, .. } = arena.node(template).kind {
            let children = arena.node(content).children.clone();
            for child in children {
                let copy = clone_into(&mut arena, child);
                arena.node_mut(copy).parent = Some(fragment);
                arena.node_mut(fragment).children.push(copy);
            }
        }
        fragment
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // HTML
    // ═══════════════════════════════════════════════════════════════════════════

    /// Replace the children of `node` with the parsed `html`.
    pub fn set_inner_html(&self, node: NodeId, html: &str) -> Result<(), std::io::Error> {
        let context = QualName::new(
            None,
            Namespace::from("http://www.w3.org/1999/xhtml"),
            LocalName::from("template"),
        );
        let dom = parse_fragment(RcDom::default(), Default::default(), context, vec![])
            .from_utf8()
            .read_from(&mut html.as_bytes())?;

        let roots: Vec<Handle> = {
            let document_children = dom.document.children.borrow();
            match document_children.first() {
                Some(html) => html.children.borrow().clone(),
                None => Vec::new(),
            }
        };

        let mut arena = self.arena.borrow_mut();
        let old = std::mem::take(&mut arena.node_mut(node).children);
        for child in old {
            arena.node_mut(child).parent = None;
        }
        for handle in &roots {
            if let Some(child) = load_handle(&mut arena, handle) {
                arena.node_mut(child).parent = Some(node);
                arena.node_mut(node).children.push(child);
            }
        }
        Ok(())
    }

    pub fn inner_html(&self, node: NodeId) -> String {
        let arena = self.arena.borrow();
        let mut out = String::new();
        let raw = arena
            .element(node)
            .is_some_and(|e| RAW_TEXT_PARENTS.contains(&e.tag.as_str()));
        for child in &arena.node(node).children {
            serialize(&arena, *child, raw, &mut out);
        }
        out
    }

    pub fn outer_html(&self, node: NodeId) -> String {
        let arena = self.arena.borrow();
        let mut out = String::new();
        serialize(&arena, node, false, &mut out);
        out
    }

    /// Elements under `root` (template contents excluded) carrying `name`.
    pub fn elements_with_attribute(&self, root: NodeId, name: &str) -> Vec<NodeId> {
        self.descendants(root)
            .into_iter()
            .filter(|id| self.has_attribute(*id, name))
            .collect()
    }

    /// Comment nodes under `root` (template contents excluded).
    pub fn comments(&self, root: NodeId) -> Vec<(NodeId, String)> {
        self.descendants(root)
            .into_iter()
            .filter_map(|id| self.comment_data(id).map(|data| (id, data)))
            .collect()
    }
}

fn clone_into(arena: &mut Arena, node: NodeId) -> NodeId {
    let kind = match &arena.node(node).kind {
        NodeKind::Element(data) => NodeKind::Element(ElementData {
            tag: data.tag.clone(),
            attributes: data.attributes.clone(),
            styles: data.styles.clone(),
            properties: IndexMap::new(),
            shadow_root: None,
        }),
        NodeKind::Template { data, content } => {
            let source_content = *content;
            let data = data.clone();
            let content = arena.push(NodeKind::Fragment);
            let children = arena.node(source_content).children.clone();
            for child in children {
                let copy = clone_into(arena, child);
                arena.node_mut(copy).parent = Some(content);
                arena.node_mut(content).children.push(copy);
            }
            NodeKind::Template { data, content }
        }
        NodeKind::ShadowRoot { .. } => NodeKind::Fragment,
        other => other.clone(),
    };
    let copy = arena.push(kind);
    if matches!(arena.node(copy).kind, NodeKind::Template { .. }) {
        return copy;
    }
    let children = arena.node(node).children.clone();
    for child in children {
        let child_copy = clone_into(arena, child);
        arena.node_mut(child_copy).parent = Some(copy);
        arena.node_mut(copy).children.push(child_copy);
    }
    copy
}

fn load_handle(arena: &mut Arena, handle: &Handle) -> Option<NodeId> {
    match &handle.data {
        NodeData::Text { contents } => Some(arena.push(NodeKind::Text(contents.borrow().to_string()))),
        NodeData::Comment { contents } => Some(arena.push(NodeKind::Comment(contents.to_string()))),
        NodeData::Element {
            name,
            attrs,
            template_contents,
            ..
        } => {
            let data = ElementData {
                tag: name.local.to_string(),
                attributes: attrs
                    .borrow()
                    .iter()
                    .map(|a| (a.name.local.to_string(), a.value.to_string()))
                    .collect(),
                ..Default::default()
            };

            let template_children = template_contents
                .borrow()
                .as_ref()
                .map(|content| content.children.borrow().clone());
            let (id, container, children) = match template_children {
                Some(children) => {
                    let content = arena.push(NodeKind::Fragment);
                    let id = arena.push(NodeKind::Template { data, content });
                    (id, content, children)
                }
                None => {
                    let id = arena.push(NodeKind::Element(data));
                    (id, id, handle.children.borrow().clone())
                }
            };
            for child in &children {
                if let Some(child_id) = load_handle(arena, child) {
                    arena.node_mut(child_id).parent = Some(container);
                    arena.node_mut(container).children.push(child_id);
                }
            }
            Some(id)
        }
        _ => None,
    }
}

fn serialize_open_tag(data: &ElementData, out: &mut String) {
    out.push('<');
    out.push_str(&data.tag);
    for (name, value) in &data.attributes {
        if name == "style" && !data.styles.is_empty() {
            continue;
        }
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_attribute(value));
        out.push('"');
    }
    if !data.styles.is_empty() {
        let style = data
            .styles
            .iter()
            .map(|(k, v)| format!("{}: {};", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        out.push_str(" style=\"");
        out.push_str(&escape_attribute(&style));
        out.push('"');
    }
    out.push('>');
}

fn serialize(arena: &Arena, node: NodeId, raw_text: bool, out: &mut String) {
    let entry = arena.node(node);
    match &entry.kind {
        NodeKind::Text(text) => {
            if raw_text {
                out.push_str(text);
            } else {
                out.push_str(&escape_text(text));
            }
        }
        NodeKind::Comment(data) => {
            out.push_str("<!--");
            out.push_str(data);
            out.push_str("-->");
        }
        NodeKind::Fragment | NodeKind::ShadowRoot { .. } => {
            for child in &entry.children {
                serialize(arena, *child, raw_text, out);
            }
        }
        NodeKind::Element(data) => {
            serialize_open_tag(data, out);
            if VOID_ELEMENTS.contains(&data.tag.as_str()) {
                return;
            }
            let raw = RAW_TEXT_PARENTS.contains(&data.tag.as_str());
            for child in &entry.children {
                serialize(arena, *child, raw, out);
            }
            out.push_str("</");
            out.push_str(&data.tag);
            out.push('>');
        }
        NodeKind::Template { data, content } => {
            serialize_open_tag(data, out);
            for child in &arena.node(*content).children {
                serialize(arena, *child, false, out);
            }
            out.push_str("</template>");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_html_round_trip() {
        let doc = Document::new();
        let host = doc.create_element("div");
        let html = r#"<p class="a">x &amp; y</p><!--fluff:text:0--><input value="1"><template data-fluff-tpl="x-a-0"><li>item</li></template>"#;
        doc.set_inner_html(host, html).unwrap();
        assert_eq!(doc.inner_html(host), html);
        assert_eq!(doc.comments(host).len(), 1);
    }

    #[test]
    fn test_template_content_is_not_a_descendant() {
        let doc = Document::new();
        let host = doc.create_element("div");
        doc.set_inner_html(host, "<template><b>t</b></template><i>i</i>").unwrap();
        let tags: Vec<String> = doc
            .descendants(host)
            .into_iter()
            .filter_map(|n| doc.tag_name(n))
            .collect();
        assert_eq!(tags, vec!["template", "i"]);
    }

    #[test]
    fn test_clone_template_content_and_insert() {
        let doc = Document::new();
        let host = doc.create_element("ul");
        doc.set_inner_html(host, "<!--s--><!--e--><template><li>a</li><li>b</li></template>")
            .unwrap();
        let children = doc.children(host);
        let fragment = doc.clone_template_content(children[2]);
        doc.insert_before(host, fragment, Some(children[1]));
        assert_eq!(
            doc.inner_html(host),
            "<!--s--><li>a</li><li>b</li><!--e--><template><li>a</li><li>b</li></template>"
        );
        assert!(doc.children(fragment).is_empty());
    }

    #[test]
    fn test_connectivity_crosses_shadow_roots() {
        let doc = Document::new();
        let host = doc.create_element("x-card");
        let shadow = doc.attach_shadow(host);
        let inner = doc.create_element("span");
        doc.append_child(shadow, inner);
        assert!(!doc.is_connected(inner));

        doc.append_child(doc.root(), host);
        assert!(doc.is_connected(inner));
        assert_eq!(doc.attach_shadow(host), shadow);

        doc.remove(host);
        assert!(!doc.is_connected(inner));
    }

    #[test]
    fn test_classes_and_styles() {
        let doc = Document::new();
        let el = doc.create_element("div");
        doc.set_attribute(el, "class", "card");
        doc.toggle_class(el, "active", true);
        doc.toggle_class(el, "active", true);
        assert_eq!(doc.attribute(el, "class").as_deref(), Some("card active"));
        doc.toggle_class(el, "card", false);
        assert_eq!(doc.attribute(el, "class").as_deref(), Some("active"));

        doc.set_style_property(el, "color", "red");
        assert_eq!(doc.outer_html(el), r#"<div class="active" style="color: red;"></div>"#);
    }

    #[test]
    fn test_listeners_may_mutate_document() {
        let doc = Document::new();
        let button = doc.create_element("button");
        let inner = doc.clone();
        doc.add_event_listener(button, "click", move |_| {
            let text = inner.create_text("clicked");
            inner.append_child(button, text);
        });
        let payload = doc.event_payload(button, "click");
        doc.dispatch_event(button, "click", &payload);
        assert_eq!(doc.text_content(button), "clicked");
    }
}
