//! Host document backed by a kuchiki tree.
//!
//! This is the "real" document the sandbox renders into. Nodes are addressed by
//! [`HostNodeId`] and never freed while the document lives; detached nodes stay
//! addressable until the owner drops the document, the same way a browser keeps
//! a removed node alive while something still references it.
//!
//! kuchiki owns the tree shape, attributes and serialisation. The document
//! layers what kuchiki has no notion of on top: closed shadow roots (kept as
//! the contents of a `<template shadowrootmode="closed">`), inline style
//! declarations, form-control state, layout boxes and listener tables.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use html5ever::{LocalName, Namespace as NamespaceUrl, QualName};
use kuchiki::{Attributes, Node, NodeRef};

pub type SharedDocument = Rc<RefCell<HostDocument>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostNodeId(usize);

impl HostNodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Html,
    Svg,
}

impl Namespace {
    pub const HTML_URI: &'static str = "http://www.w3.org/1999/xhtml";
    pub const SVG_URI: &'static str = "http://www.w3.org/2000/svg";

    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            Self::HTML_URI => Some(Namespace::Html),
            Self::SVG_URI => Some(Namespace::Svg),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Namespace::Html => Self::HTML_URI,
            Namespace::Svg => Self::SVG_URI,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LayoutBox {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostListener {
    pub id: ListenerId,
    pub event: String,
    pub capture: bool,
    pub once: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleKey(u64);

/// Rule list of a `<style>` element. Rules are addressed by stable keys so
/// deleting one rule never shifts another owner's bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct StyleSheet {
    rules: Vec<(RuleKey, String)>,
    next_key: u64,
}

impl StyleSheet {
    pub fn insert_rule(&mut self, rule: &str) -> RuleKey {
        self.next_key += 1;
        let key = RuleKey(self.next_key);
        self.rules.push((key, rule.trim().to_string()));
        key
    }

    pub fn delete_rule(&mut self, key: RuleKey) -> bool {
        let before = self.rules.len();
        self.rules.retain(|(existing, _)| *existing != key);
        before != self.rules.len()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(_, rule)| rule.as_str())
    }

    pub fn css_text(&self) -> String {
        self.rules().collect::<Vec<_>>().join("\n")
    }
}

const STYLE_PROPERTIES: &[&str] = &[
    "alignContent", "alignItems", "alignSelf", "animation", "animationDelay",
    "animationDuration", "animationName", "background", "backgroundColor",
    "backgroundImage", "backgroundPosition", "backgroundRepeat", "backgroundSize", "border",
    "borderBottom", "borderColor", "borderLeft", "borderRadius", "borderRight", "borderStyle",
    "borderTop", "borderWidth", "bottom", "boxShadow", "boxSizing", "clear", "color", "content",
    "cursor", "display", "fill", "flex", "flexBasis", "flexDirection", "flexGrow", "flexShrink",
    "flexWrap", "float", "font", "fontFamily", "fontSize", "fontStyle", "fontWeight", "gap",
    "grid", "gridArea", "gridColumn", "gridRow", "gridTemplateColumns", "gridTemplateRows",
    "height", "justifyContent", "left", "letterSpacing", "lineHeight", "listStyle",
    "listStyleImage", "margin", "marginBottom", "marginLeft", "marginRight", "marginTop",
    "maxHeight", "maxWidth", "minHeight", "minWidth", "opacity", "order", "outline", "overflow",
    "overflowX", "overflowY", "padding", "paddingBottom", "paddingLeft", "paddingRight",
    "paddingTop", "pointerEvents", "position", "right", "stroke", "strokeWidth", "tableLayout",
    "textAlign", "textDecoration", "textOverflow", "textTransform", "top", "transform",
    "transition", "userSelect", "verticalAlign", "visibility", "whiteSpace", "width",
    "wordBreak", "zIndex",
];

/// Inline style of an element. Only known CSS properties exist on it; each is
/// a string, empty when unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleDeclaration {
    values: BTreeMap<&'static str, String>,
}

impl StyleDeclaration {
    pub fn is_known(property: &str) -> bool {
        STYLE_PROPERTIES.contains(&property)
    }

    pub fn get(&self, property: &str) -> Option<&str> {
        let known = STYLE_PROPERTIES.iter().find(|known| **known == property)?;
        Some(self.values.get(known).map(String::as_str).unwrap_or(""))
    }

    pub fn set(&mut self, property: &str, value: &str) -> bool {
        let Some(known) = STYLE_PROPERTIES.iter().find(|known| **known == property) else {
            return false;
        };
        if value.is_empty() {
            self.values.remove(known);
        } else {
            self.values.insert(known, value.to_string());
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Non-empty properties in camelCase.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.values.iter().map(|(name, value)| (*name, value.as_str()))
    }

    pub fn css_text(&self) -> String {
        self.values
            .iter()
            .map(|(name, value)| format!("{}: {};", kebab_case(name), value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn kebab_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct ElementData {
    pub tag: String,
    pub namespace: Namespace,
    style: StyleDeclaration,
    dirty_value: Option<String>,
    checked: bool,
    selected_index: Option<usize>,
    shadow_root: Option<HostNodeId>,
    layout: LayoutBox,
}

impl ElementData {
    fn new(tag: &str, namespace: Namespace) -> Self {
        let tag = match namespace {
            Namespace::Html => tag.to_ascii_lowercase(),
            Namespace::Svg => tag.to_string(),
        };
        Self {
            tag,
            namespace,
            style: StyleDeclaration::default(),
            dirty_value: None,
            checked: false,
            selected_index: None,
            shadow_root: None,
            layout: LayoutBox::default(),
        }
    }

    pub fn style(&self) -> &StyleDeclaration {
        &self.style
    }
}

#[derive(Debug, Clone)]
pub enum NodeData {
    Element(ElementData),
    Text,
    ShadowRoot { host: HostNodeId },
}

pub struct HostNode {
    pub id: HostNodeId,
    pub data: NodeData,
    tree: NodeRef,
    listeners: Vec<HostListener>,
}

impl HostNode {
    pub fn element(&self) -> Option<&ElementData> {
        match &self.data {
            NodeData::Element(data) => Some(data),
            _ => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self.data, NodeData::Text)
    }

    pub fn listeners(&self) -> &[HostListener] {
        &self.listeners
    }
}

fn new_element_tree(tag: &str, namespace: Namespace, template_contents: Option<NodeRef>) -> NodeRef {
    NodeRef::new(kuchiki::NodeData::Element(kuchiki::ElementData {
        name: QualName::new(None, NamespaceUrl::from(namespace.uri()), LocalName::from(tag)),
        attributes: RefCell::new(Attributes {
            map: Default::default(),
        }),
        template_contents,
    }))
}

pub struct HostDocument {
    nodes: Vec<HostNode>,
    ids: HashMap<*const Node, HostNodeId>,
    body: HostNodeId,
    sheets: HashMap<HostNodeId, StyleSheet>,
}

impl Default for HostDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDocument {
    /// A document with an empty `<body>` to mount into.
    pub fn new() -> Self {
        let mut document = Self {
            nodes: Vec::new(),
            ids: HashMap::new(),
            body: HostNodeId(0),
            sheets: HashMap::new(),
        };
        document.body = document.create_element("body", Namespace::Html);
        document
    }

    pub fn shared() -> SharedDocument {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn body(&self) -> HostNodeId {
        self.body
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn push(&mut self, tree: NodeRef, data: NodeData) -> HostNodeId {
        let id = HostNodeId(self.nodes.len());
        self.ids.insert(Rc::as_ptr(&tree.0), id);
        self.nodes.push(HostNode {
            id,
            data,
            tree,
            listeners: Vec::new(),
        });
        id
    }

    /// The id of a tree node this document created. Shadow-root templates
    /// and stylesheet text are internal and have none.
    fn id_of(&self, tree: &NodeRef) -> Option<HostNodeId> {
        self.ids.get(&Rc::as_ptr(&tree.0)).copied()
    }

    pub fn create_element(&mut self, tag: &str, namespace: Namespace) -> HostNodeId {
        let data = ElementData::new(tag, namespace);
        let tree = new_element_tree(&data.tag, namespace, None);
        self.push(tree, NodeData::Element(data))
    }

    pub fn create_text_node(&mut self, text: &str) -> HostNodeId {
        self.push(NodeRef::new_text(text), NodeData::Text)
    }

    pub fn node(&self, id: HostNodeId) -> Result<&HostNode> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| anyhow!("missing host node {}", id.0))
    }

    fn node_mut(&mut self, id: HostNodeId) -> Result<&mut HostNode> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| anyhow!("missing host node {}", id.0))
    }

    fn tree(&self, id: HostNodeId) -> Result<&NodeRef> {
        Ok(&self.node(id)?.tree)
    }

    pub fn element(&self, id: HostNodeId) -> Result<&ElementData> {
        self.node(id)?
            .element()
            .ok_or_else(|| anyhow!("host node {} is not an element", id.0))
    }

    fn element_mut(&mut self, id: HostNodeId) -> Result<&mut ElementData> {
        match &mut self.node_mut(id)?.data {
            NodeData::Element(data) => Ok(data),
            _ => Err(anyhow!("host node {} is not an element", id.0)),
        }
    }

    fn attributes(&self, id: HostNodeId) -> Result<&RefCell<Attributes>> {
        self.element(id)?;
        self.tree(id)?
            .as_element()
            .map(|element| &element.attributes)
            .ok_or_else(|| anyhow!("host node {} is not an element", id.0))
    }

    pub fn node_type(&self, id: HostNodeId) -> Result<u16> {
        Ok(match self.node(id)?.data {
            NodeData::Element(_) => 1,
            NodeData::Text => 3,
            NodeData::ShadowRoot { .. } => 11,
        })
    }

    pub fn node_name(&self, id: HostNodeId) -> Result<String> {
        Ok(match &self.node(id)?.data {
            NodeData::Element(data) => match data.namespace {
                Namespace::Html => data.tag.to_ascii_uppercase(),
                Namespace::Svg => data.tag.clone(),
            },
            NodeData::Text => "#text".to_string(),
            NodeData::ShadowRoot { .. } => "#document-fragment".to_string(),
        })
    }

    pub fn parent(&self, id: HostNodeId) -> Result<Option<HostNodeId>> {
        Ok(self.tree(id)?.parent().and_then(|parent| self.id_of(&parent)))
    }

    pub fn parent_element(&self, id: HostNodeId) -> Result<Option<HostNodeId>> {
        let Some(parent) = self.parent(id)? else {
            return Ok(None);
        };
        Ok(self.node(parent)?.element().map(|_| parent))
    }

    pub fn children(&self, id: HostNodeId) -> Result<Vec<HostNodeId>> {
        Ok(self
            .tree(id)?
            .children()
            .filter_map(|child| self.id_of(&child))
            .collect())
    }

    fn check_insertion(&self, parent: HostNodeId, child: HostNodeId) -> Result<()> {
        if self.node(parent)?.is_text() {
            bail!("cannot insert into text node {}", parent.0);
        }
        if matches!(self.node(child)?.data, NodeData::ShadowRoot { .. }) {
            bail!("shadow root {} cannot be inserted", child.0);
        }
        if self.propagation_path(parent)?.contains(&child) {
            bail!("inserting node {} into {} would create a cycle", child.0, parent.0);
        }
        Ok(())
    }

    /// Removes `id` from its current parent, if any.
    pub fn detach(&mut self, id: HostNodeId) -> Result<()> {
        self.tree(id)?.detach();
        Ok(())
    }

    pub fn append_child(&mut self, parent: HostNodeId, child: HostNodeId) -> Result<()> {
        self.insert_before(parent, child, None)
    }

    pub fn insert_before(
        &mut self,
        parent: HostNodeId,
        child: HostNodeId,
        reference: Option<HostNodeId>,
    ) -> Result<()> {
        self.check_insertion(parent, child)?;
        let child_tree = self.tree(child)?.clone();
        match reference {
            Some(reference) => {
                if self.parent(reference)? != Some(parent) {
                    bail!(
                        "reference node {} is not a child of {}",
                        reference.0,
                        parent.0
                    );
                }
                if reference != child {
                    self.tree(reference)?.insert_before(child_tree);
                }
            }
            None => self.tree(parent)?.append(child_tree),
        }
        Ok(())
    }

    pub fn remove_child(&mut self, parent: HostNodeId, child: HostNodeId) -> Result<()> {
        if self.parent(child)? != Some(parent) {
            bail!("node {} is not a child of {}", child.0, parent.0);
        }
        self.detach(child)
    }

    /// Attaches a closed shadow root to `host` and returns it.
    pub fn attach_shadow(&mut self, host: HostNodeId) -> Result<HostNodeId> {
        if self.element(host)?.shadow_root.is_some() {
            bail!("element {} already hosts a shadow root", host.0);
        }
        let contents = NodeRef::new(kuchiki::NodeData::DocumentFragment);
        let template = new_element_tree("template", Namespace::Html, Some(contents.clone()));
        if let Some(element) = template.as_element() {
            element
                .attributes
                .borrow_mut()
                .insert("shadowrootmode", "closed".to_string());
        }
        self.tree(host)?.prepend(template);
        let root = self.push(contents, NodeData::ShadowRoot { host });
        self.element_mut(host)?.shadow_root = Some(root);
        Ok(root)
    }

    pub fn shadow_root(&self, host: HostNodeId) -> Result<Option<HostNodeId>> {
        Ok(self.element(host)?.shadow_root)
    }

    /// First element at or below `root` (shadow trees included) whose
    /// attribute `name` equals `value`.
    pub fn find_by_attribute(&self, root: HostNodeId, name: &str, value: &str) -> Option<HostNodeId> {
        let node = self.nodes.get(root.0)?;
        if let Some(element) = node.element() {
            if self.get_attribute(root, name).ok()?.as_deref() == Some(value) {
                return Some(root);
            }
            if let Some(shadow) = element.shadow_root {
                if let Some(found) = self.find_by_attribute(shadow, name, value) {
                    return Some(found);
                }
            }
        }
        self.children(root)
            .ok()?
            .into_iter()
            .find_map(|child| self.find_by_attribute(child, name, value))
    }

    pub fn get_attribute(&self, id: HostNodeId, name: &str) -> Result<Option<String>> {
        Ok(self
            .attributes(id)?
            .borrow()
            .get(name)
            .map(str::to_string))
    }

    pub fn set_attribute(&mut self, id: HostNodeId, name: &str, value: &str) -> Result<()> {
        if name == "style" {
            // The raw text replaces whatever the declaration held.
            self.element_mut(id)?.style = StyleDeclaration::default();
        }
        self.attributes(id)?
            .borrow_mut()
            .insert(name, value.to_string());
        Ok(())
    }

    pub fn remove_attribute(&mut self, id: HostNodeId, name: &str) -> Result<bool> {
        if name == "style" {
            self.element_mut(id)?.style = StyleDeclaration::default();
        }
        Ok(self.attributes(id)?.borrow_mut().remove(name).is_some())
    }

    /// Writes a reflected DOM property. Returns `false` for properties this
    /// document does not reflect.
    pub fn set_property(&mut self, id: HostNodeId, property: &str, value: &str) -> Result<bool> {
        let attribute = match property {
            "className" => "class",
            "colSpan" => "colspan",
            "rowSpan" => "rowspan",
            "dateTime" => "datetime",
            "htmlFor" => "for",
            "id" => "id",
            "title" => "title",
            "value" => {
                self.set_value(id, value)?;
                return Ok(true);
            }
            _ => return Ok(false),
        };
        self.set_attribute(id, attribute, value)?;
        Ok(true)
    }

    /// Text of every descendant text node. Shadow trees do not contribute.
    pub fn text_content(&self, id: HostNodeId) -> Result<String> {
        Ok(self.tree(id)?.text_contents())
    }

    pub fn set_text_content(&mut self, id: HostNodeId, text: &str) -> Result<()> {
        let tree = self.tree(id)?.clone();
        if let Some(existing) = tree.as_text() {
            *existing.borrow_mut() = text.to_string();
            return Ok(());
        }
        // The shadow-root template stays; it is not content.
        let replaced: Vec<NodeRef> = tree
            .children()
            .filter(|child| child.as_text().is_some() || self.id_of(child).is_some())
            .collect();
        for child in replaced {
            child.detach();
        }
        if !text.is_empty() {
            let text_node = self.create_text_node(text);
            self.append_child(id, text_node)?;
        }
        Ok(())
    }

    pub fn node_value(&self, id: HostNodeId) -> Result<Option<String>> {
        Ok(self.tree(id)?.as_text().map(|text| text.borrow().clone()))
    }

    /// Only text nodes carry a value; setting it elsewhere does nothing.
    pub fn set_node_value(&mut self, id: HostNodeId, value: &str) -> Result<()> {
        if let Some(existing) = self.tree(id)?.as_text() {
            *existing.borrow_mut() = value.to_string();
        }
        Ok(())
    }

    pub fn value(&self, id: HostNodeId) -> Result<String> {
        let element = self.element(id)?;
        Ok(match element.tag.as_str() {
            "input" => match &element.dirty_value {
                Some(value) => value.clone(),
                None => self.get_attribute(id, "value")?.unwrap_or_default(),
            },
            "textarea" => match &element.dirty_value {
                Some(value) => value.clone(),
                None => self.text_content(id)?,
            },
            "option" => match self.get_attribute(id, "value")? {
                Some(value) => value,
                None => self.text_content(id)?,
            },
            "select" => {
                let index = self.selected_index(id)?;
                let options = self.options(id)?;
                match usize::try_from(index).ok().and_then(|i| options.get(i)) {
                    Some(option) => self.value(*option)?,
                    None => String::new(),
                }
            }
            _ => String::new(),
        })
    }

    pub fn set_value(&mut self, id: HostNodeId, value: &str) -> Result<()> {
        let tag = self.element(id)?.tag.clone();
        match tag.as_str() {
            "input" | "textarea" => {
                self.element_mut(id)?.dirty_value = Some(value.to_string());
            }
            "option" => self.set_attribute(id, "value", value)?,
            "select" => {
                let options = self.options(id)?;
                let mut selected = None;
                for (index, option) in options.iter().enumerate() {
                    if self.value(*option)? == value {
                        selected = Some(index);
                        break;
                    }
                }
                self.element_mut(id)?.selected_index = selected;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn checked(&self, id: HostNodeId) -> Result<bool> {
        Ok(self.element(id)?.checked)
    }

    pub fn set_checked(&mut self, id: HostNodeId, checked: bool) -> Result<()> {
        self.element_mut(id)?.checked = checked;
        Ok(())
    }

    /// `<option>` children of a `<select>`, in document order.
    pub fn options(&self, id: HostNodeId) -> Result<Vec<HostNodeId>> {
        let mut options = Vec::new();
        for child in self.children(id)? {
            if self.node(child)?.element().map(|e| e.tag.as_str()) == Some("option") {
                options.push(child);
            }
        }
        Ok(options)
    }

    /// Selected option index; the first option when none was chosen, `-1`
    /// without options.
    pub fn selected_index(&self, id: HostNodeId) -> Result<i32> {
        let count = self.options(id)?.len();
        let index = match self.element(id)?.selected_index {
            Some(index) if index < count => index as i32,
            _ if count > 0 => 0,
            _ => -1,
        };
        Ok(index)
    }

    pub fn set_selected_index(&mut self, id: HostNodeId, index: Option<usize>) -> Result<()> {
        self.element_mut(id)?.selected_index = index;
        Ok(())
    }

    pub fn layout(&self, id: HostNodeId) -> Result<LayoutBox> {
        Ok(self.element(id)?.layout)
    }

    pub fn set_layout(&mut self, id: HostNodeId, layout: LayoutBox) -> Result<()> {
        self.element_mut(id)?.layout = layout;
        Ok(())
    }

    pub fn style(&self, id: HostNodeId) -> Result<&StyleDeclaration> {
        Ok(&self.element(id)?.style)
    }

    /// Set one inline style property and mirror the declaration into the
    /// `style` attribute. Returns `false` for unknown properties.
    pub fn set_style_property(&mut self, id: HostNodeId, property: &str, value: &str) -> Result<bool> {
        let style = &mut self.element_mut(id)?.style;
        if !style.set(property, value) {
            return Ok(false);
        }
        let css_text = style.css_text();
        let mut attributes = self.attributes(id)?.borrow_mut();
        if css_text.is_empty() {
            attributes.remove("style");
        } else {
            attributes.insert("style", css_text);
        }
        Ok(true)
    }

    pub fn sheet(&self, id: HostNodeId) -> Option<&StyleSheet> {
        self.sheets.get(&id)
    }

    /// Append a rule to the sheet of a `<style>` element.
    pub fn insert_rule(&mut self, id: HostNodeId, rule: &str) -> Result<RuleKey> {
        let key = self.sheet_mut(id)?.insert_rule(rule);
        self.sync_sheet_text(id)?;
        Ok(key)
    }

    pub fn delete_rule(&mut self, id: HostNodeId, key: RuleKey) -> Result<bool> {
        let deleted = self.sheet_mut(id)?.delete_rule(key);
        if deleted {
            self.sync_sheet_text(id)?;
        }
        Ok(deleted)
    }

    /// The rule list of a `<style>` element, created on first use.
    fn sheet_mut(&mut self, id: HostNodeId) -> Result<&mut StyleSheet> {
        if self.element(id)?.tag != "style" {
            bail!("host node {} is not a <style> element", id.0);
        }
        Ok(self.sheets.entry(id).or_default())
    }

    /// Replace the `<style>` element's text with its current rules.
    fn sync_sheet_text(&mut self, id: HostNodeId) -> Result<()> {
        let css_text = self.sheets.get(&id).map(StyleSheet::css_text).unwrap_or_default();
        let tree = self.tree(id)?;
        for child in tree.children().collect::<Vec<_>>() {
            child.detach();
        }
        if !css_text.is_empty() {
            tree.append(NodeRef::new_text(css_text));
        }
        Ok(())
    }

    pub fn add_listener(&mut self, id: HostNodeId, listener: HostListener) -> Result<()> {
        self.node_mut(id)?.listeners.push(listener);
        Ok(())
    }

    pub fn remove_listener(&mut self, id: HostNodeId, listener: ListenerId) -> Result<bool> {
        let node = self.node_mut(id)?;
        let before = node.listeners.len();
        node.listeners.retain(|existing| existing.id != listener);
        Ok(before != node.listeners.len())
    }

    /// Event path from `target` up to the outermost ancestor, crossing shadow
    /// roots into their hosts. The target comes first.
    pub fn propagation_path(&self, target: HostNodeId) -> Result<Vec<HostNodeId>> {
        let mut path = Vec::new();
        let mut current = Some(target);
        while let Some(id) = current {
            path.push(id);
            current = match self.node(id)?.data {
                NodeData::ShadowRoot { host } => Some(host),
                _ => self.parent(id)?,
            };
        }
        Ok(path)
    }

    pub fn to_html(&self) -> Result<String> {
        self.outer_html(self.body)
    }

    pub fn outer_html(&self, id: HostNodeId) -> Result<String> {
        Ok(self.tree(id)?.to_string())
    }

    /// Serialised children of `id`. A shadow host's children include its
    /// declarative `<template>`.
    pub fn inner_html(&self, id: HostNodeId) -> Result<String> {
        Ok(self
            .tree(id)?
            .children()
            .map(|child| child.to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_moves_between_parents() {
        let mut doc = HostDocument::new();
        let a = doc.create_element("div", Namespace::Html);
        let b = doc.create_element("div", Namespace::Html);
        let text = doc.create_text_node("hi");
        doc.append_child(a, text).unwrap();
        doc.append_child(b, text).unwrap();

        assert!(doc.children(a).unwrap().is_empty());
        assert_eq!(doc.children(b).unwrap(), vec![text]);
        assert_eq!(doc.parent(text).unwrap(), Some(b));
    }

    #[test]
    fn insert_before_orders_children() {
        let mut doc = HostDocument::new();
        let list = doc.create_element("ul", Namespace::Html);
        let first = doc.create_element("li", Namespace::Html);
        let second = doc.create_element("li", Namespace::Html);
        doc.append_child(list, second).unwrap();
        doc.insert_before(list, first, Some(second)).unwrap();
        assert_eq!(doc.children(list).unwrap(), vec![first, second]);
    }

    #[test]
    fn rejects_cycles() {
        let mut doc = HostDocument::new();
        let outer = doc.create_element("div", Namespace::Html);
        let inner = doc.create_element("div", Namespace::Html);
        doc.append_child(outer, inner).unwrap();
        assert!(doc.append_child(inner, outer).is_err());
    }

    #[test]
    fn remove_child_requires_parent() {
        let mut doc = HostDocument::new();
        let parent = doc.create_element("div", Namespace::Html);
        let stray = doc.create_element("span", Namespace::Html);
        assert!(doc.remove_child(parent, stray).is_err());
    }

    #[test]
    fn serializes_shadow_root_and_style() {
        let mut doc = HostDocument::new();
        let body = doc.body();
        let section = doc.create_element("section", Namespace::Html);
        doc.append_child(body, section).unwrap();
        let shadow = doc.attach_shadow(section).unwrap();
        let style = doc.create_element("style", Namespace::Html);
        doc.append_child(shadow, style).unwrap();
        doc.insert_rule(style, "h1 > b { color: red; }").unwrap();
        let div = doc.create_element("div", Namespace::Html);
        assert!(doc.set_style_property(div, "backgroundColor", "teal").unwrap());
        doc.append_child(shadow, div).unwrap();
        let span = doc.create_element("span", Namespace::Html);
        doc.set_attribute(span, "title", "a \"quote\"").unwrap();
        doc.append_child(div, span).unwrap();
        let text = doc.create_text_node("<hi>");
        doc.append_child(span, text).unwrap();
        let input = doc.create_element("input", Namespace::Html);
        doc.append_child(div, input).unwrap();

        let html = doc.to_html().unwrap();
        assert_eq!(
            html,
            "<body><section><template shadowrootmode=\"closed\"><style>h1 > b { color: red; }</style>\
             <div style=\"background-color: teal;\"><span title=\"a &quot;quote&quot;\">&lt;hi&gt;</span>\
             <input></div></template></section></body>"
        );
        assert_eq!(doc.children(section).unwrap(), Vec::<HostNodeId>::new());
        assert_eq!(doc.parent(div).unwrap(), Some(shadow));
    }

    #[test]
    fn text_content_replaces_children_but_keeps_shadow() {
        let mut doc = HostDocument::new();
        let host = doc.create_element("section", Namespace::Html);
        let shadow = doc.attach_shadow(host).unwrap();
        let inner = doc.create_text_node("hidden");
        doc.append_child(shadow, inner).unwrap();
        let old = doc.create_element("b", Namespace::Html);
        doc.append_child(host, old).unwrap();

        doc.set_text_content(host, "shown").unwrap();
        assert_eq!(doc.text_content(host).unwrap(), "shown");
        assert_eq!(doc.parent(old).unwrap(), None);
        assert_eq!(doc.shadow_root(host).unwrap(), Some(shadow));
        assert_eq!(
            doc.outer_html(host).unwrap(),
            "<section><template shadowrootmode=\"closed\">hidden</template>shown</section>"
        );
    }

    #[test]
    fn rejects_cycles_through_shadow_hosts() {
        let mut doc = HostDocument::new();
        let host = doc.create_element("section", Namespace::Html);
        doc.append_child(doc.body(), host).unwrap();
        let shadow = doc.attach_shadow(host).unwrap();
        assert!(doc.append_child(shadow, doc.body()).is_err());
        assert!(doc.append_child(shadow, host).is_err());
    }

    #[test]
    fn style_declaration_mirrors_into_attribute() {
        let mut doc = HostDocument::new();
        let div = doc.create_element("div", Namespace::Html);
        assert!(doc.set_style_property(div, "marginTop", "4px").unwrap());
        assert!(!doc.set_style_property(div, "bogus", "1").unwrap());
        assert_eq!(
            doc.get_attribute(div, "style").unwrap().as_deref(),
            Some("margin-top: 4px;")
        );
        assert!(doc.set_style_property(div, "marginTop", "").unwrap());
        assert_eq!(doc.get_attribute(div, "style").unwrap(), None);
    }

    #[test]
    fn propagation_crosses_shadow_boundary() {
        let mut doc = HostDocument::new();
        let host = doc.create_element("section", Namespace::Html);
        doc.append_child(doc.body(), host).unwrap();
        let shadow = doc.attach_shadow(host).unwrap();
        let button = doc.create_element("button", Namespace::Html);
        doc.append_child(shadow, button).unwrap();

        let path = doc.propagation_path(button).unwrap();
        assert_eq!(path, vec![button, shadow, host, doc.body()]);
    }

    #[test]
    fn stylesheet_keys_are_stable() {
        let mut sheet = StyleSheet::default();
        let a = sheet.insert_rule("a { color: red; }");
        let b = sheet.insert_rule("b { color: blue; }");
        assert!(sheet.delete_rule(a));
        assert!(!sheet.delete_rule(a));
        assert_eq!(sheet.rules().collect::<Vec<_>>(), vec!["b { color: blue; }"]);
        assert!(sheet.delete_rule(b));
        assert!(sheet.is_empty());
    }

    #[test]
    fn deleting_rules_rewrites_style_text() {
        let mut doc = HostDocument::new();
        let style = doc.create_element("style", Namespace::Html);
        let a = doc.insert_rule(style, "a { color: red; }").unwrap();
        doc.insert_rule(style, "b { color: blue; }").unwrap();
        assert_eq!(doc.text_content(style).unwrap(), "a { color: red; }\nb { color: blue; }");
        assert!(doc.delete_rule(style, a).unwrap());
        assert_eq!(doc.outer_html(style).unwrap(), "<style>b { color: blue; }</style>");

        let div = doc.create_element("div", Namespace::Html);
        assert!(doc.insert_rule(div, "a {}").is_err());
    }

    #[test]
    fn style_declaration_only_knows_css_properties() {
        let mut style = StyleDeclaration::default();
        assert_eq!(style.get("color"), Some(""));
        assert_eq!(style.get("cssFloat2"), None);
        assert!(style.set("color", "red"));
        assert!(!style.set("bogus", "1"));
        assert_eq!(style.css_text(), "color: red;");
    }

    #[test]
    fn select_value_follows_options() {
        let mut doc = HostDocument::new();
        let select = doc.create_element("select", Namespace::Html);
        for value in ["a", "b"] {
            let option = doc.create_element("option", Namespace::Html);
            doc.set_attribute(option, "value", value).unwrap();
            doc.append_child(select, option).unwrap();
        }
        assert_eq!(doc.selected_index(select).unwrap(), 0);
        doc.set_value(select, "b").unwrap();
        assert_eq!(doc.selected_index(select).unwrap(), 1);
        assert_eq!(doc.value(select).unwrap(), "b");
    }

    #[test]
    fn reflected_properties_write_attributes() {
        let mut doc = HostDocument::new();
        let cell = doc.create_element("td", Namespace::Html);
        assert!(doc.set_property(cell, "className", "wide").unwrap());
        assert!(doc.set_property(cell, "colSpan", "2").unwrap());
        assert!(!doc.set_property(cell, "innerHTML", "<b>").unwrap());
        assert_eq!(doc.get_attribute(cell, "class").unwrap().as_deref(), Some("wide"));
        assert_eq!(doc.get_attribute(cell, "colspan").unwrap().as_deref(), Some("2"));
    }
}
