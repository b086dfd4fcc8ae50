//! The DOM surface the sandbox sees.
//!
//! Every tracked node is a plain interpreter object whose prototype is shared
//! per [`ElementKind`]. Prototype members resolve `this` through the
//! [`NodeRegistry`] on each call, so a forged or stale object never reaches
//! the host document.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use rquickjs::object::Property;
use rquickjs::{Ctx, Exception, Object, Value};

use super::host::{HostListener, HostNodeId, ListenerId, Namespace, NodeData, SharedDocument};
use super::policy::{ElementInfo, FilterPolicy};
use super::registry::{handle_id, stamp_identity, NodeRegistry, TrackedNode};
use super::styles::{create_style_proxy, CssFilter};
use crate::error::BridgeError;
use crate::js::builder::{build_from_definition, ObjectDefinition};
use crate::js::handle::{HandleLedger, SandboxHandle};
use crate::js::marshal::{HostValue, Marshaller};
use crate::log::{ViolationKind, ViolationLog};

/// Which prototype a tracked node gets. Assigned once, when the node enters
/// the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Text,
    Element,
    Input,
    Select,
    TextArea,
    Option,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Extension {
    Value,
    Checked,
    Options,
}

const EXTENSIONS: &[(ElementKind, &[Extension])] = &[
    (ElementKind::Input, &[Extension::Value, Extension::Checked]),
    (ElementKind::Select, &[Extension::Value, Extension::Options]),
    (ElementKind::TextArea, &[Extension::Value]),
    (ElementKind::Option, &[Extension::Value]),
];

impl ElementKind {
    pub fn for_tag(tag: &str, namespace: Namespace) -> Self {
        if namespace != Namespace::Html {
            return ElementKind::Element;
        }
        match tag {
            "input" => ElementKind::Input,
            "select" => ElementKind::Select,
            "textarea" => ElementKind::TextArea,
            "option" => ElementKind::Option,
            _ => ElementKind::Element,
        }
    }

    fn extensions(self) -> &'static [Extension] {
        for (kind, extensions) in EXTENSIONS {
            if *kind == self {
                return extensions;
            }
        }
        &[]
    }
}

/// Log a bridge failure and raise it in the script as an `Error`.
pub(crate) fn throw(ctx: &Ctx<'_>, err: impl fmt::Display) -> rquickjs::Error {
    let message = err.to_string();
    tracing::error!(target: "sandbox::bridge", "{message}");
    Exception::throw_message(ctx, &message)
}

pub(crate) trait OrThrow<T> {
    fn or_throw(self, ctx: &Ctx<'_>) -> rquickjs::Result<T>;
}

impl<T, E: fmt::Display> OrThrow<T> for Result<T, E> {
    fn or_throw(self, ctx: &Ctx<'_>) -> rquickjs::Result<T> {
        self.map_err(|err| throw(ctx, err))
    }
}

pub(crate) fn js_string<'js>(ctx: &Ctx<'js>, value: &str) -> rquickjs::Result<Value<'js>> {
    Ok(rquickjs::String::from_str(ctx.clone(), value)?.into_value())
}

/// ECMAScript truthiness of a dumped value.
pub(crate) fn truthy(value: &HostValue) -> bool {
    match value {
        HostValue::Undefined | HostValue::Null => false,
        HostValue::Bool(flag) => *flag,
        HostValue::Number(number) => *number != 0.0 && !number.is_nan(),
        HostValue::String(text) => !text.is_empty(),
        _ => true,
    }
}

/// A node resolved from a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: u32,
    pub host: HostNodeId,
    pub kind: ElementKind,
}

struct ListenerEntry {
    node: u32,
    host: HostNodeId,
    event: String,
    capture: bool,
    callback: SandboxHandle,
}

type GetOp<'js> = fn(&DomBridge, &Ctx<'js>, &Value<'js>) -> rquickjs::Result<Value<'js>>;
type SetOp<'js> = fn(&DomBridge, &Ctx<'js>, &Value<'js>, Value<'js>) -> rquickjs::Result<()>;
type MethodOp<'js> =
    fn(&DomBridge, &Ctx<'js>, &Value<'js>, &[Value<'js>]) -> rquickjs::Result<Value<'js>>;

fn upgrade(ctx: &Ctx<'_>, weak: &Weak<DomBridge>) -> rquickjs::Result<Rc<DomBridge>> {
    weak.upgrade().ok_or_else(|| throw(ctx, BridgeError::Disposed))
}

fn getter<'js>(
    weak: &Weak<DomBridge>,
    op: GetOp<'js>,
) -> impl Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<Value<'js>> + 'js {
    let weak = weak.clone();
    move |ctx, this| op(&*upgrade(&ctx, &weak)?, &ctx, &this)
}

fn setter<'js>(
    weak: &Weak<DomBridge>,
    op: SetOp<'js>,
) -> impl Fn(Ctx<'js>, Value<'js>, Value<'js>) -> rquickjs::Result<()> + 'js {
    let weak = weak.clone();
    move |ctx, this, value| op(&*upgrade(&ctx, &weak)?, &ctx, &this, value)
}

fn method<'js>(
    weak: &Weak<DomBridge>,
    op: MethodOp<'js>,
) -> impl Fn(Ctx<'js>, Value<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> + 'js {
    let weak = weak.clone();
    move |ctx, this, args| op(&*upgrade(&ctx, &weak)?, &ctx, &this, &args)
}

/// Host side of the sandbox DOM: owns the registry, the per-kind
/// prototypes and every listener callback the script registered.
pub struct DomBridge {
    weak: Weak<DomBridge>,
    document: SharedDocument,
    policy: FilterPolicy,
    css: CssFilter,
    marshaller: Marshaller,
    violations: ViolationLog,
    ledger: HandleLedger,
    registry: RefCell<NodeRegistry>,
    prototypes: RefCell<HashMap<ElementKind, SandboxHandle>>,
    listeners: RefCell<BTreeMap<ListenerId, ListenerEntry>>,
    next_listener: Cell<u64>,
    disposed: Cell<bool>,
}

impl DomBridge {
    pub fn new(
        document: SharedDocument,
        policy: FilterPolicy,
        marshaller: Marshaller,
        ledger: HandleLedger,
    ) -> Rc<Self> {
        let violations = marshaller.violations().clone();
        Rc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            document,
            css: CssFilter::new(policy.clone(), violations.clone()),
            policy,
            marshaller,
            violations,
            ledger,
            registry: RefCell::new(NodeRegistry::new()),
            prototypes: RefCell::new(HashMap::new()),
            listeners: RefCell::new(BTreeMap::new()),
            next_listener: Cell::new(1),
            disposed: Cell::new(false),
        })
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn policy(&self) -> &FilterPolicy {
        &self.policy
    }

    pub fn css_filter(&self) -> &CssFilter {
        &self.css
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.marshaller
    }

    pub fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub fn tracked_count(&self) -> usize {
        self.registry.borrow().len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    pub fn tracked_id(&self, host: HostNodeId) -> Option<u32> {
        self.registry.borrow().find_by_node(host).map(|node| node.id)
    }

    pub fn tracked_host(&self, id: u32) -> Option<HostNodeId> {
        self.registry.borrow().find_by_id(id).map(|node| node.host)
    }

    /// Mark a tracked node as the synthetic document every node reports as
    /// its `ownerDocument`.
    pub fn set_document_node(&self, id: u32) {
        self.registry.borrow_mut().set_document(id);
    }

    fn ensure_live(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        if self.disposed.get() {
            return Err(throw(ctx, BridgeError::Disposed));
        }
        Ok(())
    }

    /// Resolve a handle to its tracked node. Untracked handles are a bridge
    /// invariant violation and raise.
    pub fn resolve<'js>(&self, ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Resolved> {
        self.ensure_live(ctx)?;
        let found = self
            .registry
            .borrow()
            .find_by_handle(ctx, value)
            .map(|node| Resolved {
                id: node.id,
                host: node.host,
                kind: node.kind,
            });
        found
            .ok_or(BridgeError::UntrackedHandle(handle_id(value)))
            .or_throw(ctx)
    }

    /// The tracked handle of `host`, wrapping it first when it is not yet
    /// tracked.
    pub fn track<'js>(&self, ctx: &Ctx<'js>, host: HostNodeId) -> rquickjs::Result<Value<'js>> {
        self.ensure_live(ctx)?;
        let existing = self
            .registry
            .borrow()
            .find_by_node(host)
            .map(|node| node.value(ctx))
            .transpose()?;
        if let Some(value) = existing {
            return Ok(value);
        }

        let kind = {
            let document = self.document.borrow();
            let node = document.node(host).or_throw(ctx)?;
            match &node.data {
                NodeData::Text => ElementKind::Text,
                NodeData::Element(element) => ElementKind::for_tag(&element.tag, element.namespace),
                NodeData::ShadowRoot { .. } => {
                    return Err(throw(ctx, format!("shadow root {} cannot be tracked", host.index())))
                }
            }
        };
        self.wrap(ctx, host, kind)
    }

    /// The tracked handle of `host`, or `undefined` when the node is unknown.
    pub fn handle_or_undefined<'js>(
        &self,
        ctx: &Ctx<'js>,
        host: Option<HostNodeId>,
    ) -> rquickjs::Result<Value<'js>> {
        self.handle_or(ctx, host, Value::new_undefined(ctx.clone()))
    }

    fn handle_or_null<'js>(&self, ctx: &Ctx<'js>, host: Option<HostNodeId>) -> rquickjs::Result<Value<'js>> {
        self.handle_or(ctx, host, Value::new_null(ctx.clone()))
    }

    fn handle_or<'js>(
        &self,
        ctx: &Ctx<'js>,
        host: Option<HostNodeId>,
        fallback: Value<'js>,
    ) -> rquickjs::Result<Value<'js>> {
        let Some(host) = host else {
            return Ok(fallback);
        };
        let registry = self.registry.borrow();
        match registry.find_by_node(host) {
            Some(node) => node.value(ctx),
            None => Ok(fallback),
        }
    }

    fn wrap<'js>(&self, ctx: &Ctx<'js>, host: HostNodeId, kind: ElementKind) -> rquickjs::Result<Value<'js>> {
        let prototype = self.prototype(ctx, kind)?;
        let object = Object::new(ctx.clone())?;
        object.set_prototype(Some(&prototype))?;

        let id = self.registry.borrow_mut().next_id();
        stamp_identity(&object, id)?;
        if kind != ElementKind::Text {
            let style = create_style_proxy(
                ctx,
                &self.marshaller,
                self.css.clone(),
                Rc::clone(&self.document),
                host,
            )?;
            object.prop("style", Property::from(style).enumerable())?;
        }

        let value = object.into_value();
        let handle = SandboxHandle::save(ctx, value.clone(), &self.ledger);
        self.registry
            .borrow_mut()
            .add(TrackedNode::new(id, host, kind, handle))
            .map(|_| ())
            .or_throw(ctx)?;
        tracing::trace!(target: "sandbox::bridge", id, host = host.index(), ?kind, "node tracked");
        Ok(value)
    }

    fn prototype<'js>(&self, ctx: &Ctx<'js>, kind: ElementKind) -> rquickjs::Result<Object<'js>> {
        if let Some(handle) = self.prototypes.borrow().get(&kind) {
            if let Some(prototype) = handle.value(ctx)?.into_object() {
                return Ok(prototype);
            }
        }
        let prototype = build_from_definition(ctx, &self.marshaller, self.definition(kind), None)?;
        let handle = SandboxHandle::save(ctx, prototype.clone().into_value(), &self.ledger);
        self.prototypes.borrow_mut().insert(kind, handle);
        Ok(prototype)
    }

    fn definition<'js>(&self, kind: ElementKind) -> ObjectDefinition<'js> {
        let weak = &self.weak;
        let mut definition = ObjectDefinition::new()
            .getter("nodeType", getter(weak, Self::node_type))
            .getter("nodeName", getter(weak, Self::node_name))
            .accessor(
                "textContent",
                getter(weak, Self::text_content),
                setter(weak, Self::set_text_content),
            )
            .accessor(
                "nodeValue",
                getter(weak, Self::node_value),
                setter(weak, Self::set_node_value),
            )
            .getter("ownerDocument", getter(weak, Self::owner_document))
            .getter("parentNode", getter(weak, Self::parent_node))
            .getter("parentElement", getter(weak, Self::parent_element));
        if kind == ElementKind::Text {
            return definition;
        }

        definition = definition
            .getter("tagName", getter(weak, Self::node_name))
            .getter("namespaceURI", getter(weak, Self::namespace_uri))
            .getter("offsetLeft", getter(weak, Self::offset_left))
            .getter("offsetTop", getter(weak, Self::offset_top))
            .getter("offsetWidth", getter(weak, Self::offset_width))
            .getter("offsetHeight", getter(weak, Self::offset_height))
            .getter("offsetParent", getter(weak, Self::parent_element))
            .native("createElement", method(weak, Self::create_element))
            .native("createElementNS", method(weak, Self::create_element_ns))
            .native("createTextNode", method(weak, Self::create_text_node))
            .native("getAttribute", method(weak, Self::get_attribute))
            .native("setAttribute", method(weak, Self::set_attribute))
            .native("removeAttribute", method(weak, Self::remove_attribute))
            .native("appendChild", method(weak, Self::append_child))
            .native("insertBefore", method(weak, Self::insert_before))
            .native("removeChild", method(weak, Self::remove_child))
            .native("addEventListener", method(weak, Self::add_event_listener))
            .native("removeEventListener", method(weak, Self::remove_event_listener));

        for extension in kind.extensions() {
            definition = match extension {
                Extension::Value => definition.accessor(
                    "value",
                    getter(weak, Self::value),
                    setter(weak, Self::set_value),
                ),
                Extension::Checked => definition.accessor(
                    "checked",
                    getter(weak, Self::checked),
                    setter(weak, Self::set_checked),
                ),
                Extension::Options => definition.getter("options", getter(weak, Self::options)),
            };
        }
        definition
    }

    fn string_arg(&self, args: &[Value<'_>], index: usize) -> String {
        args.get(index)
            .map(|value| self.marshaller.dump(value).to_string())
            .unwrap_or_default()
    }

    // Common node surface.

    fn node_type<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let kind = self.document.borrow().node_type(node.host).or_throw(ctx)?;
        Ok(Value::new_number(ctx.clone(), f64::from(kind)))
    }

    fn node_name<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let name = self.document.borrow().node_name(node.host).or_throw(ctx)?;
        js_string(ctx, &name)
    }

    fn text_content<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let text = self.document.borrow().text_content(node.host).or_throw(ctx)?;
        js_string(ctx, &text)
    }

    fn set_text_content<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>, value: Value<'js>) -> rquickjs::Result<()> {
        let node = self.resolve(ctx, this)?;
        let text = match self.marshaller.dump(&value) {
            HostValue::Null | HostValue::Undefined => String::new(),
            other => other.to_string(),
        };
        self.document
            .borrow_mut()
            .set_text_content(node.host, &text)
            .or_throw(ctx)
    }

    fn node_value<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        match self.document.borrow().node_value(node.host).or_throw(ctx)? {
            Some(text) => js_string(ctx, &text),
            None => Ok(Value::new_null(ctx.clone())),
        }
    }

    fn set_node_value<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>, value: Value<'js>) -> rquickjs::Result<()> {
        let node = self.resolve(ctx, this)?;
        let text = self.marshaller.dump(&value).to_string();
        self.document
            .borrow_mut()
            .set_node_value(node.host, &text)
            .or_throw(ctx)
    }

    fn owner_document<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let document = self.registry.borrow().document().map(|doc| (doc.id, doc.host));
        match document {
            Some((id, _)) if id == node.id => Ok(Value::new_null(ctx.clone())),
            Some((_, host)) => self.handle_or_null(ctx, Some(host)),
            None => Ok(Value::new_null(ctx.clone())),
        }
    }

    fn parent_node<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let parent = self.document.borrow().parent(node.host).or_throw(ctx)?;
        self.handle_or_null(ctx, parent)
    }

    fn parent_element<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let parent = self.document.borrow().parent_element(node.host).or_throw(ctx)?;
        self.handle_or_null(ctx, parent)
    }

    // Element surface.

    fn namespace_uri<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let namespace = self.document.borrow().element(node.host).or_throw(ctx)?.namespace;
        js_string(ctx, namespace.uri())
    }

    fn offset<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        pick: fn(&super::host::LayoutBox) -> f64,
    ) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let layout = self.document.borrow().layout(node.host).or_throw(ctx)?;
        Ok(Value::new_number(ctx.clone(), pick(&layout)))
    }

    fn offset_left<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        self.offset(ctx, this, |layout| layout.left)
    }

    fn offset_top<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        self.offset(ctx, this, |layout| layout.top)
    }

    fn offset_width<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        self.offset(ctx, this, |layout| layout.width)
    }

    fn offset_height<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        self.offset(ctx, this, |layout| layout.height)
    }

    fn allowed_tag(&self, tag: String) -> String {
        if self.policy.is_tag_allowed(&tag) {
            return tag;
        }
        self.violations.record(
            ViolationKind::Tag,
            format!("tag <{tag}> is not allowed, created <div> instead"),
        );
        "div".to_string()
    }

    fn create_element<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        self.resolve(ctx, this)?;
        let tag = self.allowed_tag(self.string_arg(args, 0).to_ascii_lowercase());
        let host = self
            .document
            .borrow_mut()
            .create_element(&tag, Namespace::Html);
        self.wrap(ctx, host, ElementKind::for_tag(&tag, Namespace::Html))
    }

    fn create_element_ns<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        self.resolve(ctx, this)?;
        let uri = self.string_arg(args, 0);
        let namespace = Namespace::from_uri(&uri).unwrap_or_else(|| {
            self.violations.record(
                ViolationKind::Namespace,
                format!("namespace `{uri}` is not allowed, using XHTML"),
            );
            Namespace::Html
        });
        let requested = self.string_arg(args, 1);
        let tag = self.allowed_tag(match namespace {
            Namespace::Html => requested.to_ascii_lowercase(),
            Namespace::Svg => requested,
        });
        let host = self.document.borrow_mut().create_element(&tag, namespace);
        self.wrap(ctx, host, ElementKind::for_tag(&tag, namespace))
    }

    fn create_text_node<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        self.resolve(ctx, this)?;
        let text = self.string_arg(args, 0);
        let host = self.document.borrow_mut().create_text_node(&text);
        self.wrap(ctx, host, ElementKind::Text)
    }

    fn attribute_allowed(&self, ctx: &Ctx<'_>, host: HostNodeId, name: &str, action: &str) -> rquickjs::Result<bool> {
        let allowed = {
            let document = self.document.borrow();
            let element = document.element(host).or_throw(ctx)?;
            let info = ElementInfo {
                tag: &element.tag,
                namespace: element.namespace,
            };
            self.policy.is_attribute_allowed(&info, name)
        };
        if !allowed {
            self.violations.record(
                ViolationKind::Attribute,
                format!("{action} of attribute `{name}` is not allowed"),
            );
        }
        Ok(allowed)
    }

    fn get_attribute<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let name = self.string_arg(args, 0);
        if !self.attribute_allowed(ctx, node.host, &name, "read")? {
            return Ok(Value::new_undefined(ctx.clone()));
        }
        match self
            .document
            .borrow()
            .get_attribute(node.host, &name)
            .or_throw(ctx)?
        {
            Some(value) => js_string(ctx, &value),
            None => Ok(Value::new_null(ctx.clone())),
        }
    }

    fn set_attribute<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let name = self.string_arg(args, 0);
        let mut value = self.string_arg(args, 1);
        if !self.attribute_allowed(ctx, node.host, &name, "write")? {
            return Ok(Value::new_undefined(ctx.clone()));
        }
        if name == "type"
            && node.kind == ElementKind::Input
            && !self.policy.is_input_type_allowed(&value.to_ascii_lowercase())
        {
            self.violations.record(
                ViolationKind::InputType,
                format!("input type `{value}` is not allowed, using text"),
            );
            value = "text".to_string();
        }

        let mut document = self.document.borrow_mut();
        let reflected = match self.policy.property_equivalent(&name) {
            Some(property) => document
                .set_property(node.host, property, &value)
                .or_throw(ctx)?,
            None => false,
        };
        if !reflected {
            document
                .set_attribute(node.host, &name, &value)
                .or_throw(ctx)?;
        }
        Ok(Value::new_undefined(ctx.clone()))
    }

    fn remove_attribute<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let name = self.string_arg(args, 0);
        if self.attribute_allowed(ctx, node.host, &name, "removal")? {
            self.document
                .borrow_mut()
                .remove_attribute(node.host, &name)
                .or_throw(ctx)?;
        }
        Ok(Value::new_undefined(ctx.clone()))
    }

    fn child_arg<'js>(&self, ctx: &Ctx<'js>, args: &[Value<'js>], index: usize) -> rquickjs::Result<(Resolved, Value<'js>)> {
        let value = args
            .get(index)
            .cloned()
            .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
        Ok((self.resolve(ctx, &value)?, value))
    }

    fn append_child<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let parent = self.resolve(ctx, this)?;
        let (child, value) = self.child_arg(ctx, args, 0)?;
        self.document
            .borrow_mut()
            .append_child(parent.host, child.host)
            .or_throw(ctx)?;
        Ok(value)
    }

    fn insert_before<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let parent = self.resolve(ctx, this)?;
        let (child, value) = self.child_arg(ctx, args, 0)?;
        let reference = match args.get(1) {
            Some(reference) if !reference.is_null() && !reference.is_undefined() => {
                Some(self.resolve(ctx, reference)?.host)
            }
            _ => None,
        };
        self.document
            .borrow_mut()
            .insert_before(parent.host, child.host, reference)
            .or_throw(ctx)?;
        Ok(value)
    }

    /// Detach the child, stop tracking it, and hand the caller its handle.
    fn remove_child<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let parent = self.resolve(ctx, this)?;
        let (child, value) = self.child_arg(ctx, args, 0)?;
        let is_child = self.document.borrow().parent(child.host).or_throw(ctx)? == Some(parent.host);
        if !is_child {
            return Err(throw(
                ctx,
                BridgeError::NotAChild {
                    parent: parent.id,
                    child: child.id,
                },
            ));
        }
        self.document
            .borrow_mut()
            .remove_child(parent.host, child.host)
            .or_throw(ctx)?;
        self.forget(child.id).or_throw(ctx)?;
        Ok(value)
    }

    /// Drop a node from the registry together with its listeners.
    pub fn forget(&self, id: u32) -> Result<HostNodeId, BridgeError> {
        let owned: Vec<ListenerId> = self
            .listeners
            .borrow()
            .iter()
            .filter(|(_, entry)| entry.node == id)
            .map(|(listener, _)| *listener)
            .collect();
        for listener in owned {
            if let Some(callback) = self.take_listener(listener) {
                callback.release();
            }
        }
        self.registry
            .borrow_mut()
            .delete_by_id(id)
            .map(|(_, host)| host)
    }

    fn listener_options(&self, options: Option<&Value<'_>>) -> (bool, bool) {
        match options.map(|value| self.marshaller.dump(value)) {
            Some(HostValue::Object(fields)) => (
                fields.get("capture").is_some_and(truthy),
                fields.get("once").is_some_and(truthy),
            ),
            Some(other) => (truthy(&other), false),
            None => (false, false),
        }
    }

    fn find_listener<'js>(
        &self,
        ctx: &Ctx<'js>,
        node: u32,
        event: &str,
        capture: bool,
        callback: &Value<'js>,
    ) -> rquickjs::Result<Option<ListenerId>> {
        let listeners = self.listeners.borrow();
        for (id, entry) in listeners.iter() {
            if entry.node == node
                && entry.event == event
                && entry.capture == capture
                && entry.callback.value(ctx)? == *callback
            {
                return Ok(Some(*id));
            }
        }
        Ok(None)
    }

    fn add_event_listener<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let event = self.string_arg(args, 0);
        let Some(callback) = args.get(1).filter(|callback| callback.is_function()) else {
            tracing::debug!(target: "sandbox::bridge", event, "ignoring non-callable listener");
            return Ok(Value::new_undefined(ctx.clone()));
        };
        let (capture, once) = self.listener_options(args.get(2));
        if self
            .find_listener(ctx, node.id, &event, capture, callback)?
            .is_some()
        {
            return Ok(Value::new_undefined(ctx.clone()));
        }

        let id = ListenerId(self.next_listener.get());
        self.next_listener.set(id.0 + 1);
        self.document
            .borrow_mut()
            .add_listener(
                node.host,
                HostListener {
                    id,
                    event: event.clone(),
                    capture,
                    once,
                },
            )
            .or_throw(ctx)?;
        self.listeners.borrow_mut().insert(
            id,
            ListenerEntry {
                node: node.id,
                host: node.host,
                event,
                capture,
                callback: SandboxHandle::save(ctx, callback.clone(), &self.ledger),
            },
        );
        Ok(Value::new_undefined(ctx.clone()))
    }

    fn remove_event_listener<'js>(
        &self,
        ctx: &Ctx<'js>,
        this: &Value<'js>,
        args: &[Value<'js>],
    ) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let event = self.string_arg(args, 0);
        let Some(callback) = args.get(1) else {
            return Ok(Value::new_undefined(ctx.clone()));
        };
        let (capture, _) = self.listener_options(args.get(2));
        if let Some(id) = self.find_listener(ctx, node.id, &event, capture, callback)? {
            if let Some(callback) = self.take_listener(id) {
                callback.release();
            }
        }
        Ok(Value::new_undefined(ctx.clone()))
    }

    /// A borrowed reference to a listener's callback for one invocation.
    pub fn listener_callback(&self, id: ListenerId) -> Option<SandboxHandle> {
        self.listeners
            .borrow()
            .get(&id)
            .map(|entry| entry.callback.borrow())
    }

    /// Unregister a listener, handing its retained callback to the caller.
    pub fn take_listener(&self, id: ListenerId) -> Option<SandboxHandle> {
        let entry = self.listeners.borrow_mut().remove(&id)?;
        if let Err(err) = self.document.borrow_mut().remove_listener(entry.host, id) {
            tracing::warn!(target: "sandbox::bridge", "listener host node vanished: {err}");
        }
        Some(entry.callback)
    }

    // Form control extensions.

    fn value<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let value = self.document.borrow().value(node.host).or_throw(ctx)?;
        js_string(ctx, &value)
    }

    fn set_value<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>, value: Value<'js>) -> rquickjs::Result<()> {
        let node = self.resolve(ctx, this)?;
        let value = self.marshaller.dump(&value).to_string();
        self.document
            .borrow_mut()
            .set_value(node.host, &value)
            .or_throw(ctx)
    }

    fn checked<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let checked = self.document.borrow().checked(node.host).or_throw(ctx)?;
        Ok(Value::new_bool(ctx.clone(), checked))
    }

    fn set_checked<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>, value: Value<'js>) -> rquickjs::Result<()> {
        let node = self.resolve(ctx, this)?;
        let checked = truthy(&self.marshaller.dump(&value));
        self.document
            .borrow_mut()
            .set_checked(node.host, checked)
            .or_throw(ctx)
    }

    /// Snapshot of a `<select>`'s options: indexed handles, `length` and
    /// `selectedIndex`.
    fn options<'js>(&self, ctx: &Ctx<'js>, this: &Value<'js>) -> rquickjs::Result<Value<'js>> {
        let node = self.resolve(ctx, this)?;
        let (options, selected) = {
            let document = self.document.borrow();
            (
                document.options(node.host).or_throw(ctx)?,
                document.selected_index(node.host).or_throw(ctx)?,
            )
        };

        let collection = Object::new(ctx.clone())?;
        for (index, option) in options.iter().enumerate() {
            let handle = {
                let registry = self.registry.borrow();
                match registry.find_by_node(*option) {
                    Some(tracked) => tracked.value(ctx)?,
                    None => return Err(throw(ctx, BridgeError::MissingOption(node.id))),
                }
            };
            collection.set(index as u32, handle)?;
        }
        collection.set("length", options.len() as u32)?;
        collection.set("selectedIndex", selected)?;
        Ok(collection.into_value())
    }

    /// Release every handle the bridge holds. Later calls from the script
    /// raise; calling this again does nothing.
    pub fn dispose(&self) -> usize {
        if self.disposed.replace(true) {
            return 0;
        }
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        {
            let mut document = self.document.borrow_mut();
            for (id, entry) in listeners {
                if let Err(err) = document.remove_listener(entry.host, id) {
                    tracing::debug!(target: "sandbox::bridge", "listener {} not detached: {err:#}", id.0);
                }
                entry.callback.release();
            }
        }
        self.prototypes.borrow_mut().clear();
        let released = self.registry.borrow_mut().dispose();
        tracing::debug!(target: "sandbox::bridge", released, "dom bridge disposed");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::host::HostDocument;
    use crate::js::runtime::QuickJsEngine;

    // Field order matters: the bridge's handles must drop before the engine.
    struct Fixture {
        bridge: Rc<DomBridge>,
        engine: QuickJsEngine,
        ledger: HandleLedger,
        log: ViolationLog,
        root: HostNodeId,
    }

    fn fixture() -> Fixture {
        let engine = QuickJsEngine::new().unwrap();
        let document = HostDocument::shared();
        let root = {
            let mut doc = document.borrow_mut();
            let root = doc.create_element("div", Namespace::Html);
            let body = doc.body();
            doc.append_child(body, root).unwrap();
            root
        };
        let ledger = HandleLedger::new();
        let log = ViolationLog::new();
        let bridge = DomBridge::new(
            document,
            FilterPolicy::default(),
            Marshaller::new(10, log.clone()),
            ledger.clone(),
        );
        engine
            .with_context(|ctx| {
                let value = bridge.track(&ctx, root)?;
                ctx.globals().set("root", value)
            })
            .unwrap();
        Fixture {
            bridge,
            engine,
            ledger,
            log,
            root,
        }
    }

    #[test]
    fn disallowed_tags_become_divs() {
        let fx = fixture();
        let tags: Vec<String> = fx
            .engine
            .eval_script(
                "[root.createElement('script').tagName, root.createElement('SPAN').tagName, \
                  root.createElementNS('http://www.w3.org/2000/svg', 'path').tagName]",
                "tags.js",
            )
            .unwrap();
        assert_eq!(tags, vec!["DIV", "SPAN", "path"]);
        assert_eq!(fx.log.count_of(ViolationKind::Tag), 1);
        assert_eq!(fx.bridge.tracked_count(), 4);
    }

    #[test]
    fn foreign_namespaces_fall_back_to_xhtml() {
        let fx = fixture();
        let uri: String = fx
            .engine
            .eval_script(
                "root.createElementNS('http://www.w3.org/1998/Math/MathML', 'p').namespaceURI",
                "ns.js",
            )
            .unwrap();
        assert_eq!(uri, Namespace::HTML_URI);
        assert_eq!(fx.log.count_of(ViolationKind::Namespace), 1);
    }

    #[test]
    fn attributes_follow_policy() {
        let fx = fixture();
        let seen: Vec<String> = fx
            .engine
            .eval_script(
                r#"
                const input = root.createElement('input');
                input.setAttribute('type', 'file');
                input.setAttribute('onclick', 'steal()');
                root.setAttribute('class', 'card');
                root.appendChild(input);
                [input.getAttribute('type'), String(input.getAttribute('onclick')),
                 String(input.getAttribute('title')), root.getAttribute('class')]
                "#,
                "attrs.js",
            )
            .unwrap();
        assert_eq!(seen, vec!["text", "undefined", "null", "card"]);
        assert_eq!(fx.log.count_of(ViolationKind::InputType), 1);
        assert_eq!(fx.log.count_of(ViolationKind::Attribute), 2);
        let doc = fx.bridge.document().borrow();
        assert_eq!(doc.get_attribute(fx.root, "class").unwrap().as_deref(), Some("card"));
    }

    #[test]
    fn untracked_children_raise_catchable_errors() {
        let fx = fixture();
        let message: String = fx
            .engine
            .eval_script(
                "try { root.appendChild({ __sandboxNodeId: 1 }); 'no error' } catch (e) { e.message }",
                "untracked.js",
            )
            .unwrap();
        assert!(message.contains("missing tracked node"), "{message}");
    }

    #[test]
    fn remove_child_untracks_and_returns_node() {
        let fx = fixture();
        let same: bool = fx
            .engine
            .eval_script(
                r#"
                const item = root.createElement('p');
                item.appendChild(root.createTextNode('hello'));
                root.appendChild(item);
                item.addEventListener('click', () => {});
                globalThis.removed = root.removeChild(item);
                removed === item
                "#,
                "remove.js",
            )
            .unwrap();
        assert!(same);
        assert_eq!(fx.bridge.tracked_count(), 2);
        assert_eq!(fx.bridge.listener_count(), 0);
        assert!(fx.bridge.document().borrow().children(fx.root).unwrap().is_empty());

        let message: String = fx
            .engine
            .eval_script("try { removed.textContent } catch (e) { e.message }", "stale.js")
            .unwrap();
        assert!(message.contains("missing tracked node"));
    }

    #[test]
    fn tree_accessors_and_insert_before() {
        let fx = fixture();
        let order: String = fx
            .engine
            .eval_script(
                r#"
                const b = root.createElement('b');
                const i = root.createElement('i');
                root.appendChild(i);
                root.insertBefore(b, i);
                b.textContent = 'bold';
                [b.parentNode === root, i.parentElement === root, root.parentNode === null,
                 root.textContent, b.nodeType, b.nodeName].join(',')
                "#,
                "tree.js",
            )
            .unwrap();
        assert_eq!(order, "true,true,true,bold,1,B");
    }

    #[test]
    fn select_options_are_tracked_handles() {
        let fx = fixture();
        let summary: String = fx
            .engine
            .eval_script(
                r#"
                const select = root.createElement('select');
                for (const v of ['a', 'b', 'c']) {
                  const option = root.createElement('option');
                  option.value = v;
                  select.appendChild(option);
                }
                select.value = 'b';
                const options = select.options;
                [options.length, options.selectedIndex, options[2].value, select.value].join(',')
                "#,
                "select.js",
            )
            .unwrap();
        assert_eq!(summary, "3,1,c,b");
    }

    #[test]
    fn duplicate_listeners_register_once_and_remove_by_identity() {
        let fx = fixture();
        fx.engine
            .eval_script::<()>(
                r#"
                globalThis.handler = () => {};
                root.addEventListener('click', handler);
                root.addEventListener('click', handler);
                root.addEventListener('click', handler, true);
                root.addEventListener('click', 'not a function');
                "#,
                "listeners.js",
            )
            .unwrap();
        assert_eq!(fx.bridge.listener_count(), 2);

        fx.engine
            .eval_script::<()>("root.removeEventListener('click', () => {});", "other.js")
            .unwrap();
        assert_eq!(fx.bridge.listener_count(), 2);

        fx.engine
            .eval_script::<()>(
                "root.removeEventListener('click', handler, { capture: true });",
                "unlisten.js",
            )
            .unwrap();
        assert_eq!(fx.bridge.listener_count(), 1);
    }

    #[test]
    fn dispose_releases_every_handle() {
        let fx = fixture();
        fx.engine
            .eval_script::<()>(
                "globalThis.kept = root.createElement('div'); root.appendChild(kept); kept.addEventListener('click', () => {});",
                "dispose.js",
            )
            .unwrap();
        assert!(fx.ledger.live() > 0);

        assert_eq!(fx.bridge.dispose(), 2);
        assert_eq!(fx.bridge.dispose(), 0);
        assert_eq!(fx.ledger.live(), 0);

        let message: String = fx
            .engine
            .eval_script("try { kept.tagName } catch (e) { e.message }", "late.js")
            .unwrap();
        assert!(message.contains("disposed"));
    }
}
