//! The page as the sandbox sees it: a closed shadow tree mounted under the
//! host container, the global entry points into it, and the small browser
//! shims UI libraries look for.

use std::rc::{Rc, Weak};

use rquickjs::function::Opt;
use rquickjs::{Ctx, Function, Object, Value};

use super::host::{HostNodeId, Namespace};
use super::node::{throw, DomBridge, OrThrow};
use super::styles::{stylesheet_object, VirtualStyleSheet};
use crate::error::BridgeError;
use crate::js::builder::{build_from_definition, ObjectDefinition};
use crate::js::marshal::{HostValue, Marshaller};

/// Host nodes making up one sandbox mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxRoot {
    /// `<section>` appended to the container. Tracked as the synthetic
    /// document.
    pub mount: HostNodeId,
    pub shadow: HostNodeId,
    /// `<style>` element whose sheet backs `createSandboxStyleSheet()`.
    pub style: HostNodeId,
    /// `<div>` returned by `createSandboxRootDomElement()`.
    pub root: HostNodeId,
}

fn live_bridge(ctx: &Ctx<'_>, weak: &Weak<DomBridge>) -> rquickjs::Result<Rc<DomBridge>> {
    match weak.upgrade() {
        Some(bridge) if !bridge.is_disposed() => Ok(bridge),
        _ => Err(throw(ctx, BridgeError::Disposed)),
    }
}

/// Build the mount under `container` and expose `document`,
/// `createSandboxRootDomElement` and `createSandboxStyleSheet`.
pub fn install_root<'js>(
    ctx: &Ctx<'js>,
    bridge: &Rc<DomBridge>,
    container: HostNodeId,
) -> rquickjs::Result<SandboxRoot> {
    let nodes = {
        let mut document = bridge.document().borrow_mut();
        let mount = document.create_element("section", Namespace::Html);
        document.append_child(container, mount).or_throw(ctx)?;
        let shadow = document.attach_shadow(mount).or_throw(ctx)?;
        let style = document.create_element("style", Namespace::Html);
        document.append_child(shadow, style).or_throw(ctx)?;
        let root = document.create_element("div", Namespace::Html);
        document.append_child(shadow, root).or_throw(ctx)?;
        SandboxRoot {
            mount,
            shadow,
            style,
            root,
        }
    };

    let document_handle = bridge.track(ctx, nodes.mount)?;
    if let Some(id) = bridge.tracked_id(nodes.mount) {
        bridge.set_document_node(id);
    }
    bridge.track(ctx, nodes.root)?;

    let sheet = Rc::new(VirtualStyleSheet::new(
        Rc::clone(bridge.document()),
        nodes.style,
        bridge.css_filter().clone(),
    ));
    let root_weak = Rc::downgrade(bridge);
    let sheet_weak = Rc::downgrade(bridge);
    let root_node = nodes.root;

    let definition = ObjectDefinition::new()
        .handle("document", document_handle)
        .native("createSandboxRootDomElement", move |ctx, _this, _args| {
            live_bridge(&ctx, &root_weak)?.track(&ctx, root_node)
        })
        .native("createSandboxStyleSheet", move |ctx, _this, _args| {
            let bridge = live_bridge(&ctx, &sheet_weak)?;
            Ok(stylesheet_object(&ctx, bridge.marshaller(), Rc::clone(&sheet))?.into_value())
        });
    build_from_definition(ctx, bridge.marshaller(), definition, Some(ctx.globals()))?;

    tracing::debug!(
        target: "sandbox::bridge",
        mount = nodes.mount.index(),
        root = nodes.root.index(),
        "sandbox root installed"
    );
    Ok(nodes)
}

#[derive(Debug, Clone, Copy)]
enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn describe<'js>(ctx: &Ctx<'js>, marshaller: &Marshaller, value: &Value<'js>) -> String {
    if let Some(text) = value.as_string().and_then(|text| text.to_string().ok()) {
        return text;
    }
    if value.is_object() && !value.is_function() {
        match ctx.json_stringify(value.clone()) {
            Ok(Some(json)) => {
                if let Ok(json) = json.to_string() {
                    return json;
                }
            }
            Ok(None) => {}
            Err(_) => {
                // Cyclic values throw; keep the exception out of the script.
                let _ = ctx.catch();
            }
        }
    }
    marshaller.dump(value).to_string()
}

fn console_method<'js>(
    level: ConsoleLevel,
    marshaller: Marshaller,
) -> impl Fn(Ctx<'js>, Value<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> + 'js {
    move |ctx, _this, args| {
        let line = args
            .iter()
            .map(|arg| describe(&ctx, &marshaller, arg))
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            ConsoleLevel::Debug => tracing::debug!(target: "sandbox::console", "{line}"),
            ConsoleLevel::Info => tracing::info!(target: "sandbox::console", "{line}"),
            ConsoleLevel::Warn => tracing::warn!(target: "sandbox::console", "{line}"),
            ConsoleLevel::Error => tracing::error!(target: "sandbox::console", "{line}"),
        }
        Ok(Value::new_undefined(ctx))
    }
}

/// `window`, `console` and `getComputedStyle`.
pub fn install_shims<'js>(ctx: &Ctx<'js>, bridge: &Rc<DomBridge>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    // Frameworks walk `window.HTMLIFrameElement` with `instanceof`, so the
    // stub needs a prototype.
    let window = Object::new(ctx.clone())?;
    let iframe: Value = ctx.eval("(class HTMLIFrameElement {})")?;
    window.set("HTMLIFrameElement", iframe)?;
    globals.set("window", window)?;

    let marshaller = bridge.marshaller();
    let mut console = ObjectDefinition::new();
    for (name, level) in [
        ("log", ConsoleLevel::Info),
        ("info", ConsoleLevel::Info),
        ("debug", ConsoleLevel::Debug),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
    ] {
        console = console.native(name, console_method(level, marshaller.clone()));
    }
    let console = build_from_definition(ctx, marshaller, console, None)?;
    globals.set("console", console)?;

    let weak = Rc::downgrade(bridge);
    let computed = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, element: Opt<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let bridge = live_bridge(&ctx, &weak)?;
            let element = element
                .0
                .unwrap_or_else(|| Value::new_undefined(ctx.clone()));
            let node = bridge.resolve(&ctx, &element)?;
            let snapshot = {
                let document = bridge.document().borrow();
                let style = document.style(node.host).or_throw(&ctx)?;
                HostValue::object(
                    style
                        .entries()
                        .filter(|(_, value)| !value.is_empty())
                        .map(|(property, value)| (property, HostValue::from(value))),
                )
            };
            bridge.marshaller().marshal(&ctx, &snapshot)
        },
    )?
    .with_name("getComputedStyle")?;
    globals.set("getComputedStyle", computed)?;
    Ok(())
}
