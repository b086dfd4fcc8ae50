//! Host events delivered to sandbox listeners.
//!
//! Dispatch walks the host propagation path: capture listeners from the
//! outermost node down to the target, then bubble listeners back up. Each
//! listener sees a fresh envelope object and is followed by a job drain.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use rquickjs::{Ctx, Object, Value};

use super::host::{HostNodeId, ListenerId};
use super::node::DomBridge;
use crate::error::SandboxError;
use crate::js::builder::{build_from_definition, ObjectDefinition};
use crate::js::marshal::HostValue;
use crate::js::runtime::QuickJsEngine;

const PHASE_CAPTURE: i32 = 1;
const PHASE_AT_TARGET: i32 = 2;
const PHASE_BUBBLE: i32 = 3;

/// Envelope members that event fields may not shadow.
const RESERVED_FIELDS: &[&str] = &[
    "type",
    "bubbles",
    "cancelable",
    "eventPhase",
    "target",
    "currentTarget",
    "relatedTarget",
    "defaultPrevented",
    "preventDefault",
    "stopPropagation",
    "stopImmediatePropagation",
    "getModifierState",
];

const MODIFIER_FIELDS: &[(&str, &str)] = &[
    ("Control", "ctrlKey"),
    ("Shift", "shiftKey"),
    ("Alt", "altKey"),
    ("Meta", "metaKey"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct HostEvent {
    pub event_type: String,
    pub bubbles: bool,
    pub cancelable: bool,
    /// Extra event data such as `clientX` or `key`. Only primitives reach the
    /// sandbox.
    pub fields: BTreeMap<String, HostValue>,
    pub related_target: Option<HostNodeId>,
}

impl HostEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            bubbles: false,
            cancelable: false,
            fields: BTreeMap::new(),
            related_target: None,
        }
    }

    pub fn with_bubbles(mut self, bubbles: bool) -> Self {
        self.bubbles = bubbles;
        self
    }

    pub fn with_cancelable(mut self, cancelable: bool) -> Self {
        self.cancelable = cancelable;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_related_target(mut self, node: HostNodeId) -> Self {
        self.related_target = Some(node);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub default_prevented: bool,
    pub propagation_stopped: bool,
    pub listeners_invoked: usize,
}

#[derive(Default)]
struct EventState {
    default_prevented: Cell<bool>,
    stopped: Cell<bool>,
    stopped_immediately: Cell<bool>,
}

/// Deliver `event` to every listener on the propagation path of `target`.
/// Listener failures are logged and do not stop the dispatch.
pub fn dispatch_event(
    engine: &QuickJsEngine,
    bridge: &DomBridge,
    target: HostNodeId,
    event: &HostEvent,
) -> Result<DispatchOutcome, SandboxError> {
    if bridge.is_disposed() {
        return Err(SandboxError::Disposed);
    }
    let path = bridge.document().borrow().propagation_path(target)?;

    let mut plan = Vec::with_capacity(path.len() * 2);
    for node in path.iter().rev() {
        let phase = if *node == target { PHASE_AT_TARGET } else { PHASE_CAPTURE };
        plan.push((*node, true, phase));
    }
    for node in &path {
        if *node == target {
            plan.push((*node, false, PHASE_AT_TARGET));
        } else if event.bubbles {
            plan.push((*node, false, PHASE_BUBBLE));
        }
    }

    let state = Rc::new(EventState::default());
    let mut outcome = DispatchOutcome::default();

    for (current, capture, phase) in plan {
        let listeners: Vec<(ListenerId, bool)> = bridge
            .document()
            .borrow()
            .node(current)?
            .listeners()
            .iter()
            .filter(|listener| listener.capture == capture && listener.event == event.event_type)
            .map(|listener| (listener.id, listener.once))
            .collect();

        for (id, once) in listeners {
            let callback = if once {
                bridge.take_listener(id)
            } else {
                bridge.listener_callback(id)
            };
            // Removed by an earlier listener in this dispatch.
            let Some(callback) = callback else {
                continue;
            };

            let result = engine.with_context(|ctx| {
                let envelope = envelope(&ctx, bridge, event, target, current, phase, &state)?;
                let function = callback.value(&ctx)?;
                match function.as_function() {
                    Some(function) => function.call::<_, Value>((envelope,)).map(|_| ()),
                    None => Ok(()),
                }
            });
            callback.release();
            outcome.listeners_invoked += 1;
            if let Err(err) = result {
                tracing::error!(
                    target: "sandbox::bridge",
                    event = %event.event_type,
                    "event listener failed: {err}"
                );
            }
            engine.drain_jobs();

            if state.stopped_immediately.get() {
                break;
            }
        }
        if state.stopped.get() {
            break;
        }
    }

    outcome.default_prevented = state.default_prevented.get();
    outcome.propagation_stopped = state.stopped.get();
    Ok(outcome)
}

fn envelope<'js>(
    ctx: &Ctx<'js>,
    bridge: &DomBridge,
    event: &HostEvent,
    target: HostNodeId,
    current: HostNodeId,
    phase: i32,
    state: &Rc<EventState>,
) -> rquickjs::Result<Object<'js>> {
    let mut definition = ObjectDefinition::new()
        .constant("type", event.event_type.as_str())
        .constant("bubbles", event.bubbles)
        .constant("cancelable", event.cancelable)
        .constant("eventPhase", phase)
        .handle("target", bridge.handle_or_undefined(ctx, Some(target))?)
        .handle("currentTarget", bridge.handle_or_undefined(ctx, Some(current))?)
        .handle(
            "relatedTarget",
            bridge.handle_or_undefined(ctx, event.related_target)?,
        );

    for (name, value) in &event.fields {
        if value.is_primitive() && !RESERVED_FIELDS.contains(&name.as_str()) {
            definition = definition.constant(name.clone(), value.clone());
        }
    }

    let modifiers: Vec<(&'static str, bool)> = MODIFIER_FIELDS
        .iter()
        .map(|(key, field)| {
            let active = event
                .fields
                .get(*field)
                .and_then(HostValue::as_bool)
                .unwrap_or(false);
            (*key, active)
        })
        .collect();

    let cancelable = event.cancelable;
    let prevented = Rc::clone(state);
    let prevent = Rc::clone(state);
    let stop = Rc::clone(state);
    let stop_now = Rc::clone(state);

    definition = definition
        .getter("defaultPrevented", move |ctx, _this| {
            Ok(Value::new_bool(ctx, prevented.default_prevented.get()))
        })
        .native("preventDefault", move |ctx, _this, _args| {
            if cancelable {
                prevent.default_prevented.set(true);
            }
            Ok(Value::new_undefined(ctx))
        })
        .native("stopPropagation", move |ctx, _this, _args| {
            stop.stopped.set(true);
            Ok(Value::new_undefined(ctx))
        })
        .native("stopImmediatePropagation", move |ctx, _this, _args| {
            stop_now.stopped.set(true);
            stop_now.stopped_immediately.set(true);
            Ok(Value::new_undefined(ctx))
        })
        .native("getModifierState", move |ctx, _this, args| {
            let key = args
                .first()
                .and_then(|key| key.as_string())
                .and_then(|key| key.to_string().ok())
                .unwrap_or_default();
            let active = modifiers
                .iter()
                .any(|(name, active)| *active && *name == key);
            Ok(Value::new_bool(ctx, active))
        });

    build_from_definition(ctx, bridge.marshaller(), definition, None)
}
