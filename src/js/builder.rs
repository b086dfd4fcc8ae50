//! Interpreter objects built from declarative definitions, and guarded proxies
//! over host-side targets.

use std::rc::Rc;

use rquickjs::function::{Rest, This};
use rquickjs::object::{Accessor, Property};
use rquickjs::{Ctx, Function, Object, Value};

use super::marshal::{HostFunction, HostValue, Marshaller};
use crate::log::ViolationKind;

pub type Getter<'js> = Box<dyn Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<Value<'js>> + 'js>;
pub type Setter<'js> = Box<dyn Fn(Ctx<'js>, Value<'js>, Value<'js>) -> rquickjs::Result<()> + 'js>;
pub type NativeMethod<'js> =
    Box<dyn Fn(Ctx<'js>, Value<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> + 'js>;

pub enum Callable<'js> {
    /// Host function behind the marshaller: dumped arguments in, marshalled
    /// result out.
    Host(HostFunction),
    /// Works on raw interpreter values; receives `this` and the arguments.
    Native(NativeMethod<'js>),
}

pub enum Member<'js> {
    Constant(HostValue),
    Accessor {
        get: Getter<'js>,
        set: Option<Setter<'js>>,
    },
    Method(Callable<'js>),
    Handle(Value<'js>),
}

#[derive(Default)]
pub struct ObjectDefinition<'js> {
    members: Vec<(String, Member<'js>)>,
}

impl<'js> ObjectDefinition<'js> {
    pub fn new() -> Self {
        Self {
            members: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, member: Member<'js>) {
        self.members.push((name.into(), member));
    }

    pub fn constant(mut self, name: impl Into<String>, value: impl Into<HostValue>) -> Self {
        self.push(name, Member::Constant(value.into()));
        self
    }

    pub fn getter(
        mut self,
        name: impl Into<String>,
        get: impl Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<Value<'js>> + 'js,
    ) -> Self {
        self.push(
            name,
            Member::Accessor {
                get: Box::new(get),
                set: None,
            },
        );
        self
    }

    pub fn accessor(
        mut self,
        name: impl Into<String>,
        get: impl Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<Value<'js>> + 'js,
        set: impl Fn(Ctx<'js>, Value<'js>, Value<'js>) -> rquickjs::Result<()> + 'js,
    ) -> Self {
        self.push(
            name,
            Member::Accessor {
                get: Box::new(get),
                set: Some(Box::new(set)),
            },
        );
        self
    }

    pub fn method(mut self, name: impl Into<String>, function: HostFunction) -> Self {
        self.push(name, Member::Method(Callable::Host(function)));
        self
    }

    pub fn native(
        mut self,
        name: impl Into<String>,
        method: impl Fn(Ctx<'js>, Value<'js>, Vec<Value<'js>>) -> rquickjs::Result<Value<'js>> + 'js,
    ) -> Self {
        self.push(name, Member::Method(Callable::Native(Box::new(method))));
        self
    }

    pub fn handle(mut self, name: impl Into<String>, value: Value<'js>) -> Self {
        self.push(name, Member::Handle(value));
        self
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Define every member of `definition` on `target`, or on a fresh object.
pub fn build_from_definition<'js>(
    ctx: &Ctx<'js>,
    marshaller: &Marshaller,
    definition: ObjectDefinition<'js>,
    target: Option<Object<'js>>,
) -> rquickjs::Result<Object<'js>> {
    let object = match target {
        Some(object) => object,
        None => Object::new(ctx.clone())?,
    };

    for (name, member) in definition.members {
        match member {
            Member::Constant(value) => {
                let value = marshaller.marshal(ctx, &value)?;
                object.prop(name.as_str(), Property::from(value).enumerable())?;
            }
            Member::Accessor { get, set } => {
                let getter = move |ctx: Ctx<'js>, this: This<Value<'js>>| get(ctx, this.0);
                match set {
                    Some(set) => {
                        let setter =
                            move |ctx: Ctx<'js>, this: This<Value<'js>>, value: Value<'js>| {
                                set(ctx, this.0, value)
                            };
                        object.prop(
                            name.as_str(),
                            Accessor::new(getter, setter).enumerable().configurable(),
                        )?;
                    }
                    None => {
                        object.prop(
                            name.as_str(),
                            Accessor::new_get(getter).enumerable().configurable(),
                        )?;
                    }
                }
            }
            Member::Method(Callable::Host(function)) => {
                let function = marshaller.host_function(ctx, function, &name)?;
                object.set(name.as_str(), function)?;
            }
            Member::Method(Callable::Native(method)) => {
                let function = Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'js>, this: This<Value<'js>>, args: Rest<Value<'js>>| {
                        method(ctx, this.0, args.0)
                    },
                )?
                .with_name(name.as_str())?;
                object.set(name.as_str(), function)?;
            }
            Member::Handle(value) => {
                object.prop(name.as_str(), Property::from(value).enumerable())?;
            }
        }
    }

    Ok(object)
}

/// Host-side object exposed through a guarded proxy. Only own properties with
/// string values exist as far as the sandbox can tell.
pub trait GuardTarget {
    fn get_own_string(&self, property: &str) -> Option<String>;
    fn set_own_string(&self, property: &str, value: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardOp<'a> {
    Get { property: &'a str },
    Set { property: &'a str, value: &'a str },
}

pub type Guard = Rc<dyn Fn(&GuardOp<'_>) -> bool>;
pub type CustomGet = Rc<dyn Fn(&str) -> HostValue>;
pub type CustomSet = Rc<dyn Fn(&str, &HostValue) -> bool>;

pub enum ProxyHandler {
    /// Default mode: every read and write is checked by the guard first.
    Guard(Guard),
    /// Replaces the default traps entirely.
    Custom { get: CustomGet, set: CustomSet },
}

impl ProxyHandler {
    pub fn guard(guard: impl Fn(&GuardOp<'_>) -> bool + 'static) -> Self {
        ProxyHandler::Guard(Rc::new(guard))
    }

    pub fn allow_all() -> Self {
        Self::guard(|_| true)
    }
}

const PROXY_FACTORY: &str = "((target, handler) => new Proxy(target, handler))";

/// Wrap `target` in a proxy whose `get`/`set` traps run on the host.
///
/// Denied reads yield `undefined`. Denied writes leave `target` untouched but
/// still report success to the script. Symbol keys are never visible.
pub fn wrap_with_guard<'js, T>(
    ctx: &Ctx<'js>,
    marshaller: &Marshaller,
    target: Rc<T>,
    handler: ProxyHandler,
) -> rquickjs::Result<Value<'js>>
where
    T: GuardTarget + 'static,
{
    let traps = Object::new(ctx.clone())?;

    let (get, set) = match handler {
        ProxyHandler::Guard(guard) => {
            let read_target = Rc::clone(&target);
            let read_guard = Rc::clone(&guard);
            let get = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      _target: Value<'js>,
                      property: Value<'js>|
                      -> rquickjs::Result<Value<'js>> {
                    let Some(property) = property_name(&property) else {
                        return Ok(Value::new_undefined(ctx));
                    };
                    let Some(current) = read_target.get_own_string(&property) else {
                        return Ok(Value::new_undefined(ctx));
                    };
                    if !read_guard(&GuardOp::Get {
                        property: &property,
                    }) {
                        return Ok(Value::new_undefined(ctx));
                    }
                    Ok(rquickjs::String::from_str(ctx, &current)?.into_value())
                },
            )?;

            let violations = marshaller.violations().clone();
            let set = Function::new(
                ctx.clone(),
                move |_target: Value<'js>,
                      property: Value<'js>,
                      value: Value<'js>|
                      -> rquickjs::Result<bool> {
                    // Always report success: a `false` here is a TypeError in
                    // strict code, and denied writes must stay invisible.
                    let Some(property) = property_name(&property) else {
                        return Ok(true);
                    };
                    if target.get_own_string(&property).is_none() {
                        violations.record(
                            ViolationKind::Property,
                            format!("write to unknown property {property:?} dropped"),
                        );
                        return Ok(true);
                    }
                    let Some(value) = value.as_string().map(|s| s.to_string()).transpose()? else {
                        violations.record(
                            ViolationKind::Property,
                            format!("non-string write to {property:?} dropped"),
                        );
                        return Ok(true);
                    };
                    if guard(&GuardOp::Set {
                        property: &property,
                        value: &value,
                    }) && !target.set_own_string(&property, &value)
                    {
                        tracing::debug!(target: "sandbox::bridge", "guarded write to {property:?} not applied");
                    }
                    Ok(true)
                },
            )?;
            (get, set)
        }
        ProxyHandler::Custom { get, set } => {
            let read_marshaller = marshaller.clone();
            let get = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'js>,
                      _target: Value<'js>,
                      property: Value<'js>|
                      -> rquickjs::Result<Value<'js>> {
                    match property_name(&property) {
                        Some(property) => read_marshaller.marshal(&ctx, &get(&property)),
                        None => Ok(Value::new_undefined(ctx)),
                    }
                },
            )?;
            let write_marshaller = marshaller.clone();
            let set = Function::new(
                ctx.clone(),
                move |_target: Value<'js>,
                      property: Value<'js>,
                      value: Value<'js>|
                      -> rquickjs::Result<bool> {
                    match property_name(&property) {
                        Some(property) => Ok(set(&property, &write_marshaller.dump(&value))),
                        None => Ok(false),
                    }
                },
            )?;
            (get, set)
        }
    };

    traps.set("get", get.with_name("get")?)?;
    traps.set("set", set.with_name("set")?)?;

    let factory: Function = ctx.eval(PROXY_FACTORY)?;
    let shadow_target = Object::new(ctx.clone())?;
    factory.call((shadow_target, traps))
}

fn property_name(property: &Value<'_>) -> Option<String> {
    property.as_string().and_then(|name| name.to_string().ok())
}
