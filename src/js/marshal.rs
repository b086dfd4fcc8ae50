//! Host ⇄ interpreter value conversion.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use rquickjs::function::Rest;
use rquickjs::{Array, Ctx, Function, Object, Value};

use crate::log::{ViolationKind, ViolationLog};

pub const DEFAULT_MAX_DEPTH: usize = 10;

/// A host function callable from the sandbox. Arguments arrive already
/// dumped; the return value is marshalled back.
#[derive(Clone)]
pub struct HostFunction(Rc<dyn Fn(Vec<HostValue>) -> HostValue>);

impl HostFunction {
    pub fn new(f: impl Fn(Vec<HostValue>) -> HostValue + 'static) -> Self {
        Self(Rc::new(f))
    }

    pub fn call(&self, args: Vec<HostValue>) -> HostValue {
        (self.0)(args)
    }
}

/// Host-side representation of the values that may cross into the sandbox.
#[derive(Clone)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<HostValue>),
    /// A plain object: string keys, no prototype beyond the base one.
    Object(BTreeMap<String, HostValue>),
    Function(HostFunction),
    /// Any other object kind, named by its type. Never crosses the boundary.
    Instance(String),
}

impl HostValue {
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, HostValue)>) -> Self {
        HostValue::Object(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            HostValue::Undefined
                | HostValue::Null
                | HostValue::Bool(_)
                | HostValue::Number(_)
                | HostValue::String(_)
        )
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Array(a), HostValue::Array(b)) => a == b,
            (HostValue::Object(a), HostValue::Object(b)) => a == b,
            (HostValue::Function(a), HostValue::Function(b)) => Rc::ptr_eq(&a.0, &b.0),
            (HostValue::Instance(a), HostValue::Instance(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("Undefined"),
            HostValue::Null => f.write_str("Null"),
            HostValue::Bool(value) => f.debug_tuple("Bool").field(value).finish(),
            HostValue::Number(value) => f.debug_tuple("Number").field(value).finish(),
            HostValue::String(value) => f.debug_tuple("String").field(value).finish(),
            HostValue::Array(items) => f.debug_list().entries(items).finish(),
            HostValue::Object(entries) => f.debug_map().entries(entries).finish(),
            HostValue::Function(_) => f.write_str("Function"),
            HostValue::Instance(kind) => f.debug_tuple("Instance").field(kind).finish(),
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("undefined"),
            HostValue::Null => f.write_str("null"),
            HostValue::Bool(value) => write!(f, "{value}"),
            HostValue::Number(value) => write_number(f, *value),
            HostValue::String(value) => f.write_str(value),
            HostValue::Array(items) => {
                let parts: Vec<String> = items.iter().map(|item| item.to_string()).collect();
                f.write_str(&parts.join(","))
            }
            HostValue::Object(_) => f.write_str("[object Object]"),
            HostValue::Function(_) => f.write_str("function () { [native code] }"),
            HostValue::Instance(kind) => write!(f, "[object {kind}]"),
        }
    }
}

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// `Number#toString` for the common cases: integers in the safe range print
/// without a fraction, non-finite values use their JS names.
fn write_number(f: &mut fmt::Formatter<'_>, value: f64) -> fmt::Result {
    if value.is_nan() {
        f.write_str("NaN")
    } else if value.is_infinite() {
        f.write_str(if value > 0.0 { "Infinity" } else { "-Infinity" })
    } else if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        write!(f, "{}", value as i64)
    } else {
        write!(f, "{value}")
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Number(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        HostValue::Number(value as f64)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(value: HostFunction) -> Self {
        HostValue::Function(value)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(value) => HostValue::Bool(value),
            serde_json::Value::Number(value) => HostValue::Number(value.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(value) => HostValue::String(value),
            serde_json::Value::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(entries) => HostValue::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, HostValue::from(value)))
                    .collect(),
            ),
        }
    }
}

/// Converts values across the boundary with a per-branch depth limit.
#[derive(Debug, Clone)]
pub struct Marshaller {
    max_depth: usize,
    violations: ViolationLog,
}

impl Marshaller {
    pub fn new(max_depth: usize, violations: ViolationLog) -> Self {
        Self {
            max_depth,
            violations,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn violations(&self) -> &ViolationLog {
        &self.violations
    }

    pub fn marshal<'js>(&self, ctx: &Ctx<'js>, value: &HostValue) -> rquickjs::Result<Value<'js>> {
        self.marshal_with_depth(ctx, value, self.max_depth)
    }

    /// `depth` is the remaining budget for this branch. Each nesting level
    /// hands its children `depth - 1`; siblings never share a counter.
    pub fn marshal_with_depth<'js>(
        &self,
        ctx: &Ctx<'js>,
        value: &HostValue,
        depth: usize,
    ) -> rquickjs::Result<Value<'js>> {
        if depth == 0 {
            return Ok(Value::new_undefined(ctx.clone()));
        }

        match value {
            HostValue::Undefined => Ok(Value::new_undefined(ctx.clone())),
            HostValue::Null => Ok(Value::new_null(ctx.clone())),
            HostValue::Bool(value) => Ok(Value::new_bool(ctx.clone(), *value)),
            HostValue::Number(value) => Ok(Value::new_number(ctx.clone(), *value)),
            HostValue::String(value) => {
                Ok(rquickjs::String::from_str(ctx.clone(), value)?.into_value())
            }
            HostValue::Array(items) => {
                let array = Array::new(ctx.clone())?;
                for (index, item) in items.iter().enumerate() {
                    array.set(index, self.marshal_with_depth(ctx, item, depth - 1)?)?;
                }
                Ok(array.into_value())
            }
            HostValue::Object(entries) => {
                let object = Object::new(ctx.clone())?;
                for (key, item) in entries {
                    object.set(key.as_str(), self.marshal_with_depth(ctx, item, depth - 1)?)?;
                }
                Ok(object.into_value())
            }
            HostValue::Function(function) => Ok(self
                .host_function(ctx, function.clone(), "proxyFn")?
                .into_value()),
            HostValue::Instance(kind) => {
                self.violations.record(
                    ViolationKind::Marshal,
                    format!("conversion of non-plain object `{kind}` is unsupported"),
                );
                Ok(Value::new_undefined(ctx.clone()))
            }
        }
    }

    /// Wrap a host function as a sandbox callable named `name`.
    pub fn host_function<'js>(
        &self,
        ctx: &Ctx<'js>,
        function: HostFunction,
        name: &str,
    ) -> rquickjs::Result<Function<'js>> {
        let marshaller = self.clone();
        let wrapped = Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
                let args = args.0.iter().map(|arg| marshaller.dump(arg)).collect();
                let result = function.call(args);
                marshaller.marshal(&ctx, &result)
            },
        )?
        .with_name(name)?;
        Ok(wrapped)
    }

    /// Interpreter value to host value, bounded by the same depth budget.
    /// Functions and symbols have no host form and dump as `Undefined`.
    pub fn dump(&self, value: &Value<'_>) -> HostValue {
        dump_with_depth(value, self.max_depth)
    }
}

fn dump_with_depth(value: &Value<'_>, depth: usize) -> HostValue {
    if depth == 0 || value.is_undefined() {
        return HostValue::Undefined;
    }
    if value.is_null() {
        return HostValue::Null;
    }
    if let Some(flag) = value.as_bool() {
        return HostValue::Bool(flag);
    }
    if let Some(number) = value.as_number() {
        return HostValue::Number(number);
    }
    if let Some(text) = value.as_string() {
        return text
            .to_string()
            .map(HostValue::String)
            .unwrap_or(HostValue::Undefined);
    }
    if value.is_function() {
        return HostValue::Undefined;
    }
    if let Some(array) = value.as_array() {
        return HostValue::Array(
            array
                .iter::<Value>()
                .map(|item| {
                    item.map(|item| dump_with_depth(&item, depth - 1))
                        .unwrap_or(HostValue::Undefined)
                })
                .collect(),
        );
    }
    if let Some(object) = value.as_object() {
        let mut entries = BTreeMap::new();
        for key in object.keys::<String>().flatten() {
            let item = object
                .get::<_, Value>(key.as_str())
                .map(|item| dump_with_depth(&item, depth - 1))
                .unwrap_or(HostValue::Undefined);
            entries.insert(key, item);
        }
        return HostValue::Object(entries);
    }
    HostValue::Undefined
}
