// src/declaration.rs

use std::{collections::BTreeMap, fmt, future::Future, str::FromStr, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;

use crate::{
    constants::CallbackMode,
    schema::{SchemaError, SchemaObject, SchemaValue, ValueKind, callback_schema, port_schema},
    tags::TagFn,
};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A host function bound to an outbound port. It receives the payload (or the
/// payload minus its tag) and settles with a value or an error. `Value::Null`
/// means "no result".
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>);

impl Handler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |payload| f(payload).boxed()))
    }

    /// Wraps a synchronous function. Its body runs when the dispatcher starts the call.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(move |payload| futures::future::ready(f(payload)).boxed()))
    }

    pub fn call(&self, payload: Value) -> HandlerFuture {
        (self.0)(payload)
    }

    pub fn ptr_eq(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// The `callback` part of a declaration, in any of its shorthand forms.
///
/// `true` and `false` switch the default callback on and off, a mode (or its
/// name) picks the reply shape, and the builder methods set mode, tag and
/// reply port individually.
#[derive(Clone, Debug, PartialEq)]
pub struct Callback(SchemaValue);

impl Callback {
    pub fn new() -> Self {
        Callback(SchemaValue::object())
    }

    pub fn mode(self, mode: CallbackMode) -> Self {
        self.set("type", mode.into())
    }

    pub fn tag(self, tag_fn: TagFn) -> Self {
        self.set("tag", tag_fn.into())
    }

    /// Sends and receives raw payloads, without a correlation tag.
    pub fn untagged(self) -> Self {
        self.set("tag", false.into())
    }

    /// Overrides the reply port, `<port>Finished` by default.
    pub fn reply_to(self, port: &str) -> Self {
        self.set("name", port.into())
    }

    pub fn into_value(self) -> SchemaValue {
        self.0
    }

    fn set(self, key: &str, value: SchemaValue) -> Self {
        Callback(self.0.with_key("type", key, value))
    }
}

impl Default for Callback {
    fn default() -> Self {
        Self::new()
    }
}

impl From<bool> for Callback {
    fn from(enabled: bool) -> Self {
        Callback(SchemaValue::Bool(enabled))
    }
}

impl From<CallbackMode> for Callback {
    fn from(mode: CallbackMode) -> Self {
        Callback(mode.into())
    }
}

impl From<&str> for Callback {
    fn from(mode: &str) -> Self {
        Callback(mode.into())
    }
}

/// A user declaration for one outbound port: a bare handler, or an object
/// with `func` and `callback`. Any [`SchemaValue`] is accepted here; shape
/// problems surface when the declaration is normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct Declaration(SchemaValue);

impl Declaration {
    pub fn new(handler: Handler) -> Self {
        Declaration(SchemaValue::object().with_key("func", "func", handler.into()))
    }

    pub fn from_value(value: SchemaValue) -> Self {
        Declaration(value)
    }

    pub fn callback(self, callback: impl Into<Callback>) -> Self {
        Declaration(self.0.with_key("func", "callback", callback.into().into_value()))
    }

    pub fn into_value(self) -> SchemaValue {
        self.0
    }
}

impl From<Handler> for Declaration {
    fn from(handler: Handler) -> Self {
        Declaration(SchemaValue::Handler(handler))
    }
}

impl From<SchemaValue> for Declaration {
    fn from(value: SchemaValue) -> Self {
        Declaration(value)
    }
}

/// Canonical callback: what to reply, how to split tags, and where to send it.
#[derive(Clone, Debug, PartialEq)]
pub struct CallbackDescriptor {
    pub mode: CallbackMode,
    /// `None` disables tagging.
    pub tag: Option<TagFn>,
    pub reply_port: String,
}

impl CallbackDescriptor {
    fn from_object(mut obj: SchemaObject) -> Result<Self, SchemaError> {
        let mode = match obj.remove("type") {
            Some(SchemaValue::String(name)) => {
                CallbackMode::from_str(&name).map_err(|_| SchemaError::InvalidEnumValue {
                    key: "type".to_string(),
                    allowed: "NONE,RESULT,ERROR,RESULT_OR_ERROR".to_string(),
                    actual: name.clone(),
                })?
            }
            other => return Err(unexpected("type", ValueKind::String, other)),
        };
        let tag = match obj.remove("tag") {
            Some(SchemaValue::Tag(tag_fn)) => Some(tag_fn),
            Some(SchemaValue::Bool(false)) => None,
            other => return Err(unexpected("tag", ValueKind::TagFunction, other)),
        };
        let reply_port = match obj.remove("name") {
            Some(SchemaValue::String(name)) => name,
            other => return Err(unexpected("name", ValueKind::String, other)),
        };
        Ok(Self { mode, tag, reply_port })
    }

    fn to_value(&self) -> SchemaValue {
        let tag = match &self.tag {
            Some(tag_fn) => SchemaValue::Tag(tag_fn.clone()),
            None => SchemaValue::Bool(false),
        };
        SchemaValue::Object(SchemaObject::from([
            ("type".to_string(), self.mode.into()),
            ("tag".to_string(), tag),
            ("name".to_string(), self.reply_port.clone().into()),
        ]))
    }
}

fn unexpected(key: &str, expected: ValueKind, found: Option<SchemaValue>) -> SchemaError {
    match found {
        Some(value) => SchemaError::TypeMismatch {
            key: key.to_string(),
            expected,
            actual: value.kind(),
        },
        None => SchemaError::MissingRequiredField { key: key.to_string() },
    }
}

/// Canonical port declaration, produced once per port and never changed.
#[derive(Clone, Debug, PartialEq)]
pub struct PortDeclaration {
    pub name: String,
    pub handler: Handler,
    /// `None` when the port never replies.
    pub callback: Option<CallbackDescriptor>,
}

impl PortDeclaration {
    pub fn normalize(name: &str, declaration: Declaration) -> Result<Self, SchemaError> {
        // 1) func + callback shorthand
        let mut port = port_schema().normalize(declaration.into_value())?;

        let handler = match port.remove("func") {
            Some(SchemaValue::Handler(handler)) => handler,
            other => return Err(unexpected("func", ValueKind::Handler, other)),
        };

        // 2) expand the callback, unless it's switched off
        let callback = match port.remove("callback") {
            None | Some(SchemaValue::Bool(false)) => None,
            Some(raw) => {
                let expanded = callback_schema(name)
                    .normalize(raw)
                    .map_err(|e| e.within("callback"))?;
                let descriptor = CallbackDescriptor::from_object(expanded).map_err(|e| e.within("callback"))?;
                Some(descriptor).filter(|d| d.mode.replies())
            }
        };

        Ok(Self {
            name: name.to_string(),
            handler,
            callback,
        })
    }

    /// The fully spelled out declaration this canonical form stands for.
    pub fn to_declaration(&self) -> Declaration {
        let callback = match &self.callback {
            Some(descriptor) => descriptor.to_value(),
            None => SchemaValue::Bool(false),
        };
        Declaration(SchemaValue::Object(SchemaObject::from([
            ("func".to_string(), SchemaValue::Handler(self.handler.clone())),
            ("callback".to_string(), callback),
        ])))
    }
}

/// User declarations keyed by port name.
#[derive(Clone, Debug, Default)]
pub struct Declarations(BTreeMap<String, Declaration>);

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, name: &str, declaration: impl Into<Declaration>) -> Self {
        self.insert(name, declaration);
        self
    }

    pub fn insert(&mut self, name: &str, declaration: impl Into<Declaration>) -> Option<Declaration> {
        self.0.insert(name.to_string(), declaration.into())
    }

    pub fn get(&self, name: &str) -> Option<&Declaration> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S, D> FromIterator<(S, D)> for Declarations
where
    S: Into<String>,
    D: Into<Declaration>,
{
    fn from_iter<I: IntoIterator<Item = (S, D)>>(iter: I) -> Self {
        Declarations(iter.into_iter().map(|(s, d)| (s.into(), d.into())).collect())
    }
}
