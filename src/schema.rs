// src/schema.rs
//
// A small validator/defaulter for loosely shaped declarations. A schema lists
// its keys in order; each key may declare a kind, a set of legal values, a
// default and a test that can reject or rewrite the value.

use std::{collections::BTreeMap, fmt, sync::Arc};

use strum::IntoEnumIterator;
use strum_macros::Display;
use thiserror::Error;

use crate::{
    constants::CallbackMode,
    declaration::Handler,
    tags::{TagFn, check_sample, default_tag_fn},
};

pub type SchemaObject = BTreeMap<String, SchemaValue>;

/// A loosely typed declaration value, before normalization.
#[derive(Clone, Debug, PartialEq)]
pub enum SchemaValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Handler(Handler),
    Tag(TagFn),
    Object(SchemaObject),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Handler,
    #[strum(serialize = "tag function")]
    TagFunction,
    Object,
}

impl SchemaValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            SchemaValue::Null => ValueKind::Null,
            SchemaValue::Bool(_) => ValueKind::Bool,
            SchemaValue::Number(_) => ValueKind::Number,
            SchemaValue::String(_) => ValueKind::String,
            SchemaValue::Handler(_) => ValueKind::Handler,
            SchemaValue::Tag(_) => ValueKind::TagFunction,
            SchemaValue::Object(_) => ValueKind::Object,
        }
    }

    pub fn object() -> Self {
        SchemaValue::Object(SchemaObject::new())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SchemaValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Sets `key` on an object value. Any other value is first wrapped under `root`.
    pub fn with_key(self, root: &str, key: &str, value: SchemaValue) -> Self {
        let mut map = match self {
            SchemaValue::Object(map) => map,
            other => SchemaObject::from([(root.to_string(), other)]),
        };
        map.insert(key.to_string(), value);
        SchemaValue::Object(map)
    }
}

impl fmt::Display for SchemaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaValue::Null => f.write_str("null"),
            SchemaValue::Bool(b) => write!(f, "{b}"),
            SchemaValue::Number(n) => write!(f, "{n}"),
            SchemaValue::String(s) => write!(f, "{s:?}"),
            SchemaValue::Handler(_) => f.write_str("<handler>"),
            SchemaValue::Tag(_) => f.write_str("<tag function>"),
            SchemaValue::Object(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{k:?}:{v}")?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for SchemaValue {
    fn from(b: bool) -> Self {
        SchemaValue::Bool(b)
    }
}

impl From<&str> for SchemaValue {
    fn from(s: &str) -> Self {
        SchemaValue::String(s.to_string())
    }
}

impl From<String> for SchemaValue {
    fn from(s: String) -> Self {
        SchemaValue::String(s)
    }
}

impl From<f64> for SchemaValue {
    fn from(n: f64) -> Self {
        SchemaValue::Number(n)
    }
}

impl From<Handler> for SchemaValue {
    fn from(h: Handler) -> Self {
        SchemaValue::Handler(h)
    }
}

impl From<TagFn> for SchemaValue {
    fn from(t: TagFn) -> Self {
        SchemaValue::Tag(t)
    }
}

impl From<CallbackMode> for SchemaValue {
    fn from(mode: CallbackMode) -> Self {
        SchemaValue::String(mode.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("{key} is required but wasn't given")]
    MissingRequiredField { key: String },
    #[error("{key} must be the type {expected} but it's {actual}")]
    TypeMismatch { key: String, expected: ValueKind, actual: ValueKind },
    #[error("{key} must be one of [{allowed}] but it's {actual}")]
    InvalidEnumValue { key: String, allowed: String, actual: String },
    #[error("{key}'s value {value} failed the schema test: {message}")]
    SchemaTestFailed { key: String, value: String, message: String },
    #[error("Expected object but got {actual}")]
    ExpectedObject { actual: ValueKind },
}

impl SchemaError {
    /// Reports the failing key as a child of `parent`, e.g. `callback.tag`.
    pub fn within(self, parent: &str) -> Self {
        let nest = |key: String| format!("{parent}.{key}");
        match self {
            SchemaError::MissingRequiredField { key } => SchemaError::MissingRequiredField { key: nest(key) },
            SchemaError::TypeMismatch { key, expected, actual } => SchemaError::TypeMismatch {
                key: nest(key),
                expected,
                actual,
            },
            SchemaError::InvalidEnumValue { key, allowed, actual } => SchemaError::InvalidEnumValue {
                key: nest(key),
                allowed,
                actual,
            },
            SchemaError::SchemaTestFailed { key, value, message } => SchemaError::SchemaTestFailed {
                key: nest(key),
                value,
                message,
            },
            SchemaError::ExpectedObject { actual } => SchemaError::TypeMismatch {
                key: parent.to_string(),
                expected: ValueKind::Object,
                actual,
            },
        }
    }

    pub fn key(&self) -> Option<&str> {
        match self {
            SchemaError::MissingRequiredField { key }
            | SchemaError::TypeMismatch { key, .. }
            | SchemaError::InvalidEnumValue { key, .. }
            | SchemaError::SchemaTestFailed { key, .. } => Some(key),
            SchemaError::ExpectedObject { .. } => None,
        }
    }
}

/// `Ok(None)` keeps the value, `Ok(Some(v))` replaces it, `Err(msg)` rejects it.
pub type SchemaTest = Arc<dyn Fn(&SchemaValue) -> Result<Option<SchemaValue>, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct KeySchema {
    kind: Option<ValueKind>,
    one_of: Option<Vec<SchemaValue>>,
    default: Option<SchemaValue>,
    test: Option<SchemaTest>,
}

impl KeySchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn one_of(mut self, values: Vec<SchemaValue>) -> Self {
        self.one_of = Some(values);
        self
    }

    pub fn default_value(mut self, value: impl Into<SchemaValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn test<F>(mut self, test: F) -> Self
    where
        F: Fn(&SchemaValue) -> Result<Option<SchemaValue>, String> + Send + Sync + 'static,
    {
        self.test = Some(Arc::new(test));
        self
    }

    /// Validates one key. An absent value takes the default unvalidated.
    pub fn check(&self, key: &str, value: Option<SchemaValue>) -> Result<SchemaValue, SchemaError> {
        let Some(value) = value else {
            return self
                .default
                .clone()
                .ok_or_else(|| SchemaError::MissingRequiredField { key: key.to_string() });
        };

        if let Some(expected) = self.kind {
            if value.kind() != expected {
                return Err(SchemaError::TypeMismatch {
                    key: key.to_string(),
                    expected,
                    actual: value.kind(),
                });
            }
        }

        if let Some(allowed) = &self.one_of {
            if !allowed.contains(&value) {
                return Err(SchemaError::InvalidEnumValue {
                    key: key.to_string(),
                    allowed: allowed.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(","),
                    actual: value.to_string(),
                });
            }
        }

        if let Some(test) = &self.test {
            return match test(&value) {
                Ok(Some(replacement)) => Ok(replacement),
                Ok(None) => Ok(value),
                Err(message) => Err(SchemaError::SchemaTestFailed {
                    key: key.to_string(),
                    value: value.to_string(),
                    message,
                }),
            };
        }

        Ok(value)
    }
}

impl fmt::Debug for KeySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySchema")
            .field("kind", &self.kind)
            .field("one_of", &self.one_of)
            .field("default", &self.default)
            .field("test", &self.test.is_some())
            .finish()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaDescription {
    root: Option<String>,
    keys: Vec<(String, KeySchema)>,
}

impl SchemaDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key a non-object value is stored under before validation.
    pub fn root(mut self, key: &str) -> Self {
        self.root = Some(key.to_string());
        self
    }

    pub fn key(mut self, name: &str, schema: KeySchema) -> Self {
        self.keys.push((name.to_string(), schema));
        self
    }

    /// Produces an object holding exactly the schema's keys. Input keys the
    /// schema doesn't name are dropped.
    pub fn normalize(&self, value: SchemaValue) -> Result<SchemaObject, SchemaError> {
        let mut input = match (value, &self.root) {
            (SchemaValue::Object(map), _) => map,
            (other, Some(root)) => SchemaObject::from([(root.clone(), other)]),
            (other, None) => return Err(SchemaError::ExpectedObject { actual: other.kind() }),
        };

        let mut out = SchemaObject::new();
        for (key, schema) in self.keys.iter() {
            let checked = schema.check(key, input.remove(key))?;
            out.insert(key.clone(), checked);
        }
        Ok(out)
    }
}

/// Schema of a port declaration, leaving `callback` for [`callback_schema`].
pub fn port_schema() -> SchemaDescription {
    SchemaDescription::new()
        .root("func")
        .key("func", KeySchema::new().kind(ValueKind::Handler))
        .key(
            "callback",
            KeySchema::new().default_value(false).test(|value| match value {
                SchemaValue::Bool(true) => Ok(Some(SchemaValue::object())),
                SchemaValue::Bool(false) | SchemaValue::String(_) | SchemaValue::Object(_) => Ok(None),
                other => Err(format!(
                    "callback must be a boolean, a callback mode or a callback object, not a {}",
                    other.kind()
                )),
            }),
        )
}

/// Schema of the callback descriptor for the port called `port_name`.
pub fn callback_schema(port_name: &str) -> SchemaDescription {
    SchemaDescription::new()
        .root("type")
        .key(
            "type",
            KeySchema::new()
                .one_of(CallbackMode::iter().map(SchemaValue::from).collect())
                .default_value(CallbackMode::Error),
        )
        .key(
            "tag",
            KeySchema::new().default_value(default_tag_fn()).test(|value| match value {
                SchemaValue::Bool(false) => Ok(None),
                SchemaValue::Bool(true) => Ok(Some(SchemaValue::Tag(default_tag_fn()))),
                SchemaValue::Tag(tag_fn) => check_sample(tag_fn).map(|_| None).map_err(|e| e.to_string()),
                other => Err(format!("tag must be a tag function or false, not a {}", other.kind())),
            }),
        )
        .key(
            "name",
            KeySchema::new()
                .kind(ValueKind::String)
                .default_value(format!("{port_name}Finished")),
        )
}
