//! Correlation tags.
//!
//! Several calls may share one reply port. The caller puts a tag in front of
//! its payload, the tag function splits it off before the handler runs, and
//! the reply carries the same tag back so the UI can match it up.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};

use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TagError {
    #[error("The callback.tag function must return an object with \"tag\" and \"rest\" but it returned {0}")]
    MissingFields(String),
    #[error("The callback.tag function panicked")]
    Panicked,
}

/// A payload split into its correlation tag and the handler's argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub tag: Value,
    pub rest: Value,
}

impl Split {
    /// Reads a tag function's output. Both keys must be present; either may be `null`.
    pub fn from_value(value: Value) -> Result<Self, TagError> {
        match value {
            Value::Object(mut map) if map.contains_key("tag") && map.contains_key("rest") => Ok(Split {
                tag: map.remove("tag").unwrap_or(Value::Null),
                rest: map.remove("rest").unwrap_or(Value::Null),
            }),
            other => Err(TagError::MissingFields(other.to_string())),
        }
    }
}

#[derive(Clone)]
pub struct TagFn(Arc<dyn Fn(&Value) -> Value + Send + Sync>);

impl TagFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, payload: &Value) -> Value {
        (self.0)(payload)
    }

    /// Runs the tag function, containing panics.
    pub fn split(&self, payload: &Value) -> Result<Split, TagError> {
        let output = panic::catch_unwind(AssertUnwindSafe(|| self.call(payload)))
            .map_err(|_| TagError::Panicked)?;
        Split::from_value(output)
    }

    pub fn ptr_eq(&self, other: &TagFn) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_default(&self) -> bool {
        self.ptr_eq(&default_tag_fn())
    }
}

impl PartialEq for TagFn {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for TagFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default() {
            f.write_str("TagFn(default)")
        } else {
            f.write_str("TagFn(custom)")
        }
    }
}

/// The first element of an array payload is the tag, the remaining elements are the rest.
/// Anything that isn't an array has no tag.
pub fn default_tag_function(payload: &Value) -> Value {
    match payload {
        Value::Array(items) => json!({
            "tag": items.first().cloned().unwrap_or(Value::Null),
            "rest": items.iter().skip(1).cloned().collect::<Vec<_>>(),
        }),
        other => json!({ "tag": Value::Null, "rest": other }),
    }
}

static DEFAULT_TAG_FN: OnceLock<TagFn> = OnceLock::new();

/// Shared instance of [`default_tag_function`], so defaulted descriptors compare equal.
pub fn default_tag_fn() -> TagFn {
    DEFAULT_TAG_FN.get_or_init(|| TagFn::new(default_tag_function)).clone()
}

/// Payload every custom tag function is checked against when it is declared.
pub fn sample_payload() -> Value {
    json!([1, 2, 3])
}

pub fn check_sample(tag_fn: &TagFn) -> Result<Split, TagError> {
    tag_fn.split(&sample_payload())
}

/// Builds a reply from its slots, putting the tag in front when there is one.
/// A single untagged slot is sent bare.
pub fn compose_reply(tag: Option<&Value>, mut slots: Vec<Value>) -> Value {
    match tag {
        Some(tag) => {
            slots.insert(0, tag.clone());
            Value::Array(slots)
        }
        None if slots.len() == 1 => slots.pop().unwrap_or(Value::Null),
        None => Value::Array(slots),
    }
}
