use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::schema::SchemaError;

/// Configuration errors. Any of these aborts the whole attach call before a
/// single port is subscribed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AttachError {
    #[error("no runtime instance was given to attach the ports to")]
    MissingInstance,
    #[error("the runtime instance exposes no ports")]
    NoChannelsExposed,
    #[error("cannot attach to port `{0}` because it's an input port")]
    CannotAttachToInputPort(String),
    #[error("port `{port}` has an invalid declaration: {source}")]
    Declaration {
        port: String,
        #[source]
        source: SchemaError,
    },
    #[error("ports must be attached from inside a tokio runtime")]
    MissingAsyncRuntime,
}

impl AttachError {
    pub fn schema_error(&self) -> Option<&SchemaError> {
        match self {
            AttachError::Declaration { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A handler that failed at dispatch time. It never leaves the dispatcher: it
/// is either sent to the reply port or logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: "Error".to_string(),
            message: message.into(),
            causes: vec![],
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        };
        Self {
            name: "Panic".to_string(),
            message,
            causes: vec![],
        }
    }

    /// The shape the UI receives: `{"name": .., "message": .., "causes": [..]}`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.message.clone()))
    }
}

impl From<anyhow::Error> for HandlerFailure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            name: "Error".to_string(),
            message: err.to_string(),
            causes: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }
}
