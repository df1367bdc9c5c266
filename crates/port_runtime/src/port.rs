//! The port contract a UI runtime exposes to its host.
//!
//! A runtime hands out named, one-way ports. Outbound ports carry values from
//! the UI to the host and can be subscribed to; inbound ports carry values from
//! the host into the UI and can only be pushed into. The two are told apart by
//! capability, never by name.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde_json::Value;
use thiserror::Error;

/// A host callback that receives every value an outbound port emits.
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Port the UI sends values out of.
pub trait OutboundPort: Send + Sync {
    /// Registers one listener. Listeners live as long as the port.
    fn subscribe(&self, listener: Listener);
}

/// Port the host pushes values into.
pub trait InboundPort: Send + Sync {
    fn send(&self, value: Value) -> Result<(), SendError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("port `{0}` is closed")]
    Closed(String),
    #[error("port `{port}` rejected the value: {reason}")]
    Rejected { port: String, reason: String },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PortKind {
    Outbound,
    Inbound,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKind::Outbound => f.write_str("outbound"),
            PortKind::Inbound => f.write_str("inbound"),
        }
    }
}

#[derive(Clone)]
pub enum Port {
    Outbound(Arc<dyn OutboundPort>),
    Inbound(Arc<dyn InboundPort>),
}

impl Port {
    pub fn kind(&self) -> PortKind {
        match self {
            Port::Outbound(_) => PortKind::Outbound,
            Port::Inbound(_) => PortKind::Inbound,
        }
    }

    /// Inbound ports are the ones that can be pushed into.
    pub fn is_inbound(&self) -> bool {
        matches!(self, Port::Inbound(_))
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port::{}", self.kind())
    }
}

/// The channel set of one runtime instance, ordered by port name.
#[derive(Clone, Default, Debug)]
pub struct PortSet {
    ports: BTreeMap<String, Port>,
}

impl PortSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, port: Port) -> Option<Port> {
        self.ports.insert(name.into(), port)
    }

    pub fn with_outbound(mut self, name: impl Into<String>, port: Arc<dyn OutboundPort>) -> Self {
        self.insert(name, Port::Outbound(port));
        self
    }

    pub fn with_inbound(mut self, name: impl Into<String>, port: Arc<dyn InboundPort>) -> Self {
        self.insert(name, Port::Inbound(port));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Port> {
        self.ports.get(name)
    }

    /// Looks up a port that can receive a pushed value.
    pub fn inbound(&self, name: &str) -> Option<Arc<dyn InboundPort>> {
        match self.ports.get(name) {
            Some(Port::Inbound(port)) => Some(port.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Port)> {
        self.ports.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.ports.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Anything that exposes a channel set: a runtime instance.
pub trait PortRuntime {
    fn ports(&self) -> &PortSet;
}

impl PortRuntime for PortSet {
    fn ports(&self) -> &PortSet {
        self
    }
}
