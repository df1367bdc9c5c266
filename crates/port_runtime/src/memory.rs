// src/memory.rs
//
// In-process runtime: outbound ports fan values out to their listeners,
// inbound ports queue pushed values on an unbounded channel.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, trace};

use crate::port::{InboundPort, Listener, OutboundPort, Port, PortKind, PortRuntime, PortSet, SendError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("the runtime has no port named `{0}`")]
    UnknownPort(String),
    #[error("port `{0}` is an inbound port and cannot emit")]
    NotOutbound(String),
}

pub struct MemoryOutbound {
    name: String,
    listeners: Mutex<Vec<Listener>>,
}

impl MemoryOutbound {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listeners: Mutex::new(vec![]),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Delivers `value` to every listener, in subscription order.
    pub fn emit(&self, value: Value) -> usize {
        // clone the list so listeners may run without holding the lock
        let listeners: Vec<Listener> = {
            let guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        trace!(port = %self.name, listeners = listeners.len(), "emitting value");
        for listener in listeners.iter() {
            listener(value.clone());
        }
        listeners.len()
    }
}

impl OutboundPort for MemoryOutbound {
    fn subscribe(&self, listener: Listener) {
        debug!(port = %self.name, "listener subscribed");
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

pub struct MemoryInbound {
    name: String,
    tx: UnboundedSender<Value>,
    rx: Mutex<Option<UnboundedReceiver<Value>>>,
}

impl MemoryInbound {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = unbounded_channel();
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Hands out the receiving end once; later calls return `None`.
    pub fn take_receiver(&self) -> Option<UnboundedReceiver<Value>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl InboundPort for MemoryInbound {
    fn send(&self, value: Value) -> Result<(), SendError> {
        trace!(port = %self.name, "value pushed");
        self.tx
            .send(value)
            .map_err(|_| SendError::Closed(self.name.clone()))
    }
}

/// A runtime instance living entirely in this process.
///
/// ```ignore
/// let runtime = MemoryRuntime::new()
///     .with_outbound("storageGet")
///     .with_inbound("storageGetFinished");
/// let mut replies = runtime.take_receiver("storageGetFinished").unwrap();
/// runtime.emit("storageGet", json!(["req-1", "a"]))?;
/// ```
#[derive(Default)]
pub struct MemoryRuntime {
    ports: PortSet,
    outbound: BTreeMap<String, Arc<MemoryOutbound>>,
    inbound: BTreeMap<String, Arc<MemoryInbound>>,
}

impl std::fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("ports", &self.ports)
            .finish_non_exhaustive()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbound(mut self, name: &str) -> Self {
        let port = Arc::new(MemoryOutbound::new(name));
        self.ports.insert(name, Port::Outbound(port.clone()));
        self.inbound.remove(name);
        self.outbound.insert(name.to_string(), port);
        self
    }

    pub fn with_inbound(mut self, name: &str) -> Self {
        let port = Arc::new(MemoryInbound::new(name));
        self.ports.insert(name, Port::Inbound(port.clone()));
        self.outbound.remove(name);
        self.inbound.insert(name.to_string(), port);
        self
    }

    /// Sends `value` out of an outbound port, returning how many listeners saw it.
    pub fn emit(&self, port: &str, value: Value) -> Result<usize, EmitError> {
        match self.outbound.get(port) {
            Some(outbound) => Ok(outbound.emit(value)),
            None if self.inbound.contains_key(port) => Err(EmitError::NotOutbound(port.to_string())),
            None => Err(EmitError::UnknownPort(port.to_string())),
        }
    }

    pub fn listener_count(&self, port: &str) -> usize {
        self.outbound
            .get(port)
            .map(|outbound| outbound.listener_count())
            .unwrap_or(0)
    }

    pub fn take_receiver(&self, port: &str) -> Option<UnboundedReceiver<Value>> {
        self.inbound.get(port).and_then(|inbound| inbound.take_receiver())
    }

    pub fn kind(&self, port: &str) -> Option<PortKind> {
        self.ports.get(port).map(Port::kind)
    }
}

impl PortRuntime for MemoryRuntime {
    fn ports(&self) -> &PortSet {
        &self.ports
    }
}
