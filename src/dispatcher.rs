//! Turns one canonical port declaration into the listener the runtime calls.
//!
//! Each delivery runs the handler, settles it into exactly one [`Outcome`],
//! and, when the port has a callback, pushes a reply shaped by the callback
//! mode into the reply port. Handler failures never escape the dispatcher.
//!
//! Handlers of one port start in the order the runtime emitted their payloads.
//! They may finish in any order, and each one replies as soon as it settles.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use futures::{
    FutureExt, StreamExt,
    future::{self, BoxFuture},
    stream::FuturesUnordered,
};
use port_runtime::{InboundPort, Listener, PortSet};
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::mpsc::{UnboundedReceiver, unbounded_channel},
};

use crate::{
    constants::CallbackMode,
    declaration::{CallbackDescriptor, Handler, PortDeclaration},
    error::HandlerFailure,
    logger::Logger,
    tags::compose_reply,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure(HandlerFailure),
}

/// Reply payload for `mode`, or `None` when nothing is sent.
///
/// | mode            | success          | failure            |
/// |-----------------|------------------|--------------------|
/// | NONE            | -                | -                  |
/// | RESULT          | `result`         | -                  |
/// | ERROR           | `null`           | `error`            |
/// | RESULT_OR_ERROR | `["", result]`   | `[error, null]`    |
///
/// With a tag the tag is put in front, e.g. `[tag, "", result]`.
pub fn shape_reply(mode: CallbackMode, tag: Option<&Value>, outcome: &Outcome) -> Option<Value> {
    let slots = match (mode, outcome) {
        (CallbackMode::None, _) => return None,
        (CallbackMode::Result, Outcome::Success(result)) => vec![result.clone()],
        (CallbackMode::Result, Outcome::Failure(_)) => return None,
        (CallbackMode::Error, Outcome::Success(_)) => vec![Value::Null],
        (CallbackMode::Error, Outcome::Failure(failure)) => vec![failure.to_value()],
        (CallbackMode::ResultOrError, Outcome::Success(result)) => {
            vec![Value::String(String::new()), result.clone()]
        }
        (CallbackMode::ResultOrError, Outcome::Failure(failure)) => vec![failure.to_value(), Value::Null],
    };
    Some(compose_reply(tag, slots))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub warn_on_ignored_returns: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { warn_on_ignored_returns: true }
    }
}

pub struct Dispatcher {
    name: String,
    handler: Handler,
    callback: Option<CallbackDescriptor>,
    reply_port: Option<Arc<dyn InboundPort>>,
    logger: Logger,
    options: DispatchOptions,
}

impl Dispatcher {
    /// Resolves the reply port once. A missing reply port is reported on every
    /// reply instead of failing here.
    pub fn new(logger: Logger, declaration: PortDeclaration, replies: &PortSet, options: DispatchOptions) -> Self {
        let PortDeclaration { name, handler, callback } = declaration;
        let reply_port = callback
            .as_ref()
            .and_then(|descriptor| replies.inbound(&descriptor.reply_port));
        if let Some(descriptor) = &callback {
            if reply_port.is_none() {
                logger.warn(
                    &name,
                    &format!(
                        "Port {name} replies to `{}` but the runtime has no inbound port by that name",
                        descriptor.reply_port
                    ),
                );
            }
        }
        Self {
            name,
            handler,
            callback,
            reply_port,
            logger,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callback(&self) -> Option<&CallbackDescriptor> {
        self.callback.as_ref()
    }

    /// Listener for the runtime. Payloads are queued to one task per port,
    /// spawned on `runtime`, which starts their calls in arrival order.
    pub fn listener(self: Arc<Self>, runtime: Handle) -> Listener {
        let (tx, rx) = unbounded_channel();
        runtime.spawn(self.clone().drive(rx));
        Arc::new(move |payload: Value| {
            if tx.send(payload).is_err() {
                let name = &self.name;
                self.logger.error(name, &format!("Port {name} dropped a payload because its dispatcher stopped"));
            }
        })
    }

    async fn drive(self: Arc<Self>, mut payloads: UnboundedReceiver<Value>) {
        // FuturesUnordered polls new futures in push order
        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                biased;
                payload = payloads.recv() => match payload {
                    Some(payload) => in_flight.push(self.clone().dispatch(payload)),
                    None => break,
                },
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        }
        while in_flight.next().await.is_some() {}
    }

    /// Splits the tag and calls the handler. The returned future drives the
    /// handler to completion and sends the reply.
    ///
    /// A tag function that can't split the payload settles the call as a
    /// failure with a `null` tag, without running the handler.
    pub fn dispatch(self: Arc<Self>, payload: Value) -> BoxFuture<'static, ()> {
        match self.split(payload) {
            Ok((tag, argument)) => {
                let pending = self.invoke(argument);
                async move {
                    let outcome = pending.await;
                    self.settle(tag.as_ref(), outcome);
                }
                .boxed()
            }
            Err(failure) => {
                self.settle(Some(&Value::Null), Outcome::Failure(failure));
                future::ready(()).boxed()
            }
        }
    }

    fn split(&self, payload: Value) -> Result<(Option<Value>, Value), HandlerFailure> {
        let tag_fn = match &self.callback {
            Some(CallbackDescriptor { tag: Some(tag_fn), .. }) => tag_fn,
            _ => {
                self.logger.debug(&self.name, &format!("Port {} has been called with {payload}", self.name));
                return Ok((None, payload));
            }
        };
        match tag_fn.split(&payload) {
            Ok(split) => {
                self.logger.debug(
                    &self.name,
                    &format!("Port {} has been called with tag {} and data {}", self.name, split.tag, split.rest),
                );
                Ok((Some(split.tag), split.rest))
            }
            Err(err) => {
                self.logger.error(
                    &self.name,
                    &format!("Port {} could not split the tag from {payload}: {err}", self.name),
                );
                Err(HandlerFailure {
                    name: "TagError".to_string(),
                    message: err.to_string(),
                    causes: vec![],
                })
            }
        }
    }

    /// Synchronous panics, async panics and `Err` all end up as a failure.
    fn invoke(&self, argument: Value) -> BoxFuture<'static, Outcome> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.call(argument))) {
            Ok(pending) => AssertUnwindSafe(pending)
                .catch_unwind()
                .map(|settled| match settled {
                    Ok(Ok(value)) => Outcome::Success(value),
                    Ok(Err(err)) => Outcome::Failure(HandlerFailure::from(err)),
                    Err(panic) => Outcome::Failure(HandlerFailure::from_panic(panic)),
                })
                .boxed(),
            Err(panic) => future::ready(Outcome::Failure(HandlerFailure::from_panic(panic))).boxed(),
        }
    }

    fn settle(&self, tag: Option<&Value>, outcome: Outcome) {
        let name = &self.name;
        let Some(descriptor) = &self.callback else {
            match outcome {
                Outcome::Success(Value::Null) => {
                    self.logger.debug(name, &format!("Port {name} finished successfully with no result"));
                }
                Outcome::Success(value) if self.options.warn_on_ignored_returns => self.logger.warn(
                    name,
                    &format!(
                        "Port {name} returned a non-null value: {value}. \
                         The value was not sent to the UI because the port has no callback"
                    ),
                ),
                Outcome::Success(value) => self.logger.debug(
                    name,
                    &format!(
                        "Port {name} finished with an ignored result {value} \
                         (warning suppressed because warnOnIgnoredReturns is off)"
                    ),
                ),
                Outcome::Failure(failure) => {
                    self.logger.error(
                        name,
                        &format!("Port {name} errored when running (not sent to the UI): {}", failure.message),
                    );
                    self.logger.debug(
                        name,
                        &format!("Error from {name} was not sent to the UI because the port has no callback"),
                    );
                }
            }
            return;
        };

        match &outcome {
            Outcome::Success(value) => {
                self.logger.info(name, &format!("Port {name} returned a value: {value}"));
            }
            Outcome::Failure(failure) => {
                self.logger.error(name, &format!("Port {name} errored when running: {}", failure.message));
            }
        }

        match shape_reply(descriptor.mode, tag, &outcome) {
            Some(reply) => self.send_reply(descriptor, reply),
            None => self.logger.debug(
                name,
                &format!("Port {name} sent no reply because its callback mode is {}", descriptor.mode),
            ),
        }
    }

    fn send_reply(&self, descriptor: &CallbackDescriptor, reply: Value) {
        let name = &self.name;
        match &self.reply_port {
            Some(port) => match port.send(reply) {
                Ok(()) => self.logger.debug(name, &format!("Port {name} replied on {}", descriptor.reply_port)),
                Err(err) => self.logger.error(name, &format!("Port {name} could not reply: {err}")),
            },
            None => self.logger.error(
                name,
                &format!(
                    "Port {name} could not reply because inbound port `{}` does not exist",
                    descriptor.reply_port
                ),
            ),
        }
    }
}
