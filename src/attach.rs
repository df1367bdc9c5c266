// src/attach.rs

use std::sync::Arc;

use port_runtime::{Listener, OutboundPort, Port, PortRuntime};
use serde_json::Value;
use tokio::runtime::Handle;

use crate::{
    config::AttachOptions,
    declaration::{Declarations, PortDeclaration},
    dispatcher::{DispatchOptions, Dispatcher},
    error::AttachError,
    logger::{Logger, LoggerType, TracingLogger},
};

/// What one outbound port gets once attaching goes ahead.
enum Binding {
    Declared(Arc<Dispatcher>),
    Empty,
}

/// Binds user declarations to the ports of a runtime.
///
/// A fresh [`Logger`] is built from the injected sink for every attach call,
/// at the verbosity given in that call's [`AttachOptions`].
pub struct PortAttacher {
    sink: Box<dyn LoggerType>,
}

impl Default for PortAttacher {
    fn default() -> Self {
        Self::new(Box::new(TracingLogger::new()))
    }
}

impl std::fmt::Debug for PortAttacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAttacher").field("sink", &self.sink.debug_box()).finish()
    }
}

impl PortAttacher {
    pub fn new(sink: Box<dyn LoggerType>) -> Self {
        Self { sink }
    }

    /// Attaches every declaration, or nothing at all.
    ///
    /// Declarations are normalized and dispatchers built for every port before
    /// the first listener is subscribed, so any error leaves the runtime
    /// untouched. Returns the runtime for chaining.
    pub fn attach<'r, R>(
        &self,
        declarations: &Declarations,
        options: Option<AttachOptions>,
        runtime: Option<&'r R>,
    ) -> Result<&'r R, AttachError>
    where
        R: PortRuntime + ?Sized,
    {
        let runtime = runtime.ok_or(AttachError::MissingInstance)?;
        let ports = runtime.ports();
        if ports.is_empty() {
            return Err(AttachError::NoChannelsExposed);
        }

        let options = options.unwrap_or_default();
        let logger = Logger::new(self.sink.clone_box(), options.logging);
        let dispatch_options = DispatchOptions {
            warn_on_ignored_returns: options.warn_on_ignored_returns,
        };
        logger.debug("attach", &format!("Started attaching ports with {options:?}"));

        // 1) plan a binding for every port
        let mut plan: Vec<(String, Arc<dyn OutboundPort>, Binding)> = Vec::with_capacity(ports.len());
        for (name, port) in ports.iter() {
            logger.debug("attach", &format!("Inspecting port {name}"));
            match (port, declarations.get(name)) {
                (Port::Inbound(_), Some(_)) => {
                    logger.error("attach", &format!("Cannot attach to port {name} because it's an input port"));
                    return Err(AttachError::CannotAttachToInputPort(name.clone()));
                }
                (Port::Inbound(_), None) => {}
                (Port::Outbound(outbound), Some(declaration)) => {
                    let canonical = PortDeclaration::normalize(name, declaration.clone()).map_err(|source| {
                        AttachError::Declaration {
                            port: name.clone(),
                            source,
                        }
                    })?;
                    logger.debug("attach", &format!("Normalized port {name} to {canonical:?}"));
                    let dispatcher = Dispatcher::new(logger.clone(), canonical, ports, dispatch_options);
                    plan.push((name.clone(), outbound.clone(), Binding::Declared(Arc::new(dispatcher))));
                }
                (Port::Outbound(outbound), None) if options.listen_to_empty_ports => {
                    plan.push((name.clone(), outbound.clone(), Binding::Empty));
                }
                (Port::Outbound(_), None) => logger.debug(
                    "attach",
                    &format!(
                        "No listener was attached to port {name} because there isn't a user defined listener \
                         and listenToEmptyPorts isn't enabled"
                    ),
                ),
            }
        }

        for name in declarations.names().filter(|name| !ports.contains(name)) {
            logger.warn(
                "attach",
                &format!("A listener was defined for port {name} but the runtime has no port by that name"),
            );
        }

        // 2) dispatchers settle on the caller's runtime
        let handle = Handle::try_current().map_err(|_| AttachError::MissingAsyncRuntime)?;

        // 3) subscribe
        let mut attached = 0;
        for (name, outbound, binding) in plan {
            match binding {
                Binding::Declared(dispatcher) => {
                    logger.debug("attach", &format!("Adding user-defined handler to port {name}"));
                    outbound.subscribe(dispatcher.listener(handle.clone()));
                    attached += 1;
                }
                Binding::Empty => {
                    logger.debug(
                        "attach",
                        &format!("User has not defined a handler for port {name}, adding 'empty' listener"),
                    );
                    outbound.subscribe(empty_port_listener(logger.clone(), name));
                }
            }
        }

        logger.debug(
            "attach",
            &format!("Attached {attached} out of {} user defined ports", declarations.len()),
        );
        Ok(runtime)
    }
}

/// Logs whatever an undeclared port sends, then drops it.
fn empty_port_listener(logger: Logger, name: String) -> Listener {
    Arc::new(move |data: Value| {
        logger.warn(
            &name,
            &format!("A port that you didn't make a listener for, `{name}`, sent data: {data}"),
        );
    })
}

/// [`PortAttacher::attach`] with logs going to `tracing`.
pub fn attach_ports<'r, R>(
    declarations: &Declarations,
    options: Option<AttachOptions>,
    runtime: Option<&'r R>,
) -> Result<&'r R, AttachError>
where
    R: PortRuntime + ?Sized,
{
    PortAttacher::default().attach(declarations, options, runtime)
}

#[cfg(test)]
pub mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use port_runtime::{
        MemoryRuntime, PortSet,
        test_util::{assert_no_reply, next_reply},
    };
    use serde_json::json;

    use super::*;
    use crate::{
        constants::{CallbackMode, LogLevel},
        declaration::{Callback, Declaration, Handler},
        logger::{MemoryLogger, Severity},
        schema::SchemaError,
        tags::TagFn,
    };

    fn runtime() -> MemoryRuntime {
        MemoryRuntime::new()
            .with_outbound("setTitle")
            .with_outbound("storageGet")
            .with_outbound("unused")
            .with_inbound("storageGetFinished")
    }

    fn noop() -> Handler {
        Handler::sync(|_| Ok(Value::Null))
    }

    fn attacher() -> (PortAttacher, MemoryLogger) {
        let log = MemoryLogger::new();
        (PortAttacher::new(Box::new(log.clone())), log)
    }

    #[tokio::test]
    async fn test_attach_binds_declared_and_empty_ports() {
        let rt = runtime();
        let (attacher, log) = attacher();
        let decls = Declarations::new()
            .port("setTitle", noop())
            .port("storageGet", Declaration::new(noop()).callback(true));

        let returned = attacher.attach(&decls, None, Some(&rt)).unwrap();
        assert!(std::ptr::eq(returned, &rt));
        assert_eq!(rt.listener_count("setTitle"), 1);
        assert_eq!(rt.listener_count("storageGet"), 1);
        assert_eq!(rt.listener_count("unused"), 1);

        rt.emit("unused", json!({ "x": 1 })).unwrap();
        assert!(log.contains(Severity::Warn, "`unused`, sent data"));
    }

    #[tokio::test]
    async fn test_empty_ports_left_alone_when_disabled() {
        let rt = runtime();
        let (attacher, _) = attacher();
        let decls = Declarations::new().port("setTitle", noop());
        let options = AttachOptions::default().listen_to_empty_ports(false);

        attacher.attach(&decls, Some(options), Some(&rt)).unwrap();
        assert_eq!(rt.listener_count("setTitle"), 1);
        assert_eq!(rt.listener_count("storageGet"), 0);
        assert_eq!(rt.listener_count("unused"), 0);
    }

    #[tokio::test]
    async fn test_reply_round_trip() {
        let rt = runtime();
        let mut replies = rt.take_receiver("storageGetFinished").unwrap();
        let handler = Handler::new(|args: Value| async move { Ok(json!(format!("value of {}", args[0]))) });
        let decls = Declarations::new().port("storageGet", Declaration::new(handler).callback(CallbackMode::Result));

        attach_ports(&decls, None, Some(&rt)).unwrap();
        rt.emit("storageGet", json!(["req-1", "a"])).unwrap();
        assert_eq!(next_reply(&mut replies).await, json!(["req-1", "value of \"a\""]));
    }

    #[tokio::test]
    async fn test_input_port_declaration_aborts_everything() {
        let rt = runtime();
        let (attacher, log) = attacher();
        let decls = Declarations::new()
            .port("setTitle", noop())
            .port("storageGetFinished", noop());

        let err = attacher.attach(&decls, None, Some(&rt)).unwrap_err();
        assert_eq!(err, AttachError::CannotAttachToInputPort("storageGetFinished".into()));
        assert_eq!(rt.listener_count("setTitle"), 0);
        assert_eq!(rt.listener_count("unused"), 0);
        assert!(log.contains(Severity::Error, "input port"));
    }

    #[tokio::test]
    async fn test_bad_declaration_aborts_everything() {
        let rt = runtime();
        let (attacher, _) = attacher();
        let bad_tag = TagFn::new(|_| json!(42));
        let decls = Declarations::new()
            .port("setTitle", noop())
            .port("storageGet", Declaration::new(noop()).callback(Callback::new().tag(bad_tag)));

        let err = attacher.attach(&decls, None, Some(&rt)).unwrap_err();
        match err {
            AttachError::Declaration { port, source } => {
                assert_eq!(port, "storageGet");
                assert!(matches!(source, SchemaError::SchemaTestFailed { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(rt.listener_count("setTitle"), 0);
    }

    #[tokio::test]
    async fn test_missing_instance_and_no_channels() {
        let (attacher, _) = attacher();
        let decls = Declarations::new().port("setTitle", noop());

        let err = attacher.attach::<MemoryRuntime>(&decls, None, None).unwrap_err();
        assert_eq!(err, AttachError::MissingInstance);

        let empty = PortSet::new();
        let err = attacher.attach(&decls, None, Some(&empty)).unwrap_err();
        assert_eq!(err, AttachError::NoChannelsExposed);
    }

    #[test]
    fn test_attach_outside_tokio_fails() {
        let rt = runtime();
        let (attacher, _) = attacher();
        let decls = Declarations::new().port("setTitle", noop());
        let err = attacher.attach(&decls, None, Some(&rt)).unwrap_err();
        assert_eq!(err, AttachError::MissingAsyncRuntime);
        assert_eq!(rt.listener_count("setTitle"), 0);
    }

    #[tokio::test]
    async fn test_unknown_declaration_is_reported() {
        let rt = runtime();
        let (attacher, log) = attacher();
        let decls = Declarations::new().port("setTitle", noop()).port("nowhere", noop());
        let options = AttachOptions::default().logging(LogLevel::Debug);

        attacher.attach(&decls, Some(options), Some(&rt)).unwrap();
        assert!(log.contains(Severity::Warn, "nowhere"));
        assert!(log.contains(Severity::Debug, "Attached 1 out of 2 user defined ports"));
    }

    #[tokio::test]
    async fn test_logging_option_sets_verbosity() {
        let rt = runtime();
        let (attacher, log) = attacher();
        let decls = Declarations::new().port("setTitle", noop());

        attacher
            .attach(&decls, Some(AttachOptions::default().logging(LogLevel::None)), Some(&rt))
            .unwrap();
        rt.emit("unused", json!(1)).unwrap();
        assert!(log.lines().is_empty());
    }

    #[tokio::test]
    async fn test_deliveries_reach_handler_in_order() {
        let rt = runtime();
        let (attacher, _) = attacher();
        let seen = Arc::new(Mutex::new(vec![]));
        let calls = Arc::new(AtomicUsize::new(0));
        let (recorded, counter) = (seen.clone(), calls.clone());
        let handler = Handler::sync(move |title| {
            recorded.lock().unwrap().push(title);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        let decls = Declarations::new().port("setTitle", handler);

        attacher.attach(&decls, None, Some(&rt)).unwrap();
        for title in ["one", "two", "three"] {
            rt.emit("setTitle", json!(title)).unwrap();
        }
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[json!("one"), json!("two"), json!("three")]);
    }

    #[tokio::test]
    async fn test_no_reply_without_callback() {
        let rt = runtime();
        let mut replies = rt.take_receiver("storageGetFinished").unwrap();
        let (attacher, _) = attacher();
        let decls = Declarations::new().port("storageGet", Handler::sync(|_| Ok(json!("ignored"))));

        attacher.attach(&decls, None, Some(&rt)).unwrap();
        rt.emit("storageGet", json!(["t", "a"])).unwrap();
        assert_no_reply(&mut replies, 50).await;
    }
}
