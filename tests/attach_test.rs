// tests/attach_test.rs
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use port_runtime::{
    MemoryRuntime, PortRuntime,
    test_util::{assert_no_reply, drain, next_reply},
};
use portbridge::{
    attach::{PortAttacher, attach_ports},
    config::{AttachOptions, ConfigManager, MapConfigManager, WARN_ON_IGNORED_RETURNS_KEY},
    constants::{CallbackMode, LogLevel},
    declaration::{Callback, Declaration, Declarations, Handler},
    error::AttachError,
    logger::{MemoryLogger, Severity},
    schema::SchemaError,
    tags::TagFn,
};
use serde_json::{Value, json};

/// Helper to build the storage ports used throughout these tests.
fn storage_runtime() -> MemoryRuntime {
    MemoryRuntime::new()
        .with_outbound("storageSet")
        .with_outbound("storageGet")
        .with_outbound("unused")
        .with_inbound("storageGetFinished")
}

fn attacher() -> (PortAttacher, MemoryLogger) {
    let log = MemoryLogger::new();
    (PortAttacher::new(Box::new(log.clone())), log)
}

#[tokio::test]
async fn test_storage_set_without_callback_never_replies() {
    let rt = storage_runtime();
    let mut replies = rt.take_receiver("storageGetFinished").unwrap();
    let (attacher, log) = attacher();

    let calls = Arc::new(Mutex::new(vec![]));
    let recorded = calls.clone();
    let store = Handler::sync(move |args| {
        recorded.lock().unwrap().push((args[0].clone(), args[1].clone()));
        Ok(json!("stored"))
    });
    let decls = Declarations::new().port("storageSet", Declaration::new(store).callback(false));
    let options = AttachOptions::default().warn_on_ignored_returns(false);

    attacher.attach(&decls, Some(options), Some(&rt)).unwrap();
    rt.emit("storageSet", json!(["a", "1"])).unwrap();

    assert_no_reply(&mut replies, 50).await;
    assert_eq!(calls.lock().unwrap().as_slice(), &[(json!("a"), json!("1"))]);
    assert!(log.with_severity(Severity::Warn).is_empty());
}

fn lookup_declaration(table: &[(&str, &str)]) -> Declarations {
    let table: Vec<(String, String)> = table.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let lookup = Handler::new(move |args: Value| {
        let table = table.clone();
        async move {
            tokio::task::yield_now().await;
            let path = args[0].as_str().unwrap_or_default().to_string();
            table
                .iter()
                .find(|(k, _)| *k == path)
                .map(|(_, v)| Value::String(v.clone()))
                .ok_or_else(|| anyhow::anyhow!("not found"))
        }
    });
    Declarations::new().port(
        "storageGet",
        Declaration::new(lookup).callback(Callback::new().mode(CallbackMode::ResultOrError)),
    )
}

#[tokio::test]
async fn test_storage_get_replies_with_tag() {
    let rt = storage_runtime();
    let mut replies = rt.take_receiver("storageGetFinished").unwrap();

    attach_ports(&lookup_declaration(&[("a", "1")]), None, Some(&rt)).unwrap();
    rt.emit("storageGet", json!(["req-7", "a"])).unwrap();

    assert_eq!(next_reply(&mut replies).await, json!(["req-7", "", "1"]));
    assert_no_reply(&mut replies, 50).await;
}

#[tokio::test]
async fn test_storage_get_failure_carries_message() {
    let rt = storage_runtime();
    let mut replies = rt.take_receiver("storageGetFinished").unwrap();

    attach_ports(&lookup_declaration(&[]), None, Some(&rt)).unwrap();
    rt.emit("storageGet", json!(["req-7", "a"])).unwrap();

    let reply = next_reply(&mut replies).await;
    assert_eq!(reply[0], json!("req-7"));
    assert_eq!(reply[1]["message"], json!("not found"));
    assert_eq!(reply[2], Value::Null);
}

#[tokio::test]
async fn test_concurrent_calls_each_get_their_reply() {
    let rt = storage_runtime();
    let mut replies = rt.take_receiver("storageGetFinished").unwrap();
    attach_ports(&lookup_declaration(&[("a", "1"), ("b", "2")]), None, Some(&rt)).unwrap();

    rt.emit("storageGet", json!(["t1", "a"])).unwrap();
    rt.emit("storageGet", json!(["t2", "b"])).unwrap();
    rt.emit("storageGet", json!(["t3", "c"])).unwrap();

    let mut got = vec![];
    for _ in 0..3 {
        got.push(next_reply(&mut replies).await);
    }
    got.sort_by_key(|reply| reply[0].as_str().unwrap_or_default().to_string());
    assert_eq!(got[0], json!(["t1", "", "1"]));
    assert_eq!(got[1], json!(["t2", "", "2"]));
    assert_eq!(got[2][1]["message"], json!("not found"));
    assert!(drain(&mut replies).is_empty());
}

#[tokio::test]
async fn test_input_port_declaration_fails_and_binds_nothing() {
    let rt = storage_runtime();
    let (attacher, _) = attacher();
    let decls = lookup_declaration(&[]).port("storageGetFinished", Handler::sync(|_| Ok(Value::Null)));

    let err = attacher.attach(&decls, None, Some(&rt)).unwrap_err();
    assert_eq!(err, AttachError::CannotAttachToInputPort("storageGetFinished".into()));
    for port in ["storageSet", "storageGet", "unused"] {
        assert_eq!(rt.listener_count(port), 0, "{port} should be unbound");
    }
}

#[tokio::test]
async fn test_missing_instance_and_empty_runtime() {
    let decls = lookup_declaration(&[]);
    assert_eq!(
        attach_ports::<MemoryRuntime>(&decls, None, None).unwrap_err(),
        AttachError::MissingInstance
    );
    let empty = MemoryRuntime::new();
    assert_eq!(
        attach_ports(&decls, None, Some(&empty)).unwrap_err(),
        AttachError::NoChannelsExposed
    );
}

#[tokio::test]
async fn test_listen_to_empty_ports_option() {
    let rt = storage_runtime();
    let (attacher, log) = attacher();
    attacher
        .attach(&Declarations::new(), Some(AttachOptions::default()), Some(&rt))
        .unwrap();
    assert_eq!(rt.listener_count("unused"), 1);
    rt.emit("unused", json!("hello")).unwrap();
    assert!(log.contains(Severity::Warn, "\"hello\""));

    let rt = storage_runtime();
    let options = AttachOptions::default().listen_to_empty_ports(false);
    attacher.attach(&Declarations::new(), Some(options), Some(&rt)).unwrap();
    assert_eq!(rt.listener_count("unused"), 0);
}

#[tokio::test]
async fn test_bad_tag_fn_means_no_binding() {
    let rt = storage_runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = Handler::sync(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Null)
    });
    let bad_tag = TagFn::new(|v| json!({ "tag": v[0] }));
    let decls = Declarations::new().port("storageGet", Declaration::new(handler).callback(Callback::new().tag(bad_tag)));

    let err = attach_ports(&decls, None, Some(&rt)).unwrap_err();
    assert!(matches!(
        err.schema_error(),
        Some(SchemaError::SchemaTestFailed { key, .. }) if key == "callback.tag"
    ));
    assert_eq!(rt.listener_count("storageGet"), 0);
    assert!(rt.emit("storageGet", json!(["t", 1])).is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_options_loaded_from_config_drive_warnings() {
    /// Attaches a `storageSet` handler returning 42, sends one payload and
    /// waits until that call has been settled.
    async fn run_ignored_return(options: AttachOptions) -> (usize, MemoryLogger) {
        let rt = storage_runtime();
        let mut replies = rt.take_receiver("storageGetFinished").unwrap();
        let (attacher, log) = attacher();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = Handler::sync(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(42))
        });
        let decls = Declarations::new().port("storageSet", handler);
        attacher.attach(&decls, Some(options), Some(&rt)).unwrap();
        rt.emit("storageSet", json!(["a", "1"])).unwrap();
        assert_no_reply(&mut replies, 50).await;
        (calls.load(Ordering::SeqCst), log)
    }

    let (calls, log) = run_ignored_return(AttachOptions::default()).await;
    assert_eq!(calls, 1);
    assert!(log.contains(Severity::Warn, "non-null value: 42"));

    let mgr = MapConfigManager::new();
    mgr.set(WARN_ON_IGNORED_RETURNS_KEY, "false");
    let options = AttachOptions::load(&ConfigManager(mgr)).await.unwrap();
    let (calls, log) = run_ignored_return(options).await;
    assert_eq!(calls, 1);
    assert!(log.with_severity(Severity::Warn).is_empty());
}

#[tokio::test]
async fn test_debug_logging_traces_each_call() {
    let rt = storage_runtime();
    let mut replies = rt.take_receiver("storageGetFinished").unwrap();
    let (attacher, log) = attacher();
    let options = AttachOptions::default().logging(LogLevel::Debug);

    attacher
        .attach(&lookup_declaration(&[("a", "1")]), Some(options), Some(&rt))
        .unwrap();
    assert_eq!(rt.ports().len(), 4);
    rt.emit("storageGet", json!(["req-1", "a"])).unwrap();
    next_reply(&mut replies).await;

    assert!(log.contains(Severity::Debug, "has been called with tag \"req-1\""));
    assert!(log.contains(Severity::Info, "returned a value: \"1\""));
    assert!(log.contains(Severity::Debug, "Attached 1 out of 1 user defined ports"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_writes_start_in_emit_order() {
    const WRITES: usize = 2000;
    let rt = storage_runtime();
    let started = Arc::new(Mutex::new(Vec::with_capacity(WRITES)));
    let recorded = started.clone();
    let store = Handler::new(move |value: Value| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().unwrap().push(value);
            tokio::task::yield_now().await;
            Ok(Value::Null)
        }
    });
    let decls = Declarations::new().port("storageSet", store);
    attach_ports(&decls, None, Some(&rt)).unwrap();

    for i in 0..WRITES {
        rt.emit("storageSet", json!(i)).unwrap();
    }
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let count = started.lock().unwrap().len();
            if count == WRITES {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every write should start");

    let started = started.lock().unwrap();
    let inversion = started.windows(2).find(|pair| pair[0].as_u64() > pair[1].as_u64());
    assert_eq!(inversion, None, "writes on one port started out of emit order");
}
