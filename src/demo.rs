// src/demo.rs
//
// The storage example: a UI that sets its title, writes key/value pairs, and
// reads them back through a tagged reply port.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow, bail};
use dashmap::DashMap;
use port_runtime::MemoryRuntime;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::time::{Duration, timeout};
use tracing::info;
use uuid::Uuid;

use crate::{
    attach::PortAttacher,
    config::AttachOptions,
    constants::CallbackMode,
    declaration::{Callback, Declaration, Declarations, Handler},
};

pub const REPLY_PORT: &str = "storageGetFinished";
const REPLY_WAIT: Duration = Duration::from_secs(5);
const POLL_EVERY: Duration = Duration::from_millis(5);

/// Host-side state the demo handlers write into.
#[derive(Clone, Debug, Default)]
pub struct Storage {
    pub values: Arc<DashMap<String, String>>,
    pub title: Arc<Mutex<Option<String>>>,
}

impl Storage {
    pub fn title(&self) -> Option<String> {
        self.title.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Ports of the demo UI. `analytics` is never declared.
pub fn storage_runtime() -> MemoryRuntime {
    MemoryRuntime::new()
        .with_outbound("setTitle")
        .with_outbound("storageSet")
        .with_outbound("storageGet")
        .with_outbound("analytics")
        .with_inbound(REPLY_PORT)
}

/// Waits until `ready` holds. Ports are independent, so a write on one port
/// is only visible to another once its handler has run.
async fn settled(what: &str, ready: impl Fn() -> bool) -> anyhow::Result<()> {
    timeout(REPLY_WAIT, async {
        while !ready() {
            tokio::time::sleep(POLL_EVERY).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

fn path_arg(args: &Value, index: usize) -> anyhow::Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("argument {index} should be a string but got {args}"))
}

pub fn storage_declarations(storage: &Storage) -> Declarations {
    let title = storage.title.clone();
    let set_title = Handler::sync(move |payload| {
        let text = match payload {
            Value::String(text) => text,
            other => bail!("title should be a string but got {other}"),
        };
        *title.lock().unwrap_or_else(PoisonError::into_inner) = Some(text);
        Ok(Value::Null)
    });

    let values = storage.values.clone();
    let storage_set = Handler::sync(move |args| {
        let path = path_arg(&args, 0)?;
        let value = path_arg(&args, 1)?;
        values.insert(path, value);
        Ok(Value::Null)
    });

    let values = storage.values.clone();
    let storage_get = Handler::new(move |args| {
        let values = values.clone();
        async move {
            tokio::task::yield_now().await;
            let path = path_arg(&args, 0)?;
            let found = values.get(&path).map(|v| v.clone());
            found.map(Value::String).ok_or_else(|| anyhow!("not found"))
        }
    });

    Declarations::new()
        .port("setTitle", set_title)
        .port("storageSet", Declaration::new(storage_set).callback(false))
        .port(
            "storageGet",
            Declaration::new(storage_get).callback(Callback::new().mode(CallbackMode::ResultOrError)),
        )
}

#[derive(Debug, Clone, Serialize)]
pub struct DemoReport {
    pub title: Option<String>,
    pub stored: Vec<(String, String)>,
    pub replies: Vec<Value>,
}

/// Attaches the storage declarations, plays a short UI session, and collects
/// what came back on the reply port.
pub async fn run_demo(attacher: &PortAttacher, options: AttachOptions) -> anyhow::Result<DemoReport> {
    let storage = Storage::default();
    let runtime = storage_runtime();
    let mut replies = runtime
        .take_receiver(REPLY_PORT)
        .with_context(|| format!("{REPLY_PORT} receiver already taken"))?;

    attacher.attach(&storage_declarations(&storage), Some(options), Some(&runtime))?;
    info!("storage demo attached");

    let hit = Uuid::new_v4().to_string();
    let miss = Uuid::new_v4().to_string();
    runtime.emit("setTitle", json!("Port demo"))?;
    runtime.emit("storageSet", json!(["greeting", "hello"]))?;
    settled("the title", || storage.title().is_some()).await?;
    settled("the greeting to be stored", || storage.values.contains_key("greeting")).await?;
    runtime.emit("storageGet", json!([hit, "greeting"]))?;
    runtime.emit("storageGet", json!([miss, "missing"]))?;
    runtime.emit("analytics", json!({ "event": "opened" }))?;

    let mut collected = Vec::with_capacity(2);
    for _ in 0..2 {
        let reply = timeout(REPLY_WAIT, replies.recv())
            .await
            .context("timed out waiting for a storage reply")?
            .context("reply port closed")?;
        collected.push(reply);
    }
    collected.sort_by_key(|reply| reply[0] != json!(hit));

    let mut stored: Vec<(String, String)> = storage
        .values
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    stored.sort();

    Ok(DemoReport {
        title: storage.title(),
        stored,
        replies: collected,
    })
}
