//! Helpers for tests that drive a [`MemoryRuntime`](crate::MemoryRuntime).

use std::time::Duration;

use serde_json::Value;
use tokio::{sync::mpsc::UnboundedReceiver, time::timeout};

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Waits for the next value pushed into an inbound port.
///
/// Panics when nothing arrives within [`REPLY_TIMEOUT`].
pub async fn next_reply(rx: &mut UnboundedReceiver<Value>) -> Value {
    match timeout(REPLY_TIMEOUT, rx.recv()).await {
        Ok(Some(value)) => value,
        Ok(None) => panic!("inbound port closed before a reply arrived"),
        Err(_) => panic!("no reply within {:?}", REPLY_TIMEOUT),
    }
}

/// Asserts that nothing is pushed into the port for `quiet_ms`.
pub async fn assert_no_reply(rx: &mut UnboundedReceiver<Value>, quiet_ms: u64) {
    if let Ok(Some(value)) = timeout(Duration::from_millis(quiet_ms), rx.recv()).await {
        panic!("expected no reply but got {value}");
    }
}

/// Collects everything already queued without waiting.
pub fn drain(rx: &mut UnboundedReceiver<Value>) -> Vec<Value> {
    let mut out = vec![];
    while let Ok(value) = rx.try_recv() {
        out.push(value);
    }
    out
}
