// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for sink nodes and retry generations against an unreliable store.
//!
//! Retry delays are hours long, so these tests run on a paused clock.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use common::*;
use flowhive_core::protocol::{Command, Headers};
use flowhive_core::{DurableStore, InputSpec, RetryEngine, SinkNode};

const WAIT: Duration = Duration::from_secs(5);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Default)]
struct FlakyStore {
    down: AtomicBool,
    attempts: AtomicUsize,
    saved: Mutex<Vec<Value>>,
    tagged: Mutex<Vec<String>>,
}

impl FlakyStore {
    fn down() -> Arc<Self> {
        let store = Self::default();
        store.down.store(true, Ordering::SeqCst);
        Arc::new(store)
    }

    fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn saved(&self) -> Vec<Value> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    fn object_id(&self, data: &Value) -> anyhow::Result<String> {
        data.get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("item has no id"))
    }

    async fn save(&self, data: &Value) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("connection to database refused");
        }
        self.saved.lock().unwrap().push(data.clone());
        Ok(())
    }

    async fn handle_tagged(&self, message: &str, _headers: &Headers) -> anyhow::Result<()> {
        self.tagged.lock().unwrap().push(message.to_string());
        Ok(())
    }
}

fn retry_armed(sink: &SinkNode<FlakyStore>) -> bool {
    sink.engine().snapshot()[0].timer_armed
}

fn paused_context() -> TestContext {
    TestContext::new("saver").with_heartbeat_interval(DAY)
}

#[tokio::test(start_paused = true)]
async fn test_item_promoted_after_ten_failed_sweeps() {
    let ctx = paused_context();
    let store = FlakyStore::down();
    let (node, sink) = SinkNode::node(
        ctx.builder().input(InputSpec::queue(INPUT_QUEUE)),
        store.clone(),
        RetryEngine::default_generations(),
    )
    .unwrap();
    let run = tokio::spawn(node.run());

    ctx.feed(INPUT_QUEUE, r#"{"id":"X"}"#, Headers::new());
    assert!(eventually(WAIT, || async { retry_armed(&sink) }).await);
    assert_eq!(sink.engine().locate("X"), Some((0, 0)));
    assert_eq!(store.attempts(), 1);

    tokio::time::sleep(Duration::from_secs(10 * 30 * 60 + 1)).await;

    assert_eq!(sink.engine().locate("X"), Some((1, 0)));
    assert_eq!(store.attempts(), 11);
    let reports: Vec<_> = ctx
        .errors()
        .into_iter()
        .filter(|report| report.text.contains("X"))
        .collect();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].text.contains("10 times"));
    assert_eq!(reports[0].cause, r#"{"id":"X"}"#);

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
    assert!(sink.engine().is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_pending_item_is_updated_and_saved_on_recovery() {
    let ctx = paused_context();
    let store = FlakyStore::down();
    let (node, sink) = SinkNode::node(
        ctx.builder().input(InputSpec::queue(INPUT_QUEUE)),
        store.clone(),
        RetryEngine::default_generations(),
    )
    .unwrap();
    let run = tokio::spawn(node.run());

    ctx.feed(INPUT_QUEUE, r#"{"id":"X","v":1}"#, Headers::new());
    assert!(eventually(WAIT, || async { retry_armed(&sink) }).await);

    ctx.feed(INPUT_QUEUE, r#"{"id":"X","v":2}"#, Headers::new());
    assert!(
        eventually(WAIT, || async {
            sink.engine().snapshot()[0]
                .objects
                .first()
                .is_some_and(|object| object.data["v"] == 2)
        })
        .await
    );
    assert_eq!(store.attempts(), 1);

    store.recover();
    tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;

    assert_eq!(sink.engine().tracked(), 0);
    assert_eq!(store.saved(), vec![json!({"id": "X", "v": 2})]);
    assert!(ctx.errors().is_empty());

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_healthy_store_saves_immediately() {
    let ctx = paused_context();
    let store = Arc::new(FlakyStore::default());
    let (node, sink) = SinkNode::node(
        ctx.builder()
            .input(InputSpec::queue(INPUT_QUEUE))
            .subscription_tag("audit"),
        store.clone(),
        RetryEngine::default_generations(),
    )
    .unwrap();
    let run = tokio::spawn(node.run());

    ctx.feed(INPUT_QUEUE, r#"{"id":"A"}"#, Headers::new());
    ctx.feed(INPUT_QUEUE, "audit entry", tag("audit"));
    assert!(eventually(WAIT, || async { store.tagged.lock().unwrap().len() == 1 }).await);

    assert_eq!(store.saved(), vec![json!({"id": "A"})]);
    assert_eq!(sink.engine().tracked(), 0);
    assert!(ctx.errors().is_empty());

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_items_are_reported() {
    let ctx = paused_context();
    let store = Arc::new(FlakyStore::default());
    let (node, sink) = SinkNode::node(
        ctx.builder().input(InputSpec::queue(INPUT_QUEUE)),
        store.clone(),
        RetryEngine::default_generations(),
    )
    .unwrap();
    let run = tokio::spawn(node.run());

    ctx.feed(INPUT_QUEUE, "not json", Headers::new());
    let error = ctx.next_error(WAIT).await.unwrap();
    assert!(error.text.contains("not valid JSON"));
    assert_eq!(error.cause, "not json");

    ctx.feed(INPUT_QUEUE, r#"{"name":"anonymous"}"#, Headers::new());
    let error = ctx.next_error(WAIT).await.unwrap();
    assert!(error.text.contains("item has no id"));

    assert_eq!(store.attempts(), 0);
    assert_eq!(sink.engine().tracked(), 0);

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
}
