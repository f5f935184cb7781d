// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for processing nodes: dispatch, crash replay, tag bypass, failures
//! and reconnects, driven through the in-memory broker.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use common::*;
use flowhive_core::protocol::{Command, Headers};
use flowhive_core::state::{CURRENT_MESSAGE_KEY, StateStore};
use flowhive_core::{
    HandlerContext, InputSpec, MessageHandler, NodeRuntime, OutputSpec, ServiceStatus,
};

const WAIT: Duration = Duration::from_secs(2);

/// Records every message and forwards it upper-cased.
#[derive(Default)]
struct Upper {
    seen: Mutex<Vec<String>>,
}

impl Upper {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Upper {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, '_>,
        message: &str,
        headers: &Headers,
    ) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(message.to_string());
        match message {
            "bad" => anyhow::bail!("cannot handle {message}"),
            "boom" => panic!("handler exploded"),
            _ => {}
        }
        ctx.send(&message.to_uppercase(), headers).await?;
        Ok(())
    }
}

fn spawn_node(node: NodeRuntime) -> tokio::task::JoinHandle<flowhive_core::Result<()>> {
    tokio::spawn(node.run())
}

#[tokio::test]
async fn test_message_is_processed_and_marker_cleared() {
    let ctx = TestContext::new("upper");
    let handler = Arc::new(Upper::default());
    let node = NodeRuntime::new(
        ctx.builder()
            .input(InputSpec::queue(INPUT_QUEUE))
            .output(OutputSpec::queue("out")),
        handler.clone(),
    )
    .unwrap();
    let service = node.service().clone();
    let run = spawn_node(node);

    ctx.feed(INPUT_QUEUE, "hello", Headers::new());
    assert_eq!(ctx.next_body("out", WAIT).await.as_deref(), Some("HELLO"));

    let marker = service.state().get(CURRENT_MESSAGE_KEY).await;
    assert!(marker.is_none_or(|value| value.is_null()));
    assert!(service.activity().last_received.is_some());
    assert!(service.activity().last_sent.is_some());

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
    assert_eq!(service.status(), ServiceStatus::Terminated);
    assert_eq!(handler.seen(), vec!["hello"]);
}

#[tokio::test]
async fn test_unfinished_message_replayed_once() {
    let ctx = TestContext::new("upper");
    {
        let previous_run = StateStore::new(ctx.state_dir.path(), 1);
        previous_run.set(CURRENT_MESSAGE_KEY, "pending").await;
        previous_run.dump(None, true).await.unwrap();
    }

    let handler = Arc::new(Upper::default());
    let node = NodeRuntime::new(
        ctx.builder()
            .input(InputSpec::queue(INPUT_QUEUE))
            .output(OutputSpec::queue("out")),
        handler.clone(),
    )
    .unwrap();
    let run = spawn_node(node);

    assert_eq!(ctx.next_body("out", WAIT).await.as_deref(), Some("PENDING"));
    ctx.feed(INPUT_QUEUE, "next", Headers::new());
    assert_eq!(ctx.next_body("out", WAIT).await.as_deref(), Some("NEXT"));

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
    assert_eq!(handler.seen(), vec!["pending", "next"]);

    // The marker was cleared on disk too: a second run replays nothing.
    let restarted = StateStore::new(ctx.state_dir.path(), 1);
    restarted.load().await.unwrap();
    let marker = restarted.get(CURRENT_MESSAGE_KEY).await;
    assert!(marker.is_none_or(|value| value.is_null()));
}

#[tokio::test]
async fn test_foreign_tag_bypasses_handler_to_every_output() {
    let ctx = TestContext::new("upper");
    let handler = Arc::new(Upper::default());
    let node = NodeRuntime::new(
        ctx.builder()
            .input(InputSpec::queue(INPUT_QUEUE))
            .output(OutputSpec::queue("first"))
            .output(OutputSpec::queue("second"))
            .subscription_tag("mine"),
        handler.clone(),
    )
    .unwrap();
    let run = spawn_node(node);

    ctx.feed(INPUT_QUEUE, "untouched", tag("other"));
    for queue in ["first", "second"] {
        let message = ctx.next_message(queue, WAIT).await.unwrap();
        assert_eq!(message.body_text(), "untouched");
        assert_eq!(message.headers.get("tag"), Some(&serde_json::json!("other")));
    }
    assert!(handler.seen().is_empty());

    for value in [serde_json::Value::Null, serde_json::json!(7)] {
        let mut headers = Headers::new();
        headers.insert("tag".to_string(), value.clone());
        ctx.feed(INPUT_QUEUE, "odd tag", headers);
        for queue in ["first", "second"] {
            let message = ctx.next_message(queue, WAIT).await.unwrap();
            assert_eq!(message.body_text(), "odd tag");
            assert_eq!(message.headers.get("tag"), Some(&value));
        }
    }
    assert!(handler.seen().is_empty());

    ctx.feed(INPUT_QUEUE, "handled", tag("mine"));
    assert_eq!(ctx.next_body("first", WAIT).await.as_deref(), Some("HANDLED"));
    assert_eq!(handler.seen(), vec!["handled"]);

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_output_headers_merge_with_message_headers() {
    let ctx = TestContext::new("upper");
    let node = NodeRuntime::new(
        ctx.builder()
            .input(InputSpec::queue(INPUT_QUEUE))
            .output(
                OutputSpec::queue("out")
                    .with_header("source", "upper")
                    .with_header("tag", "static"),
            ),
        Arc::new(Upper::default()),
    )
    .unwrap();
    let run = spawn_node(node);

    let mut headers = Headers::new();
    headers.insert("tag".to_string(), serde_json::json!("dynamic"));
    ctx.feed(INPUT_QUEUE, "x", Headers::new());
    let plain = ctx.next_message("out", WAIT).await.unwrap();
    assert_eq!(plain.headers.get("source"), Some(&serde_json::json!("upper")));
    assert_eq!(plain.headers.get("tag"), Some(&serde_json::json!("static")));

    // A node without subscription tags forwards tagged input untouched; the
    // per-message value wins and the conflict is reported as a warning.
    ctx.feed(INPUT_QUEUE, "y", headers);
    let tagged = ctx.next_message("out", WAIT).await.unwrap();
    assert_eq!(tagged.body_text(), "y");
    assert_eq!(tagged.headers.get("tag"), Some(&serde_json::json!("dynamic")));
    let warning = ctx.next_error(WAIT).await.unwrap();
    assert!(warning.text.contains("Header tag"));

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_handler_failures_are_reported_and_survived() {
    let ctx = TestContext::new("upper");
    let handler = Arc::new(Upper::default());
    let node = NodeRuntime::new(
        ctx.builder()
            .input(InputSpec::queue(INPUT_QUEUE))
            .output(OutputSpec::queue("out")),
        handler.clone(),
    )
    .unwrap();
    let run = spawn_node(node);

    ctx.feed(INPUT_QUEUE, "bad", Headers::new());
    let error = ctx.next_error(WAIT).await.unwrap();
    assert!(error.text.contains("cannot handle bad"));
    assert_eq!(error.cause, "bad");
    assert_eq!(error.service, "upper");

    ctx.feed(INPUT_QUEUE, "boom", Headers::new());
    let panic = ctx.next_error(WAIT).await.unwrap();
    assert!(panic.text.contains("handler exploded"));
    assert_eq!(panic.cause, "boom");

    ctx.feed(INPUT_QUEUE, "fine", Headers::new());
    assert_eq!(ctx.next_body("out", WAIT).await.as_deref(), Some("FINE"));

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
    assert_eq!(handler.seen(), vec!["bad", "boom", "fine"]);
}

#[tokio::test]
async fn test_node_without_input_is_rejected() {
    let ctx = TestContext::new("upper");
    let result = NodeRuntime::new(ctx.builder(), Arc::new(Upper::default()));
    assert!(matches!(result, Err(flowhive_core::RuntimeError::Setup(_))));
}

#[tokio::test]
async fn test_input_survives_broker_outage() {
    let ctx = TestContext::new("upper");
    let handler = Arc::new(Upper::default());
    let node = NodeRuntime::new(
        ctx.builder()
            .input(InputSpec::queue(INPUT_QUEUE))
            .output(OutputSpec::queue("out")),
        handler.clone(),
    )
    .unwrap();
    let service = node.service().clone();
    let run = spawn_node(node);

    ctx.feed(INPUT_QUEUE, "before", Headers::new());
    assert_eq!(ctx.next_body("out", WAIT).await.as_deref(), Some("BEFORE"));

    ctx.broker.disconnect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(service.status(), flowhive_core::ServiceStatus::Running);
    ctx.broker.restore();

    ctx.feed(INPUT_QUEUE, "after", Headers::new());
    assert_eq!(ctx.next_body("out", WAIT).await.as_deref(), Some("AFTER"));

    ctx.command(Command::shutdown()).await;
    run.await.unwrap().unwrap();
}
