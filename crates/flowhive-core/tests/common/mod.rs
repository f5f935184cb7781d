// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flowhive-core integration tests.
//!
//! Every test gets its own in-memory broker and state directory.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use flowhive_core::broker::{InboundMessage, OutboundMessage};
use flowhive_core::protocol::{
    Command, ERRORS_QUEUE, ErrorMessage, HEARTBEATS_QUEUE, Headers, HeartbeatMessage,
    ServiceIdentity,
};
use flowhive_core::{
    ControlClient, MemoryBroker, RuntimeConfig, ServiceBuilder, ServiceContext, ServiceRuntime,
};

pub const PIPELINE: &str = "shop";
pub const INPUT_QUEUE: &str = "incoming";

/// Broker, state directory and identity of one node under test.
pub struct TestContext {
    pub broker: MemoryBroker,
    pub state_dir: TempDir,
    pub identity: ServiceIdentity,
    pub heartbeat_interval: Duration,
}

impl TestContext {
    pub fn new(service: &str) -> Self {
        Self {
            broker: MemoryBroker::new(),
            state_dir: tempfile::tempdir().expect("Failed to create state dir"),
            identity: ServiceIdentity::new(PIPELINE, service),
            heartbeat_interval: Duration::from_millis(50),
        }
    }

    /// For paused-clock tests, where frequent heartbeats only add noise.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn config(&self) -> RuntimeConfig {
        RuntimeConfig::new(self.identity.clone())
            .with_state_dir(self.state_dir.path())
            .with_reconnect_delay(Duration::from_millis(20))
            .with_heartbeat_interval(self.heartbeat_interval)
    }

    pub fn context(&self) -> ServiceContext {
        ServiceContext::with_broker(self.config(), Arc::new(self.broker.clone()))
    }

    pub fn builder(&self) -> ServiceBuilder {
        ServiceRuntime::builder(self.context())
    }

    pub fn control(&self) -> ControlClient {
        ControlClient::new(Arc::new(self.broker.clone()))
    }

    /// Sends `command` to this node through the commands exchange.
    pub async fn command(&self, command: Command) {
        let sent = self
            .control()
            .send_command(&self.identity.command_routing_key(), &command)
            .await
            .expect("Failed to encode command");
        assert!(sent, "command was not published");
    }

    /// Puts a message into `queue`, declaring it first so nothing is lost
    /// before the node subscribes.
    pub fn feed(&self, queue: &str, body: &str, headers: Headers) {
        self.broker.declare_queue(queue);
        let message = OutboundMessage::new(body.as_bytes().to_vec()).with_headers(headers);
        self.broker
            .publish("", queue, &message)
            .expect("Failed to publish test message");
    }

    pub async fn next_body(&self, queue: &str, timeout: Duration) -> Option<String> {
        self.broker
            .recv(queue, timeout)
            .await
            .map(|message| message.body_text())
    }

    pub async fn next_message(&self, queue: &str, timeout: Duration) -> Option<InboundMessage> {
        self.broker.recv(queue, timeout).await
    }

    pub fn errors(&self) -> Vec<ErrorMessage> {
        self.broker
            .drain(ERRORS_QUEUE)
            .iter()
            .map(|m| ErrorMessage::from_slice(&m.body).expect("Malformed error report"))
            .collect()
    }

    pub async fn next_error(&self, timeout: Duration) -> Option<ErrorMessage> {
        self.broker
            .recv(ERRORS_QUEUE, timeout)
            .await
            .map(|m| ErrorMessage::from_slice(&m.body).expect("Malformed error report"))
    }

    /// Waits for a heartbeat matching `accept`, skipping older ones.
    pub async fn heartbeat_where(
        &self,
        timeout: Duration,
        accept: impl Fn(&HeartbeatMessage) -> bool,
    ) -> Option<HeartbeatMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return None;
            }
            let message = self.broker.recv(HEARTBEATS_QUEUE, left).await?;
            let heartbeat =
                HeartbeatMessage::from_slice(&message.body).expect("Malformed heartbeat");
            if accept(&heartbeat) {
                return Some(heartbeat);
            }
        }
    }
}

/// Polls `check` every 10 ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn tag(value: &str) -> Headers {
    let mut headers = Headers::new();
    headers.insert("tag".to_string(), serde_json::Value::String(value.to_string()));
    headers
}
