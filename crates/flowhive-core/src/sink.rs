// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terminal nodes persisting items into an unreliable store.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use flowhive_protocol::{Command, Headers};

use crate::error::Result;
use crate::handler::{CommandHandler, MessageHandler};
use crate::node::NodeRuntime;
use crate::retry::{GenerationConfig, RetryEngine};
use crate::service::{HandlerContext, ServiceBuilder, ServiceRuntime, TAG_HEADER};

/// Downstream store a [`SinkNode`] writes to.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Identifier the item is tracked under while its save is retried.
    fn object_id(&self, data: &Value) -> anyhow::Result<String>;

    async fn save(&self, data: &Value) -> anyhow::Result<()>;

    /// Called instead of [`save`](Self::save) for tagged messages this node
    /// subscribed to.
    async fn handle_tagged(&self, _message: &str, _headers: &Headers) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Saves every inbound JSON item; failed saves go to the [`RetryEngine`].
///
/// An item that is already waiting for a retry is not saved again right
/// away: its pending payload is replaced and the next sweep saves the newest
/// version.
pub struct SinkNode<S> {
    store: Arc<S>,
    engine: RetryEngine,
}

impl<S> std::fmt::Debug for SinkNode<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkNode")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl<S: DurableStore + 'static> SinkNode<S> {
    /// Creates the sink for `service` and registers it for commands.
    pub fn attach(
        service: &Arc<ServiceRuntime>,
        store: Arc<S>,
        generations: Vec<GenerationConfig>,
    ) -> Result<Arc<Self>> {
        let engine = RetryEngine::new(
            generations,
            store.clone() as Arc<dyn DurableStore>,
            service.reporter().clone(),
        )?;
        let sink = Arc::new(Self { store, engine });
        service.register_command_handler(sink.clone());
        Ok(sink)
    }

    /// A processing node driven by a new sink.
    pub fn node(
        builder: ServiceBuilder,
        store: Arc<S>,
        generations: Vec<GenerationConfig>,
    ) -> Result<(NodeRuntime, Arc<Self>)> {
        NodeRuntime::with_handler(builder, |service| Self::attach(service, store, generations))
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn engine(&self) -> &RetryEngine {
        &self.engine
    }
}

#[async_trait]
impl<S: DurableStore + 'static> MessageHandler for SinkNode<S> {
    async fn handle(
        &self,
        _ctx: &mut HandlerContext<'_, '_>,
        message: &str,
        headers: &Headers,
    ) -> anyhow::Result<()> {
        if headers.contains_key(TAG_HEADER) {
            debug!(headers = ?headers, "Handling tagged message");
            return self.store.handle_tagged(message, headers).await;
        }

        let data: Value = serde_json::from_str(message).context("message is not valid JSON")?;
        let id = self.store.object_id(&data)?;
        info!(data_id = %id, "Data received");

        if self.engine.update(&id, data.clone()) {
            info!(data_id = %id, "Data is waiting for a retry, pending payload replaced");
            return Ok(());
        }

        if self.engine.save(&id, &data).await.is_ok() {
            self.engine.mark_processed(&id);
        } else {
            self.engine.check_errors();
        }
        Ok(())
    }
}

#[async_trait]
impl<S: DurableStore + 'static> CommandHandler for SinkNode<S> {
    async fn handle_command(
        &self,
        _ctx: &mut HandlerContext<'_, '_>,
        command: &Command,
    ) -> anyhow::Result<()> {
        if command.is("shutdown") {
            self.engine.stop();
        }
        Ok(())
    }
}
