// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processing node: consume, handle, forward.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{Result, RuntimeError};
use crate::handler::MessageHandler;
use crate::service::{ServiceBuilder, ServiceRuntime, SuspendPolicy};

/// Runs a [`MessageHandler`] over the node's input queue.
///
/// On start the in-flight message of a previous run (if any) is replayed
/// before new input is consumed. Suspending stops consumption and persists
/// the state; resuming reloads it.
pub struct NodeRuntime {
    service: Arc<ServiceRuntime>,
    handler: Arc<dyn MessageHandler>,
}

impl NodeRuntime {
    pub fn new(builder: ServiceBuilder, handler: Arc<dyn MessageHandler>) -> Result<Self> {
        let service = Self::build_service(builder)?;
        Ok(Self { service, handler })
    }

    /// Builds the service first and lets `make` create the handler from it,
    /// for handlers that need the runtime (reporter, command registration).
    pub fn with_handler<H, F>(builder: ServiceBuilder, make: F) -> Result<(Self, Arc<H>)>
    where
        H: MessageHandler + 'static,
        F: FnOnce(&Arc<ServiceRuntime>) -> Result<Arc<H>>,
    {
        let service = Self::build_service(builder)?;
        let handler = make(&service)?;
        let node = Self {
            service,
            handler: handler.clone(),
        };
        Ok((node, handler))
    }

    fn build_service(builder: ServiceBuilder) -> Result<Arc<ServiceRuntime>> {
        if !builder.has_input() {
            return Err(RuntimeError::Setup(
                "a processing node needs an input".to_string(),
            ));
        }
        Ok(builder
            .suspend_policy(SuspendPolicy {
                persist_on_suspend: true,
                reload_on_resume: true,
            })
            .build())
    }

    pub fn service(&self) -> &Arc<ServiceRuntime> {
        &self.service
    }

    /// Runs until a `shutdown` command arrives.
    pub async fn run(self) -> Result<()> {
        self.service.start().await?;
        let mut consumer = self.service.channels().connect_input().await?;

        self.service.replay_unfinished(self.handler.as_ref()).await;

        info!("Consuming input");
        loop {
            if !self.service.wait_until_running().await {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = self.service.wait_until_not_running() => continue,
                next = consumer.next() => next,
            };

            let failure = match next {
                Ok(Some(delivery)) => {
                    self.service
                        .dispatch(delivery, self.handler.as_ref())
                        .await;
                    continue;
                }
                Ok(None) => "input consumer cancelled by the broker".to_string(),
                Err(e) => e.to_string(),
            };

            warn!(error = %failure, "Input channel failed, reconnecting");
            self.service
                .reporter()
                .report(format!("Input channel failed: {failure}"), None)
                .await;
            match self
                .service
                .channels()
                .reconnect_input(self.service.shutdown_token())
                .await
            {
                Some(fresh) => consumer = fresh,
                None => break,
            }
        }

        info!(service = %self.service.identity(), "Service terminated");
        self.service.join_background().await;
        Ok(())
    }
}
