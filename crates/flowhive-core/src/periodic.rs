// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Source node emitting a message on an interval or on command.
//!
//! The payload and the interval live in the state under [`MESSAGE_KEY`] and
//! [`DELAY_KEY`] (seconds), so they survive restarts. Commands:
//!
//! | Command | Args | Effect |
//! |---------|------|--------|
//! | `set_delay` | seconds | new interval; non-zero wakes the current wait |
//! | `set_message` | text | new payload |
//! | `trigger` | optional text | emit now (the text replaces the payload once) |
//!
//! A non-positive delay waits until the next `trigger` or `set_delay`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, futures::Notified};
use tracing::{debug, error, info, warn};

use flowhive_protocol::{Command, Headers};

use crate::error::Result;
use crate::handler::{CommandHandler, Emitter};
use crate::service::{HandlerContext, ServiceBuilder, ServiceRuntime, ServiceStatus};

pub const MESSAGE_KEY: &str = "message";
pub const DELAY_KEY: &str = "delay";

/// Defaults for a periodic node; persisted values take precedence.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicConfig {
    /// Seconds between emissions.
    pub delay: f64,
    pub message: String,
    /// Emit right away instead of waiting one interval first.
    pub initiate_on_start: bool,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            delay: 60.0,
            message: String::new(),
            initiate_on_start: true,
        }
    }
}

/// [`Emitter`] that logs a fixed line after every emission.
#[derive(Debug, Clone, Default)]
pub struct LogEmitter {
    line: String,
}

impl LogEmitter {
    pub fn new(line: impl Into<String>) -> Self {
        Self { line: line.into() }
    }
}

#[async_trait]
impl Emitter for LogEmitter {
    async fn after_send(
        &self,
        _ctx: &mut HandlerContext<'_, '_>,
        _message: &str,
    ) -> anyhow::Result<()> {
        if !self.line.is_empty() {
            info!("{}", self.line);
        }
        Ok(())
    }
}

async fn emit(
    ctx: &mut HandlerContext<'_, '_>,
    emitter: &dyn Emitter,
    payload: Option<&str>,
) -> anyhow::Result<()> {
    let message = match payload {
        Some(payload) => payload.to_string(),
        None => ctx.state().get_str(MESSAGE_KEY).unwrap_or_default().to_string(),
    };
    emitter.before_send(ctx).await?;
    ctx.send(&message, &Headers::new()).await?;
    emitter.after_send(ctx, &message).await?;
    debug!(bytes = message.len(), "Message emitted");
    Ok(())
}

struct PeriodicCommands {
    wake: Arc<Notify>,
    emitter: Arc<dyn Emitter>,
}

#[async_trait]
impl CommandHandler for PeriodicCommands {
    async fn handle_command(
        &self,
        ctx: &mut HandlerContext<'_, '_>,
        command: &Command,
    ) -> anyhow::Result<()> {
        match command.command.as_str() {
            "set_delay" => match command.arg(0).map(str::parse::<f64>) {
                Some(Ok(delay)) if delay.is_finite() => {
                    ctx.state().set(DELAY_KEY, delay);
                    info!(delay_secs = delay, "Delay updated");
                    // Only a wait already in progress is woken.
                    if delay != 0.0 {
                        self.wake.notify_waiters();
                    }
                }
                _ => warn!(args = ?command.args, "set_delay expects a number of seconds"),
            },
            "set_message" => match command.arg(0) {
                Some(message) => {
                    ctx.state().set(MESSAGE_KEY, message);
                    info!("Message updated");
                }
                None => warn!("set_message expects the new message"),
            },
            "trigger" => emit(ctx, self.emitter.as_ref(), command.arg(0)).await?,
            _ => {}
        }
        ctx.state().dump(None, true).await?;
        Ok(())
    }
}

/// Emits on an interval through an [`Emitter`].
pub struct PeriodicRuntime {
    service: Arc<ServiceRuntime>,
    emitter: Arc<dyn Emitter>,
    wake: Arc<Notify>,
    config: PeriodicConfig,
}

impl PeriodicRuntime {
    pub fn new(builder: ServiceBuilder, config: PeriodicConfig, emitter: Arc<dyn Emitter>) -> Self {
        let wake = Arc::new(Notify::new());
        let commands = Arc::new(PeriodicCommands {
            wake: wake.clone(),
            emitter: emitter.clone(),
        });
        let service = builder
            .initial_state(MESSAGE_KEY, config.message.clone())
            .initial_state(DELAY_KEY, config.delay)
            .command_handler(commands)
            .build();
        Self {
            service,
            emitter,
            wake,
            config,
        }
    }

    pub fn service(&self) -> &Arc<ServiceRuntime> {
        &self.service
    }

    /// Runs until a `shutdown` command arrives.
    pub async fn run(self) -> Result<()> {
        self.service.start().await?;

        let mut should_emit = self.config.initiate_on_start;
        loop {
            if !self.service.wait_until_running().await {
                break;
            }

            let (delay, woken) = {
                let mut state = self.service.state().write().await;
                if self.service.status() != ServiceStatus::Running {
                    continue;
                }
                if should_emit {
                    let mut ctx = HandlerContext::new(&self.service, &mut state);
                    if let Err(err) = emit(&mut ctx, self.emitter.as_ref(), None).await {
                        self.service
                            .reporter()
                            .report(format!("{err:#}"), None)
                            .await;
                    }
                    if let Err(e) = state.dump(None, true).await {
                        error!(error = %e, "Failed to persist state after emission");
                    }
                } else {
                    should_emit = true;
                }
                // Registered under the lock so a command right after it wakes this wait.
                let woken = self.wake.notified();
                (state.get_f64(DELAY_KEY).unwrap_or(self.config.delay), woken)
            };

            self.wait(delay, woken).await;
        }

        info!(service = %self.service.identity(), "Service terminated");
        self.service.join_background().await;
        Ok(())
    }

    async fn wait(&self, delay: f64, woken: Notified<'_>) {
        let stopped = self.service.wait_until_not_running();
        let interval = (delay > 0.0)
            .then(|| Duration::try_from_secs_f64(delay).ok())
            .flatten();

        match interval {
            Some(interval) => tokio::select! {
                _ = woken => debug!("Wait interrupted"),
                _ = stopped => {}
                _ = tokio::time::sleep(interval) => {}
            },
            None => tokio::select! {
                _ = woken => debug!("Wait interrupted"),
                _ = stopped => {}
            },
        }
    }
}
