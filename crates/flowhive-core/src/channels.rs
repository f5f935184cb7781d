// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker connections of one node, one per role.
//!
//! | Role | Broker | Object |
//! |------|--------|--------|
//! | input | local | queue, or `exchange.queue` bound to a fanout exchange |
//! | outputs | local | one publisher per configured queue or exchange |
//! | commands | global | `<pipeline>.<service>` bound to the `commands` topic exchange |
//! | heartbeats | global | `heartbeats` queue |
//! | errors | global | `errors` queue |
//!
//! Every role reconnects on its own. A broken role is retried forever at a
//! fixed interval and never affects the others.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowhive_protocol::{
    COMMANDS_EXCHANGE, ERRORS_QUEUE, HEARTBEATS_QUEUE, Headers, ServiceIdentity,
    exchange_queue_name, routing_key_prefixes,
};

use crate::broker::{
    Broker, BrokerError, Consumer, ExchangeBinding, ExchangeKind, OutboundMessage, PublishTarget,
    Publisher, QueueBinding,
};
use crate::error::{Result, RuntimeError};

const DEFAULT_PREFETCH: u16 = 100;

/// Where a node reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub queue: String,
    /// Fanout exchange to subscribe through, if any.
    pub exchange: Option<String>,
    pub prefetch: u16,
    pub durable: bool,
}

impl InputSpec {
    /// Consume a plain queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            queue: name.into(),
            exchange: None,
            prefetch: DEFAULT_PREFETCH,
            durable: true,
        }
    }

    /// Subscribe to `exchange` through a queue named `exchange.queue`.
    pub fn exchange(exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: Some(exchange.into()),
            prefetch: DEFAULT_PREFETCH,
            durable: true,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Queue name actually declared on the broker.
    pub fn queue_name(&self) -> String {
        match &self.exchange {
            Some(exchange) => exchange_queue_name(exchange, &self.queue),
            None => self.queue.clone(),
        }
    }

    fn binding(&self) -> QueueBinding {
        let queue = self.queue_name();
        let exchange = self.exchange.as_ref().map(|exchange| ExchangeBinding {
            name: exchange.clone(),
            kind: ExchangeKind::Fanout,
            durable: self.durable,
            routing_keys: routing_key_prefixes(&queue),
        });
        QueueBinding {
            queue,
            durable: self.durable,
            prefetch: self.prefetch,
            exchange,
        }
    }
}

/// Kind of object an output publishes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Queue,
    /// Fanout exchange.
    Exchange,
}

/// One downstream destination.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub kind: OutputKind,
    /// Durable objects also get persistent messages.
    pub durable: bool,
    /// Static headers added to every message sent here.
    pub headers: Headers,
}

impl OutputSpec {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Queue,
            durable: true,
            headers: Headers::new(),
        }
    }

    pub fn exchange(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: OutputKind::Exchange,
            durable: true,
            headers: Headers::new(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn target(&self) -> PublishTarget {
        match self.kind {
            OutputKind::Queue => PublishTarget::queue(&self.name, self.durable),
            OutputKind::Exchange => {
                PublishTarget::exchange(&self.name, ExchangeKind::Fanout, self.durable)
            }
        }
    }
}

fn heartbeat_target() -> PublishTarget {
    PublishTarget::queue(HEARTBEATS_QUEUE, true)
}

fn error_target() -> PublishTarget {
    PublishTarget::queue(ERRORS_QUEUE, true)
}

/// Retries `connect` every `delay` until it succeeds.
pub(crate) async fn reconnect_forever<T, F, Fut>(role: &str, delay: Duration, mut connect: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, BrokerError>>,
{
    let mut attempt: u64 = 0;
    loop {
        tokio::time::sleep(delay).await;
        attempt += 1;
        match connect().await {
            Ok(connection) => {
                info!(role, attempt, "Reconnected");
                return connection;
            }
            Err(e) => warn!(
                role,
                attempt,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Unable to reconnect"
            ),
        }
    }
}

/// All broker connections of a node.
pub struct ChannelSet {
    identity: ServiceIdentity,
    local: Arc<dyn Broker>,
    global: Arc<dyn Broker>,
    input: Option<InputSpec>,
    outputs: Vec<OutputSpec>,
    reconnect_delay: Duration,
    output_publishers: Mutex<Vec<Box<dyn Publisher>>>,
    heartbeat: Mutex<Option<Box<dyn Publisher>>>,
    errors: Arc<Mutex<Option<Box<dyn Publisher>>>>,
    errors_reconnecting: Arc<AtomicBool>,
}

impl std::fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSet")
            .field("identity", &self.identity)
            .field("input", &self.input)
            .field("outputs", &self.outputs)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish_non_exhaustive()
    }
}

impl ChannelSet {
    pub fn new(
        identity: ServiceIdentity,
        local: Arc<dyn Broker>,
        global: Arc<dyn Broker>,
        input: Option<InputSpec>,
        outputs: Vec<OutputSpec>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            identity,
            local,
            global,
            input,
            outputs,
            reconnect_delay,
            output_publishers: Mutex::new(Vec::new()),
            heartbeat: Mutex::new(None),
            errors: Arc::new(Mutex::new(None)),
            errors_reconnecting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn input(&self) -> Option<&InputSpec> {
        self.input.as_ref()
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    fn command_binding(&self) -> QueueBinding {
        let queue = self.identity.command_routing_key();
        QueueBinding {
            exchange: Some(ExchangeBinding {
                name: COMMANDS_EXCHANGE.to_string(),
                kind: ExchangeKind::Topic,
                durable: false,
                routing_keys: routing_key_prefixes(&queue),
            }),
            queue,
            durable: false,
            prefetch: 0,
        }
    }

    pub async fn connect_input(&self) -> Result<Box<dyn Consumer>> {
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| RuntimeError::Setup("node has no input configured".to_string()))?;
        let consumer = self.local.open_consumer(&input.binding()).await?;
        info!(queue = %input.queue_name(), "Input channel connected");
        Ok(consumer)
    }

    async fn open_outputs(&self) -> std::result::Result<Vec<Box<dyn Publisher>>, BrokerError> {
        let mut publishers = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            publishers.push(self.local.open_publisher(&output.target()).await?);
        }
        Ok(publishers)
    }

    pub async fn connect_outputs(&self) -> std::result::Result<(), BrokerError> {
        let publishers = self.open_outputs().await?;
        *self.output_publishers.lock().await = publishers;
        debug!(outputs = self.outputs.len(), "Output channels connected");
        Ok(())
    }

    pub async fn connect_command(&self) -> std::result::Result<Box<dyn Consumer>, BrokerError> {
        let binding = self.command_binding();
        let consumer = self.global.open_consumer(&binding).await?;
        info!(queue = %binding.queue, "Command channel connected");
        Ok(consumer)
    }

    pub async fn connect_heartbeat(&self) -> std::result::Result<(), BrokerError> {
        let publisher = self.global.open_publisher(&heartbeat_target()).await?;
        *self.heartbeat.lock().await = Some(publisher);
        Ok(())
    }

    pub async fn connect_error(&self) -> std::result::Result<(), BrokerError> {
        let publisher = self.global.open_publisher(&error_target()).await?;
        *self.errors.lock().await = Some(publisher);
        Ok(())
    }

    /// Reopens the input consumer, giving up only when `cancel` fires.
    pub async fn reconnect_input(&self, cancel: &CancellationToken) -> Option<Box<dyn Consumer>> {
        let input = self.input.as_ref()?;
        let binding = input.binding();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            consumer = reconnect_forever("input", self.reconnect_delay, || {
                self.local.open_consumer(&binding)
            }) => Some(consumer),
        }
    }

    /// Reopens the command consumer, giving up only when `cancel` fires.
    pub async fn reconnect_command(
        &self,
        cancel: &CancellationToken,
    ) -> Option<Box<dyn Consumer>> {
        let binding = self.command_binding();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            consumer = reconnect_forever("commands", self.reconnect_delay, || {
                self.global.open_consumer(&binding)
            }) => Some(consumer),
        }
    }

    async fn try_publish_outputs(
        &self,
        messages: &[OutboundMessage],
    ) -> std::result::Result<(), BrokerError> {
        let publishers = self.output_publishers.lock().await;
        if publishers.len() != messages.len() {
            return Err(BrokerError::Disconnected(
                "output channels are not connected".to_string(),
            ));
        }
        for (publisher, message) in publishers.iter().zip(messages) {
            publisher.publish(message).await?;
        }
        Ok(())
    }

    /// Publishes `messages[i]` to output `i`, reconnecting until every
    /// output has accepted its message. Only non-transient errors return.
    pub async fn publish_outputs(
        &self,
        messages: &[OutboundMessage],
    ) -> std::result::Result<(), BrokerError> {
        if self.outputs.is_empty() {
            return Ok(());
        }
        loop {
            match self.try_publish_outputs(messages).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    warn!(
                        error = %e,
                        retry_in_ms = self.reconnect_delay.as_millis() as u64,
                        "Sending failed, reconnecting outputs"
                    );
                    let publishers = reconnect_forever("outputs", self.reconnect_delay, || {
                        self.open_outputs()
                    })
                    .await;
                    *self.output_publishers.lock().await = publishers;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Publishes one heartbeat. On failure the channel is reconnected and
    /// this beat is skipped.
    pub async fn publish_heartbeat(&self, message: &OutboundMessage) {
        let result = match self.heartbeat.lock().await.as_ref() {
            Some(publisher) => publisher.publish(message).await,
            None => Err(BrokerError::Disconnected(
                "heartbeat channel is not connected".to_string(),
            )),
        };
        if let Err(e) = result {
            warn!(error = %e, "Heartbeat not sent, reconnecting");
            let target = heartbeat_target();
            let publisher = reconnect_forever("heartbeats", self.reconnect_delay, || {
                self.global.open_publisher(&target)
            })
            .await;
            *self.heartbeat.lock().await = Some(publisher);
        }
    }

    /// Publishes one error report, best effort.
    ///
    /// When the channel is down the report is dropped and the channel is
    /// reconnected in the background, so the caller never waits on the broker.
    pub async fn publish_error(&self, message: &OutboundMessage) -> bool {
        let result = match self.errors.lock().await.as_ref() {
            Some(publisher) => publisher.publish(message).await,
            None => Err(BrokerError::Disconnected(
                "error channel is not connected".to_string(),
            )),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Error report dropped, reconnecting error channel");
                self.spawn_error_reconnect();
                false
            }
        }
    }

    fn spawn_error_reconnect(&self) {
        if self.errors_reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let broker = self.global.clone();
        let slot = self.errors.clone();
        let in_progress = self.errors_reconnecting.clone();
        let delay = self.reconnect_delay;
        tokio::spawn(async move {
            let target = error_target();
            let publisher =
                reconnect_forever("errors", delay, || broker.open_publisher(&target)).await;
            *slot.lock().await = Some(publisher);
            in_progress.store(false, Ordering::SeqCst);
        });
    }
}
