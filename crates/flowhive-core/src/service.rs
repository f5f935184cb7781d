// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared lifecycle of every node.
//!
//! A [`ServiceRuntime`] owns the node's [`ChannelSet`] and [`StateStore`]
//! and runs two background tasks: the command listener and the heartbeat
//! loop. Specializations ([`NodeRuntime`](crate::node::NodeRuntime),
//! [`PeriodicRuntime`](crate::periodic::PeriodicRuntime)) drive the main
//! loop on top of it.
//!
//! # Lifecycle
//!
//! ```text
//!   Suspended ──start()──► Running ◄──resume──┐
//!                             │               │
//!                             └──suspend──► Suspended
//!   any ──shutdown──► Terminated
//! ```
//!
//! Commands and message handling both hold the state write lock for their
//! whole duration, so a command never observes a half-processed message.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowhive_protocol::{
    Command, Headers, HeartbeatMessage, HeartbeatState, ServiceIdentity, format_timestamp,
    unix_timestamp,
};

use crate::broker::{Consumer, Delivery, OutboundMessage};
use crate::channels::{ChannelSet, InputSpec, OutputSpec};
use crate::context::ServiceContext;
use crate::error::Result;
use crate::handler::{CommandHandler, MessageHandler};
use crate::reporter::ErrorReporter;
use crate::state::{
    CURRENT_HEADERS_KEY, CURRENT_MESSAGE_KEY, LAST_RECEIVED_KEY, LAST_SENT_KEY, StateStore,
    StateValue, StateWriteGuard,
};

/// Header naming the consumer a message is meant for.
pub const TAG_HEADER: &str = "tag";

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Suspended,
    Running,
    Terminated,
}

impl ServiceStatus {
    pub fn heartbeat_state(self) -> HeartbeatState {
        match self {
            ServiceStatus::Running => HeartbeatState::Ok,
            ServiceStatus::Suspended | ServiceStatus::Terminated => HeartbeatState::Suspended,
        }
    }
}

/// What happens to the state on `suspend` and `resume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendPolicy {
    /// Dump the full state when suspending.
    pub persist_on_suspend: bool,
    /// Reload the state from disk when resuming.
    pub reload_on_resume: bool,
}

/// Timestamps reported in heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activity {
    pub last_received: Option<String>,
    pub last_sent: Option<String>,
}

/// Builder for [`ServiceRuntime`].
pub struct ServiceBuilder {
    context: ServiceContext,
    input: Option<InputSpec>,
    outputs: Vec<OutputSpec>,
    subscription_tags: Vec<String>,
    dump_interval: u32,
    initial_state: Vec<(String, StateValue)>,
    command_handlers: Vec<Arc<dyn CommandHandler>>,
    suspend_policy: SuspendPolicy,
}

impl std::fmt::Debug for ServiceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBuilder")
            .field("identity", self.context.identity())
            .field("input", &self.input)
            .field("outputs", &self.outputs)
            .field("subscription_tags", &self.subscription_tags)
            .field("dump_interval", &self.dump_interval)
            .field("command_handlers", &self.command_handlers.len())
            .field("suspend_policy", &self.suspend_policy)
            .finish()
    }
}

impl ServiceBuilder {
    pub fn new(context: ServiceContext) -> Self {
        Self {
            context,
            input: None,
            outputs: Vec::new(),
            subscription_tags: Vec::new(),
            dump_interval: 1,
            initial_state: Vec::new(),
            command_handlers: Vec::new(),
            suspend_policy: SuspendPolicy::default(),
        }
    }

    pub fn input(mut self, input: InputSpec) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: OutputSpec) -> Self {
        self.outputs.push(output);
        self
    }

    /// Tags this node handles itself; messages tagged otherwise are forwarded.
    pub fn subscription_tag(mut self, tag: impl Into<String>) -> Self {
        self.subscription_tags.push(tag.into());
        self
    }

    /// Number of throttled dumps per real write.
    pub fn dump_interval(mut self, interval: u32) -> Self {
        self.dump_interval = interval;
        self
    }

    /// Value used when nothing is persisted under `key` yet.
    pub fn initial_state(mut self, key: impl Into<String>, value: impl Into<StateValue>) -> Self {
        self.initial_state.push((key.into(), value.into()));
        self
    }

    pub fn command_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.command_handlers.push(handler);
        self
    }

    pub fn suspend_policy(mut self, policy: SuspendPolicy) -> Self {
        self.suspend_policy = policy;
        self
    }

    pub(crate) fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn build(self) -> Arc<ServiceRuntime> {
        let config = self.context.config;
        let identity = config.identity.clone();
        let channels = Arc::new(ChannelSet::new(
            identity.clone(),
            self.context.local,
            self.context.global,
            self.input,
            self.outputs,
            config.reconnect_delay,
        ));
        let reporter = ErrorReporter::new(identity.clone(), channels.clone());
        let (status, _) = watch::channel(ServiceStatus::Suspended);

        Arc::new(ServiceRuntime {
            identity,
            state: StateStore::new(config.state_dir, self.dump_interval),
            channels,
            reporter,
            status,
            activity: RwLock::new(Activity::default()),
            subscription_tags: self.subscription_tags,
            initial_state: self.initial_state,
            command_handlers: RwLock::new(self.command_handlers),
            suspend_policy: self.suspend_policy,
            heartbeat_interval: config.heartbeat_interval,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Lifecycle, command dispatch, heartbeats and outbound sends of one node.
pub struct ServiceRuntime {
    identity: ServiceIdentity,
    channels: Arc<ChannelSet>,
    state: StateStore,
    reporter: ErrorReporter,
    status: watch::Sender<ServiceStatus>,
    activity: RwLock<Activity>,
    subscription_tags: Vec<String>,
    initial_state: Vec<(String, StateValue)>,
    command_handlers: RwLock<Vec<Arc<dyn CommandHandler>>>,
    suspend_policy: SuspendPolicy,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ServiceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRuntime")
            .field("identity", &self.identity)
            .field("status", &self.status())
            .field("channels", &self.channels)
            .field("subscription_tags", &self.subscription_tags)
            .finish_non_exhaustive()
    }
}

impl ServiceRuntime {
    pub fn builder(context: ServiceContext) -> ServiceBuilder {
        ServiceBuilder::new(context)
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.borrow()
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Cancelled once the node terminates.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn activity(&self) -> Activity {
        self.activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Adds a handler for commands received from now on.
    pub fn register_command_handler(&self, handler: Arc<dyn CommandHandler>) {
        self.command_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    fn activity_mut(&self) -> RwLockWriteGuard<'_, Activity> {
        self.activity.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects every channel except the input, loads the state, starts the
    /// background tasks and switches to `Running`.
    ///
    /// Any failure here is a startup failure and is returned to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(service = %self.identity, "Starting service");

        self.channels.connect_outputs().await?;
        self.channels.connect_heartbeat().await?;
        self.channels.connect_error().await?;
        let commands = self.channels.connect_command().await?;

        {
            let mut state = self.state.write().await;
            for (key, value) in &self.initial_state {
                state.set(key, value.clone());
            }
            let loaded = state.reload().await?;
            *self.activity_mut() = Activity {
                last_received: state.get_str(LAST_RECEIVED_KEY).map(str::to_owned),
                last_sent: state.get_str(LAST_SENT_KEY).map(str::to_owned),
            };
            info!(root = %self.state.root().display(), records = loaded, "State loaded");
        }

        self.status.send_replace(ServiceStatus::Running);

        let listener = tokio::spawn(self.clone().command_loop(commands));
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listener, heartbeat]);

        info!(service = %self.identity, "Service is running");
        Ok(())
    }

    /// Resolves once the node is running (`true`) or terminated (`false`).
    pub async fn wait_until_running(&self) -> bool {
        let mut status = self.status.subscribe();
        match status
            .wait_for(|status| *status != ServiceStatus::Suspended)
            .await
        {
            Ok(status) => *status == ServiceStatus::Running,
            Err(_) => false,
        }
    }

    /// Resolves as soon as the node stops running.
    pub async fn wait_until_not_running(&self) {
        let mut status = self.status.subscribe();
        let _ = status
            .wait_for(|status| *status != ServiceStatus::Running)
            .await;
    }

    /// Resolves once the node has terminated.
    pub async fn terminated(&self) {
        self.shutdown.cancelled().await;
    }

    /// Stops the background tasks and waits for them.
    pub async fn join_background(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
    }

    // ---- inbound messages ----

    /// Acknowledges `delivery`, records it as in flight and runs `handler` on it.
    pub async fn dispatch(&self, delivery: Delivery, handler: &dyn MessageHandler) {
        let (message, acker) = delivery.into_parts();
        if let Err(e) = acker.ack().await {
            warn!(error = %e, "Failed to acknowledge message");
        }

        let body = message.body_text();
        let received_at = format_timestamp();

        let mut state = self.state.write().await;
        state.set(LAST_RECEIVED_KEY, received_at.clone());
        state.set(CURRENT_MESSAGE_KEY, body.clone());
        state.set(CURRENT_HEADERS_KEY, headers_to_state(&message.headers));
        self.activity_mut().last_received = Some(received_at);

        if let Err(e) = state
            .dump(
                Some(&[CURRENT_MESSAGE_KEY, CURRENT_HEADERS_KEY, LAST_RECEIVED_KEY]),
                true,
            )
            .await
        {
            self.reporter
                .report(format!("Failed to persist in-flight message: {e}"), Some(&body))
                .await;
        }

        debug!(bytes = body.len(), "Message received");
        self.process(&mut state, handler, &body, &message.headers)
            .await;
    }

    /// Runs `handler` on the in-flight message left behind by a crash, if any.
    pub async fn replay_unfinished(&self, handler: &dyn MessageHandler) -> bool {
        let mut state = self.state.write().await;
        let Some(body) = state.get_str(CURRENT_MESSAGE_KEY).map(str::to_owned) else {
            return false;
        };
        let headers = headers_from_state(state.get(CURRENT_HEADERS_KEY));

        info!("Unfinished message found in state, replaying it");
        self.process(&mut state, handler, &body, &headers).await;
        true
    }

    /// A present `tag` header is compared as is: `null` or a non-string value
    /// never matches a subscription.
    fn bypasses(&self, headers: &Headers) -> bool {
        match headers.get(TAG_HEADER) {
            None => false,
            Some(Value::String(tag)) => !self.subscription_tags.contains(tag),
            Some(_) => true,
        }
    }

    async fn process(
        &self,
        state: &mut StateWriteGuard<'_>,
        handler: &dyn MessageHandler,
        body: &str,
        headers: &Headers,
    ) {
        let outcome = if self.bypasses(headers) {
            debug!("Message tagged for another consumer, forwarding to outputs");
            self.send_locked(state, body, headers)
                .await
                .map_err(anyhow::Error::from)
        } else {
            let mut ctx = HandlerContext::new(self, state);
            match AssertUnwindSafe(handler.handle(&mut ctx, body, headers))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(&panic))),
            }
        };

        if let Err(err) = outcome {
            self.reporter.report(format!("{err:#}"), Some(body)).await;
        }

        state.set(CURRENT_MESSAGE_KEY, StateValue::Null);
        state.set(CURRENT_HEADERS_KEY, StateValue::Null);
        if let Err(e) = state.dump(None, false).await {
            error!(error = %e, "Failed to persist state after message");
        }
    }

    // ---- outbound messages ----

    /// Sends `body` to every output. Blocks through broker outages.
    pub async fn send(&self, body: &str, headers: &Headers) -> Result<()> {
        let mut state = self.state.write().await;
        self.send_locked(&mut state, body, headers).await
    }

    pub(crate) async fn send_locked(
        &self,
        state: &mut StateWriteGuard<'_>,
        body: &str,
        headers: &Headers,
    ) -> Result<()> {
        let mut messages = Vec::with_capacity(self.channels.outputs().len());
        for output in self.channels.outputs() {
            let merged = self.merge_headers(output, headers).await;
            let mut message = OutboundMessage::new(body.as_bytes().to_vec()).with_headers(merged);
            message.persistent = output.durable;
            messages.push(message);
        }
        self.channels.publish_outputs(&messages).await?;

        let sent_at = format_timestamp();
        state.set(LAST_SENT_KEY, sent_at.clone());
        self.activity_mut().last_sent = Some(sent_at);
        Ok(())
    }

    async fn merge_headers(&self, output: &OutputSpec, headers: &Headers) -> Headers {
        let mut merged = output.headers.clone();
        for (key, value) in headers {
            if merged.contains_key(key) {
                self.reporter
                    .warn(
                        format!(
                            "Header {key} is set both by output {} and by the message; using the message value",
                            output.name
                        ),
                        None,
                    )
                    .await;
            }
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    // ---- commands ----

    /// Executes `command` under the write lock.
    pub async fn execute(&self, command: &Command) {
        let mut state = self.state.write().await;
        self.execute_command(&mut state, command).await;
    }

    /// Built-in lifecycle commands first, then every registered handler.
    pub async fn execute_command(&self, state: &mut StateWriteGuard<'_>, command: &Command) {
        if command.is("shutdown") {
            self.hard_shutdown(state).await;
        } else if command.is("suspend") {
            self.suspend(state).await;
        } else if command.is("resume") {
            self.resume(state).await;
        }

        let handlers = self
            .command_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            let mut ctx = HandlerContext::new(self, state);
            if let Err(err) = handler.handle_command(&mut ctx, command).await {
                let cause = serde_json::to_string(command).unwrap_or_default();
                self.reporter
                    .report(
                        format!("Command {} failed: {err:#}", command.command),
                        Some(&cause),
                    )
                    .await;
            }
        }
    }

    async fn hard_shutdown(&self, state: &mut StateWriteGuard<'_>) {
        info!(service = %self.identity, "Shutdown requested");
        if let Err(e) = state.dump(None, true).await {
            error!(error = %e, "Failed to persist state on shutdown");
        }
        self.status.send_replace(ServiceStatus::Terminated);
        self.shutdown.cancel();
    }

    async fn suspend(&self, state: &mut StateWriteGuard<'_>) {
        if self.status() != ServiceStatus::Running {
            debug!("Suspend ignored, service is not running");
            return;
        }
        self.status.send_replace(ServiceStatus::Suspended);
        if self.suspend_policy.persist_on_suspend {
            if let Err(e) = state.dump(None, true).await {
                error!(error = %e, "Failed to persist state on suspend");
            }
        }
        info!(service = %self.identity, "Service suspended");
    }

    async fn resume(&self, state: &mut StateWriteGuard<'_>) {
        if self.status() != ServiceStatus::Suspended {
            debug!("Resume ignored, service is not suspended");
            return;
        }
        if self.suspend_policy.reload_on_resume {
            if let Err(e) = state.reload().await {
                self.reporter
                    .report(format!("Failed to reload state on resume: {e}"), None)
                    .await;
            }
        }
        self.status.send_replace(ServiceStatus::Running);
        info!(service = %self.identity, "Service resumed");
    }

    async fn handle_command_delivery(&self, delivery: Delivery) {
        let (message, acker) = delivery.into_parts();
        match Command::from_slice(&message.body) {
            Ok(command) => {
                info!(command = %command.command, args = ?command.args, "Command received");
                self.execute(&command).await;
            }
            Err(e) => {
                self.reporter
                    .report(e.to_string(), Some(&message.body_text()))
                    .await;
            }
        }
        if let Err(e) = acker.ack().await {
            warn!(error = %e, "Failed to acknowledge command");
        }
    }

    async fn command_loop(self: Arc<Self>, mut consumer: Box<dyn Consumer>) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = consumer.next() => next,
            };
            match next {
                Ok(Some(delivery)) => self.handle_command_delivery(delivery).await,
                Ok(None) => {
                    warn!("Command consumer cancelled by the broker, reconnecting");
                    match self.channels.reconnect_command(&self.shutdown).await {
                        Some(fresh) => consumer = fresh,
                        None => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Command channel failed, reconnecting");
                    match self.channels.reconnect_command(&self.shutdown).await {
                        Some(fresh) => consumer = fresh,
                        None => break,
                    }
                }
            }
        }
        debug!("Command listener stopped");
    }

    // ---- heartbeats ----

    /// Heartbeat describing the node right now.
    pub fn heartbeat(&self) -> HeartbeatMessage {
        let activity = self.activity();
        HeartbeatMessage {
            pipeline: self.identity.pipeline.clone(),
            service: self.identity.service.clone(),
            state: self.status().heartbeat_state(),
            last_heartbeat_datetime: unix_timestamp(),
            last_received_message_datetime: activity.last_received,
            last_sent_message_datetime: activity.last_sent,
        }
    }

    async fn send_heartbeat(&self) {
        match self.heartbeat().to_vec() {
            Ok(body) => {
                self.channels
                    .publish_heartbeat(&OutboundMessage::new(body))
                    .await
            }
            Err(e) => error!(error = %e, "Failed to encode heartbeat"),
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        info!(
            interval_ms = self.heartbeat_interval.as_millis() as u64,
            "Heartbeat loop started"
        );
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.send_heartbeat() => {}
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.heartbeat_interval) => {}
            }
        }
        debug!("Heartbeat loop stopped");
    }
}

/// What node logic gets to touch while it runs under the write lock.
pub struct HandlerContext<'r, 's> {
    runtime: &'r ServiceRuntime,
    state: &'r mut StateWriteGuard<'s>,
}

impl<'r, 's> HandlerContext<'r, 's> {
    pub(crate) fn new(runtime: &'r ServiceRuntime, state: &'r mut StateWriteGuard<'s>) -> Self {
        Self { runtime, state }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.runtime.identity
    }

    pub fn status(&self) -> ServiceStatus {
        self.runtime.status()
    }

    /// The locked state.
    pub fn state(&mut self) -> &mut StateWriteGuard<'s> {
        &mut *self.state
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.runtime.reporter
    }

    /// Sends to every output and records the send time.
    pub async fn send(&mut self, body: &str, headers: &Headers) -> Result<()> {
        self.runtime.send_locked(&mut *self.state, body, headers).await
    }

    pub async fn report_error(&self, text: impl Into<String>, cause: Option<&str>) -> bool {
        self.runtime.reporter.report(text, cause).await
    }
}

fn headers_to_state(headers: &Headers) -> StateValue {
    StateValue::Structured(Value::Object(
        headers
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    ))
}

fn headers_from_state(value: Option<&StateValue>) -> Headers {
    match value {
        Some(StateValue::Structured(Value::Object(map))) => map
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        _ => Headers::new(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
