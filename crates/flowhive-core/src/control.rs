// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator side of the control plane: sending commands, watching the fleet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use flowhive_protocol::{
    COMMAND_MESSAGE_TTL_MS, COMMANDS_EXCHANGE, Command, ERRORS_QUEUE, HEARTBEATS_QUEUE,
    HeartbeatMessage, HeartbeatState, ServiceIdentity, unix_timestamp,
};

use crate::broker::{
    Broker, BrokerError, Consumer, ExchangeKind, OutboundMessage, PublishTarget, Publisher,
    QueueBinding,
};
use crate::error::Result;

/// A node with no heartbeat for this long is considered down.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

fn commands_target() -> PublishTarget {
    PublishTarget::exchange(COMMANDS_EXCHANGE, ExchangeKind::Topic, false)
}

fn collector_binding(queue: &str) -> QueueBinding {
    QueueBinding {
        queue: queue.to_string(),
        durable: true,
        prefetch: 0,
        exchange: None,
    }
}

/// Sends commands to nodes and subscribes to fleet-wide queues.
pub struct ControlClient {
    broker: Arc<dyn Broker>,
    commands: Mutex<Option<Box<dyn Publisher>>>,
}

impl std::fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlClient").finish_non_exhaustive()
    }
}

impl ControlClient {
    /// Connects lazily on the first command.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            commands: Mutex::new(None),
        }
    }

    /// Sends `command` to every node whose `<pipeline>.<service>` key starts
    /// with `target` (`"p"` reaches the whole pipeline, `"p.s"` one node).
    ///
    /// On a broker failure the connection is reopened and the publish tried
    /// once more; `Ok(false)` means that second attempt failed too.
    pub async fn send_command(&self, target: &str, command: &Command) -> Result<bool> {
        let message = OutboundMessage::new(command.to_vec()?)
            .with_routing_key(target)
            .with_expiration_ms(COMMAND_MESSAGE_TTL_MS);

        let mut publisher = self.commands.lock().await;
        if let Some(current) = publisher.as_ref() {
            match current.publish(&message).await {
                Ok(()) => {
                    info!(target, command = %command.command, "Command sent");
                    return Ok(true);
                }
                Err(e) => warn!(error = %e, "Command publish failed, reconnecting"),
            }
        }

        *publisher = None;
        let fresh = match self.broker.open_publisher(&commands_target()).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, "Unable to connect to the commands exchange, try again later");
                return Ok(false);
            }
        };
        let sent = match fresh.publish(&message).await {
            Ok(()) => {
                info!(target, command = %command.command, "Command sent");
                true
            }
            Err(e) => {
                warn!(error = %e, "Command publish failed after reconnecting");
                false
            }
        };
        *publisher = Some(fresh);
        Ok(sent)
    }

    /// Consumes the shared `heartbeats` queue.
    pub async fn heartbeats(&self) -> std::result::Result<Box<dyn Consumer>, BrokerError> {
        self.broker
            .open_consumer(&collector_binding(HEARTBEATS_QUEUE))
            .await
    }

    /// Consumes the shared `errors` queue.
    pub async fn errors(&self) -> std::result::Result<Box<dyn Consumer>, BrokerError> {
        self.broker.open_consumer(&collector_binding(ERRORS_QUEUE)).await
    }
}

/// Health of one node as derived from its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Up,
    Suspended,
    Down,
}

/// Last heartbeat seen from every node of the fleet.
#[derive(Debug, Clone)]
pub struct FleetState {
    services: BTreeMap<ServiceIdentity, Option<HeartbeatMessage>>,
    timeout: Duration,
}

impl Default for FleetState {
    fn default() -> Self {
        Self::new()
    }
}

impl FleetState {
    pub fn new() -> Self {
        Self {
            services: BTreeMap::new(),
            timeout: HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Starts tracking a node before its first heartbeat; it shows as down
    /// until one arrives.
    pub fn register(&mut self, identity: ServiceIdentity) {
        self.services.entry(identity).or_insert(None);
    }

    pub fn record(&mut self, heartbeat: HeartbeatMessage) {
        debug!(service = %heartbeat.identity(), state = ?heartbeat.state, "Heartbeat recorded");
        self.services.insert(heartbeat.identity(), Some(heartbeat));
    }

    pub fn last_heartbeat(&self, identity: &ServiceIdentity) -> Option<&HeartbeatMessage> {
        self.services.get(identity).and_then(Option::as_ref)
    }

    /// Health of `identity` at `now` (seconds since the unix epoch).
    pub fn health_at(&self, identity: &ServiceIdentity, now: f64) -> ServiceHealth {
        let Some(heartbeat) = self.last_heartbeat(identity) else {
            return ServiceHealth::Down;
        };
        if now - heartbeat.last_heartbeat_datetime > self.timeout.as_secs_f64() {
            return ServiceHealth::Down;
        }
        match heartbeat.state {
            HeartbeatState::Ok => ServiceHealth::Up,
            HeartbeatState::Suspended => ServiceHealth::Suspended,
        }
    }

    pub fn health(&self, identity: &ServiceIdentity) -> ServiceHealth {
        self.health_at(identity, unix_timestamp())
    }

    /// Every known node with its current health, ordered by identity.
    pub fn overview(&self) -> Vec<(ServiceIdentity, ServiceHealth)> {
        let now = unix_timestamp();
        self.services
            .keys()
            .map(|identity| (identity.clone(), self.health_at(identity, now)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(state: HeartbeatState, at: f64) -> HeartbeatMessage {
        HeartbeatMessage {
            pipeline: "odds".to_string(),
            service: "saver".to_string(),
            state,
            last_heartbeat_datetime: at,
            last_received_message_datetime: None,
            last_sent_message_datetime: None,
        }
    }

    #[test]
    fn test_registered_without_heartbeat_is_down() {
        let mut fleet = FleetState::new();
        let identity = ServiceIdentity::new("odds", "saver");
        fleet.register(identity.clone());

        assert_eq!(fleet.health_at(&identity, 100.0), ServiceHealth::Down);
        assert_eq!(fleet.overview().len(), 1);
    }

    #[test]
    fn test_health_follows_heartbeat_state_and_age() {
        let mut fleet = FleetState::new();
        let identity = ServiceIdentity::new("odds", "saver");

        fleet.record(heartbeat(HeartbeatState::Ok, 1000.0));
        assert_eq!(fleet.health_at(&identity, 1005.0), ServiceHealth::Up);
        assert_eq!(fleet.health_at(&identity, 1010.5), ServiceHealth::Down);

        fleet.record(heartbeat(HeartbeatState::Suspended, 1020.0));
        assert_eq!(fleet.health_at(&identity, 1021.0), ServiceHealth::Suspended);
    }

    #[test]
    fn test_register_keeps_existing_heartbeat() {
        let mut fleet = FleetState::new().with_timeout(Duration::from_secs(60));
        let identity = ServiceIdentity::new("odds", "saver");
        fleet.record(heartbeat(HeartbeatState::Ok, 1000.0));
        fleet.register(identity.clone());

        assert_eq!(fleet.health_at(&identity, 1030.0), ServiceHealth::Up);
    }

    #[test]
    fn test_health_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceHealth::Suspended).unwrap();
        assert_eq!(json, "\"suspended\"");
    }
}
