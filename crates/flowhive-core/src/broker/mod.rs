// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker abstraction.
//!
//! The runtime only needs three capabilities from a message broker: open a
//! consumer on a (possibly exchange-bound) queue, open a publisher towards a
//! queue or exchange, and acknowledge deliveries. Each `open_*` call creates
//! a fresh connection, so replacing a broken consumer or publisher is just a
//! matter of opening a new one.
//!
//! Two backends are provided:
//!
//! - [`AmqpBroker`] (feature `amqp`) talks AMQP 0-9-1 through `lapin`.
//! - [`MemoryBroker`] routes messages in-process and can simulate outages.

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

use async_trait::async_trait;
use flowhive_protocol::Headers;

/// Errors surfaced by broker backends.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The connection or channel is gone (refused, reset, closed, DNS failure).
    #[error("broker connection lost: {0}")]
    Disconnected(String),

    /// The broker answered but refused the operation (e.g. a declaration
    /// conflicting with an existing queue).
    #[error("broker rejected operation: {0}")]
    Rejected(String),

    /// The message could not be encoded for the wire.
    #[error("failed to encode message: {0}")]
    Encoding(String),
}

impl BrokerError {
    /// Whether the failure is a connectivity problem that a reconnect can fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Rejected(_))
    }
}

/// Exchange routing discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

/// Exchange a consumer queue is bound through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    /// Literal binding keys; every one of them routes into the queue.
    pub routing_keys: Vec<String>,
}

/// Everything needed to declare and consume one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub durable: bool,
    /// Maximum unacknowledged deliveries; 0 leaves the broker default.
    pub prefetch: u16,
    pub exchange: Option<ExchangeBinding>,
}

/// Destination of a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    /// Exchange name; empty for the default exchange (direct to a queue).
    pub exchange: String,
    /// Default routing key, overridable per message.
    pub routing_key: String,
    /// Declare `exchange` with this kind before publishing.
    pub declare_exchange: Option<ExchangeKind>,
    /// Declare `routing_key` as a queue before publishing (default exchange only).
    pub declare_queue: bool,
    pub durable: bool,
}

impl PublishTarget {
    /// Publish straight into a named queue through the default exchange.
    pub fn queue(name: impl Into<String>, durable: bool) -> Self {
        Self {
            exchange: String::new(),
            routing_key: name.into(),
            declare_exchange: None,
            declare_queue: true,
            durable,
        }
    }

    /// Publish into an exchange of the given kind.
    pub fn exchange(name: impl Into<String>, kind: ExchangeKind, durable: bool) -> Self {
        Self {
            exchange: name.into(),
            routing_key: String::new(),
            declare_exchange: Some(kind),
            declare_queue: false,
            durable,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }
}

/// A message as received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
}

impl InboundMessage {
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    /// Ask the broker to write the message to disk.
    pub persistent: bool,
    /// Per-message TTL in milliseconds, as the broker expects it (a string).
    pub expiration: Option<String>,
    /// Overrides the publisher's default routing key.
    pub routing_key: Option<String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn with_expiration_ms(mut self, ttl_ms: u64) -> Self {
        self.expiration = Some(ttl_ms.to_string());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }
}

/// Acknowledges one delivery.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A received message plus the handle to acknowledge it.
pub struct Delivery {
    pub message: InboundMessage,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: InboundMessage, acker: Box<dyn Acker>) -> Self {
        Self { message, acker }
    }

    pub fn into_parts(self) -> (InboundMessage, Box<dyn Acker>) {
        (self.message, self.acker)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Waits for the next delivery. `Ok(None)` means the broker cancelled the
    /// consumer; callers treat it like a lost connection.
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError>;
}

/// Publishes to one fixed target.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError>;
}

/// Connection factory for one broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares the queue (and exchange bindings) and starts consuming it.
    async fn open_consumer(&self, binding: &QueueBinding) -> Result<Box<dyn Consumer>, BrokerError>;

    /// Declares the target and returns a publisher for it.
    async fn open_publisher(
        &self,
        target: &PublishTarget,
    ) -> Result<Box<dyn Publisher>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BrokerError::Disconnected("reset".into()).is_transient());
        assert!(BrokerError::Rejected("precondition failed".into()).is_transient());
        assert!(!BrokerError::Encoding("bad header".into()).is_transient());
    }

    #[test]
    fn test_outbound_builder() {
        let msg = OutboundMessage::new("hello")
            .persistent()
            .with_expiration_ms(10_000)
            .with_routing_key("shop.saver");
        assert_eq!(msg.body, b"hello");
        assert!(msg.persistent);
        assert_eq!(msg.expiration.as_deref(), Some("10000"));
        assert_eq!(msg.routing_key.as_deref(), Some("shop.saver"));
    }
}
