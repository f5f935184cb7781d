// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process broker.
//!
//! Queues are unbounded channels shared by every consumer of that queue;
//! exchanges keep `(queue, key)` bindings. Fanout exchanges copy a message to
//! every bound queue, direct and topic exchanges to queues whose binding key
//! equals the routing key. A queue receives a routed message at most once.
//!
//! [`MemoryBroker::disconnect`] takes the broker offline and invalidates every
//! consumer and publisher opened so far, the way a dropped TCP connection
//! would. After [`MemoryBroker::restore`] new connections succeed while the
//! old handles stay broken, so callers have to reconnect. Queued messages
//! survive the outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{
    Acker, Broker, BrokerError, Consumer, Delivery, ExchangeKind, InboundMessage,
    OutboundMessage, PublishTarget, Publisher, QueueBinding,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    online: bool,
    epoch: u64,
}

impl Link {
    fn serves(&self, epoch: u64) -> bool {
        self.online && self.epoch == epoch
    }
}

struct MemoryQueue {
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

struct MemoryExchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

#[derive(Default)]
struct Topology {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, MemoryExchange>,
}

impl Topology {
    fn declare_queue(&mut self, name: &str) -> &MemoryQueue {
        self.queues
            .entry(name.to_string())
            .or_insert_with(MemoryQueue::new)
    }

    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind) -> &mut MemoryExchange {
        self.exchanges
            .entry(name.to_string())
            .or_insert_with(|| MemoryExchange {
                kind,
                bindings: Vec::new(),
            })
    }

    fn targets(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            return vec![routing_key.to_string()];
        }
        let Some(exchange) = self.exchanges.get(exchange) else {
            return Vec::new();
        };
        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &exchange.bindings {
            let matches = match exchange.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct | ExchangeKind::Topic => key == routing_key,
            };
            if matches && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        targets
    }
}

struct Inner {
    topology: Mutex<Topology>,
    link: watch::Sender<Link>,
    acked: AtomicU64,
}

/// In-process [`Broker`] with outage simulation.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("link", &*self.inner.link.borrow())
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (link, _) = watch::channel(Link {
            online: true,
            epoch: 0,
        });
        Self {
            inner: Arc::new(Inner {
                topology: Mutex::new(Topology::default()),
                link,
                acked: AtomicU64::new(0),
            }),
        }
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.inner
            .topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) -> Result<u64, BrokerError> {
        let link = *self.inner.link.borrow();
        if link.online {
            Ok(link.epoch)
        } else {
            Err(BrokerError::Disconnected("connection refused".to_string()))
        }
    }

    /// Drops every open connection and refuses new ones until [`restore`](Self::restore).
    pub fn disconnect(&self) {
        self.inner.link.send_modify(|link| {
            link.online = false;
            link.epoch += 1;
        });
        debug!("Memory broker went offline");
    }

    /// Accepts connections again.
    pub fn restore(&self) {
        self.inner.link.send_modify(|link| link.online = true);
        debug!("Memory broker back online");
    }

    pub fn is_online(&self) -> bool {
        self.inner.link.borrow().online
    }

    /// Number of acknowledged deliveries so far.
    pub fn acked(&self) -> u64 {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn declare_queue(&self, name: &str) {
        self.topology().declare_queue(name);
    }

    /// Routes a message as if a publisher on the default or named exchange sent it.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.connect()?;
        self.route(exchange, routing_key, message);
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str, message: &OutboundMessage) {
        let topology = self.topology();
        let targets = topology.targets(exchange, routing_key);
        if targets.is_empty() {
            debug!(exchange, routing_key, "Message routed to no queue");
        }
        for name in targets {
            if let Some(queue) = topology.queues.get(&name) {
                let _ = queue.sender.send(InboundMessage {
                    body: message.body.clone(),
                    headers: message.headers.clone(),
                });
            }
        }
    }

    /// Removes and returns everything currently waiting in `queue`.
    ///
    /// Messages held by a consumer that is blocked mid-receive are not visible.
    pub fn drain(&self, queue: &str) -> Vec<InboundMessage> {
        let receiver = match self.topology().queues.get(queue) {
            Some(queue) => queue.receiver.clone(),
            None => return Vec::new(),
        };
        let Ok(mut receiver) = receiver.try_lock() else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Waits up to `timeout` for the next message in `queue`.
    pub async fn recv(&self, queue: &str, timeout: Duration) -> Option<InboundMessage> {
        let receiver = self.topology().declare_queue(queue).receiver.clone();
        let mut receiver = receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_consumer(&self, binding: &QueueBinding) -> Result<Box<dyn Consumer>, BrokerError> {
        let epoch = self.connect()?;
        let receiver = {
            let mut topology = self.topology();
            let receiver = topology.declare_queue(&binding.queue).receiver.clone();
            if let Some(exchange) = &binding.exchange {
                let declared = topology.declare_exchange(&exchange.name, exchange.kind);
                for key in &exchange.routing_keys {
                    let pair = (binding.queue.clone(), key.clone());
                    if !declared.bindings.contains(&pair) {
                        declared.bindings.push(pair);
                    }
                }
            }
            receiver
        };
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            receiver,
            link: self.inner.link.subscribe(),
            epoch,
        }))
    }

    async fn open_publisher(
        &self,
        target: &PublishTarget,
    ) -> Result<Box<dyn Publisher>, BrokerError> {
        let epoch = self.connect()?;
        {
            let mut topology = self.topology();
            if let Some(kind) = target.declare_exchange {
                topology.declare_exchange(&target.exchange, kind);
            }
            if target.declare_queue {
                topology.declare_queue(&target.routing_key);
            }
        }
        Ok(Box::new(MemoryPublisher {
            broker: self.clone(),
            target: target.clone(),
            epoch,
        }))
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>>,
    link: watch::Receiver<Link>,
    epoch: u64,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let epoch = self.epoch;
        let current = *self.link.borrow();
        if !current.serves(epoch) {
            return Err(BrokerError::Disconnected("consumer channel closed".to_string()));
        }

        let receiver = self.receiver.clone();
        let mut receiver = receiver.lock().await;
        tokio::select! {
            message = receiver.recv() => Ok(message.map(|message| {
                Delivery::new(message, Box::new(MemoryAcker { broker: self.broker.clone() }))
            })),
            _ = self.link.wait_for(|link| !link.serves(epoch)) => {
                Err(BrokerError::Disconnected("consumer channel closed".to_string()))
            }
        }
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        self.broker.inner.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
    target: PublishTarget,
    epoch: u64,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), BrokerError> {
        if !self.broker.inner.link.borrow().serves(self.epoch) {
            return Err(BrokerError::Disconnected("publisher channel closed".to_string()));
        }
        let routing_key = message
            .routing_key
            .as_deref()
            .unwrap_or(&self.target.routing_key);
        self.broker.route(&self.target.exchange, routing_key, message);
        Ok(())
    }
}
