// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-level context handed to every runtime.

use std::sync::Arc;

use flowhive_protocol::ServiceIdentity;

use crate::broker::Broker;
use crate::config::RuntimeConfig;

/// Configuration plus broker handles, created once by the entry point.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: RuntimeConfig,
    /// Pipeline-internal broker.
    pub local: Arc<dyn Broker>,
    /// Control-plane broker.
    pub global: Arc<dyn Broker>,
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ServiceContext {
    pub fn new(config: RuntimeConfig, local: Arc<dyn Broker>, global: Arc<dyn Broker>) -> Self {
        Self {
            config,
            local,
            global,
        }
    }

    /// Uses the same broker for pipeline traffic and the control plane.
    pub fn with_broker(config: RuntimeConfig, broker: Arc<dyn Broker>) -> Self {
        Self::new(config, broker.clone(), broker)
    }

    /// AMQP brokers from the configured profiles.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: RuntimeConfig) -> Self {
        use crate::broker::AmqpBroker;

        let local = Arc::new(AmqpBroker::new(config.local_broker.uri()));
        let global = Arc::new(AmqpBroker::new(config.global_broker.uri()));
        Self::new(config, local, global)
    }

    /// [`RuntimeConfig::from_env`] with AMQP brokers.
    #[cfg(feature = "amqp")]
    pub fn from_env() -> crate::Result<Self> {
        Ok(Self::amqp(RuntimeConfig::from_env()?))
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.config.identity
    }
}
