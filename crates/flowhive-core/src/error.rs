// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the service runtime.

use thiserror::Error;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::state::StateError;

/// Errors raised by the runtime itself.
///
/// Handler, emitter and store failures are `anyhow::Error`s; they never leave
/// the dispatch boundary and end up as error reports instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("protocol error: {0}")]
    Protocol(#[from] flowhive_protocol::ProtocolError),

    /// Invalid runtime setup, e.g. a node without input or an empty retry plan.
    #[error("invalid setup: {0}")]
    Setup(String),
}

impl RuntimeError {
    /// Whether the error is a broker outage that reconnecting can fix.
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Broker(err) if err.is_transient())
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
