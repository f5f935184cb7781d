// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane message bodies.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Local, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Envelope headers carried next to a payload.
///
/// Values are arbitrary JSON so they survive both the AMQP field-table
/// mapping and persistence in the node state.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Errors produced while encoding or decoding control-plane messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind} message: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Identity of a running node, fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub pipeline: String,
    pub service: String,
}

impl ServiceIdentity {
    pub fn new(pipeline: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            service: service.into(),
        }
    }

    /// Routing key (and command queue name) addressing this node: `<pipeline>.<service>`.
    pub fn command_routing_key(&self) -> String {
        format!("{}.{}", self.pipeline, self.service)
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pipeline, self.service)
    }
}

/// Remote instruction delivered over the `commands` exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub args: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Command {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn shutdown() -> Self {
        Self::new("shutdown", Vec::new())
    }

    pub fn suspend() -> Self {
        Self::new("suspend", Vec::new())
    }

    pub fn resume() -> Self {
        Self::new("resume", Vec::new())
    }

    /// Case-insensitive name comparison, used for the built-in lifecycle commands.
    pub fn is(&self, name: &str) -> bool {
        self.command.eq_ignore_ascii_case(name)
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(body).map_err(|source| ProtocolError::Malformed {
            kind: "command",
            source,
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|source| ProtocolError::Encode {
            kind: "command",
            source,
        })
    }
}

/// Liveness status published in every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatState {
    Ok,
    Suspended,
}

/// Periodic liveness record published to the `heartbeats` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub pipeline: String,
    pub service: String,
    pub state: HeartbeatState,
    /// Seconds since the unix epoch.
    pub last_heartbeat_datetime: f64,
    pub last_received_message_datetime: Option<String>,
    pub last_sent_message_datetime: Option<String>,
}

impl HeartbeatMessage {
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(&self.pipeline, &self.service)
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(body).map_err(|source| ProtocolError::Malformed {
            kind: "heartbeat",
            source,
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|source| ProtocolError::Encode {
            kind: "heartbeat",
            source,
        })
    }
}

/// Cause placeholder of reports not tied to a payload.
pub const UNKNOWN_CAUSE: &str = "Unknown";

fn unknown_cause() -> String {
    UNKNOWN_CAUSE.to_string()
}

/// Failure notice published to the shared `errors` queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub pipeline: String,
    pub service: String,
    pub text: String,
    #[serde(default = "unknown_cause")]
    pub cause: String,
    pub timestamp: String,
}

impl ErrorMessage {
    /// Builds a report stamped with the current local time. A missing cause
    /// is sent as [`UNKNOWN_CAUSE`].
    pub fn new(identity: &ServiceIdentity, text: impl Into<String>, cause: Option<&str>) -> Self {
        Self {
            pipeline: identity.pipeline.clone(),
            service: identity.service.clone(),
            text: text.into(),
            cause: cause.unwrap_or(UNKNOWN_CAUSE).to_string(),
            timestamp: format_timestamp(),
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(body).map_err(|source| ProtocolError::Malformed {
            kind: "error",
            source,
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|source| ProtocolError::Encode {
            kind: "error",
            source,
        })
    }
}

/// Local wall-clock time with microseconds, e.g. `2025-03-01 14:05:09.123456`.
pub fn format_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Seconds since the unix epoch with sub-second precision.
pub fn unix_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
