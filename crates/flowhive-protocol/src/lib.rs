// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowhive Protocol - control-plane messages shared by every pipeline node
//!
//! Nodes exchange payloads with each other through broker queues; this crate
//! only covers the fleet-wide side channel that operators and nodes share:
//!
//! ```text
//! ┌──────────────┐   commands (topic exchange)    ┌──────────────┐
//! │   operator   │ ─────────────────────────────► │     node     │
//! │  / dashboard │ ◄───────────────────────────── │ <pipe>.<svc> │
//! └──────────────┘   heartbeats, errors (queues)  └──────────────┘
//! ```
//!
//! | Channel | Broker object | Body |
//! |---------|---------------|------|
//! | commands | topic exchange `commands`, routing key `<pipeline>.<service>` | [`Command`] |
//! | heartbeats | durable queue `heartbeats` | [`HeartbeatMessage`] |
//! | errors | durable queue `errors` | [`ErrorMessage`] |
//!
//! All bodies are JSON.

pub mod message;
pub mod naming;

pub use message::{
    Command, ErrorMessage, Headers, HeartbeatMessage, HeartbeatState, ProtocolError,
    ServiceIdentity, UNKNOWN_CAUSE, format_timestamp, unix_timestamp,
};
pub use naming::{
    COMMAND_MESSAGE_TTL_MS, COMMANDS_EXCHANGE, ERRORS_QUEUE, HEARTBEATS_QUEUE,
    exchange_queue_name, routing_key_prefixes,
};
