// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Broker object names shared across the fleet.

/// Topic exchange every node's command queue is bound to.
pub const COMMANDS_EXCHANGE: &str = "commands";

/// Queue collecting heartbeats from all nodes.
pub const HEARTBEATS_QUEUE: &str = "heartbeats";

/// Queue collecting error reports from all nodes.
pub const ERRORS_QUEUE: &str = "errors";

/// Commands that sit unconsumed longer than this are discarded by the broker.
pub const COMMAND_MESSAGE_TTL_MS: u64 = 10_000;

/// Name of the queue a node declares when it subscribes through an exchange.
pub fn exchange_queue_name(exchange: &str, queue: &str) -> String {
    format!("{exchange}.{queue}")
}

/// Every dot-delimited prefix of `routing_key`, shortest first.
///
/// A queue bound under all of them receives messages addressed to any
/// ancestor of its key: `a.b.c` yields `["a", "a.b", "a.b.c"]`.
pub fn routing_key_prefixes(routing_key: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    for (idx, ch) in routing_key.char_indices() {
        if ch == '.' && idx > 0 {
            prefixes.push(routing_key[..idx].to_string());
        }
    }
    if !routing_key.is_empty() {
        prefixes.push(routing_key.to_string());
    }
    prefixes
}
