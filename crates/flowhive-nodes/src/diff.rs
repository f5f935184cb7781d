// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forward-only-on-change processing.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use flowhive_core::protocol::Headers;
use flowhive_core::{HandlerContext, MessageHandler, StateValue};

/// State key holding the last hash seen per item id.
pub const DATA_STATE_KEY: &str = "data_state";

/// Hex sha256 over the scalar values of `data`.
///
/// Object members are visited in key order and keys themselves are not
/// hashed, so reordering an object's members keeps the hash stable. Array
/// order matters.
pub fn content_hash(data: &Value) -> String {
    fn feed(hasher: &mut Sha256, value: &Value) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    feed(hasher, &map[key]);
                }
            }
            Value::Array(items) => {
                for item in items {
                    feed(hasher, item);
                }
            }
            Value::String(text) => hasher.update(text.as_bytes()),
            scalar => hasher.update(scalar.to_string().as_bytes()),
        }
    }

    let mut hasher = Sha256::new();
    feed(&mut hasher, data);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Forwards an item only when its content differs from the last one seen
/// under the same id.
///
/// A message is either one JSON object or an array of them; array items are
/// checked and forwarded one by one.
#[derive(Debug, Clone)]
pub struct DiffFinder {
    id_field: String,
}

impl DiffFinder {
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
        }
    }

    fn item_id(&self, item: &Value) -> anyhow::Result<String> {
        match item.get(&self.id_field) {
            Some(Value::String(id)) => Ok(id.clone()),
            Some(Value::Null) | None => {
                anyhow::bail!("item has no {:?} field", self.id_field)
            }
            Some(other) => Ok(other.to_string()),
        }
    }
}

fn known_hashes(ctx: &mut HandlerContext<'_, '_>) -> Map<String, Value> {
    match ctx.state().get(DATA_STATE_KEY) {
        Some(StateValue::Structured(Value::Object(map))) => map.clone(),
        _ => Map::new(),
    }
}

#[async_trait]
impl MessageHandler for DiffFinder {
    async fn handle(
        &self,
        ctx: &mut HandlerContext<'_, '_>,
        message: &str,
        headers: &Headers,
    ) -> anyhow::Result<()> {
        let data: Value = serde_json::from_str(message).context("message is not valid JSON")?;
        let items = match data {
            Value::Array(items) => items,
            item => vec![item],
        };

        let mut hashes = known_hashes(ctx);
        let mut changed = Vec::new();
        for item in items {
            let id = self.item_id(&item)?;
            let hash = content_hash(&item);
            if hashes.get(&id).and_then(Value::as_str) == Some(hash.as_str()) {
                debug!(data_id = %id, "Nothing new");
                continue;
            }
            hashes.insert(id.clone(), Value::String(hash));
            changed.push((id, item));
        }
        for (id, item) in &changed {
            ctx.send(&item.to_string(), headers).await?;
            info!(data_id = %id, "Changes sent");
        }
        // Hashes are recorded only once every change went out.
        ctx.state()
            .set(DATA_STATE_KEY, StateValue::Structured(Value::Object(hashes)));
        Ok(())
    }
}
