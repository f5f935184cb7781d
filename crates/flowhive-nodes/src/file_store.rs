// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable store writing items into files.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use flowhive_core::DurableStore;

/// How a [`FileStore`] writes into an item's file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SavingMode {
    /// Append, unless the payload equals the last one saved for the item.
    #[default]
    AppendSkipOnRepeat,
    Append,
    /// Replace the file content with the payload.
    Rewrite,
}

impl FromStr for SavingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append_skip_on_repeat" => Ok(SavingMode::AppendSkipOnRepeat),
            "append" => Ok(SavingMode::Append),
            "rewrite" => Ok(SavingMode::Rewrite),
            other => Err(format!(
                "unknown saving mode {other:?} (expected append_skip_on_repeat, append or rewrite)"
            )),
        }
    }
}

/// Writes each item as one JSON line into a file chosen by its key fields.
///
/// `path_template` contains one `{}` per key field; the item's values for
/// those fields fill them in order. The item id is the same values joined
/// with `_`.
#[derive(Debug, Clone)]
pub struct FileStore {
    path_template: String,
    key_fields: Vec<String>,
    mode: SavingMode,
    last_dir: PathBuf,
}

impl FileStore {
    /// `last_dir` holds the last payload per item for
    /// [`SavingMode::AppendSkipOnRepeat`].
    pub fn new(
        path_template: impl Into<String>,
        key_fields: Vec<String>,
        mode: SavingMode,
        last_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let path_template = path_template.into();
        if key_fields.is_empty() {
            anyhow::bail!("at least one key field is required");
        }
        let placeholders = path_template.matches("{}").count();
        if placeholders != key_fields.len() {
            anyhow::bail!(
                "path template {path_template:?} has {placeholders} placeholders for {} key fields",
                key_fields.len()
            );
        }
        Ok(Self {
            path_template,
            key_fields,
            mode,
            last_dir: last_dir.into(),
        })
    }

    fn key_values(&self, data: &Value) -> anyhow::Result<Vec<String>> {
        self.key_fields
            .iter()
            .map(|field| match data.get(field) {
                Some(Value::String(value)) => Ok(value.clone()),
                Some(Value::Null) | None => Err(anyhow::anyhow!("item has no {field:?} field")),
                Some(other) => Ok(other.to_string()),
            })
            .collect()
    }

    pub fn path_for(&self, data: &Value) -> anyhow::Result<PathBuf> {
        let values = self.key_values(data)?;
        let mut path = String::with_capacity(self.path_template.len());
        let mut rest = self.path_template.as_str();
        for value in &values {
            if let Some((head, tail)) = rest.split_once("{}") {
                path.push_str(head);
                path.push_str(value);
                rest = tail;
            }
        }
        path.push_str(rest);
        Ok(PathBuf::from(path))
    }

    /// Records `payload` as the last one for `id`; true when it repeats the
    /// previous one.
    async fn repeats_last(&self, id: &str, payload: &str) -> anyhow::Result<bool> {
        tokio::fs::create_dir_all(&self.last_dir)
            .await
            .with_context(|| format!("cannot create {}", self.last_dir.display()))?;
        let last_path = self.last_dir.join(format!("{id}.json"));
        let repeated = match tokio::fs::read_to_string(&last_path).await {
            Ok(previous) => previous == payload,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read {}", last_path.display()));
            }
        };
        tokio::fs::write(&last_path, payload)
            .await
            .with_context(|| format!("cannot write {}", last_path.display()))?;
        Ok(repeated)
    }
}

async fn create_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    Ok(())
}

#[async_trait]
impl DurableStore for FileStore {
    fn object_id(&self, data: &Value) -> anyhow::Result<String> {
        Ok(self.key_values(data)?.join("_"))
    }

    async fn save(&self, data: &Value) -> anyhow::Result<()> {
        let payload = data.to_string();
        if self.mode == SavingMode::AppendSkipOnRepeat {
            let id = self.object_id(data)?;
            if self.repeats_last(&id, &payload).await? {
                debug!(data_id = %id, "Same payload as last time, skipped");
                return Ok(());
            }
        }

        let path = self.path_for(data)?;
        create_parent(&path).await?;
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        match self.mode {
            SavingMode::Rewrite => options.write(true).truncate(true),
            SavingMode::Append | SavingMode::AppendSkipOnRepeat => options.append(true),
        };
        let mut file = options
            .open(&path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        file.write_all(format!("{payload}\n").as_bytes())
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }
}
