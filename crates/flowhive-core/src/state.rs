// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable key/value snapshot of a node's recoverable fields.
//!
//! Every key is persisted as its own record, `<root>/<key>.json`. A record is
//! first written to `<root>/tmp_<key>` and then renamed over the final path,
//! so a reader never sees a half-written file.
//!
//! All access goes through one [`tokio::sync::RwLock`]. Sequences that must
//! look atomic to other tasks (handling a message, executing a command) hold a
//! [`StateWriteGuard`] for their whole duration and pass it down instead of
//! re-locking.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Body of the message currently being processed (the in-flight marker).
pub const CURRENT_MESSAGE_KEY: &str = "_current_message";
/// Headers of the message currently being processed.
pub const CURRENT_HEADERS_KEY: &str = "_current_headers";
/// When the last inbound message arrived.
pub const LAST_RECEIVED_KEY: &str = "_last_received_message_datetime";
/// When the last outbound message was published.
pub const LAST_SENT_KEY: &str = "_last_sent_message_datetime";

const RECORD_EXTENSION: &str = ".json";
const TEMP_PREFIX: &str = "tmp_";

/// Errors reading or writing state records.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize state key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("corrupt state record {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A persisted state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    /// Arrays and objects.
    Structured(Value),
}

impl StateValue {
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value, whether stored as integer or float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StateValue::Integer(i) => Some(*i as f64),
            StateValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::Null => Value::Null,
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::Integer(i) => Value::from(*i),
            StateValue::Float(f) => Value::from(*f),
            StateValue::Text(s) => Value::String(s.clone()),
            StateValue::Structured(v) => v.clone(),
        }
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => StateValue::Null,
            Value::Bool(b) => StateValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => StateValue::Integer(i),
                None => StateValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => StateValue::Text(s),
            other => StateValue::Structured(other),
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::Text(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Integer(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

#[derive(Debug, Default)]
struct StateMap {
    values: BTreeMap<String, StateValue>,
    dump_counter: u32,
}

/// Lock-guarded, file-backed state of one node.
#[derive(Debug)]
pub struct StateStore {
    root: PathBuf,
    dump_interval: u32,
    map: RwLock<StateMap>,
}

impl StateStore {
    /// `dump_interval` is the number of throttled dumps that make one real
    /// write; 0 and 1 both write every time.
    pub fn new(root: impl Into<PathBuf>, dump_interval: u32) -> Self {
        Self {
            root: root.into(),
            dump_interval,
            map: RwLock::new(StateMap::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn read(&self) -> StateReadGuard<'_> {
        StateReadGuard {
            map: self.map.read().await,
        }
    }

    pub async fn write(&self) -> StateWriteGuard<'_> {
        StateWriteGuard {
            store: self,
            map: self.map.write().await,
        }
    }

    pub async fn get(&self, key: &str) -> Option<StateValue> {
        self.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, value: impl Into<StateValue>) {
        self.write().await.set(key, value);
    }

    pub async fn dump(&self, keys: Option<&[&str]>, force: bool) -> Result<(), StateError> {
        self.write().await.dump(keys, force).await
    }

    /// Reads every record under the root into memory, returning how many were found.
    pub async fn load(&self) -> Result<usize, StateError> {
        self.write().await.reload().await
    }
}

/// Shared read access to the state.
pub struct StateReadGuard<'a> {
    map: RwLockReadGuard<'a, StateMap>,
}

impl StateReadGuard<'_> {
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.map.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(StateValue::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.values.keys().map(String::as_str)
    }
}

/// Exclusive access to the state; see the module docs.
pub struct StateWriteGuard<'a> {
    store: &'a StateStore,
    map: RwLockWriteGuard<'a, StateMap>,
}

impl StateWriteGuard<'_> {
    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.map.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(StateValue::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(StateValue::as_f64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.values.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<StateValue>) {
        self.map.values.insert(key.to_string(), value.into());
    }

    /// Sets `key` only if it has no value yet.
    pub fn set_default(&mut self, key: &str, value: impl Into<StateValue>) {
        self.map
            .values
            .entry(key.to_string())
            .or_insert_with(|| value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.map.values.remove(key)
    }

    /// Persists `keys` (all keys when `None`).
    ///
    /// With `force == false` only every `dump_interval`-th call writes.
    pub async fn dump(&mut self, keys: Option<&[&str]>, force: bool) -> Result<(), StateError> {
        if !force {
            if self.map.dump_counter + 1 < self.store.dump_interval {
                self.map.dump_counter += 1;
                return Ok(());
            }
            self.map.dump_counter = 0;
        }

        let root = &self.store.root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| StateError::Io {
                path: root.clone(),
                source,
            })?;

        match keys {
            Some(keys) => {
                for key in keys {
                    match self.map.values.get(*key) {
                        Some(value) => write_record(root, key, value).await?,
                        None => debug!(key, "Skipping dump of unset state key"),
                    }
                }
            }
            None => {
                for (key, value) in &self.map.values {
                    write_record(root, key, value).await?;
                }
            }
        }
        Ok(())
    }

    /// Replaces in-memory values with whatever is persisted; keys without a
    /// record keep their current value.
    pub async fn reload(&mut self) -> Result<usize, StateError> {
        let root = self.store.root.clone();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(StateError::Io { path: root, source }),
        };

        let mut loaded = 0;
        loop {
            let entry = entries.next_entry().await.map_err(|source| StateError::Io {
                path: root.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };

            let file_name = entry.file_name();
            let Some(key) = file_name
                .to_str()
                .and_then(|name| name.strip_suffix(RECORD_EXTENSION))
            else {
                continue;
            };

            let path = entry.path();
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|source| StateError::Io {
                    path: path.clone(),
                    source,
                })?;
            let value: StateValue = serde_json::from_slice(&raw)
                .map_err(|source| StateError::Decode { path, source })?;
            self.map.values.insert(key.to_string(), value);
            loaded += 1;
        }
        debug!(root = %root.display(), loaded, "State loaded");
        Ok(loaded)
    }
}

async fn write_record(root: &Path, key: &str, value: &StateValue) -> Result<(), StateError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StateError::Encode {
        key: key.to_string(),
        source,
    })?;
    let temp = root.join(format!("{TEMP_PREFIX}{key}"));
    let target = root.join(format!("{key}{RECORD_EXTENSION}"));

    tokio::fs::write(&temp, bytes)
        .await
        .map_err(|source| StateError::Io {
            path: temp.clone(),
            source,
        })?;
    tokio::fs::rename(&temp, &target)
        .await
        .map_err(|source| StateError::Io {
            path: target,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dump_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), 1);
        {
            let mut state = store.write().await;
            state.set("message", "hello");
            state.set("delay", 2.5);
            state.set("count", 42_i64);
            state.set("enabled", true);
            state.set("nothing", StateValue::Null);
            state.set("data_state", json!({"a": "0f3c", "b": [1, 2]}));
            state.dump(None, true).await.unwrap();
        }

        // A fresh store over the same directory behaves like a restarted node.
        let restarted = StateStore::new(dir.path(), 1);
        assert_eq!(restarted.load().await.unwrap(), 6);

        let state = restarted.read().await;
        assert_eq!(state.get_str("message"), Some("hello"));
        assert_eq!(state.get("delay"), Some(&StateValue::Float(2.5)));
        assert_eq!(state.get("count"), Some(&StateValue::Integer(42)));
        assert_eq!(state.get("enabled"), Some(&StateValue::Bool(true)));
        assert_eq!(state.get("nothing"), Some(&StateValue::Null));
        assert_eq!(
            state.get("data_state").map(StateValue::to_json),
            Some(json!({"a": "0f3c", "b": [1, 2]}))
        );
    }

    #[tokio::test]
    async fn test_whole_floats_keep_their_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), 1);
        store.set("delay", 60.0).await;
        store.dump(None, true).await.unwrap();

        let restarted = StateStore::new(dir.path(), 1);
        restarted.load().await.unwrap();
        assert_eq!(restarted.get("delay").await, Some(StateValue::Float(60.0)));
    }

    #[tokio::test]
    async fn test_partial_dump_writes_selected_keys_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), 1);
        {
            let mut state = store.write().await;
            state.set("a", 1_i64);
            state.set("b", 2_i64);
            state.dump(Some(&["a", "missing"]), true).await.unwrap();
        }

        assert!(dir.path().join("a.json").exists());
        assert!(!dir.path().join("b.json").exists());
        assert!(!dir.path().join("missing.json").exists());
        assert!(!dir.path().join("tmp_a").exists(), "temp file must be renamed away");
    }

    #[tokio::test]
    async fn test_throttled_dump_writes_every_nth_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), 3);
        let record = dir.path().join("counter.json");

        let mut state = store.write().await;
        for i in 1..=2_i64 {
            state.set("counter", i);
            state.dump(None, false).await.unwrap();
            assert!(!record.exists(), "call {i} should be throttled");
        }
        state.set("counter", 3_i64);
        state.dump(None, false).await.unwrap();
        assert_eq!(std::fs::read_to_string(&record).unwrap(), "3");

        // Forced dumps bypass the throttle.
        state.set("counter", 4_i64);
        state.dump(None, true).await.unwrap();
        assert_eq!(std::fs::read_to_string(&record).unwrap(), "4");
    }

    #[tokio::test]
    async fn test_load_missing_root_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = StateStore::new(dir.path().join("absent"), 1);
        assert_eq!(missing.load().await.unwrap(), 0);

        std::fs::write(dir.path().join("tmp_stale"), "{").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(dir.path().join("kept.json"), "\"value\"").unwrap();

        let store = StateStore::new(dir.path(), 1);
        store.set("untouched", true).await;
        assert_eq!(store.load().await.unwrap(), 1);
        assert_eq!(store.get("kept").await, Some(StateValue::from("value")));
        assert_eq!(store.get("untouched").await, Some(StateValue::Bool(true)));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let store = StateStore::new(dir.path(), 1);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, StateError::Decode { .. }));
    }
}
