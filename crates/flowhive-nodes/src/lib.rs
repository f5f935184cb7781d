// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowhive Nodes - ready-made pipeline stages
//!
//! | Binary | Node | Role |
//! |--------|------|------|
//! | `flowhive-initiator` | [`PeriodicRuntime`](flowhive_core::PeriodicRuntime) + [`LogEmitter`](flowhive_core::LogEmitter) | Starts a pipeline on a timer |
//! | `flowhive-diff-finder` | [`DiffFinder`] | Forwards only items whose content changed |
//! | `flowhive-file-sink` | [`FileStore`] in a [`SinkNode`](flowhive_core::SinkNode) | Appends items to files, retrying failed writes |
//!
//! Besides the runtime variables (`FLOW_NAME`, `SERVICE_NAME`, broker and
//! state settings), each binary reads its own:
//!
//! | Variable | Binary | Default | Description |
//! |----------|--------|---------|-------------|
//! | `OUTPUT_QUEUE` | initiator, diff finder | - | Queue to publish to |
//! | `INPUT_QUEUE` | diff finder, file sink | - | Queue to consume |
//! | `INITIATOR_MESSAGE` | initiator | empty | Message emitted |
//! | `INITIATOR_DELAY_SECS` | initiator | `60` | Seconds between emissions |
//! | `INITIATOR_ON_START` | initiator | `true` | Emit right after start |
//! | `ID_FIELD` | diff finder | `id` | Field identifying an item |
//! | `FILE_PATH_TEMPLATE` | file sink | - | Output path, `{}` replaced by key fields |
//! | `FILE_KEY_FIELDS` | file sink | `id` | Comma-separated fields filling the template |
//! | `FILE_SAVING_MODE` | file sink | `append_skip_on_repeat` | `append_skip_on_repeat`, `append` or `rewrite` |

pub mod diff;
pub mod file_store;

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use flowhive_core::ServiceRuntime;
use flowhive_core::protocol::Command;

pub use diff::{DATA_STATE_KEY, DiffFinder, content_hash};
pub use file_store::{FileStore, SavingMode};

/// Loads `.env` and installs the fmt subscriber with `directive` on top of
/// `RUST_LOG`.
pub fn init_tracing(directive: &str) {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match directive.parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Required environment variable.
pub fn env_required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} must be set"))
}

/// Optional environment variable parsed as `T`.
pub fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{name} has an invalid value {raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Drives `run` to completion; Ctrl-C is turned into a `shutdown` command so
/// the node persists its state before exiting.
pub async fn run_until_shutdown<F>(service: Arc<ServiceRuntime>, run: F) -> anyhow::Result<()>
where
    F: Future<Output = flowhive_core::Result<()>>,
{
    tokio::pin!(run);
    tokio::select! {
        result = &mut run => return Ok(result?),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, shutting down");
            service.execute(&Command::shutdown()).await;
        }
    }
    run.await?;
    Ok(())
}
