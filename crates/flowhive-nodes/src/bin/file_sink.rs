// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowhive File Sink - appends items to files, retrying failed writes

use std::sync::Arc;

use tracing::{error, info};

use flowhive_core::{InputSpec, RetryEngine, ServiceContext, ServiceRuntime, SinkNode};
use flowhive_nodes::{FileStore, SavingMode, env_or, env_required, init_tracing, run_until_shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("flowhive_core=info");

    let context = ServiceContext::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let input = env_required("INPUT_QUEUE")?;
    let template = env_required("FILE_PATH_TEMPLATE")?;
    let key_fields: Vec<String> = env_or("FILE_KEY_FIELDS", "id".to_string())?
        .split(',')
        .map(|field| field.trim().to_string())
        .filter(|field| !field.is_empty())
        .collect();
    let mode: SavingMode = env_or("FILE_SAVING_MODE", SavingMode::default())?;

    let last_dir = context.config.state_dir.join("last");
    let store = Arc::new(FileStore::new(template, key_fields, mode, last_dir)?);

    info!(
        service = %context.identity(),
        input = %input,
        mode = ?mode,
        "Starting file sink"
    );

    let builder = ServiceRuntime::builder(context).input(InputSpec::queue(input));
    let (node, _sink) = SinkNode::node(builder, store, RetryEngine::default_generations())?;
    let service = node.service().clone();
    run_until_shutdown(service, node.run()).await?;

    info!("Shutdown complete");
    Ok(())
}
