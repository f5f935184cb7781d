// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowhive Diff Finder - forwards items only when their content changed

use std::sync::Arc;

use tracing::{error, info};

use flowhive_core::{InputSpec, NodeRuntime, OutputSpec, ServiceContext, ServiceRuntime};
use flowhive_nodes::{DiffFinder, env_or, env_required, init_tracing, run_until_shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("flowhive_core=info");

    let context = ServiceContext::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let input = env_required("INPUT_QUEUE")?;
    let output = env_required("OUTPUT_QUEUE")?;
    let id_field: String = env_or("ID_FIELD", "id".to_string())?;

    info!(
        service = %context.identity(),
        input = %input,
        output = %output,
        id_field = %id_field,
        "Starting diff finder"
    );

    let builder = ServiceRuntime::builder(context)
        .input(InputSpec::queue(input))
        .output(OutputSpec::queue(output));
    let node = NodeRuntime::new(builder, Arc::new(DiffFinder::new(id_field)))?;
    let service = node.service().clone();
    run_until_shutdown(service, node.run()).await?;

    info!("Shutdown complete");
    Ok(())
}
