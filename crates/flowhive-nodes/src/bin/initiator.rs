// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowhive Initiator - emits a configured message on a timer
//!
//! The message and delay can be changed at runtime with the `set_message`
//! and `set_delay` commands; `trigger` emits immediately.

use std::sync::Arc;

use tracing::{error, info};

use flowhive_core::{LogEmitter, OutputSpec, PeriodicConfig, PeriodicRuntime, ServiceContext};
use flowhive_nodes::{env_or, env_required, init_tracing, run_until_shutdown};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("flowhive_core=info");

    let context = ServiceContext::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let output = env_required("OUTPUT_QUEUE")?;
    let config = PeriodicConfig {
        delay: env_or("INITIATOR_DELAY_SECS", 60.0)?,
        message: env_or("INITIATOR_MESSAGE", String::new())?,
        initiate_on_start: env_or("INITIATOR_ON_START", true)?,
    };

    info!(
        service = %context.identity(),
        output = %output,
        delay_secs = config.delay,
        "Starting initiator"
    );

    let builder = flowhive_core::ServiceRuntime::builder(context).output(OutputSpec::queue(output));
    let node = PeriodicRuntime::new(builder, config, Arc::new(LogEmitter::new("Initial message sent")));
    let service = node.service().clone();
    run_until_shutdown(service, node.run()).await?;

    info!("Shutdown complete");
    Ok(())
}
