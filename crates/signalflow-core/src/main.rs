// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! signalflow - standalone signal engine process
//!
//! Connects to the configured database, resets stale registry entries and keeps the
//! engine running until Ctrl-C. Nodes are declared by embedding applications sharing
//! the same database.

use anyhow::Result;
use tracing::{error, info};

use signalflow_core::config::Config;
use signalflow_core::runtime::SignalRuntime;
use signalflow_core::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    telemetry::init_tracing();

    info!("Starting signalflow");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        checkpoint_interval_secs = config.checkpoint_interval.map(|d| d.as_secs()),
        max_connections = config.max_connections,
        audit_switches = config.audit_switches,
        "Configuration loaded"
    );

    let runtime = SignalRuntime::from_config(&config).await?;

    info!(runtime_id = %runtime.runtime_id(), "signalflow initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
