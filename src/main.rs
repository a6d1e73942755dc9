//! The Stagehand stream pipeline.

mod app;
mod broker;
mod communication;
mod config;
mod connection;
mod envelope;
mod eof;
mod error;
#[cfg(test)]
mod fixtures;
mod gateway;
mod processor;
mod prom;
mod record;
#[cfg(test)]
mod record_test;
mod recovery;
mod utils;
#[cfg(test)]
mod utils_test;
mod worker;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true).with_ansi(true).compact())
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    metrics::set_recorder(prom::get_metrics_recorder()).context("error setting prometheus metrics recorder")?;
    prom::register_metrics();

    tracing::info!(
        gateway_port = %cfg.gateway_port,
        metrics_port = %cfg.metrics_port,
        storage_data_path = %cfg.storage_data_path,
        stages = cfg.topology.stages.len(),
        "starting Stagehand",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
