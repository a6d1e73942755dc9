//! Assembly of stage replicas.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::broker::{Broker, ExchangeKind};
use crate::communication::{Receiver, Sender};
use crate::config::{Config, InputSpec, OutputSpec, StageSpec};
use crate::connection::Connection;
use crate::gateway::ResultRegistry;
use crate::processor::{self, ProcessorFactory};
use crate::recovery::{self, DurableLog};
use crate::utils;

/// Declare the broker resources an output publishes into.
pub async fn declare_output(broker: &dyn Broker, output: &OutputSpec) -> Result<()> {
    match output {
        OutputSpec::Queue { name } => broker.declare_queue(name).await,
        OutputSpec::Fanout { exchange } => broker.declare_exchange(exchange, ExchangeKind::Fanout).await,
        OutputSpec::Topic { exchange, .. } => broker.declare_exchange(exchange, ExchangeKind::Topic).await,
    }
}

/// Declare the input, control queues and output of a stage.
///
/// Topic inputs get a private queue per replica, bound with the replica's index.
pub async fn declare_stage(broker: &dyn Broker, stage: &StageSpec) -> Result<()> {
    match &stage.input {
        InputSpec::Queue { name } => broker.declare_queue(name).await?,
        InputSpec::Fanout { exchange } => {
            broker.declare_exchange(exchange, ExchangeKind::Fanout).await?;
            let queue = stage.input_queue(0);
            broker.declare_queue(&queue).await?;
            broker.bind_queue(&queue, exchange, "").await?;
        }
        InputSpec::Topic { exchange } => {
            broker.declare_exchange(exchange, ExchangeKind::Topic).await?;
            for index in 0..stage.replicas {
                let queue = stage.input_queue(index);
                broker.declare_queue(&queue).await?;
                broker.bind_queue(&queue, exchange, &index.to_string()).await?;
            }
        }
    }
    for index in 0..stage.replicas {
        broker.declare_queue(&utils::control_queue_name(&stage.name, index)).await?;
    }
    if let Some(output) = &stage.output {
        declare_output(broker, output).await?;
    }
    tracing::debug!(stage = %stage.name, replicas = stage.replicas, "stage declared");
    Ok(())
}

/// Spawn every replica of a stage, whose resources must already be declared.
pub async fn spawn_stage(
    config: &Config, stage: Arc<StageSpec>, broker: Arc<dyn Broker>, results: Option<ResultRegistry>, shutdown_tx: broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<Result<()>>>> {
    let factory = processor::factory(&stage.processor, results).with_context(|| format!("error building processor of stage {}", stage.name))?;
    let mut handles = Vec::with_capacity(stage.replicas as usize);
    for index in 0..stage.replicas {
        let handle = spawn_replica(config, stage.clone(), index, broker.clone(), factory.clone(), shutdown_tx.clone()).await?;
        handles.push(handle);
    }
    Ok(handles)
}

/// Spawn one replica of a stage, restoring its state from its recovery log.
#[tracing::instrument(level = "debug", skip(config, stage, broker, factory, shutdown_tx), fields(stage = %stage.name))]
pub async fn spawn_replica(
    config: &Config, stage: Arc<StageSpec>, index: u32, broker: Arc<dyn Broker>, factory: ProcessorFactory, shutdown_tx: broadcast::Sender<()>,
) -> Result<JoinHandle<Result<()>>> {
    let log = DurableLog::open(config.log_path(&stage.name, index)).await?;
    if let Some(point) = log.restore().await? {
        tracing::info!(
            index,
            restore_type = ?point.restore_type,
            message_id = point.message_id,
            client_id = point.client_id,
            "resuming from recovery log"
        );
    }
    let restored = recovery::restore(&log)
        .await
        .with_context(|| format!("error restoring replica {} of stage {}", index, stage.name))?;
    let sender = Sender::new(broker.clone(), stage.name.clone(), stage.output.clone(), stage.output_fields.clone(), config.delimiter);
    let connection = Connection::new(stage.clone(), index, factory, sender, log, restored);
    let receiver = Receiver::new(stage, index, broker, connection, config.delimiter, config.eof_requeue_delay(), shutdown_tx).await?;
    Ok(receiver.spawn())
}
