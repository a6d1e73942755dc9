use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::broker::{Broker, MemoryBroker};
use crate::config::Config;
use crate::gateway::{Gateway, ResultRegistry};
use crate::prom::spawn_prom_server;
use crate::worker;

/// The application object, running the whole pipeline in one process.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The broker connecting the stages.
    _broker: Arc<dyn Broker>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handles of every stage replica, along with their stage names.
    replicas: Vec<(String, JoinHandle<Result<()>>)>,
    /// The join handle of the client gateway.
    gateway: JoinHandle<Result<()>>,
    /// The join handle of the metrics server.
    metrics_server: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    ///
    /// Every broker resource of the topology is declared before any replica starts.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(10);
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(config.channel_capacity));

        let topology = &config.topology;
        let results = Arc::new(topology.results_stage());
        let stages: Vec<_> = topology.stages.iter().cloned().map(Arc::new).chain(std::iter::once(results)).collect();
        for stage in stages.iter() {
            worker::declare_stage(&*broker, stage)
                .await
                .with_context(|| format!("error declaring resources of stage {}", stage.name))?;
        }
        for input in topology.gateway.inputs.iter() {
            worker::declare_output(&*broker, &input.output).await.context("error declaring gateway output")?;
        }

        let registry = ResultRegistry::default();
        let mut replicas = vec![];
        for stage in stages {
            let handles = worker::spawn_stage(&config, stage.clone(), broker.clone(), Some(registry.clone()), shutdown_tx.clone())
                .await
                .with_context(|| format!("error spawning stage {}", stage.name))?;
            replicas.extend(handles.into_iter().map(|handle| (stage.name.clone(), handle)));
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], config.gateway_port));
        let gateway = Gateway::new(config.clone(), broker.clone(), registry, addr, shutdown_tx.clone())
            .await
            .context("error setting up client gateway")?
            .spawn();
        let metrics_server = spawn_prom_server(&config, shutdown_tx.subscribe());

        Ok(Self {
            _config: config,
            _broker: broker,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            replicas,
            gateway,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("stagehand is shutting down");
        for (stage, handle) in self.replicas {
            if let Err(err) = handle.await.context("error joining stage replica handle").and_then(|res| res) {
                tracing::error!(error = ?err, %stage, "error shutting down stage replica");
            }
        }
        if let Err(err) = self.gateway.await.context("error joining gateway handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down client gateway");
        }
        if let Err(err) = self.metrics_server.await.context("error joining metrics server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down metrics server");
        }

        tracing::debug!("stagehand shutdown complete");
        Ok(())
    }
}
