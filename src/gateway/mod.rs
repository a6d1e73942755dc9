//! The client facing TCP gateway.
//!
//! Each connection is a client, given a fresh ID. Its dataset batches are published into the
//! pipeline and its results are streamed back over the same socket by the results stage.

mod codec;
mod ids;
mod results;
#[cfg(test)]
mod ids_test;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::broker::Broker;
use crate::communication::Sender;
use crate::config::Config;
use crate::error::AppError;
use crate::prom::METRIC_CLIENTS_CONNECTED;
use self::ids::ClientIds;

pub use self::codec::{Frame, FrameReader, FRAME_TERMINATOR};
pub use self::results::{ResultForwarder, ResultRegistry};

/// The TCP server accepting client connections.
pub struct Gateway {
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    registry: ResultRegistry,
    listener: TcpListener,
    /// The source of client IDs.
    ids: ClientIds,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Gateway {
    /// Create a new instance, bound to the given address.
    pub async fn new(
        config: Arc<Config>, broker: Arc<dyn Broker>, registry: ResultRegistry, addr: SocketAddr, shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        let ids = ClientIds::open(config.client_ids_path()).await?;
        let listener = TcpListener::bind(addr).await.with_context(|| format!("error binding gateway to {}", addr))?;
        Ok(Self {
            config,
            broker,
            registry,
            listener,
            ids,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        })
    }

    /// The address the gateway is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("error getting gateway address")
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "gateway is listening for clients");
        loop {
            tokio::select! {
                _ = self.shutdown_rx.next() => break,
                res = self.listener.accept() => match res {
                    Ok((socket, peer)) => self.spawn_session(socket, peer).await,
                    Err(err) => tracing::warn!(error = ?err, "error accepting client connection"),
                },
            }
        }
        tracing::debug!("gateway has shutdown");
        Ok(())
    }

    async fn spawn_session(&mut self, socket: TcpStream, peer: SocketAddr) {
        let client_id = match self.ids.next_id().await {
            Ok(client_id) => client_id,
            Err(err) => {
                tracing::error!(error = ?err, %peer, "error assigning client id, dropping client");
                return;
            }
        };
        metrics::counter!(METRIC_CLIENTS_CONNECTED, 1);
        tracing::info!(client_id, %peer, "client connected");
        let (read_half, write_half) = socket.into_split();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        match self.registry.lock() {
            Ok(mut registry) => {
                registry.insert(client_id, writer_tx);
            }
            Err(_) => {
                tracing::error!(client_id, "result registry mutex poisoned, dropping client");
                return;
            }
        }
        tokio::spawn(write_frames(client_id, write_half, writer_rx, self.registry.clone(), self.shutdown_tx.subscribe()));

        let session = Session {
            client_id,
            config: self.config.clone(),
            broker: self.broker.clone(),
            registry: self.registry.clone(),
            senders: HashMap::new(),
            next_message_id: 0,
            ended: HashSet::new(),
        };
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = session.run(FrameReader::new(read_half), shutdown).await {
                tracing::warn!(client_id, error = ?err, "client session ended with error");
            }
        });
    }
}

/// The inbound side of a client connection.
struct Session {
    client_id: u32,
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    /// Holds the client's writer until its results are all sent.
    registry: ResultRegistry,
    /// The publishers of each dataset kind.
    senders: HashMap<u8, Sender>,
    /// The ID of the next batch read from the client.
    next_message_id: u64,
    /// The dataset kinds which the client has ended.
    ended: HashSet<u8>,
}

impl Session {
    async fn run(mut self, mut reader: FrameReader<OwnedReadHalf>, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let res = self.read_datasets(&mut reader, shutdown).await;
        if self.ended.len() < self.config.topology.gateway.inputs.len() {
            // The client is gone before its results could be produced, so is its writer.
            if let Ok(mut registry) = self.registry.lock() {
                registry.remove(&self.client_id);
            }
        }
        res
    }

    async fn read_datasets(&mut self, reader: &mut FrameReader<OwnedReadHalf>, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut shutdown = BroadcastStream::new(shutdown);
        let timeout = self.config.client_read_timeout();
        let expected = self.config.topology.gateway.inputs.len();
        while self.ended.len() < expected {
            let frame = tokio::select! {
                _ = shutdown.next() => return Ok(()),
                res = tokio::time::timeout(timeout, reader.next_frame()) => match res {
                    Ok(frame) => frame?,
                    Err(_) => {
                        tracing::info!(client_id = self.client_id, ?timeout, "client idle for too long, closing");
                        return Ok(());
                    }
                },
            };
            match frame {
                Some(frame) => self.handle_frame(frame).await?,
                None => {
                    tracing::info!(client_id = self.client_id, "client closed connection before ending its datasets");
                    return Ok(());
                }
            }
        }
        tracing::debug!(client_id = self.client_id, "client ended all datasets, awaiting results");
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Batch { kind, records } => {
                if self.ended.contains(&kind) {
                    bail!(AppError::InvalidInput(format!("batch of kind {} received after its EOF", kind)));
                }
                let message_id = self.next_message_id;
                self.next_message_id += 1;
                let client_id = self.client_id;
                self.sender(kind)?.send_lines(client_id, message_id, records).await?;
            }
            Frame::Eof { kind } => {
                if !self.ended.insert(kind) {
                    tracing::warn!(client_id = self.client_id, kind, "duplicate EOF from client, ignoring");
                    return Ok(());
                }
                let client_id = self.client_id;
                self.sender(kind)?.send_eof(client_id).await?;
                tracing::debug!(client_id, kind, "client dataset ended");
            }
            Frame::Done | Frame::Results { .. } => {
                bail!(AppError::InvalidInput("clients may not send result frames".into()));
            }
        }
        Ok(())
    }

    /// The publisher of the given dataset kind.
    fn sender(&mut self, kind: u8) -> Result<&mut Sender> {
        if !self.senders.contains_key(&kind) {
            let input = self
                .config
                .topology
                .gateway
                .inputs
                .iter()
                .find(|input| input.kind == kind)
                .ok_or_else(|| anyhow!(AppError::InvalidInput(format!("unknown dataset kind {}", kind))))?;
            let sender = Sender::new(self.broker.clone(), format!("gateway.{}", kind), Some(input.output.clone()), None, self.config.delimiter);
            self.senders.insert(kind, sender);
        }
        self.senders.get_mut(&kind).context("sender vanished")
    }
}

/// Write the frames of the given client to its socket until every writer is dropped.
async fn write_frames(
    client_id: u32, mut socket: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Vec<u8>>, registry: ResultRegistry,
    shutdown: broadcast::Receiver<()>,
) {
    let mut shutdown = BroadcastStream::new(shutdown);
    loop {
        let frame = tokio::select! {
            _ = shutdown.next() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = socket.write_all(&frame).await {
            tracing::warn!(client_id, error = ?err, "error writing to client, closing");
            break;
        }
    }
    if let Ok(mut registry) = registry.lock() {
        registry.remove(&client_id);
    }
    let _ = socket.shutdown().await;
    tracing::info!(client_id, "client connection closed");
}
