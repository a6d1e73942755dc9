use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::broker::{Broker, Consumer, Delivery, Destination};
use crate::communication::{BatchOutcome, InputHandler};
use crate::config::StageSpec;
use crate::envelope::Envelope;
use crate::eof::{EofAction, EofCoordinator, EofPhase};
use crate::error::{ShutdownError, ShutdownResult, ERR_BROKER_PUBLISH};
use crate::prom::{METRIC_CLIENTS_EVICTED, METRIC_EOF_REQUEUES, METRIC_PROCESSING_ERRORS};
use crate::record::{self, Record};
use crate::utils;

/// The backoff before a batch which could not be handled yet is put back on its queue.
const NOT_READY_BACKOFF: Duration = Duration::from_millis(10);
/// How far out to park the requeue timer when no token is waiting.
const IDLE_TIMER: Duration = Duration::from_secs(3600);

/// Receives the input and EOF tokens of a stage replica, driving its handler.
///
/// Deliveries are handled one at a time. Tokens addressed to the replica itself go through a
/// local loopback queue and are handled before any other delivery.
pub struct Receiver<H: InputHandler> {
    stage: Arc<StageSpec>,
    index: u32,
    broker: Arc<dyn Broker>,
    handler: H,
    coordinator: EofCoordinator,
    delimiter: char,
    requeue_delay: Duration,

    /// The consumer of the replica's input queue.
    input: Consumer,
    /// The consumer of the replica's control queue.
    control: Consumer,
    /// Tokens addressed to this replica.
    loopback: VecDeque<Envelope>,
    /// Tokens waiting out the requeue backoff, along with their due time and target replica.
    delayed: Vec<(Instant, u32, Envelope)>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl<H: InputHandler> Receiver<H> {
    /// Create a new instance, consuming the replica's input and control queues.
    ///
    /// The queues must already be declared.
    pub async fn new(
        stage: Arc<StageSpec>, index: u32, broker: Arc<dyn Broker>, handler: H, delimiter: char, requeue_delay: Duration,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        let input = broker
            .consume(&stage.input_queue(index))
            .await
            .context("error consuming stage input queue")?;
        let control = broker
            .consume(&utils::control_queue_name(&stage.name, index))
            .await
            .context("error consuming stage control queue")?;
        tracing::debug!(
            stage = %stage.name,
            replica = index,
            input = %input.queue,
            input_consumer = %input.id,
            control = %control.queue,
            control_consumer = %control.id,
            "consuming stage queues"
        );
        let coordinator = EofCoordinator::new(index, stage.replicas, stage.eof_sources);
        Ok(Self {
            stage,
            index,
            broker,
            handler,
            coordinator,
            delimiter,
            requeue_delay,
            input,
            control,
            loopback: VecDeque::new(),
            delayed: vec![],
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!(stage = %self.stage.name, replica = self.index, "stage replica has started");
        loop {
            let res = match self.loopback.pop_front() {
                Some(envelope) => self.handle_eof(envelope).await,
                None => {
                    let deadline = self.delayed.iter().map(|(due, _, _)| *due).min();
                    let timer = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE_TIMER));
                    tokio::select! {
                        biased;
                        _ = self.shutdown_rx.next() => break,
                        _ = timer, if deadline.is_some() => self.forward_due().await,
                        Some(delivery) = self.control.next() => self.handle_control(delivery).await,
                        Some(delivery) = self.input.next() => self.handle_input(delivery).await,
                        else => break,
                    }
                }
            };
            if let Err(err) = res {
                tracing::error!(error = ?err, stage = %self.stage.name, replica = self.index, "fatal error in stage replica");
                let _ = self.shutdown_tx.send(());
                return Err(err.into());
            }
        }

        tracing::debug!(stage = %self.stage.name, replica = self.index, "stage replica has shutdown");
        Ok(())
    }

    /// Handle a delivery of the input queue.
    #[tracing::instrument(level = "trace", skip(self, delivery), fields(stage = %self.stage.name, replica = self.index))]
    async fn handle_input(&mut self, delivery: Delivery) -> ShutdownResult<()> {
        let envelope = match Envelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "discarding undecodable input message");
                delivery.ack();
                return Ok(());
            }
        };
        let (client_id, message_id, payload) = match envelope {
            Envelope::Protocol {
                client_id,
                message_id,
                payload,
            } => (client_id, message_id, payload),
            eof => {
                self.handle_eof(eof).await?;
                delivery.ack();
                return Ok(());
            }
        };

        if self.coordinator.phase(client_id) == EofPhase::Done {
            tracing::debug!(client_id, message_id, "dropping late message of evicted client");
            delivery.ack();
            return Ok(());
        }
        let records = self.decode_records(client_id, message_id, payload);
        match self.handler.on_batch(client_id, message_id, records).await? {
            BatchOutcome::Handled | BatchOutcome::Duplicate => delivery.ack(),
            BatchOutcome::NotReady => {
                tokio::time::sleep(NOT_READY_BACKOFF).await;
                delivery.nack(true);
            }
        }
        Ok(())
    }

    /// Decode the records of a batch, skipping the ones which can not be decoded.
    fn decode_records(&self, client_id: u32, message_id: u64, payload: Vec<String>) -> Vec<Record> {
        let fields = self.stage.input_fields.as_deref();
        payload
            .iter()
            .filter_map(|line| match record::decode_record(line, fields, self.delimiter) {
                Ok(record) => Some(record),
                Err(err) => {
                    metrics::counter!(METRIC_PROCESSING_ERRORS, 1, "stage" => self.stage.name.clone());
                    tracing::warn!(error = ?err, client_id, message_id, line = %line.escape_debug(), "skipping undecodable record");
                    None
                }
            })
            .collect()
    }

    /// Handle a delivery of the control queue.
    #[tracing::instrument(level = "trace", skip(self, delivery), fields(stage = %self.stage.name, replica = self.index))]
    async fn handle_control(&mut self, delivery: Delivery) -> ShutdownResult<()> {
        match Envelope::decode(&delivery.body) {
            Ok(envelope) if envelope.is_eof() => self.handle_eof(envelope).await?,
            Ok(envelope) => tracing::warn!(client_id = envelope.client_id(), "discarding data message sent to control queue"),
            Err(err) => tracing::warn!(error = %err, "discarding undecodable control message"),
        }
        delivery.ack();
        Ok(())
    }

    /// Run an EOF envelope through the coordinator and apply the resulting actions.
    async fn handle_eof(&mut self, envelope: Envelope) -> ShutdownResult<()> {
        let client_id = envelope.client_id();
        if self.coordinator.should_flush(&envelope) {
            self.handler.on_eof(client_id).await?;
        }
        let counts = self.handler.counts(client_id);
        tracing::trace!(client_id, ?envelope, ?counts, "handling EOF envelope");
        for action in self.coordinator.handle(envelope, counts) {
            self.apply(action).await?;
        }
        Ok(())
    }

    async fn apply(&mut self, action: EofAction) -> ShutdownResult<()> {
        match action {
            EofAction::Forward { to, envelope, delayed: false } => self.forward(to, envelope).await?,
            EofAction::Forward { to, envelope, delayed: true } => {
                metrics::counter!(METRIC_EOF_REQUEUES, 1, "stage" => self.stage.name.clone());
                let base = self.requeue_delay.as_millis() as u64;
                let jitter = rand::thread_rng().gen_range(0..=base);
                let due = Instant::now() + Duration::from_millis(base + jitter);
                self.delayed.push((due, to, envelope));
            }
            EofAction::SendDownstream { client_id, messages_sent } => self.handler.on_drained(client_id, messages_sent).await?,
            EofAction::Broadcast { envelope } => {
                for replica in 0..self.stage.replicas {
                    self.forward(replica, envelope.clone()).await?;
                }
            }
            EofAction::Evict { client_id } => {
                self.handler.evict(client_id).await?;
                metrics::counter!(METRIC_CLIENTS_EVICTED, 1, "stage" => self.stage.name.clone());
                tracing::debug!(client_id, stage = %self.stage.name, replica = self.index, "client evicted");
            }
        }
        Ok(())
    }

    /// Deliver an envelope to the control queue of the given replica.
    async fn forward(&mut self, to: u32, envelope: Envelope) -> ShutdownResult<()> {
        if to == self.index {
            self.loopback.push_back(envelope);
            return Ok(());
        }
        // Only the first EOF of a client has to survive a broker restart.
        let persistent = matches!(envelope, Envelope::EofFirst { .. });
        let destination = Destination::Queue(utils::control_queue_name(&self.stage.name, to));
        self.broker
            .publish(&destination, envelope.encode(), persistent)
            .await
            .with_context(|| format!("{} {}", ERR_BROKER_PUBLISH, destination))
            .map_err(ShutdownError::from)
    }

    /// Forward the delayed tokens which are due.
    async fn forward_due(&mut self) -> ShutdownResult<()> {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed).into_iter().partition(|(at, _, _)| *at <= now);
        self.delayed = waiting;
        for (_, to, envelope) in due {
            self.forward(to, envelope).await?;
        }
        Ok(())
    }
}
