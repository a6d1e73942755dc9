//! The per-client processing harness of a stage replica.
//!
//! Each batch goes through the recovery log as START, SENT, SAVE and COMMIT around the
//! processing and publication of its outputs, so that a restarted replica neither loses nor
//! double counts a message.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::communication::{BatchOutcome, InputHandler, Sender};
use crate::config::StageSpec;
use crate::eof::ClientCounts;
use crate::error::{ShutdownError, ShutdownResult};
use crate::processor::{Processor, ProcessorFactory, Response};
use crate::prom::{METRIC_DUPLICATES_DROPPED, METRIC_MESSAGES_RECEIVED, METRIC_MESSAGES_SENT, METRIC_PROCESSING_ERRORS};
use crate::record::Record;
use crate::recovery::{DuplicateCatcher, DurableLog, RestoreState, SavedState};

/// The high bit marks message IDs reserved for the outputs of a processor flush.
const FLUSH_ID_FLAG: u64 = 1 << 63;

/// The processing state of one client on one replica.
pub struct ClientContext {
    processor: Box<dyn Processor>,
    duplicates: DuplicateCatcher,
    /// Unique messages received from upstream.
    received: u64,
    /// The processor snapshot as of the last completed message.
    last_snapshot: Option<Vec<u8>>,
    /// The count of flush outputs published, used to mint their message IDs.
    flushes: u32,
}

/// The input handler of a stage replica, running each client's processor.
pub struct Connection {
    stage: Arc<StageSpec>,
    index: u32,
    factory: ProcessorFactory,
    sender: Sender,
    log: DurableLog,
    /// State restored from the log, handed to clients as their contexts are created.
    restored: RestoreState,
    contexts: HashMap<u32, ClientContext>,
}

impl Connection {
    /// Create a new instance.
    pub fn new(stage: Arc<StageSpec>, index: u32, factory: ProcessorFactory, sender: Sender, log: DurableLog, restored: RestoreState) -> Self {
        Self {
            stage,
            index,
            factory,
            sender,
            log,
            restored,
            contexts: Default::default(),
        }
    }

    /// Get the context of the given client, creating it from any restored state.
    fn context(&mut self, client_id: u32) -> ShutdownResult<&mut ClientContext> {
        if !self.contexts.contains_key(&client_id) {
            let restored = self.restored.take_client(client_id);
            let mut processor = (self.factory)(client_id);
            if let Some(snapshot) = restored.snapshot.as_ref() {
                processor
                    .restore(snapshot)
                    .context("error restoring processor from its snapshot")
                    .map_err(ShutdownError::from)?;
            }
            if restored.received > 0 || restored.sent > 0 {
                tracing::debug!(client_id, received = restored.received, sent = restored.sent, "client restored from recovery log");
            }
            self.sender.set_messages_sent(client_id, restored.sent);
            let context = ClientContext {
                processor,
                duplicates: DuplicateCatcher::new(restored.duplicates),
                received: restored.received,
                last_snapshot: restored.snapshot,
                flushes: 0,
            };
            self.contexts.insert(client_id, context);
        }
        self.contexts
            .get_mut(&client_id)
            .context("client context vanished")
            .map_err(ShutdownError::from)
    }

    /// Publish the outputs of a message and record its completion in the log.
    async fn publish(&mut self, client_id: u32, message_id: u64, outputs: Vec<Record>) -> ShutdownResult<u64> {
        self.log.start(message_id, client_id).await?;
        let published = self
            .sender
            .send_all(client_id, message_id, &outputs)
            .await
            .map_err(ShutdownError::from)?;
        self.log.sent(message_id, client_id, published).await?;

        let sent = self.sender.messages_sent(client_id);
        let context = self.context(client_id)?;
        let snapshot = context.processor.snapshot().map_err(ShutdownError::from)?;
        context.last_snapshot = snapshot.clone();
        let state = SavedState {
            received: context.received,
            sent,
            processor: snapshot,
        };
        self.log.save(message_id, client_id, state).await?;
        self.log.commit(message_id, client_id).await?;
        if published > 0 {
            metrics::counter!(METRIC_MESSAGES_SENT, published, "stage" => self.stage.name.clone());
        }
        Ok(published)
    }
}

#[async_trait]
impl InputHandler for Connection {
    #[tracing::instrument(level = "trace", skip(self, records), fields(stage = %self.stage.name, replica = self.index))]
    async fn on_batch(&mut self, client_id: u32, message_id: u64, records: Vec<Record>) -> ShutdownResult<BatchOutcome> {
        let stage_name = self.stage.name.clone();
        let factory = self.factory.clone();
        let context = self.context(client_id)?;
        if context.duplicates.is_duplicate(message_id) {
            metrics::counter!(METRIC_DUPLICATES_DROPPED, 1, "stage" => stage_name);
            tracing::debug!(client_id, message_id, "discarding duplicate message");
            return Ok(BatchOutcome::Duplicate);
        }

        let mut outputs = vec![];
        for record in records {
            match context.processor.process(record) {
                Ok(Response::NotReady) => {
                    // Undo the partial batch, it will be processed again from the start.
                    context.duplicates.forget(message_id);
                    match context.last_snapshot.as_ref() {
                        Some(snapshot) => context.processor.restore(snapshot).map_err(ShutdownError::from)?,
                        None => context.processor = factory(client_id),
                    }
                    tracing::debug!(client_id, message_id, "processor not ready, message will be retried");
                    return Ok(BatchOutcome::NotReady);
                }
                Ok(response) => outputs.extend(response.into_records()),
                Err(err) => {
                    metrics::counter!(METRIC_PROCESSING_ERRORS, 1, "stage" => stage_name.clone());
                    tracing::warn!(error = ?err, client_id, message_id, "error processing record, skipping");
                }
            }
        }
        context.received += 1;
        metrics::counter!(METRIC_MESSAGES_RECEIVED, 1, "stage" => stage_name);

        self.publish(client_id, message_id, outputs).await?;
        Ok(BatchOutcome::Handled)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(stage = %self.stage.name, replica = self.index))]
    async fn on_eof(&mut self, client_id: u32) -> ShutdownResult<()> {
        let (stage_name, index) = (self.stage.name.clone(), self.index);
        let context = self.context(client_id)?;
        let outputs = match context.processor.finish_processing() {
            Ok(Some(Response::NotReady)) => {
                tracing::warn!(client_id, "processor not ready at end of input, dropping its flush");
                vec![]
            }
            Ok(Some(response)) => response.into_records(),
            Ok(None) => vec![],
            Err(err) => {
                metrics::counter!(METRIC_PROCESSING_ERRORS, 1, "stage" => stage_name);
                tracing::warn!(error = ?err, client_id, "error flushing processor");
                vec![]
            }
        };
        if outputs.is_empty() {
            return Ok(());
        }
        context.flushes += 1;
        let message_id = FLUSH_ID_FLAG | (u64::from(index) << 32) | u64::from(context.flushes);
        let published = self.publish(client_id, message_id, outputs).await?;
        tracing::debug!(client_id, published, "processor flushed");
        Ok(())
    }

    fn counts(&self, client_id: u32) -> ClientCounts {
        match self.contexts.get(&client_id) {
            Some(context) => ClientCounts {
                received: context.received,
                sent: self.sender.messages_sent(client_id),
            },
            None => ClientCounts {
                received: self.restored.messages_received.get(&client_id).copied().unwrap_or(0),
                sent: self.restored.messages_sent.get(&client_id).copied().unwrap_or(0),
            },
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(stage = %self.stage.name, replica = self.index))]
    async fn on_drained(&mut self, client_id: u32, messages_sent: u64) -> ShutdownResult<()> {
        self.sender.set_messages_sent(client_id, messages_sent);
        if self.stage.suppress_eof {
            tracing::debug!(client_id, "stage suppresses EOF, not propagating");
            return Ok(());
        }
        self.sender.send_eof(client_id).await.map_err(ShutdownError::from)
    }

    async fn evict(&mut self, client_id: u32) -> ShutdownResult<()> {
        if let Some(context) = self.contexts.remove(&client_id) {
            tracing::debug!(client_id, seen = context.duplicates.len(), "evicting client context");
        }
        let _ = self.restored.take_client(client_id);
        self.sender.forget_client(client_id);
        self.log.purge_client(client_id).await
    }
}
