//! Shared test fixtures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::broker::Consumer;
use crate::config::{InputSpec, OutputSpec, StageSpec};
use crate::envelope::Envelope;
use crate::processor::{Processor, ProcessorFactory, ProcessorKind, Response};
use crate::record::Record;

/// Build a stage reading a queue.
pub fn queue_stage(name: &str, replicas: u32, input: &str, output: Option<&str>, processor: ProcessorKind) -> StageSpec {
    StageSpec {
        name: name.into(),
        replicas,
        input: InputSpec::Queue { name: input.into() },
        input_fields: None,
        output: output.map(|name| OutputSpec::Queue { name: name.into() }),
        output_fields: None,
        processor,
        suppress_eof: false,
        eof_sources: 1,
    }
}

/// A processor tagging every record, so that its outputs are recognizable.
pub fn tagger() -> ProcessorKind {
    ProcessorKind::Tag {
        field: "seen".into(),
        value: "yes".into(),
    }
}

/// Encode a batch of lines for the given client.
pub fn batch(client_id: u32, message_id: u64, lines: &[&str]) -> Bytes {
    Envelope::Protocol {
        client_id,
        message_id,
        payload: lines.iter().map(|line| line.to_string()).collect(),
    }
    .encode()
}

/// Wait for the next delivery of the given consumer, acking it and decoding its envelope.
pub async fn next_envelope(consumer: &mut Consumer) -> Result<Envelope> {
    let delivery = tokio::time::timeout(Duration::from_secs(5), consumer.next())
        .await
        .context("timeout waiting for delivery")?
        .context("expected a delivery")?;
    let envelope = Envelope::decode(&delivery.body)?;
    delivery.ack();
    Ok(envelope)
}

/// A processor which is not ready for the first `waits` records it is given, across all of
/// its instances, and passes records through after that.
pub struct Gated {
    waits: Arc<AtomicUsize>,
    seen: Vec<Record>,
}

impl Gated {
    pub fn factory(waits: Arc<AtomicUsize>) -> ProcessorFactory {
        Arc::new(move |_: u32| -> Box<dyn Processor> {
            Box::new(Gated {
                waits: waits.clone(),
                seen: vec![],
            })
        })
    }
}

impl Processor for Gated {
    fn process(&mut self, record: Record) -> Result<Response> {
        let gated = self
            .waits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |waits| waits.checked_sub(1))
            .is_ok();
        if gated {
            return Ok(Response::NotReady);
        }
        self.seen.push(record.clone());
        Ok(Response::Single(record))
    }

    fn finish_processing(&mut self) -> Result<Option<Response>> {
        Ok(None)
    }

    fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(serde_json::to_vec(&self.seen)?))
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        self.seen = serde_json::from_slice(snapshot)?;
        Ok(())
    }
}
