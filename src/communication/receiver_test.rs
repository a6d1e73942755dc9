use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::broker::{Broker, Destination, MemoryBroker};
use crate::communication::{BatchOutcome, InputHandler, Receiver};
use crate::config::{Config, Topology};
use crate::envelope::Envelope;
use crate::eof::ClientCounts;
use crate::error::ShutdownResult;
use crate::fixtures::{self, next_envelope, Gated};
use crate::record::Record;
use crate::worker;

/// The events seen by a test handler.
#[derive(Default)]
struct Seen {
    batches: Vec<(u32, u64)>,
    eofs: Vec<u32>,
    drained: Vec<(u32, u64)>,
    evicted: Vec<u32>,
}

/// A handler recording what it is given, which is not ready for the first `not_ready` batches.
struct Recorder {
    seen: Arc<Mutex<Seen>>,
    not_ready: usize,
    received: u64,
}

#[async_trait]
impl InputHandler for Recorder {
    async fn on_batch(&mut self, client_id: u32, message_id: u64, _records: Vec<Record>) -> ShutdownResult<BatchOutcome> {
        let mut seen = self.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        seen.batches.push((client_id, message_id));
        if self.not_ready > 0 {
            self.not_ready -= 1;
            return Ok(BatchOutcome::NotReady);
        }
        self.received += 1;
        Ok(BatchOutcome::Handled)
    }

    async fn on_eof(&mut self, client_id: u32) -> ShutdownResult<()> {
        self.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.eofs.push(client_id);
        Ok(())
    }

    fn counts(&self, _client_id: u32) -> ClientCounts {
        ClientCounts {
            received: self.received,
            sent: 0,
        }
    }

    async fn on_drained(&mut self, client_id: u32, messages_sent: u64) -> ShutdownResult<()> {
        self.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.drained.push((client_id, messages_sent));
        Ok(())
    }

    async fn evict(&mut self, client_id: u32) -> ShutdownResult<()> {
        self.seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.evicted.push(client_id);
        Ok(())
    }
}

/// Poll the given condition until it holds, failing after a few seconds.
async fn eventually(mut cond: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("condition not met in time")
}

#[tokio::test]
async fn not_ready_batches_are_redelivered_then_drained() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new(10));
    let stage = Arc::new(fixtures::queue_stage("solo", 1, "solo-in", None, fixtures::tagger()));
    worker::declare_stage(&*broker, &stage).await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    let seen = Arc::new(Mutex::new(Seen::default()));
    let handler = Recorder {
        seen: seen.clone(),
        not_ready: 2,
        received: 0,
    };
    let receiver = Receiver::new(stage, 0, broker.clone(), handler, ',', Duration::from_millis(1), shutdown_tx.clone()).await?;
    let handle = receiver.spawn();

    let input = Destination::Queue("solo-in".into());
    broker.publish(&input, fixtures::batch(9, 100, &["a"]), true).await?;
    broker.publish(&input, Envelope::EofFirst { client_id: 9, messages_sent: 1 }.encode(), true).await?;

    eventually(|| seen.lock().map(|seen| !seen.evicted.is_empty()).unwrap_or(false)).await?;
    {
        let seen = seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        assert_eq!(seen.batches, vec![(9, 100); 3], "expected the batch to be redelivered twice, got {:?}", seen.batches);
        assert_eq!(seen.eofs, vec![9], "expected one flush");
        assert_eq!(seen.drained, vec![(9, 0)], "expected one drain with nothing sent, got {:?}", seen.drained);
        assert_eq!(seen.evicted, vec![9]);
    }
    assert_eq!(broker.queue_len("solo-in").await?, 0, "expected every input delivery to be settled");

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}

#[tokio::test]
async fn three_replicas_forward_all_data_before_eof() -> Result<()> {
    let stage = fixtures::queue_stage("tagging", 3, "tag-in", Some("tag-out"), fixtures::tagger());
    let (config, _tmpdir) = Config::new_test(Topology {
        stages: vec![stage.clone()],
        ..Default::default()
    })?;
    let broker = Arc::new(MemoryBroker::new(100));
    worker::declare_stage(&*broker, &stage).await?;
    let mut output = broker.consume("tag-out").await?;
    let (shutdown_tx, _) = broadcast::channel(1);
    let handles = worker::spawn_stage(&config, Arc::new(stage), broker.clone(), None, shutdown_tx.clone()).await?;

    let input = Destination::Queue("tag-in".into());
    for message_id in 0..30u64 {
        broker.publish(&input, fixtures::batch(42, message_id, &["x"]), true).await?;
    }
    broker.publish(&input, Envelope::EofFirst { client_id: 42, messages_sent: 30 }.encode(), true).await?;

    let mut data = 0;
    loop {
        match next_envelope(&mut output).await? {
            Envelope::Protocol { client_id, payload, .. } => {
                assert_eq!(client_id, 42);
                assert_eq!(payload, vec!["x,yes".to_string()], "expected tagged record, got {:?}", payload);
                data += 1;
            }
            Envelope::EofFirst { client_id, messages_sent } => {
                assert_eq!(client_id, 42);
                assert_eq!(messages_sent, 30, "expected downstream EOF to carry the stage total, got {}", messages_sent);
                break;
            }
            other => bail!("unexpected envelope downstream {:?}", other),
        }
    }
    assert_eq!(data, 30, "expected every data message before the EOF, got {}", data);

    let _ = shutdown_tx.send(());
    for handle in handles {
        handle.await??;
    }
    Ok(())
}

#[tokio::test]
async fn not_ready_processor_rolls_back_and_completes() -> Result<()> {
    let stage = Arc::new(fixtures::queue_stage("gated", 1, "gated-in", Some("gated-out"), fixtures::tagger()));
    let (config, _tmpdir) = Config::new_test(Topology::default())?;
    let broker = Arc::new(MemoryBroker::new(10));
    worker::declare_stage(&*broker, &stage).await?;
    let mut output = broker.consume("gated-out").await?;
    let (shutdown_tx, _) = broadcast::channel(1);

    // The second batch is not ready twice, so it is rolled back and redelivered twice.
    let waits = Arc::new(AtomicUsize::new(0));
    let handle = worker::spawn_replica(&config, stage, 0, broker.clone(), Gated::factory(waits.clone()), shutdown_tx.clone()).await?;
    let input = Destination::Queue("gated-in".into());
    broker.publish(&input, fixtures::batch(5, 1, &["first"]), true).await?;
    next_envelope(&mut output).await?;

    waits.store(2, Ordering::SeqCst);
    broker.publish(&input, fixtures::batch(5, 2, &["second", "third"]), true).await?;
    match next_envelope(&mut output).await? {
        Envelope::Protocol { payload, .. } => {
            assert_eq!(payload, vec!["second".to_string(), "third".to_string()], "expected the full batch once, got {:?}", payload);
        }
        other => bail!("expected protocol envelope, got {:?}", other),
    }
    assert_eq!(waits.load(Ordering::SeqCst), 0, "expected every wait to be consumed");

    broker.publish(&input, Envelope::EofFirst { client_id: 5, messages_sent: 2 }.encode(), true).await?;
    let eof = next_envelope(&mut output).await?;
    assert_eq!(eof, Envelope::EofFirst { client_id: 5, messages_sent: 2 }, "expected EOF after both outputs");

    let _ = shutdown_tx.send(());
    handle.await??;
    Ok(())
}
