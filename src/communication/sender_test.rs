use std::sync::Arc;

use anyhow::{bail, Result};

use crate::broker::{Broker, ExchangeKind, MemoryBroker};
use crate::communication::Sender;
use crate::config::OutputSpec;
use crate::envelope::Envelope;
use crate::fixtures::next_envelope;
use crate::record::Record;
use crate::utils;

fn flight(origin: &str, fare: &str) -> Record {
    let mut record = Record::new();
    record.insert("origin".into(), origin.into());
    record.insert("fare".into(), fare.into());
    record
}

#[tokio::test]
async fn topic_output_is_partitioned_by_key() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new(10));
    broker.declare_exchange("by-origin", ExchangeKind::Topic).await?;
    for partition in 0..2u32 {
        let queue = format!("averages.input.{}", partition);
        broker.declare_queue(&queue).await?;
        broker.bind_queue(&queue, "by-origin", &partition.to_string()).await?;
    }
    let mut consumers = vec![broker.consume("averages.input.0").await?, broker.consume("averages.input.1").await?];

    let output = OutputSpec::Topic {
        exchange: "by-origin".into(),
        key_field: "origin".into(),
        partitions: 2,
    };
    let mut sender = Sender::new(broker.clone(), "filter".into(), Some(output), Some(vec!["origin".into(), "fare".into()]), ',');
    let records = vec![flight("EZE", "10"), flight("JFK", "20"), flight("EZE", "30")];
    let published = sender.send_all(7, 1, &records).await?;

    let partitions: std::collections::BTreeSet<u32> = ["EZE", "JFK"].iter().map(|key| utils::partition_for_key(key, 2)).collect();
    assert_eq!(published, partitions.len() as u64, "expected one message per partition hit");
    assert_eq!(sender.messages_sent(7), published);

    let eze = utils::partition_for_key("EZE", 2) as usize;
    match next_envelope(&mut consumers[eze]).await? {
        Envelope::Protocol {
            client_id,
            message_id,
            payload,
        } => {
            assert_eq!(client_id, 7);
            assert_eq!(message_id, utils::derive_message_id("filter", 1), "expected derived message id");
            assert!(
                payload.contains(&"EZE,10".to_string()) && payload.contains(&"EZE,30".to_string()),
                "expected both EZE records in one message, got {:?}",
                payload
            );
        }
        other => bail!("expected protocol envelope, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn records_without_partition_key_are_skipped() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new(10));
    broker.declare_exchange("by-origin", ExchangeKind::Topic).await?;
    broker.declare_queue("averages.input.0").await?;
    broker.bind_queue("averages.input.0", "by-origin", "0").await?;
    let mut consumer = broker.consume("averages.input.0").await?;

    let output = OutputSpec::Topic {
        exchange: "by-origin".into(),
        key_field: "origin".into(),
        partitions: 1,
    };
    let mut sender = Sender::new(broker.clone(), "route".into(), Some(output), None, ',');
    let mut keyless = Record::new();
    keyless.insert("fare".into(), "5".into());
    let published = sender.send_all(2, 1, &[keyless, flight("EZE", "10")]).await?;
    assert_eq!(published, 1, "expected the keyed record to be published, got {}", published);

    match next_envelope(&mut consumer).await? {
        Envelope::Protocol { payload, .. } => assert_eq!(payload, vec!["10,EZE".to_string()], "expected only the keyed record, got {:?}", payload),
        other => bail!("expected protocol envelope, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn empty_outputs_publish_nothing() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new(10));
    broker.declare_queue("next").await?;
    let mut sender = Sender::new(broker.clone(), "tag".into(), Some(OutputSpec::Queue { name: "next".into() }), None, ',');

    let published = sender.send_all(1, 1, &[]).await?;
    assert_eq!(published, 0, "expected nothing published for no records");
    assert_eq!(broker.queue_len("next").await?, 0);

    let mut sink = Sender::new(broker.clone(), "sink".into(), None, None, ',');
    assert_eq!(sink.send_all(1, 1, &[flight("EZE", "1")]).await?, 0, "expected a stage without output to publish nothing");
    sink.send_eof(1).await?;
    Ok(())
}

#[tokio::test]
async fn eof_carries_messages_sent() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new(10));
    broker.declare_queue("next").await?;
    let mut consumer = broker.consume("next").await?;
    let mut sender = Sender::new(broker.clone(), "tag".into(), Some(OutputSpec::Queue { name: "next".into() }), None, ',');

    sender.send_all(3, 1, &[flight("EZE", "1")]).await?;
    sender.send_all(3, 2, &[flight("JFK", "2")]).await?;
    sender.set_messages_sent(3, 5);
    sender.send_eof(3).await?;

    next_envelope(&mut consumer).await?;
    next_envelope(&mut consumer).await?;
    let eof = next_envelope(&mut consumer).await?;
    assert_eq!(eof, Envelope::EofFirst { client_id: 3, messages_sent: 5 }, "expected EOF with the installed count");

    sender.forget_client(3);
    assert_eq!(sender.messages_sent(3), 0, "expected forgotten client to have no count");
    Ok(())
}

#[tokio::test]
async fn raw_lines_are_rejected_for_topic_outputs() -> Result<()> {
    let broker = Arc::new(MemoryBroker::new(10));
    let output = OutputSpec::Topic {
        exchange: "x".into(),
        key_field: "k".into(),
        partitions: 1,
    };
    let mut sender = Sender::new(broker, "gateway".into(), Some(output), None, ',');
    let res = sender.send_lines(1, 1, vec!["a,b".into()]).await;
    assert!(res.is_err(), "expected raw lines over a topic output to be rejected");
    Ok(())
}
