use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use crate::broker::{Broker, Destination};
use crate::config::OutputSpec;
use crate::envelope::Envelope;
use crate::error::{AppError, ERR_BROKER_PUBLISH};
use crate::prom::METRIC_PROCESSING_ERRORS;
use crate::record::{self, Record};
use crate::utils;

/// Publishes the outputs of a stage, counting the messages sent per client.
pub struct Sender {
    broker: Arc<dyn Broker>,
    /// The name of the publishing stage, which namespaces the IDs of published messages.
    namespace: String,
    output: Option<OutputSpec>,
    output_fields: Option<Vec<String>>,
    delimiter: char,
    /// Messages published per client.
    messages_sent: HashMap<u32, u64>,
}

impl Sender {
    /// Create a new instance.
    pub fn new(
        broker: Arc<dyn Broker>, namespace: String, output: Option<OutputSpec>, output_fields: Option<Vec<String>>, delimiter: char,
    ) -> Self {
        Self {
            broker,
            namespace,
            output,
            output_fields,
            delimiter,
            messages_sent: Default::default(),
        }
    }

    /// The number of messages published for the given client.
    pub fn messages_sent(&self, client_id: u32) -> u64 {
        self.messages_sent.get(&client_id).copied().unwrap_or(0)
    }

    /// Install the given count of messages published for the client.
    pub fn set_messages_sent(&mut self, client_id: u32, count: u64) {
        self.messages_sent.insert(client_id, count);
    }

    /// Drop the counter of the given client.
    pub fn forget_client(&mut self, client_id: u32) {
        self.messages_sent.remove(&client_id);
    }

    /// Publish the given records as the output of an input message, returning the number of
    /// messages published.
    ///
    /// Topic outputs are partitioned by key, one message per partition. Records which can not be
    /// encoded are skipped. Nothing is published for an empty set of records.
    #[tracing::instrument(level = "trace", skip(self, records), fields(namespace = %self.namespace))]
    pub async fn send_all(&mut self, client_id: u32, message_id: u64, records: &[Record]) -> Result<u64> {
        let output = match &self.output {
            Some(output) if !records.is_empty() => output,
            _ => return Ok(0),
        };
        let message_id = utils::derive_message_id(&self.namespace, message_id);
        let mut batches: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            match self.encode(output, record) {
                Ok((routing_key, line)) => batches.entry(routing_key).or_default().push(line),
                Err(err) => {
                    metrics::counter!(METRIC_PROCESSING_ERRORS, 1, "stage" => self.namespace.clone());
                    tracing::warn!(error = ?err, client_id, "skipping output record which can not be published");
                }
            }
        }

        let mut published = 0;
        for (routing_key, payload) in batches {
            let envelope = Envelope::Protocol {
                client_id,
                message_id,
                payload,
            };
            let destination = destination(output, routing_key);
            self.broker
                .publish(&destination, envelope.encode(), true)
                .await
                .with_context(|| format!("{} {}", ERR_BROKER_PUBLISH, destination))?;
            published += 1;
        }
        *self.messages_sent.entry(client_id).or_default() += published;
        Ok(published)
    }

    /// Encode an output record, along with the routing key of its partition.
    fn encode(&self, output: &OutputSpec, record: &Record) -> Result<(String, String)> {
        let line = record::encode_record(record, self.output_fields.as_deref(), self.delimiter)?;
        let routing_key = match output {
            OutputSpec::Topic { key_field, partitions, .. } => match record.get(key_field) {
                Some(key) => utils::partition_for_key(key, *partitions).to_string(),
                None => bail!(AppError::InvalidInput(format!("record is missing partition key field '{}'", key_field))),
            },
            OutputSpec::Queue { .. } | OutputSpec::Fanout { .. } => String::new(),
        };
        Ok((routing_key, line))
    }

    /// Publish the given lines as is, as one message.
    pub async fn send_lines(&mut self, client_id: u32, message_id: u64, payload: Vec<String>) -> Result<u64> {
        let output = match &self.output {
            Some(output) if !payload.is_empty() => output,
            _ => return Ok(0),
        };
        if matches!(output, OutputSpec::Topic { .. }) {
            bail!(AppError::InvalidInput("raw lines can not be partitioned over a topic output".into()));
        }
        let envelope = Envelope::Protocol {
            client_id,
            message_id: utils::derive_message_id(&self.namespace, message_id),
            payload,
        };
        let destination = destination(output, String::new());
        self.broker
            .publish(&destination, envelope.encode(), true)
            .await
            .with_context(|| format!("{} {}", ERR_BROKER_PUBLISH, destination))?;
        *self.messages_sent.entry(client_id).or_default() += 1;
        Ok(1)
    }

    /// Publish the end of the given client's data, carrying the count of messages sent for it.
    #[tracing::instrument(level = "debug", skip(self), fields(namespace = %self.namespace))]
    pub async fn send_eof(&mut self, client_id: u32) -> Result<()> {
        let output = match &self.output {
            Some(output) => output,
            None => return Ok(()),
        };
        let messages_sent = self.messages_sent(client_id);
        let envelope = Envelope::EofFirst { client_id, messages_sent };
        // Topic readers funnel EOFs to their replica 0, which reads routing key 0.
        let destination = destination(output, "0".into());
        self.broker
            .publish(&destination, envelope.encode(), true)
            .await
            .with_context(|| format!("{} {}", ERR_BROKER_PUBLISH, destination))?;
        tracing::debug!(client_id, messages_sent, "EOF sent downstream");
        Ok(())
    }
}

/// The destination of a publication to the given output.
fn destination(output: &OutputSpec, routing_key: String) -> Destination {
    match output {
        OutputSpec::Queue { name } => Destination::Queue(name.clone()),
        OutputSpec::Fanout { exchange } => Destination::Exchange {
            name: exchange.clone(),
            routing_key: String::new(),
        },
        OutputSpec::Topic { exchange, .. } => Destination::Exchange {
            name: exchange.clone(),
            routing_key,
        },
    }
}
