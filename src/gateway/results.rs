use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::gateway::codec::Frame;
use crate::processor::{Processor, Response};
use crate::record::{self, Record};

/// The writers of the connected clients, by client ID.
pub type ResultRegistry = Arc<Mutex<HashMap<u32, mpsc::UnboundedSender<Vec<u8>>>>>;

/// Forwards result records to the gateway connection of their client.
pub struct ResultForwarder {
    client_id: u32,
    registry: ResultRegistry,
}

impl ResultForwarder {
    pub fn new(client_id: u32, registry: ResultRegistry) -> Self {
        Self { client_id, registry }
    }

    /// Write a frame to the client, dropping it if the client is gone.
    ///
    /// With `last` set, the client is removed from the registry, closing its writer once the
    /// frame is out.
    fn write(&self, frame: Frame, last: bool) -> Result<()> {
        let mut registry = self.registry.lock().map_err(|_| anyhow!("result registry mutex poisoned"))?;
        let writer = if last { registry.remove(&self.client_id) } else { registry.get(&self.client_id).cloned() };
        match writer {
            Some(writer) => {
                if writer.send(frame.encode()).is_err() {
                    tracing::debug!(client_id = self.client_id, "client writer closed, dropping results");
                }
            }
            None => tracing::debug!(client_id = self.client_id, "client not connected, dropping results"),
        }
        Ok(())
    }
}

impl Processor for ResultForwarder {
    fn process(&mut self, record: Record) -> Result<Response> {
        let line = record::encode_record(&record, None, ',')?;
        self.write(Frame::Results { records: vec![line] }, false)?;
        Ok(Response::Multiple(vec![]))
    }

    fn finish_processing(&mut self) -> Result<Option<Response>> {
        self.write(Frame::Done, true)?;
        tracing::debug!(client_id = self.client_id, "all results sent to client");
        Ok(None)
    }
}
