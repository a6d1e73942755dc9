use anyhow::Result;

use crate::processor::{Processor, Response};
use crate::record::Record;

/// Sets a field of every record to a fixed value, marking which query a result belongs to.
pub struct Tag {
    field: String,
    value: String,
}

impl Tag {
    pub fn new(field: String, value: String) -> Self {
        Self { field, value }
    }
}

impl Processor for Tag {
    fn process(&mut self, mut record: Record) -> Result<Response> {
        record.insert(self.field.clone(), self.value.clone());
        Ok(Response::Single(record))
    }

    fn finish_processing(&mut self) -> Result<Option<Response>> {
        Ok(None)
    }
}
