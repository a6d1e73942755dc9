//! Record processors, the business logic run by stages.

mod filter;
mod group;
mod tag;

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::gateway::{ResultForwarder, ResultRegistry};
use crate::record::Record;

pub use self::filter::{Filter, Predicate, PredicateOp};
pub use self::group::GroupAverage;
pub use self::tag::Tag;

/// The outcome of processing a record.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// One output record.
    Single(Record),
    /// Any number of output records.
    Multiple(Vec<Record>),
    /// The processor can not handle the record yet; it must be retried later.
    NotReady,
    /// The processor has nothing to contribute, but the stage must still drain downstream.
    SendEof,
}

impl Response {
    /// The output records of this response.
    pub fn into_records(self) -> Vec<Record> {
        match self {
            Self::Single(record) => vec![record],
            Self::Multiple(records) => records,
            Self::NotReady | Self::SendEof => vec![],
        }
    }
}

/// A processor of the records of one client.
pub trait Processor: Send {
    /// Process a record.
    fn process(&mut self, record: Record) -> Result<Response>;

    /// Flush the processor once the client's input has ended.
    fn finish_processing(&mut self) -> Result<Option<Response>>;

    /// Snapshot the processor's state, `None` if it keeps none.
    fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Restore the processor's state from a snapshot.
    fn restore(&mut self, _snapshot: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Builds a fresh processor for the given client.
pub type ProcessorFactory = Arc<dyn Fn(u32) -> Box<dyn Processor> + Send + Sync>;

/// The processor of a stage, as configured in the topology.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessorKind {
    /// Pass the records matching a predicate, optionally projected onto some fields.
    Filter {
        #[serde(default)]
        predicate: Option<Predicate>,
        #[serde(default)]
        project: Option<Vec<String>>,
    },
    /// Average a numeric field per group, emitted once the client's input ends.
    GroupAverage {
        group_by: Vec<String>,
        field: String,
        #[serde(default = "GroupAverage::default_output_field")]
        output_field: String,
    },
    /// Set a field to a fixed value.
    Tag { field: String, value: String },
    /// Forward records to the client connected to the gateway.
    Results,
}

/// Build the processor factory of the given kind.
///
/// The results processor needs the gateway's registry of client writers.
pub fn factory(kind: &ProcessorKind, results: Option<ResultRegistry>) -> Result<ProcessorFactory> {
    let factory: ProcessorFactory = match kind.clone() {
        ProcessorKind::Filter { predicate, project } => Arc::new(move |_: u32| -> Box<dyn Processor> { Box::new(Filter::new(predicate.clone(), project.clone())) }),
        ProcessorKind::GroupAverage {
            group_by,
            field,
            output_field,
        } => Arc::new(move |_: u32| -> Box<dyn Processor> {
            Box::new(GroupAverage::new(group_by.clone(), field.clone(), output_field.clone()))
        }),
        ProcessorKind::Tag { field, value } => Arc::new(move |_: u32| -> Box<dyn Processor> { Box::new(Tag::new(field.clone(), value.clone())) }),
        ProcessorKind::Results => match results {
            Some(registry) => Arc::new(move |client_id: u32| -> Box<dyn Processor> {
                Box::new(ResultForwarder::new(client_id, registry.clone()))
            }),
            None => bail!(AppError::InvalidInput("the results processor requires the gateway".into())),
        },
    };
    Ok(factory)
}
