use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::processor::{Processor, Response};
use crate::record::Record;

/// Averages a numeric field over groups of records, emitting one record per group when the
/// client's input ends.
pub struct GroupAverage {
    group_by: Vec<String>,
    field: String,
    output_field: String,
    state: GroupState,
}

/// The accumulated groups, keyed by their joined key values.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
struct GroupState {
    groups: BTreeMap<String, Group>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
struct Group {
    key: Vec<String>,
    sum: f64,
    count: u64,
}

/// Separates key values in a group's map key.
const KEY_SEPARATOR: char = '\u{1f}';

impl GroupAverage {
    pub fn new(group_by: Vec<String>, field: String, output_field: String) -> Self {
        Self {
            group_by,
            field,
            output_field,
            state: GroupState::default(),
        }
    }

    pub(super) fn default_output_field() -> String {
        "average".into()
    }
}

impl Processor for GroupAverage {
    fn process(&mut self, record: Record) -> Result<Response> {
        let mut key = Vec::with_capacity(self.group_by.len());
        for field in self.group_by.iter() {
            match record.get(field) {
                Some(val) => key.push(val.clone()),
                None => bail!(AppError::InvalidInput(format!("record is missing group field '{}'", field))),
            }
        }
        let val: f64 = match record.get(&self.field) {
            Some(val) => val
                .parse()
                .map_err(|_| AppError::InvalidInput(format!("field '{}' is not numeric: {:?}", self.field, val)))?,
            None => bail!(AppError::InvalidInput(format!("record is missing averaged field '{}'", self.field))),
        };
        // Sums are snapshotted as JSON, which has no representation for them otherwise.
        if !val.is_finite() {
            bail!(AppError::InvalidInput(format!("field '{}' is not a finite number: {}", self.field, val)));
        }

        let map_key = key.join(&KEY_SEPARATOR.to_string());
        let group = self.state.groups.entry(map_key).or_insert_with(|| Group { key, sum: 0.0, count: 0 });
        let sum = group.sum + val;
        if !sum.is_finite() {
            bail!(AppError::InvalidInput(format!("sum of field '{}' overflows", self.field)));
        }
        group.sum = sum;
        group.count += 1;
        Ok(Response::Multiple(vec![]))
    }

    fn finish_processing(&mut self) -> Result<Option<Response>> {
        if self.state.groups.is_empty() {
            return Ok(Some(Response::SendEof));
        }
        let groups = std::mem::take(&mut self.state.groups);
        let records = groups
            .into_values()
            .map(|group| {
                let mut record: Record = self.group_by.iter().cloned().zip(group.key).collect();
                let average = group.sum / group.count as f64;
                record.insert(self.output_field.clone(), format!("{:.2}", average));
                record
            })
            .collect();
        Ok(Some(Response::Multiple(records)))
    }

    fn snapshot(&self) -> Result<Option<Vec<u8>>> {
        let bytes = serde_json::to_vec(&self.state).context("error serializing group average state")?;
        Ok(Some(bytes))
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        self.state = serde_json::from_slice(snapshot).context("error deserializing group average state")?;
        Ok(())
    }
}
