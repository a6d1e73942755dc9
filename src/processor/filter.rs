use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::processor::{Processor, Response};
use crate::record::Record;

/// A comparison of a record field against a value.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Predicate {
    pub field: String,
    pub op: PredicateOp,
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
}

impl Predicate {
    /// Check the given record against this predicate.
    ///
    /// Values which both parse as numbers are compared numerically, others as strings.
    pub fn matches(&self, record: &Record) -> Result<bool> {
        let val = match record.get(&self.field) {
            Some(val) => val,
            None => bail!(AppError::InvalidInput(format!("record is missing filter field '{}'", self.field))),
        };
        if self.op == PredicateOp::Contains {
            return Ok(val.contains(self.value.as_str()));
        }
        let ordering = match (val.parse::<f64>(), self.value.parse::<f64>()) {
            (Ok(lhs), Ok(rhs)) => match lhs.partial_cmp(&rhs) {
                Some(ordering) => ordering,
                None => return Ok(false),
            },
            _ => val.as_str().cmp(self.value.as_str()),
        };
        Ok(match self.op {
            PredicateOp::Eq => ordering.is_eq(),
            PredicateOp::Ne => ordering.is_ne(),
            PredicateOp::Gt => ordering.is_gt(),
            PredicateOp::Ge => ordering.is_ge(),
            PredicateOp::Lt => ordering.is_lt(),
            PredicateOp::Le => ordering.is_le(),
            PredicateOp::Contains => false,
        })
    }
}

/// Passes the records matching its predicate, optionally projected onto a set of fields.
pub struct Filter {
    predicate: Option<Predicate>,
    project: Option<Vec<String>>,
}

impl Filter {
    pub fn new(predicate: Option<Predicate>, project: Option<Vec<String>>) -> Self {
        Self { predicate, project }
    }
}

impl Processor for Filter {
    fn process(&mut self, record: Record) -> Result<Response> {
        if let Some(predicate) = &self.predicate {
            if !predicate.matches(&record)? {
                return Ok(Response::Multiple(vec![]));
            }
        }
        let fields = match &self.project {
            Some(fields) => fields,
            None => return Ok(Response::Single(record)),
        };
        let mut output = Record::new();
        for field in fields {
            match record.get(field) {
                Some(val) => output.insert(field.clone(), val.clone()),
                None => bail!(AppError::InvalidInput(format!("record is missing projected field '{}'", field))),
            };
        }
        Ok(Response::Single(output))
    }

    fn finish_processing(&mut self) -> Result<Option<Response>> {
        Ok(None)
    }
}
