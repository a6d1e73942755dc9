//! Application records and their positional CSV-like text form.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::error::AppError;

/// A structured application record, mapping field names to values.
pub type Record = BTreeMap<String, String>;

/// The field under which an unstructured line is stored when no field order is configured.
pub const RAW_FIELD: &str = "raw";

/// Decode a line into a record.
///
/// With a field order, values are assigned positionally; extra trailing values are ignored and
/// missing values are an error. Without a field order the whole line is kept under `RAW_FIELD`.
pub fn decode_record(line: &str, fields: Option<&[String]>, delimiter: char) -> Result<Record> {
    let fields = match fields {
        Some(fields) => fields,
        None => return Ok(Record::from([(RAW_FIELD.to_string(), line.to_string())])),
    };
    let mut record = Record::new();
    let mut values = line.split(delimiter);
    for field in fields {
        match values.next() {
            Some(val) => {
                record.insert(field.clone(), val.trim().to_string());
            }
            None => bail!(AppError::InvalidInput(format!(
                "record has too few values, missing field '{}' in line {:?}",
                field, line
            ))),
        }
    }
    Ok(record)
}

/// Encode a record into a line.
///
/// With a field order, values are written in that order and every field must be present.
/// Without one, a raw record is written back verbatim, and any other record is written in key
/// order.
pub fn encode_record(record: &Record, fields: Option<&[String]>, delimiter: char) -> Result<String> {
    let mut line = String::new();
    match fields {
        Some(fields) => {
            for (idx, field) in fields.iter().enumerate() {
                let val = match record.get(field) {
                    Some(val) => val,
                    None => bail!(AppError::InvalidInput(format!("record is missing output field '{}'", field))),
                };
                if idx > 0 {
                    line.push(delimiter);
                }
                line.push_str(val);
            }
        }
        None => {
            if let (1, Some(raw)) = (record.len(), record.get(RAW_FIELD)) {
                return Ok(raw.clone());
            }
            for (idx, val) in record.values().enumerate() {
                if idx > 0 {
                    line.push(delimiter);
                }
                line.push_str(val);
            }
        }
    }
    Ok(line)
}
