use anyhow::{Context, Result};

use crate::error::AppError;
use crate::record::{self, Record, RAW_FIELD};

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[test]
fn decode_record_assigns_values_positionally() -> Result<()> {
    let order = fields(&["origin", "destination", "fare"]);
    let output = record::decode_record("EZE, JFK ,1200.5,extra", Some(&order), ',')?;

    assert_eq!(output.len(), 3, "expected extra values to be ignored, got {:?}", output);
    assert_eq!(output.get("origin").map(String::as_str), Some("EZE"));
    assert_eq!(output.get("destination").map(String::as_str), Some("JFK"), "expected values to be trimmed");
    assert_eq!(output.get("fare").map(String::as_str), Some("1200.5"));
    Ok(())
}

#[test]
fn decode_record_errs_on_missing_values() -> Result<()> {
    let order = fields(&["origin", "destination", "fare"]);
    let err = record::decode_record("EZE,JFK", Some(&order), ',').err().context("expected an error for a short line")?;
    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::InvalidInput(_)), "expected InvalidInput, got {:?}", app_err);
    Ok(())
}

#[test]
fn decode_record_without_order_keeps_raw_line() -> Result<()> {
    let output = record::decode_record("a;b;c", None, ';')?;
    assert_eq!(output.get(RAW_FIELD).map(String::as_str), Some("a;b;c"));
    assert_eq!(record::encode_record(&output, None, ';')?, "a;b;c", "expected raw record to be written verbatim");
    Ok(())
}

#[test]
fn encode_record_follows_output_order() -> Result<()> {
    let mut rec = Record::new();
    rec.insert("fare".into(), "310".into());
    rec.insert("origin".into(), "LAX".into());
    rec.insert("unused".into(), "x".into());

    let line = record::encode_record(&rec, Some(&fields(&["origin", "fare"])), ',')?;
    assert_eq!(line, "LAX,310");

    let res = record::encode_record(&rec, Some(&fields(&["origin", "distance"])), ',');
    assert!(res.is_err(), "expected a missing output field to be an error");
    Ok(())
}

#[test]
fn encode_record_without_order_uses_key_order() -> Result<()> {
    let mut rec = Record::new();
    rec.insert("b".into(), "2".into());
    rec.insert("a".into(), "1".into());
    assert_eq!(record::encode_record(&rec, None, ',')?, "1,2");
    Ok(())
}
