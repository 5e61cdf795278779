//! Failure reports from the sink, in whichever shape the write path produced
//! them, and their normalization into dead-letter records.

use serde_json::{json, Value};
use tracing::warn;

use crate::error_record::{ErrorRecord, ErrorType};

pub const UNKNOWN_ERROR_FORMAT: &str = "Unknown error format";

/// One row the sink gave up on.
#[derive(Debug, Clone, PartialEq)]
pub enum FailedRowReport {
    /// `{"row": ..., "errors": ..., "table": ...}`
    Tagged {
        table: Option<String>,
        row: Value,
        errors: Option<Value>,
    },
    /// `[table, row, errors]`
    Triple {
        table: Value,
        row: Value,
        errors: Value,
    },
    /// `[row, errors]`
    Pair { row: Value, errors: Value },
    /// Anything else. The whole value is the row.
    Opaque(Value),
}

impl FailedRowReport {
    /// Never fails: whatever doesn't match a known shape is `Opaque`.
    pub fn parse(value: Value) -> Self {
        match value {
            Value::Object(mut map) if map.contains_key("row") => {
                let row = map.remove("row").unwrap_or(Value::Null);
                let errors = map.remove("errors");
                let table = map.remove("table").map(|t| textual(&t));
                FailedRowReport::Tagged { table, row, errors }
            }
            Value::Array(items) if items.len() == 3 => {
                let mut items = items.into_iter();
                let table = items.next().unwrap_or(Value::Null);
                let row = items.next().unwrap_or(Value::Null);
                let errors = items.next().unwrap_or(Value::Null);
                FailedRowReport::Triple { table, row, errors }
            }
            Value::Array(items) if items.len() >= 2 => {
                let mut items = items.into_iter();
                let row = items.next().unwrap_or(Value::Null);
                let errors = items.next().unwrap_or(Value::Null);
                FailedRowReport::Pair { row, errors }
            }
            other => FailedRowReport::Opaque(other),
        }
    }

    pub fn row(&self) -> &Value {
        match self {
            FailedRowReport::Tagged { row, .. }
            | FailedRowReport::Triple { row, .. }
            | FailedRowReport::Pair { row, .. } => row,
            FailedRowReport::Opaque(value) => value,
        }
    }

    /// The report as a single JSON value, close to the shape it arrived in.
    pub fn to_value(&self) -> Value {
        match self {
            FailedRowReport::Tagged { table, row, errors } => {
                let mut value = json!({ "row": row });
                if let Some(errors) = errors {
                    value["errors"] = errors.clone();
                }
                if let Some(table) = table {
                    value["table"] = Value::String(table.clone());
                }
                value
            }
            FailedRowReport::Triple { table, row, errors } => {
                json!([table, row, errors])
            }
            FailedRowReport::Pair { row, errors } => json!([row, errors]),
            FailedRowReport::Opaque(value) => value.clone(),
        }
    }
}

/// Turns one failure report into exactly one `SINK_WRITE_ERROR` record. If
/// the report can't be rendered, a fallback record carrying the report's text
/// is returned instead.
pub fn normalize(report: &FailedRowReport) -> ErrorRecord {
    match try_normalize(report) {
        Ok(record) => record,
        Err(e) => {
            warn!("failed to normalize sink failure report: {}", e);
            ErrorRecord::new(
                ErrorType::SinkWriteError,
                textual(&report.to_value()),
                format!("Error processing failed row: {e}"),
            )
        }
    }
}

fn try_normalize(report: &FailedRowReport) -> Result<ErrorRecord, serde_json::Error> {
    let message = match report {
        FailedRowReport::Tagged {
            errors: Some(errors),
            ..
        }
        | FailedRowReport::Triple { errors, .. }
        | FailedRowReport::Pair { errors, .. } => textual(errors),
        FailedRowReport::Tagged { errors: None, .. } => serde_json::to_string(&report.to_value())?,
        FailedRowReport::Opaque(_) => UNKNOWN_ERROR_FORMAT.to_string(),
    };

    let row = report.row();
    let mut original_data = match row {
        Value::Object(_) | Value::Array(_) => serde_json::to_string(row)?,
        other => textual(other),
    };
    if original_data.is_empty() {
        original_data = serde_json::to_string(&report.to_value())?;
    }

    Ok(ErrorRecord::new(
        ErrorType::SinkWriteError,
        original_data,
        message,
    ))
}

/// Strings as themselves, everything else as compact JSON.
fn textual(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
