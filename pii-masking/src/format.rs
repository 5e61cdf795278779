use serde_json::{json, Value};
use tracing::debug;

use crate::{schema::SchemaDescriptor, types::Record};

/// Key under which a JSON field's unparseable text is preserved.
pub const RAW_VALUE_KEY: &str = "raw_value";

/// Completes masked records against the schema so the sink never sees a
/// missing column or malformed JSON text. Total: every record comes out.
#[derive(Debug, Clone, Copy)]
pub struct FormatStage {
    schema: &'static SchemaDescriptor,
}

impl FormatStage {
    pub fn new(schema: &'static SchemaDescriptor) -> Self {
        Self { schema }
    }

    pub fn format(&self, mut record: Record) -> Record {
        for field in self.schema.fields() {
            if !record.contains(field.name) {
                record.insert(field.name, Value::Null);
            }
        }

        for name in self.schema.json_fields() {
            let Some(current) = record.get(name) else {
                continue;
            };
            if let Some(canonical) = canonical_json(current) {
                record.insert(name, canonical);
            }
        }

        record
    }
}

/// The value a JSON-typed field is stored as, or None if it is fine as is.
fn canonical_json(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(_) => None,
            Err(_) => {
                debug!("wrapping unparseable JSON field text");
                Some(Value::String(json!({ RAW_VALUE_KEY: text }).to_string()))
            }
        },
        // Objects, arrays, numbers and bools all have a JSON text form
        other => Some(Value::String(other.to_string())),
    }
}
