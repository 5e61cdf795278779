//! The one declaration of what a stored record looks like. The format stage
//! completes records against it and the sink provisions its table from it, so
//! the two can't drift apart.

pub const MASKED_AT_FIELD: &str = "_masked_at";
pub const MASKING_STATUS_FIELD: &str = "_masking_status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Stored as canonical JSON text
    Json,
    String,
    Timestamp,
}

impl FieldType {
    /// Column type in the analytical store. Every column is nullable, since the
    /// format stage fills absent fields with null.
    pub fn column_type(&self) -> &'static str {
        match self {
            FieldType::Json | FieldType::String => "Nullable(String)",
            FieldType::Timestamp => "Nullable(DateTime64(6, 'UTC'))",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
}

impl FieldSpec {
    const fn new(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchemaDescriptor {
    fields: &'static [FieldSpec],
}

/// Assistant audit-log records, as emitted by the upstream continuous query.
pub static AUDIT_LOG_SCHEMA: SchemaDescriptor = SchemaDescriptor::new(&[
    FieldSpec::new("request", FieldType::Json),
    FieldSpec::new("response", FieldType::Json),
    FieldSpec::new("userIamPrincipal", FieldType::String),
    FieldSpec::new("timestamp", FieldType::Timestamp),
    FieldSpec::new("userQuery", FieldType::String),
    FieldSpec::new("serviceTextReply", FieldType::String),
    FieldSpec::new("serviceLabel", FieldType::String),
    FieldSpec::new("methodName", FieldType::String),
    FieldSpec::new("serviceAttributionToken", FieldType::String),
    FieldSpec::new("serviceName", FieldType::String),
    FieldSpec::new(MASKED_AT_FIELD, FieldType::Timestamp),
    FieldSpec::new(MASKING_STATUS_FIELD, FieldType::String),
]);

impl SchemaDescriptor {
    pub const fn new(fields: &'static [FieldSpec]) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        self.fields
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn json_fields(&self) -> impl Iterator<Item = &'static str> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::Json)
            .map(|f| f.name)
    }

    /// DDL creating the table if it is missing. `qualified_table` must already
    /// be quoted.
    pub fn create_table_ddl(&self, qualified_table: &str) -> String {
        let columns = self
            .fields
            .iter()
            .map(|f| format!("    `{}` {}", f.name, f.field_type.column_type()))
            .collect::<Vec<_>>()
            .join(",\n");

        format!(
            "CREATE TABLE IF NOT EXISTS {qualified_table}\n(\n{columns}\n)\nENGINE = MergeTree\nORDER BY tuple()"
        )
    }
}
