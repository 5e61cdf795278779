use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::types::format_timestamp;

/// Stand-in when there is nothing at all left of the failed input.
pub const EMPTY_ORIGINAL_DATA: &str = "<empty>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    MaskingError,
    SinkWriteError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::MaskingError => "MASKING_ERROR",
            ErrorType::SinkWriteError => "SINK_WRITE_ERROR",
        }
    }
}

/// The dead-letter entry. Replay tooling reads `original_data` back in, and
/// tells masking failures from write failures by `error_type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorRecord {
    pub original_data: String,
    pub error_message: String,
    pub error_type: ErrorType,
    pub error_timestamp: String,
}

impl ErrorRecord {
    /// Never fails. `original_data` is kept non-empty: an empty value is
    /// replaced by [`EMPTY_ORIGINAL_DATA`].
    pub fn new(
        error_type: ErrorType,
        original_data: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let mut original_data = original_data.into();
        if original_data.is_empty() {
            original_data = EMPTY_ORIGINAL_DATA.to_string();
        }

        Self {
            original_data,
            error_message: error_message.into(),
            error_type,
            error_timestamp: format_timestamp(Utc::now()),
        }
    }

    /// The dead-letter wire form: one compact JSON object, UTF-8 encoded.
    pub fn to_wire(&self) -> Vec<u8> {
        json!({
            "original_data": self.original_data,
            "error_message": self.error_message,
            "error_type": self.error_type.as_str(),
            "error_timestamp": self.error_timestamp,
        })
        .to_string()
        .into_bytes()
    }
}
