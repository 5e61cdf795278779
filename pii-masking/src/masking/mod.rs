use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, error};

use crate::{
    error::MaskingError,
    error_record::{ErrorRecord, ErrorType},
    metric_consts::{FIELDS_MASKED, MASKING_FAILURES, RECORDS_MASKED},
    schema::{MASKED_AT_FIELD, MASKING_STATUS_FIELD},
    types::{format_timestamp, MaskingStatus, Record},
};

pub mod dlp;

pub const DEFAULT_PII_FIELDS: &[&str] = &["userIamPrincipal"];

pub const DEFAULT_INFO_TYPES: &[&str] = &[
    "EMAIL_ADDRESS",
    "PHONE_NUMBER",
    "US_SOCIAL_SECURITY_NUMBER",
    "CREDIT_CARD_NUMBER",
    "PERSON_NAME",
    "STREET_ADDRESS",
    "DATE_OF_BIRTH",
    "IP_ADDRESS",
];

pub const MASKING_CHARACTER: char = '*';

/// What to look for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectPolicy {
    Template(String),
    InfoTypes(Vec<String>),
}

/// What to do with what was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeidentifyPolicy {
    Template(String),
    /// `number_to_mask == 0` masks every character of a finding
    CharacterMask {
        masking_character: char,
        number_to_mask: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskingPolicy {
    pub inspect: InspectPolicy,
    pub deidentify: DeidentifyPolicy,
}

impl Default for MaskingPolicy {
    fn default() -> Self {
        Self {
            inspect: InspectPolicy::InfoTypes(
                DEFAULT_INFO_TYPES.iter().map(|t| t.to_string()).collect(),
            ),
            deidentify: DeidentifyPolicy::CharacterMask {
                masking_character: MASKING_CHARACTER,
                number_to_mask: 0,
            },
        }
    }
}

impl MaskingPolicy {
    /// Each configured template replaces its own half of the inline default.
    pub fn from_templates(deidentify: Option<String>, inspect: Option<String>) -> Self {
        let mut policy = Self::default();
        if let Some(name) = deidentify.filter(|n| !n.trim().is_empty()) {
            policy.deidentify = DeidentifyPolicy::Template(name);
        }
        if let Some(name) = inspect.filter(|n| !n.trim().is_empty()) {
            policy.inspect = InspectPolicy::Template(name);
        }
        policy
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeidentifyRequest<'a> {
    pub text: &'a str,
    pub policy: &'a MaskingPolicy,
}

/// The external detection and masking service. One call per designated field.
#[async_trait]
pub trait MaskingService: Send + Sync {
    async fn deidentify(&self, request: DeidentifyRequest<'_>) -> Result<String, MaskingError>;
}

/// A message as delivered by the source.
#[derive(Debug, Clone)]
pub enum RawInput {
    Bytes(Vec<u8>),
    Decoded(Value),
}

impl RawInput {
    /// Best-effort text of the input, for the dead-letter channel.
    pub fn original_text(&self) -> String {
        match self {
            RawInput::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            RawInput::Decoded(Value::String(s)) => s.clone(),
            RawInput::Decoded(value) => value.to_string(),
        }
    }

    fn decode(&self) -> Result<Record, MaskingError> {
        let value = match self {
            RawInput::Bytes(bytes) => serde_json::from_slice(bytes)?,
            RawInput::Decoded(value) => value.clone(),
        };
        Record::try_from(value).map_err(|_| MaskingError::NotAnObject)
    }
}

impl From<Vec<u8>> for RawInput {
    fn from(bytes: Vec<u8>) -> Self {
        RawInput::Bytes(bytes)
    }
}

impl From<Value> for RawInput {
    fn from(value: Value) -> Self {
        RawInput::Decoded(value)
    }
}

#[derive(Debug)]
pub struct MaskingFailure {
    pub original_data: String,
    pub error: MaskingError,
}

impl From<MaskingFailure> for ErrorRecord {
    fn from(failure: MaskingFailure) -> Self {
        ErrorRecord::new(
            ErrorType::MaskingError,
            failure.original_data,
            failure.error.to_string(),
        )
    }
}

pub struct MaskingStage<M> {
    service: M,
    policy: MaskingPolicy,
    pii_fields: Vec<String>,
}

impl<M: MaskingService> MaskingStage<M> {
    pub fn new(service: M, policy: MaskingPolicy, pii_fields: Vec<String>) -> Self {
        Self {
            service,
            policy,
            pii_fields,
        }
    }

    /// Decodes and masks one record. Every error, decoding included, comes
    /// back as a `MaskingFailure` carrying the input text.
    pub async fn mask(&self, raw: &RawInput) -> Result<Record, MaskingFailure> {
        match self.mask_record(raw).await {
            Ok(record) => {
                counter!(RECORDS_MASKED).increment(1);
                Ok(record)
            }
            Err(error) => {
                counter!(MASKING_FAILURES).increment(1);
                // The payload may hold exactly what we are trying to hide, so it stays out of the logs
                error!("failed to mask record: {}", error);
                Err(MaskingFailure {
                    original_data: raw.original_text(),
                    error,
                })
            }
        }
    }

    async fn mask_record(&self, raw: &RawInput) -> Result<Record, MaskingError> {
        let mut record = raw.decode()?;

        for field in &self.pii_fields {
            let text = match record.get(field) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                // Absent, null, empty or not text: nothing to mask
                _ => continue,
            };

            let masked = self
                .service
                .deidentify(DeidentifyRequest {
                    text: &text,
                    policy: &self.policy,
                })
                .await?;

            debug!(field = field.as_str(), "masked field");
            counter!(FIELDS_MASKED).increment(1);
            record.insert(field.as_str(), Value::String(masked));
        }

        record.insert(MASKED_AT_FIELD, Value::String(format_timestamp(Utc::now())));
        record.insert(
            MASKING_STATUS_FIELD,
            Value::String(MaskingStatus::Success.as_str().to_string()),
        );
        Ok(record)
    }
}
