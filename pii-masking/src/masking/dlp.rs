use async_trait::async_trait;
use common_metrics::timing_guard;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::DlpConfig,
    error::{MaskingClientError, MaskingError},
    metric_consts::DLP_CALL_TIME,
};

use super::{DeidentifyPolicy, DeidentifyRequest, InspectPolicy, MaskingPolicy, MaskingService};

/// Client for the DLP v2 `content:deidentify` endpoint. One per worker; the
/// underlying connection pool is reused across every record that worker sees.
pub struct DlpClient {
    client: Client,
    url: Url,
    access_token: Option<String>,
}

impl DlpClient {
    pub fn connect(config: &DlpConfig) -> Result<Self, MaskingClientError> {
        let client = Client::builder()
            .user_agent("PII Masking Worker")
            .timeout(config.timeout())
            .build()?;

        let url = deidentify_url(&config.endpoint, &config.project)?;

        Ok(Self {
            client,
            url,
            access_token: config
                .access_token
                .clone()
                .filter(|t| !t.trim().is_empty()),
        })
    }
}

#[async_trait]
impl MaskingService for DlpClient {
    async fn deidentify(&self, request: DeidentifyRequest<'_>) -> Result<String, MaskingError> {
        let body = DeidentifyContentRequest::new(request.text, request.policy);

        let timer = timing_guard(DLP_CALL_TIME, &[]);

        let mut builder = self.client.post(self.url.clone()).json(&body);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                timer.label("outcome", "transport_error").fin();
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            timer.label("outcome", "service_error").fin();
            let body = response.text().await.unwrap_or_default();
            return Err(MaskingError::Service {
                status: status.as_u16(),
                message: service_message(status, &body),
            });
        }

        let parsed = match response.text().await {
            Ok(text) => serde_json::from_str::<DeidentifyContentResponse>(&text)
                .map_err(|e| MaskingError::MalformedResponse(e.to_string())),
            Err(e) => Err(e.into()),
        };
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                timer.label("outcome", "malformed").fin();
                return Err(e);
            }
        };

        let Some(value) = parsed.item.and_then(|item| item.value) else {
            timer.label("outcome", "malformed").fin();
            return Err(MaskingError::MalformedResponse(
                "response carries no item value".to_string(),
            ));
        };

        timer.label("outcome", "success").fin();
        debug!("deidentify call succeeded");
        Ok(value)
    }
}

/// Joins the method path onto the endpoint, keeping any path prefix the
/// endpoint carries (e.g. a proxy mount point).
fn deidentify_url(endpoint: &str, project: &str) -> Result<Url, url::ParseError> {
    let mut base = Url::parse(endpoint)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(&format!("v2/projects/{project}/locations/global/content:deidentify"))
}

/// The service's own error message, or the raw body when it isn't the usual
/// error envelope.
fn service_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() => envelope.error.message,
        _ if !body.trim().is_empty() => body.to_string(),
        _ => format!("masking service returned {status}"),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeidentifyContentRequest<'a> {
    item: ContentItem<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deidentify_template_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deidentify_config: Option<DeidentifyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inspect_template_name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inspect_config: Option<InspectConfig<'a>>,
}

impl<'a> DeidentifyContentRequest<'a> {
    fn new(text: &'a str, policy: &'a MaskingPolicy) -> Self {
        let mut request = Self {
            item: ContentItem { value: text },
            deidentify_template_name: None,
            deidentify_config: None,
            inspect_template_name: None,
            inspect_config: None,
        };

        match &policy.deidentify {
            DeidentifyPolicy::Template(name) => {
                request.deidentify_template_name = Some(name.as_str())
            }
            DeidentifyPolicy::CharacterMask {
                masking_character,
                number_to_mask,
            } => {
                request.deidentify_config = Some(DeidentifyConfig::character_mask(
                    *masking_character,
                    *number_to_mask,
                ))
            }
        }

        match &policy.inspect {
            InspectPolicy::Template(name) => {
                request.inspect_template_name = Some(name.as_str())
            }
            InspectPolicy::InfoTypes(names) => {
                request.inspect_config = Some(InspectConfig {
                    info_types: names
                        .iter()
                        .map(|name| InfoType {
                            name: name.as_str(),
                        })
                        .collect(),
                })
            }
        }

        request
    }
}

#[derive(Serialize)]
struct ContentItem<'a> {
    value: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectConfig<'a> {
    info_types: Vec<InfoType<'a>>,
}

#[derive(Serialize)]
struct InfoType<'a> {
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeidentifyConfig {
    info_type_transformations: InfoTypeTransformations,
}

impl DeidentifyConfig {
    fn character_mask(masking_character: char, number_to_mask: u32) -> Self {
        Self {
            info_type_transformations: InfoTypeTransformations {
                transformations: vec![InfoTypeTransformation {
                    primitive_transformation: PrimitiveTransformation {
                        character_mask_config: CharacterMaskConfig {
                            masking_character: masking_character.to_string(),
                            number_to_mask,
                        },
                    },
                }],
            },
        }
    }
}

#[derive(Serialize)]
struct InfoTypeTransformations {
    transformations: Vec<InfoTypeTransformation>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoTypeTransformation {
    primitive_transformation: PrimitiveTransformation,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrimitiveTransformation {
    character_mask_config: CharacterMaskConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CharacterMaskConfig {
    masking_character: String,
    number_to_mask: u32,
}

#[derive(Deserialize)]
struct DeidentifyContentResponse {
    item: Option<ResponseItem>,
}

#[derive(Deserialize)]
struct ResponseItem {
    value: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    use super::*;

    const PATH: &str = "/v2/projects/my-project/locations/global/content:deidentify";

    fn config(server: &MockServer) -> DlpConfig {
        DlpConfig {
            project: "my-project".to_string(),
            endpoint: server.base_url(),
            access_token: Some("secret-token".to_string()),
            timeout_ms: 2000,
            deidentify_template: None,
            inspect_template: None,
        }
    }

    #[tokio::test]
    async fn sends_inline_policy_and_returns_masked_text() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path(PATH)
                .header("authorization", "Bearer secret-token")
                .json_body(json!({
                    "item": {"value": "user:alice@example.com"},
                    "deidentifyConfig": {
                        "infoTypeTransformations": {
                            "transformations": [{
                                "primitiveTransformation": {
                                    "characterMaskConfig": {
                                        "maskingCharacter": "*",
                                        "numberToMask": 0
                                    }
                                }
                            }]
                        }
                    },
                    "inspectConfig": {
                        "infoTypes": [
                            {"name": "EMAIL_ADDRESS"},
                            {"name": "PHONE_NUMBER"},
                            {"name": "US_SOCIAL_SECURITY_NUMBER"},
                            {"name": "CREDIT_CARD_NUMBER"},
                            {"name": "PERSON_NAME"},
                            {"name": "STREET_ADDRESS"},
                            {"name": "DATE_OF_BIRTH"},
                            {"name": "IP_ADDRESS"}
                        ]
                    }
                }));
            then.status(200)
                .json_body(json!({"item": {"value": "user:*****************"}}));
        });

        let client = DlpClient::connect(&config(&server)).unwrap();
        let policy = MaskingPolicy::default();
        let masked = client
            .deidentify(DeidentifyRequest {
                text: "user:alice@example.com",
                policy: &policy,
            })
            .await
            .unwrap();

        mock.assert();
        assert_eq!(masked, "user:*****************");
    }

    #[tokio::test]
    async fn sends_template_names_instead_of_inline_config() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path(PATH).json_body(json!({
                "item": {"value": "bob"},
                "deidentifyTemplateName": "projects/my-project/deidentifyTemplates/mask",
                "inspectTemplateName": "projects/my-project/inspectTemplates/pii"
            }));
            then.status(200).json_body(json!({"item": {"value": "***"}}));
        });

        let client = DlpClient::connect(&config(&server)).unwrap();
        let policy = MaskingPolicy::from_templates(
            Some("projects/my-project/deidentifyTemplates/mask".to_string()),
            Some("projects/my-project/inspectTemplates/pii".to_string()),
        );
        let masked = client
            .deidentify(DeidentifyRequest {
                text: "bob",
                policy: &policy,
            })
            .await
            .unwrap();

        mock.assert();
        assert_eq!(masked, "***");
    }

    #[tokio::test]
    async fn service_error_message_is_surfaced_verbatim() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(429).json_body(json!({
                "error": {
                    "code": 429,
                    "message": "Quota exceeded for quota metric 'Number of requests'",
                    "status": "RESOURCE_EXHAUSTED"
                }
            }));
        });

        let client = DlpClient::connect(&config(&server)).unwrap();
        let policy = MaskingPolicy::default();
        let err = client
            .deidentify(DeidentifyRequest {
                text: "bob",
                policy: &policy,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MaskingError::Service { status: 429, .. }));
        assert_eq!(
            err.to_string(),
            "Quota exceeded for quota metric 'Number of requests'"
        );
    }

    #[tokio::test]
    async fn missing_item_is_a_malformed_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200).json_body(json!({"overview": {}}));
        });

        let client = DlpClient::connect(&config(&server)).unwrap();
        let policy = MaskingPolicy::default();
        let err = client
            .deidentify(DeidentifyRequest {
                text: "bob",
                policy: &policy,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MaskingError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn unparseable_body_is_a_malformed_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path(PATH);
            then.status(200).body("<html>gateway</html>");
        });

        let client = DlpClient::connect(&config(&server)).unwrap();
        let policy = MaskingPolicy::default();
        let err = client
            .deidentify(DeidentifyRequest {
                text: "bob",
                policy: &policy,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, MaskingError::MalformedResponse(_)));
    }

    #[test]
    fn endpoint_path_prefix_is_kept() {
        let expected = "https://proxy.internal/dlp/v2/projects/p/locations/global/content:deidentify";
        assert_eq!(
            deidentify_url("https://proxy.internal/dlp", "p").unwrap().as_str(),
            expected
        );
        assert_eq!(
            deidentify_url("https://proxy.internal/dlp/", "p").unwrap().as_str(),
            expected
        );
        assert_eq!(
            deidentify_url("https://dlp.googleapis.com", "p").unwrap().as_str(),
            "https://dlp.googleapis.com/v2/projects/p/locations/global/content:deidentify"
        );
    }

    #[test]
    fn plain_text_error_bodies_are_kept() {
        assert_eq!(
            service_message(reqwest::StatusCode::BAD_GATEWAY, "upstream unavailable"),
            "upstream unavailable"
        );
        assert_eq!(
            service_message(reqwest::StatusCode::BAD_GATEWAY, ""),
            "masking service returned 502 Bad Gateway"
        );
    }
}
