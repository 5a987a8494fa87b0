use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::backend::ImageBackend;
use crate::error::BackendError;
use crate::utils::http::get_http_client;

/// Immutable client configuration, injected by the caller. Credentials are
/// never read from ambient state inside the client.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub image_model: String,
    pub safety_profile: String,
    pub call_timeout: Duration,
}

/// Gemini `generateContent` client for seeded image generation and
/// edit-conditioned generation with an inline base image.
pub struct GeminiImageClient {
    config: GeminiConfig,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    parts: Option<Vec<GeminiPart>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        #[allow(dead_code)]
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

fn should_retry_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .or_else(|| value.get("message").and_then(|v| v.as_str()))
        {
            return message.to_string();
        }
        return truncate_for_log(&value.to_string(), 2000);
    }

    truncate_for_log(trimmed, 2000)
}

fn build_safety_settings(profile: &str) -> Vec<Value> {
    let threshold = match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        "permissive" => "BLOCK_ONLY_HIGH",
        other => {
            warn!("Unknown safety profile '{other}', using permissive defaults.");
            "BLOCK_ONLY_HIGH"
        }
    };

    vec![
        json!({ "category": "HARM_CATEGORY_HARASSMENT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": threshold }),
        json!({ "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": threshold }),
    ]
}

fn extract_image_from_response(response: GeminiResponse) -> Option<Vec<u8>> {
    for candidate in response.candidates.unwrap_or_default() {
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts.unwrap_or_default() {
            if let GeminiPart::InlineData { inline_data } = part {
                if inline_data.mime_type.starts_with("image/") {
                    if let Ok(bytes) = general_purpose::STANDARD.decode(inline_data.data) {
                        return Some(bytes);
                    }
                }
            }
        }
    }
    None
}

impl GeminiImageClient {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    fn redact_api_key(&self, text: &str) -> String {
        let key = self.config.api_key.trim();
        if key.is_empty() {
            return text.to_string();
        }
        text.replace(key, "[redacted]")
    }

    fn build_payload(&self, prompt: &str, seed: i64, base_image: Option<&[u8]>) -> Value {
        let mut parts = Vec::new();
        if let Some(bytes) = base_image {
            let mime_type =
                infer::get(bytes).map_or_else(|| "image/png".to_string(), |kind| {
                    kind.mime_type().to_string()
                });
            parts.push(json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": general_purpose::STANDARD.encode(bytes)
                }
            }));
        }
        parts.push(json!({
            "text": format!("{prompt}\n\n[Negative Prompt]\n{}", crate::prompt::NEGATIVE_PROMPT)
        }));

        json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": {
                "temperature": 0.4,
                "topP": 0.8,
                "topK": 32,
                "candidateCount": 1,
                "seed": seed,
                "responseModalities": ["IMAGE"]
            },
            "safetySettings": build_safety_settings(&self.config.safety_profile),
        })
    }

    /// Single call, no internal retries; the orchestrator owns the retry
    /// budget and only consumes the transient/permanent classification.
    async fn request_image(
        &self,
        prompt: &str,
        seed: i64,
        base_image: Option<&[u8]>,
    ) -> Result<Vec<u8>, BackendError> {
        let client = get_http_client();
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.config.image_model, self.config.api_key
        );
        let payload = self.build_payload(prompt, seed, base_image);

        debug!(
            target: "backend.gemini",
            model = %self.config.image_model,
            seed,
            has_base_image = base_image.is_some(),
            prompt_preview = %truncate_for_log(prompt, 200)
        );

        let response = client
            .post(&url)
            .timeout(self.config.call_timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|err| {
                let message = self.redact_api_key(&format!(
                    "request failed to send: {err} (timeout={}, connect={})",
                    err.is_timeout(),
                    err.is_connect()
                ));
                if should_retry_error(&err) {
                    BackendError::transient(message)
                } else {
                    BackendError::permanent(message)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = self.redact_api_key(&summarize_error_body(&body));
            let message = format!("Gemini API error (status {status}): {detail}");
            return if should_retry_status(status) {
                Err(BackendError::transient(message))
            } else {
                Err(BackendError::permanent(message))
            };
        }

        let parsed = response
            .json::<GeminiResponse>()
            .await
            .map_err(|err| BackendError::transient(format!("malformed Gemini response: {err}")))?;

        extract_image_from_response(parsed).ok_or_else(|| {
            BackendError::permanent(format!(
                "no image part in Gemini response (model: {})",
                self.config.image_model
            ))
        })
    }
}

#[async_trait]
impl ImageBackend for GeminiImageClient {
    async fn generate(&self, prompt: &str, seed: i64) -> Result<Vec<u8>, BackendError> {
        self.request_image(prompt, seed, None).await
    }

    async fn edit_from(
        &self,
        base: &[u8],
        prompt: &str,
        seed: i64,
    ) -> Result<Vec<u8>, BackendError> {
        self.request_image(prompt, seed, Some(base)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retryable_statuses() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!should_retry_status(StatusCode::UNAUTHORIZED));
        assert!(!should_retry_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn error_body_summary_prefers_api_message() {
        let body = r#"{"error": {"code": 429, "message": "Resource exhausted"}}"#;
        assert_eq!(summarize_error_body(body), "Resource exhausted");
        assert_eq!(summarize_error_body("  "), "empty response body");
    }

    #[test]
    fn api_key_is_redacted_from_messages() {
        let client = GeminiImageClient::new(GeminiConfig {
            api_key: "sk-secret".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            safety_profile: "permissive".to_string(),
            call_timeout: Duration::from_secs(120),
        });
        let redacted = client.redact_api_key("request to ...?key=sk-secret failed");
        assert!(!redacted.contains("sk-secret"));
        assert!(redacted.contains("[redacted]"));
    }

    #[test]
    fn payload_carries_seed_and_base_image() {
        let client = GeminiImageClient::new(GeminiConfig {
            api_key: "k".to_string(),
            image_model: "m".to_string(),
            safety_profile: "permissive".to_string(),
            call_timeout: Duration::from_secs(120),
        });

        let payload = client.build_payload("prompt text", 42, Some(b"raw-bytes"));
        assert_eq!(payload.pointer("/generationConfig/seed"), Some(&json!(42)));

        let parts = payload
            .pointer("/contents/0/parts")
            .and_then(|v| v.as_array())
            .expect("parts array");
        assert_eq!(parts.len(), 2);
        assert!(parts[0].get("inlineData").is_some());
        let text = parts[1]
            .get("text")
            .and_then(|v| v.as_str())
            .expect("text part");
        assert!(text.contains("[Negative Prompt]"));
    }

    #[test]
    fn extracts_first_image_part() {
        let encoded = general_purpose::STANDARD.encode(b"png-bytes");
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "parts": [
                        { "text": "here is your image" },
                        { "inlineData": { "mimeType": "image/png", "data": encoded } }
                    ]
                }
            }]
        }))
        .expect("response should deserialize");

        assert_eq!(
            extract_image_from_response(response),
            Some(b"png-bytes".to_vec())
        );
    }

    #[test]
    fn text_only_response_yields_no_image() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "refused" }] } }]
        }))
        .expect("response should deserialize");
        assert_eq!(extract_image_from_response(response), None);
    }
}
