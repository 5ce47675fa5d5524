use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use longform_core::{GenerationRequest, ModelClass, ProviderAdapter, ProviderError, Role};

use crate::base_url::join_endpoint;
use crate::error::{retry_after_header, AdapterError};
use crate::models::ModelNames;
use crate::openai::conversation;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

static RETRY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"retry[_ ]?delay[^0-9]*(\d+)").expect("invalid retry delay regex"));

pub struct GeminiAdapter {
    client: Client,
    base_url: String,
    api_key: String,
    models: ModelNames,
    max_tokens: u32,
    temperature: f32,
}

impl GeminiAdapter {
    pub fn new(
        api_key: &str,
        base_url: &str,
        models: ModelNames,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Gemini api_key must not be empty".to_string(),
            ));
        }
        let base_url = if base_url.trim().is_empty() {
            DEFAULT_GEMINI_BASE_URL.to_string()
        } else {
            base_url.trim().trim_end_matches('/').to_string()
        };

        Ok(Self {
            client: Client::builder().build()?,
            base_url,
            api_key: api_key.trim().to_string(),
            models,
            max_tokens,
            temperature,
        })
    }

    pub fn endpoint(&self, class: ModelClass) -> String {
        join_endpoint(
            &self.base_url,
            &format!("models/{}:generateContent", self.models.get(class)),
        )
    }

    fn send(&self, request: &GenerationRequest, timeout: Duration) -> Result<String, AdapterError> {
        let body = GeminiRequest::from_request(
            request,
            request.max_tokens.unwrap_or(self.max_tokens),
            request.temperature.unwrap_or(self.temperature),
        );
        let response = self
            .client
            .post(self.endpoint(request.model_class))
            .timeout(timeout)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let header_delay = retry_after_header(response.headers());
            let body = response.text().unwrap_or_default();
            let retry_after = header_delay.or_else(|| parse_retry_delay(&body));
            return Err(AdapterError::HttpStatus {
                status,
                body,
                retry_after,
            });
        }
        let text = response.text()?;
        parse_gemini_response(&text)
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn model(&self, class: ModelClass) -> String {
        self.models.get(class).to_string()
    }

    fn invoke(&self, request: &GenerationRequest, timeout: Duration) -> Result<String, ProviderError> {
        self.send(request, timeout).map_err(ProviderError::from)
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContentRequest<'a>>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiSystemInstruction>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

impl<'a> GeminiRequest<'a> {
    fn from_request(request: &'a GenerationRequest, max_tokens: u32, temperature: f32) -> Self {
        Self {
            contents: conversation(request)
                .map(|(role, text)| GeminiContentRequest {
                    role: match role {
                        Role::Assistant => "model",
                        _ => "user",
                    },
                    parts: vec![GeminiPartRequest { text }],
                })
                .collect(),
            system_instruction: request.system_text().map(|text| GeminiSystemInstruction {
                parts: vec![GeminiOwnedPart { text }],
            }),
            generation_config: GeminiGenerationConfig {
                max_output_tokens: max_tokens,
                temperature,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiContentRequest<'a> {
    role: &'static str,
    parts: Vec<GeminiPartRequest<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPartRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiOwnedPart>,
}

#[derive(Debug, Serialize)]
struct GeminiOwnedPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Other(serde_json::Value),
}

fn parse_gemini_response(body: &str) -> Result<String, AdapterError> {
    let response: GeminiResponse = serde_json::from_str(body)?;
    for candidate in response.candidates {
        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => warn!("Gemini response truncated due to max_tokens limit"),
            Some("SAFETY") => warn!("Gemini response blocked by safety filters"),
            Some("RECITATION") => warn!("Gemini response blocked due to recitation concerns"),
            _ => {}
        }

        let Some(content) = candidate.content else {
            continue;
        };
        let text: String = content
            .parts
            .into_iter()
            .filter_map(|part| match part {
                GeminiPart::Text { text } => Some(text),
                GeminiPart::Other(_) => None,
            })
            .collect();
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }
    Err(AdapterError::EmptyResponse)
}

/// Retry hint from a Gemini error body, either the structured
/// `error.details[].retryDelay` ("30s") or a loose textual mention.
fn parse_retry_delay(body: &str) -> Option<Duration> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let details = value
            .get("error")
            .and_then(|error| error.get("details"))
            .and_then(|details| details.as_array());
        for detail in details.into_iter().flatten() {
            let delay = detail
                .get("retryDelay")
                .or_else(|| detail.get("retry_delay"));
            if let Some(seconds) = delay.and_then(parse_delay_value) {
                return Some(Duration::from_secs(seconds));
            }
        }
    }

    RETRY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|matched| matched.as_str().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn parse_delay_value(value: &serde_json::Value) -> Option<u64> {
    if let Some(number) = value.as_u64() {
        return Some(number);
    }
    let text = value.as_str()?.trim().trim_end_matches('s');
    text.parse::<f64>().ok().map(|seconds| seconds.ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use longform_core::ChatMessage;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new(
            "key",
            "",
            ModelNames::new("gemini-2.5-pro", "gemini-2.5-flash"),
            8192,
            0.7,
        )
        .unwrap()
    }

    #[test]
    fn endpoint_follows_model_class() {
        let adapter = adapter();
        assert_eq!(
            adapter.endpoint(ModelClass::Drafting),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
        assert_eq!(adapter.model(ModelClass::Planning), "gemini-2.5-pro");
    }

    #[test]
    fn request_splits_system_instruction() {
        let request = GenerationRequest::new(
            ModelClass::Planning,
            vec![
                ChatMessage::system("你是小说策划"),
                ChatMessage::user("生成大纲"),
                ChatMessage::assistant("好的"),
            ],
        );
        let value = serde_json::to_value(GeminiRequest::from_request(&request, 1024, 0.5)).unwrap();
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "你是小说策划");
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn joins_text_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"第一"},{"inlineData":{}},{"text":"章"}]},"finishReason":"STOP"}]}"#;
        assert_eq!(parse_gemini_response(body).unwrap(), "第一章");
        assert!(matches!(
            parse_gemini_response(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#),
            Err(AdapterError::EmptyResponse)
        ));
    }

    #[test]
    fn reads_retry_delay_from_error_details() {
        let body = r#"{"error":{"code":429,"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"31s"}]}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(31)));
        assert_eq!(
            parse_retry_delay("please retry_delay: 9 seconds"),
            Some(Duration::from_secs(9))
        );
        assert_eq!(parse_retry_delay("quota"), None);
    }

    #[test]
    fn requires_api_key() {
        assert!(GeminiAdapter::new(" ", "", ModelNames::new("a", "b"), 1, 0.1).is_err());
    }
}
