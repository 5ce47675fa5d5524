use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use longform_core::{GenerationRequest, ModelClass, ProviderAdapter, ProviderError, Role};

use crate::base_url::join_endpoint;
use crate::error::{retry_after_header, AdapterError};
use crate::models::ModelNames;

static AZURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^https://([^/]+)/openai/deployments/([^/]+)/chat/completions\?api-version=([^/?&]+)",
    )
    .expect("invalid azure openai url regex")
});

/// Any vendor speaking the OpenAI chat-completions dialect.
pub struct OpenAiLikeAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
    models: ModelNames,
    max_tokens: Option<u32>,
    temperature: f32,
}

impl OpenAiLikeAdapter {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        models: ModelNames,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            client: Client::builder().build()?,
            url: join_endpoint(base_url, "chat/completions"),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            models,
            max_tokens: (max_tokens > 0).then_some(max_tokens),
            temperature,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn send(&self, request: &GenerationRequest, timeout: Duration) -> Result<String, AdapterError> {
        let body = ChatCompletionRequest::from_request(
            request,
            Some(self.models.get(request.model_class)),
            self.max_tokens,
            self.temperature,
        );
        let mut builder = self.client.post(&self.url).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        execute(builder)
    }
}

impl ProviderAdapter for OpenAiLikeAdapter {
    fn model(&self, class: ModelClass) -> String {
        self.models.get(class).to_string()
    }

    fn invoke(&self, request: &GenerationRequest, timeout: Duration) -> Result<String, ProviderError> {
        self.send(request, timeout).map_err(ProviderError::from)
    }
}

/// Azure deployments: the model is fixed by the deployment in the URL.
pub struct AzureOpenAiAdapter {
    client: Client,
    url: String,
    api_key: String,
    deployment: String,
    max_tokens: Option<u32>,
    temperature: f32,
}

impl AzureOpenAiAdapter {
    pub fn new(
        api_key: &str,
        base_url: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Self, AdapterError> {
        if api_key.trim().is_empty() {
            return Err(AdapterError::InvalidConfig(
                "Azure OpenAI api_key must not be empty".to_string(),
            ));
        }
        let captures = AZURE_RE.captures(base_url.trim()).ok_or_else(|| {
            AdapterError::InvalidConfig(
                "Invalid Azure OpenAI base_url format. Expected https://<resource>.openai.azure.com/openai/deployments/<deployment>/chat/completions?api-version=<version>"
                    .to_string(),
            )
        })?;
        let (host, deployment, api_version) = (&captures[1], &captures[2], &captures[3]);

        Ok(Self {
            client: Client::builder().build()?,
            url: format!(
                "https://{host}/openai/deployments/{deployment}/chat/completions?api-version={api_version}"
            ),
            api_key: api_key.to_string(),
            deployment: deployment.to_string(),
            max_tokens: (max_tokens > 0).then_some(max_tokens),
            temperature,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ProviderAdapter for AzureOpenAiAdapter {
    fn model(&self, _class: ModelClass) -> String {
        self.deployment.clone()
    }

    fn invoke(&self, request: &GenerationRequest, timeout: Duration) -> Result<String, ProviderError> {
        let body =
            ChatCompletionRequest::from_request(request, None, self.max_tokens, self.temperature);
        let builder = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("api-key", &self.api_key)
            .json(&body);
        execute(builder).map_err(ProviderError::from)
    }
}

fn execute(builder: RequestBuilder) -> Result<String, AdapterError> {
    let response = builder.send()?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = retry_after_header(response.headers());
        let body = response.text().unwrap_or_default();
        return Err(AdapterError::HttpStatus {
            status,
            body,
            retry_after,
        });
    }
    let text = response.text()?;
    parse_chat_completion(&text)
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

impl<'a> ChatCompletionRequest<'a> {
    fn from_request(
        request: &'a GenerationRequest,
        model: Option<&'a str>,
        max_tokens: Option<u32>,
        temperature: f32,
    ) -> Self {
        Self {
            model,
            messages: request
                .messages
                .iter()
                .map(|message| ChatMessageRequest {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
            max_tokens: request.max_tokens.or(max_tokens),
            temperature: request.temperature.unwrap_or(temperature),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessageRequest<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

fn parse_chat_completion(body: &str) -> Result<String, AdapterError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)?;
    for choice in parsed.choices {
        if choice.finish_reason.as_deref() == Some("length") {
            warn!("chat completion truncated by the max_tokens limit");
        }
        let content = choice
            .message
            .and_then(|message| message.content)
            .or(choice.text);
        if let Some(content) = content.filter(|content| !content.trim().is_empty()) {
            return Ok(content);
        }
    }
    Err(AdapterError::EmptyResponse)
}

/// Request messages without a system turn, for transports that need the
/// roles split apart.
pub(crate) fn conversation(request: &GenerationRequest) -> impl Iterator<Item = (Role, &str)> {
    request
        .messages
        .iter()
        .filter(|message| message.role != Role::System)
        .map(|message| (message.role, message.content.as_str()))
}
