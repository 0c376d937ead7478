//! OpenAI-compatible chat completions client.
//!
//! DeepSeek and OpenAI both speak the `/chat/completions` dialect, so one
//! client covers both. [`Provider`] only picks the default base URL, model,
//! and the name used in errors and logs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A chat completions provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    DeepSeek,
    OpenAi,
}

impl Provider {
    pub fn name(self) -> &'static str {
        match self {
            Provider::DeepSeek => "deepseek",
            Provider::OpenAi => "openai",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::DeepSeek => "https://api.deepseek.com",
            Provider::OpenAi => "https://api.openai.com/v1",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::DeepSeek => "deepseek-chat",
            Provider::OpenAi => "gpt-4o-mini",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deepseek" => Ok(Provider::DeepSeek),
            "openai" | "gpt" => Ok(Provider::OpenAi),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// A message in a chat completion conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".to_string(), content: content.into() }
    }
}

/// Parameters for one completion call. Unset options use provider defaults.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// The first choice of a completion, flattened.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub model: String,
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{0} API key is not configured")]
    MissingKey(Provider),
    #[error("request to {provider} failed: {source}")]
    Transport {
        provider: Provider,
        #[source]
        source: reqwest::Error,
    },
    /// The provider answered with a non-2xx status.
    #[error("{provider} API error {status}: {body}")]
    Provider {
        provider: Provider,
        status: u16,
        body: String,
    },
    #[error("failed to parse {provider} response: {detail}")]
    Decode { provider: Provider, detail: String },
    #[error("{0} returned no completion")]
    Empty(Provider),
}

impl LlmError {
    /// Upstream HTTP status, if the provider answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Chat completions client for one provider.
#[derive(Debug, Clone)]
pub struct LlmClient {
    provider: Provider,
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(provider: Provider, api_key: impl Into<String>) -> Self {
        Self {
            provider,
            api_key: api_key.into(),
            base_url: provider.default_base_url().to_string(),
            model: provider.default_model().to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a conversation and return the first choice.
    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::MissingKey(self.provider));
        }

        let model = req.model.as_deref().unwrap_or(&self.model);
        let mut body = serde_json::json!({
            "model": model,
            "messages": &req.messages,
            "stream": false,
        });
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(n) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(n);
        }

        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(provider = %self.provider, %model, messages = req.messages.len(), "Calling chat completions");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|source| LlmError::Transport { provider: self.provider, source })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Provider {
                provider: self.provider,
                status: status.as_u16(),
                body,
            });
        }

        let text = resp
            .text()
            .await
            .map_err(|source| LlmError::Transport { provider: self.provider, source })?;
        parse_response(self.provider, model, &text)
    }

    /// Single-turn completion with a system prompt.
    pub async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let req = ChatRequest {
            messages: vec![ChatMessage::system(system), ChatMessage::user(prompt)],
            ..Default::default()
        };
        Ok(self.chat(&req).await?.content)
    }
}

fn parse_response(provider: Provider, requested_model: &str, text: &str) -> Result<ChatResponse, LlmError> {
    let api: ApiResponse = serde_json::from_str(text)
        .map_err(|e| LlmError::Decode { provider, detail: e.to_string() })?;
    let choice = api.choices.into_iter().next().ok_or(LlmError::Empty(provider))?;
    let content = choice.message.content.unwrap_or_default();
    if content.trim().is_empty() {
        return Err(LlmError::Empty(provider));
    }
    Ok(ChatResponse {
        model: api.model.unwrap_or_else(|| requested_model.to_string()),
        content,
        finish_reason: choice.finish_reason,
        usage: api.usage,
    })
}
