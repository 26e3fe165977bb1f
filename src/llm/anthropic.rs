//! Native Anthropic Messages API provider.
//!
//! Single-shot client: maps one `CompletionRequest` to one Messages API
//! call and classifies failures into the `LlmError` taxonomy the retry
//! policy keys off (429 → `RateLimited`, network/5xx → `RequestFailed`,
//! everything else → `AuthFailed`/`InvalidResponse`).

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

const API_BASE: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const PROVIDER_NAME: &str = "anthropic";

/// Fallback max_tokens when the request doesn't set one (the API requires it).
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Native Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: Client,
    api_key: SecretString,
    model: String,
}

impl AnthropicProvider {
    /// Create a new provider for the given model.
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            model: model.into(),
        }
    }
}

// ── Messages API request/response types ─────────────────────────────

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

// ── Message conversion ──────────────────────────────────────────────

/// Convert our ChatMessage list to Anthropic API format.
///
/// System messages are extracted to the top-level `system` field;
/// multiple system messages are joined with blank lines.
fn convert_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<ApiMessage>) {
    let mut system_text: Option<String> = None;
    let mut api_messages = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => {
                if let Some(ref mut existing) = system_text {
                    existing.push_str("\n\n");
                    existing.push_str(&msg.content);
                } else {
                    system_text = Some(msg.content);
                }
            }
            Role::User => api_messages.push(ApiMessage {
                role: "user".to_string(),
                content: msg.content,
            }),
            Role::Assistant => api_messages.push(ApiMessage {
                role: "assistant".to_string(),
                content: msg.content,
            }),
        }
    }

    (system_text, api_messages)
}

fn parse_finish_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (system, messages) = convert_messages(request.messages);

        let body = MessagesRequest {
            model: self.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            temperature: request.temperature,
        };

        let url = format!("{API_BASE}/v1/messages");
        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("anthropic-version", API_VERSION)
            .header("x-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER_NAME.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let response_text = response.text().await.unwrap_or_default();
        tracing::debug!(model = %self.model, status = %status, "Anthropic response");

        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthFailed {
                    provider: PROVIDER_NAME.to_string(),
                },
                429 => LlmError::RateLimited {
                    provider: PROVIDER_NAME.to_string(),
                    retry_after: None,
                },
                500..=599 => LlmError::RequestFailed {
                    provider: PROVIDER_NAME.to_string(),
                    reason: format!("HTTP {status}: {response_text}"),
                },
                _ => LlmError::InvalidResponse {
                    provider: PROVIDER_NAME.to_string(),
                    reason: format!("HTTP {status}: {response_text}"),
                },
            });
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&response_text).map_err(|e| LlmError::InvalidResponse {
                provider: PROVIDER_NAME.to_string(),
                reason: format!("JSON parse error: {e}"),
            })?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("");

        Ok(CompletionResponse {
            content,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
            finish_reason: parse_finish_reason(parsed.stop_reason.as_deref()),
        })
    }
}
