use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};

use super::agent::{
    AgentMessage, AgentResult, BoxFuture, MissingApiKeySnafu, Role, TokenCountRequestSnafu,
    TokenCountStatusSnafu,
};

pub const ANTHROPIC_PROVIDER_ID: &str = "anthropic";
pub const DEFAULT_COUNT_TOKENS_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCountRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<AgentMessage>,
}

impl TokenCountRequest {
    pub fn new(
        model: impl Into<String>,
        system: impl Into<String>,
        messages: Vec<AgentMessage>,
    ) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            messages,
        }
    }
}

/// Exact token counting for a prompt, as billed by the model vendor.
pub trait TokenCounter: Send + Sync {
    fn count<'a>(&'a self, request: TokenCountRequest) -> BoxFuture<'a, AgentResult<u64>>;
}

pub struct AnthropicTokenCounter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicTokenCounter {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into().trim().to_string(),
            base_url: if base_url.is_empty() {
                DEFAULT_COUNT_TOKENS_BASE_URL.to_string()
            } else {
                base_url
            },
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages/count_tokens", self.base_url)
    }

    fn request_body(request: &TokenCountRequest) -> CountTokensBody<'_> {
        CountTokensBody {
            model: &request.model,
            system: (!request.system.trim().is_empty()).then_some(request.system.as_str()),
            messages: request
                .messages
                .iter()
                .filter(|message| !matches!(message.role, Role::System))
                .map(|message| CountTokensMessage {
                    role: message.role.as_str(),
                    content: vec![CountTokensContent {
                        kind: "text",
                        text: &message.content,
                    }],
                })
                .collect(),
        }
    }

    async fn count_remote(&self, request: TokenCountRequest) -> AgentResult<u64> {
        ensure!(
            !self.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "count-tokens-api-key",
                provider_id: ANTHROPIC_PROVIDER_ID.to_string(),
            }
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&Self::request_body(&request))
            .send()
            .await
            .context(TokenCountRequestSnafu {
                stage: "count-tokens-send",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return TokenCountStatusSnafu {
                stage: "count-tokens-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let payload: CountTokensResponse =
            response.json().await.context(TokenCountRequestSnafu {
                stage: "count-tokens-parse",
            })?;

        tracing::debug!(
            model = %request.model,
            input_tokens = payload.input_tokens,
            "counted prompt tokens"
        );
        Ok(payload.input_tokens)
    }
}

impl TokenCounter for AnthropicTokenCounter {
    fn count<'a>(&'a self, request: TokenCountRequest) -> BoxFuture<'a, AgentResult<u64>> {
        Box::pin(self.count_remote(request))
    }
}

#[derive(Debug, Serialize)]
struct CountTokensBody<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<CountTokensMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct CountTokensMessage<'a> {
    role: &'static str,
    content: Vec<CountTokensContent<'a>>,
}

#[derive(Debug, Serialize)]
struct CountTokensContent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct CountTokensResponse {
    #[serde(default)]
    input_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentError;

    #[test]
    fn body_uses_text_blocks_and_skips_blank_system() {
        let request = TokenCountRequest::new(
            "claude-sonnet-4-20250514",
            "  ",
            vec![
                AgentMessage::user("make a landing page"),
                AgentMessage::assistant("{\"files\":{}}"),
            ],
        );
        let body = serde_json::to_value(AnthropicTokenCounter::request_body(&request)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "model": "claude-sonnet-4-20250514",
                "messages": [
                    {"role": "user", "content": [{"type": "text", "text": "make a landing page"}]},
                    {"role": "assistant", "content": [{"type": "text", "text": "{\"files\":{}}"}]}
                ]
            })
        );
    }

    #[test]
    fn endpoint_defaults_and_trims_trailing_slash() {
        assert_eq!(
            AnthropicTokenCounter::new("key", "").endpoint(),
            "https://api.anthropic.com/v1/messages/count_tokens"
        );
        assert_eq!(
            AnthropicTokenCounter::new("key", "http://localhost:9000/").endpoint(),
            "http://localhost:9000/v1/messages/count_tokens"
        );
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let counter = AnthropicTokenCounter::new("", "http://127.0.0.1:9");
        let result = counter
            .count(TokenCountRequest::new("m", "s", vec![AgentMessage::user("x")]))
            .await;
        assert!(matches!(result, Err(AgentError::MissingApiKey { .. })));
    }
}
