//! The model invocation seam.
//!
//! One method, one request struct. The endpoint profile (base URL, key,
//! model, token budget) travels with every request because it is resolved
//! per run from effective settings, not fixed at process start. Tests swap
//! the whole client for an in-process stub.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Deadline applied to every model call.
const MODEL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything one completion call needs.
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub base_url: &'a str,
    pub api_key: &'a str,
    pub model: &'a str,
    pub max_tokens: u32,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u32,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model transport error: {0}")]
    Transport(String),
    #[error("model endpoint rejected request: status={status}, body={body}")]
    Rejected { status: u16, body: String },
    #[error("malformed model response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ModelError>;
}

/// Default client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient {
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

impl OpenAiClient {
    pub fn new() -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(MODEL_CALL_TIMEOUT)
            .build()
            .map_err(|err| ModelError::Transport(err.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<Completion, ModelError> {
        let body = ChatRequest {
            model: request.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: request.user_prompt,
                },
            ],
            max_tokens: request.max_tokens,
        };

        let url = format!(
            "{}/chat/completions",
            request.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(url)
            .bearer_auth(request.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ModelError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| ModelError::Malformed(err.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::Malformed("no choices in response".into()))?;

        Ok(Completion {
            text: choice.message.content,
            tokens_used: parsed.usage.total_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_serializes_system_then_user() {
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "be terse",
                },
                ChatMessage {
                    role: "user",
                    content: "analyze this",
                },
            ],
            max_tokens: 500,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["max_tokens"], 500);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["role"], "user");
    }

    #[test]
    fn chat_response_tolerates_missing_usage() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"report"}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content, "report");
        assert_eq!(parsed.usage.total_tokens, 0);
    }
}
