//! Chat-completion client for the judge deployment.
//!
//! Speaks both the Azure OpenAI deployment API and any OpenAI-compatible
//! `/v1/chat/completions` endpoint. HTTP failures are classified into
//! transient and permanent [`JudgeInvocationError`]s here, at the wire.

use crate::config::{Credential, JudgeConfig, JudgeProvider};
use crate::error::{EvalError, JudgeInvocationError, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A message in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Request body for chat completion.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    /// Azure selects the model by deployment path instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
}

/// Response from chat completion.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI API error response.
#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Response from a chat call including metadata.
#[derive(Debug)]
pub struct ChatResponse {
    pub content: String,
    /// Reason the model stopped generating.
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Chat-completion client bound to one judge deployment.
#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    config: JudgeConfig,
    credential: Credential,
}

impl ChatClient {
    /// Create a client from resolved settings.
    pub fn new(config: JudgeConfig) -> Result<Self> {
        let credential = config.credential()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EvalError::config(format!("Failed to build judge client: {}", e)))?;

        Ok(Self {
            client,
            config,
            credential,
        })
    }

    /// Get the API endpoint URL.
    fn endpoint(&self) -> String {
        let base = self.config.endpoint.trim_end_matches('/');
        match self.config.provider {
            JudgeProvider::Azure => format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base, self.config.deployment, self.config.api_version
            ),
            JudgeProvider::OpenAi => format!("{}/v1/chat/completions", base),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match (&self.credential, self.config.provider) {
            (Credential::ApiKey(key), JudgeProvider::Azure) => request.header("api-key", key),
            (Credential::ApiKey(key), JudgeProvider::OpenAi) => request.bearer_auth(key),
            (Credential::BearerToken(token), _) => request.bearer_auth(token),
        }
    }

    /// Send a chat completion request.
    pub async fn chat(
        &self,
        messages: Vec<Message>,
    ) -> std::result::Result<ChatResponse, JudgeInvocationError> {
        let request = ChatCompletionRequest {
            model: match self.config.provider {
                JudgeProvider::Azure => None,
                JudgeProvider::OpenAi => Some(self.config.deployment.as_str()),
            },
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .authorize(self.client.post(self.endpoint()))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await?;

        if !status.is_success() {
            return Err(classify_status(status, &body, retry_after));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| JudgeInvocationError::MalformedResponse(e.to_string()))?;

        let choice = completion.choices.into_iter().next().ok_or_else(|| {
            JudgeInvocationError::MalformedResponse("No choices in response".to_string())
        })?;

        let content = choice.message.content.ok_or_else(|| {
            JudgeInvocationError::MalformedResponse(format!(
                "Completion has no content (finish reason: {})",
                choice.finish_reason.as_deref().unwrap_or("unknown")
            ))
        })?;

        Ok(ChatResponse {
            content,
            finish_reason: choice.finish_reason,
            usage: completion.usage,
        })
    }

    /// Convenience method: single user message with optional system prompt.
    pub async fn complete(
        &self,
        system: Option<&str>,
        user: &str,
    ) -> std::result::Result<ChatResponse, JudgeInvocationError> {
        let mut messages = Vec::new();

        if let Some(sys) = system {
            messages.push(Message::system(sys));
        }
        messages.push(Message::user(user));

        self.chat(messages).await
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ApiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> JudgeInvocationError {
    let message = error_message(body);
    let code = status.as_u16();

    match status {
        StatusCode::TOO_MANY_REQUESTS => JudgeInvocationError::RateLimited {
            message,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            JudgeInvocationError::Timeout(format!("({}) {}", code, message))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => JudgeInvocationError::Unauthorized {
            status: code,
            message,
        },
        s if s.is_server_error() => JudgeInvocationError::Unavailable {
            status: code,
            message,
        },
        _ => JudgeInvocationError::BadRequest {
            status: code,
            message,
        },
    }
}
