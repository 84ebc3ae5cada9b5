//! LLM-as-judge for retrieved context.
//!
//! [`Judge`] is the seam the runner calls. [`LlmJudge`] implements it over a
//! chat-completion deployment; [`JudgeWithBackoff`] wraps any judge with
//! bounded retries for transient failures.

mod client;
mod prompts;
mod retry;
mod verdict;

pub use client::{ChatClient, ChatResponse, Message, Role, TokenUsage};
pub use prompts::Prompts;
pub use retry::JudgeWithBackoff;
pub use verdict::{JudgeVerdict, Score, parse_verdict};

use crate::config::JudgeConfig;
use crate::context::ContextBlock;
use crate::error::{JudgeInvocationError, Result};
use crate::query::Query;
use async_trait::async_trait;
use tracing::debug;

/// Rates how well a context block supports answering a query.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(
        &self,
        query: &Query,
        context: &ContextBlock,
    ) -> std::result::Result<JudgeVerdict, JudgeInvocationError>;
}

/// Judge backed by a chat-completion deployment.
#[derive(Clone)]
pub struct LlmJudge {
    client: ChatClient,
}

impl LlmJudge {
    /// Create a new judge with the given chat client.
    pub fn new(client: ChatClient) -> Self {
        Self { client }
    }

    /// Create from judge config.
    pub fn from_config(config: JudgeConfig) -> Result<Self> {
        Ok(Self::new(ChatClient::new(config)?))
    }

    /// Test connectivity to the judge deployment.
    pub async fn check_connection(&self) -> std::result::Result<String, JudgeInvocationError> {
        let response = self
            .client
            .complete(None, Prompts::connection_check())
            .await?;
        Ok(response.content)
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn judge(
        &self,
        query: &Query,
        context: &ContextBlock,
    ) -> std::result::Result<JudgeVerdict, JudgeInvocationError> {
        let prompt = Prompts::retrieval_judge(&query.text, context.text());

        let response = self
            .client
            .complete(Some(Prompts::system_retrieval_judge()), &prompt)
            .await?;

        if let Some(usage) = response.usage {
            debug!(
                query = query.position,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "judge call completed"
            );
        }

        Ok(parse_verdict(&response.content)?)
    }
}
