//! Chat-completion clients used by the router and the workflows.
//!
//! The core only needs `complete(messages, max_tokens) -> (text, usage)`.
//! [`OpenAiCompatibleClient`] talks to any OpenAI-style endpoint and
//! [`MockClient`] replays scripted answers in tests.

mod mock;
mod openai;

pub use mock::{MockClient, MockReply};
pub use openai::OpenAiCompatibleClient;

use std::ops::AddAssign;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
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

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token counters reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A model answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Trait for chat-completion backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Sends the conversation and returns the model's reply.
    ///
    /// Failures are surfaced as [`Error::Model`]; the core never retries.
    async fn complete(&self, messages: &[Message], max_tokens: u32) -> Result<Completion>;

    /// Returns the model identifier this client targets.
    fn model(&self) -> &str;
}

/// Runs one completion bounded by `timeout`.
///
/// An elapsed timer drops the in-flight request and yields
/// [`Error::ModelTimeout`].
pub async fn complete_with_timeout(
    client: &dyn LlmClient,
    messages: &[Message],
    max_tokens: u32,
    timeout: Duration,
) -> Result<Completion> {
    match tokio::time::timeout(timeout, client.complete(messages, max_tokens)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(model = %client.model(), ?timeout, "model call timed out");
            Err(Error::ModelTimeout(timeout))
        }
    }
}
