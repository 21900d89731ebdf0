//! OpenAI-compatible chat completions client.
//!
//! Works against hosted APIs as well as local servers (LM Studio, Ollama,
//! vLLM) that expose `/chat/completions`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{Error, Result};

use super::{Completion, LlmClient, Message, Usage};

/// Client for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageJson>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// Servers disagree on naming; accept both spellings.
#[derive(Debug, Default, Deserialize)]
struct UsageJson {
    #[serde(default, alias = "input_tokens")]
    prompt_tokens: u64,
    #[serde(default, alias = "output_tokens")]
    completion_tokens: u64,
}

impl OpenAiCompatibleClient {
    /// Creates a client for `model` at `base_url`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: model.into(),
            temperature: 0.1,
        }
    }

    /// Sets the bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Builds the workflow client from configuration.
    pub fn from_config(config: &LlmConfig) -> Self {
        let client = Self::new(&config.base_url, &config.model).with_temperature(config.temperature);
        match &config.api_key {
            Some(key) => client.with_api_key(key),
            None => client,
        }
    }

    /// Builds the routing client: router model, deterministic sampling.
    pub fn router_from_config(config: &LlmConfig) -> Self {
        let client =
            Self::new(&config.base_url, config.effective_router_model()).with_temperature(0.0);
        match &config.api_key {
            Some(key) => client.with_api_key(key),
            None => client,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_request<'a>(&'a self, messages: &'a [Message], max_tokens: u32) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages,
            max_tokens,
            temperature: self.temperature,
        }
    }
}

fn parse_response(body: &str) -> Result<Completion> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| Error::Model(format!("malformed completion body: {}", e)))?;

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| Error::Model("completion has no message content".to_string()))?;

    let usage = parsed.usage.unwrap_or_default();
    Ok(Completion {
        text,
        usage: Usage::new(usage.prompt_tokens, usage.completion_tokens),
    })
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, messages: &[Message], max_tokens: u32) -> Result<Completion> {
        let body = self.build_request(messages, max_tokens);

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            max_tokens,
            "sending chat completion"
        );

        let mut request = self.http.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Model(format!("request to {} failed: {}", self.base_url, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Model(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Model(format!(
                "HTTP {}: {}",
                status,
                crate::error::truncate_chars(&text, 300)
            )));
        }

        let completion = parse_response(&text)?;
        tracing::debug!(
            input_tokens = completion.usage.input_tokens,
            output_tokens = completion.usage.output_tokens,
            "completion received"
        );
        Ok(completion)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_openai_shape() {
        let client = OpenAiCompatibleClient::new("http://localhost:1234/v1/", "coder");
        let messages = vec![Message::system("be terse"), Message::user("hi")];

        let json = serde_json::to_value(client.build_request(&messages, 64)).unwrap();

        assert_eq!(json["model"], "coder");
        assert_eq!(json["max_tokens"], 64);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(client.endpoint(), "http://localhost:1234/v1/chat/completions");
    }

    #[test]
    fn parses_prompt_completion_usage() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;

        let completion = parse_response(body).unwrap();
        assert_eq!(completion.text, "ok");
        assert_eq!(completion.usage, Usage::new(12, 3));
    }

    #[test]
    fn parses_input_output_usage_aliases() {
        let body = r#"{
            "choices": [{"message": {"content": "ok"}}],
            "usage": {"input_tokens": 7, "output_tokens": 1}
        }"#;

        assert_eq!(parse_response(body).unwrap().usage, Usage::new(7, 1));
    }

    #[test]
    fn missing_usage_counts_zero() {
        let body = r#"{"choices": [{"message": {"content": "ok"}}]}"#;
        assert_eq!(parse_response(body).unwrap().usage, Usage::default());
    }

    #[test]
    fn empty_choices_is_model_error() {
        assert!(matches!(
            parse_response(r#"{"choices": []}"#),
            Err(Error::Model(_))
        ));
    }

    #[test]
    fn router_client_uses_router_model() {
        let config = LlmConfig {
            router_model: Some("tiny".to_string()),
            api_key: Some("k".to_string()),
            ..Default::default()
        };

        let client = OpenAiCompatibleClient::router_from_config(&config);
        assert_eq!(client.model(), "tiny");
        assert_eq!(client.temperature, 0.0);
        assert_eq!(client.api_key.as_deref(), Some("k"));
    }
}
