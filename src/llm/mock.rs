//! Scripted client for tests and offline runs.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

use super::{Completion, LlmClient, Message, Usage};

/// A scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return a text response.
    Text(String),
    /// Fail the call with a model error.
    Error(String),
}

type Responder = dyn Fn(&[Message]) -> MockReply + Send + Sync;

/// Client that replays queued replies, then falls back to a responder.
///
/// Every request is recorded so tests can inspect the prompts that were
/// actually sent. Usage is estimated at four characters per token.
#[derive(Clone)]
pub struct MockClient {
    model: String,
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    responder: Option<Arc<Responder>>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
    delay: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockClient {
    /// Creates a mock with no scripted replies.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            responder: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Queues a text reply.
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        self.push_reply(text);
        self
    }

    /// Queues several text replies in order.
    pub fn with_replies<I, S>(self, texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for text in texts {
            self.push_reply(text);
        }
        self
    }

    /// Queues a model failure.
    pub fn with_error(self, message: impl Into<String>) -> Self {
        lock(&self.replies).push_back(MockReply::Error(message.into()));
        self
    }

    /// Answers with `responder` once the queue is drained.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[Message]) -> MockReply + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Sleeps before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a text reply on a shared instance.
    pub fn push_reply(&self, text: impl Into<String>) {
        lock(&self.replies).push_back(MockReply::Text(text.into()));
    }

    /// Number of completed or attempted calls.
    pub fn call_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Every conversation sent so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        lock(&self.requests).clone()
    }

    /// The most recent conversation, if any.
    pub fn last_request(&self) -> Option<Vec<Message>> {
        lock(&self.requests).last().cloned()
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[async_trait]
impl LlmClient for MockClient {
    async fn complete(&self, messages: &[Message], _max_tokens: u32) -> Result<Completion> {
        lock(&self.requests).push(messages.to_vec());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = lock(&self.replies).pop_front();
        let reply = match (queued, &self.responder) {
            (Some(reply), _) => reply,
            (None, Some(responder)) => responder(messages),
            (None, None) => MockReply::Error("mock client has no replies left".to_string()),
        };

        match reply {
            MockReply::Text(text) => {
                let input: u64 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
                let usage = Usage::new(input, estimate_tokens(&text));
                Ok(Completion { text, usage })
            }
            MockReply::Error(message) => Err(Error::Model(message)),
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_queue_then_responder() {
        let client = MockClient::new("mock")
            .with_replies(["one", "two"])
            .with_responder(|_| MockReply::Text("fallback".to_string()));

        let msgs = [Message::user("hi")];
        assert_eq!(client.complete(&msgs, 8).await.unwrap().text, "one");
        assert_eq!(client.complete(&msgs, 8).await.unwrap().text, "two");
        assert_eq!(client.complete(&msgs, 8).await.unwrap().text, "fallback");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn exhausted_queue_is_model_error() {
        let client = MockClient::new("mock");
        let result = client.complete(&[Message::user("hi")], 8).await;

        assert!(matches!(result, Err(Error::Model(_))));
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn records_requests_and_estimates_usage() {
        let client = MockClient::new("mock").with_reply("abcdefgh");

        let completion = client
            .complete(&[Message::user("abcd")], 8)
            .await
            .unwrap();

        assert_eq!(completion.usage, Usage::new(1, 2));
        assert_eq!(client.last_request().unwrap()[0].content, "abcd");
    }

    #[tokio::test]
    async fn clones_share_state() {
        let client = MockClient::new("mock");
        let clone = client.clone();
        client.push_reply("shared");

        assert_eq!(
            clone.complete(&[Message::user("x")], 8).await.unwrap().text,
            "shared"
        );
        assert_eq!(client.call_count(), 1);
    }
}
