use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

use crate::models::message::Message;
use crate::models::tool::Tool;
use crate::providers::base::{
    FinishReason, Provider, ProviderError, ProviderResponse, Usage,
};

/// A mock provider that returns pre-configured outcomes for testing
pub struct MockProvider {
    outcomes: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of successful responses
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            outcomes: Mutex::new(responses.into_iter().map(Ok).collect()),
        }
    }

    /// Create a mock provider with explicit per-call outcomes, including
    /// failures
    pub fn with_outcomes(outcomes: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes),
        }
    }

    /// Convenience for a plain text turn
    pub fn text_response(text: &str) -> ProviderResponse {
        ProviderResponse {
            message: Message::assistant().with_text(text),
            finish_reason: FinishReason::Stop,
            usage: Usage::default(),
        }
    }

    /// Convenience for a tool-calling turn
    pub fn tool_response(message: Message) -> ProviderResponse {
        ProviderResponse {
            message,
            finish_reason: FinishReason::ToolUse,
            usage: Usage::default(),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        _system: Option<&str>,
        _messages: &[Message],
        _tools: &[Tool],
        _temperature: Option<f32>,
        _max_tokens: Option<i32>,
        _timeout: Option<Duration>,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut outcomes = self.outcomes.lock().unwrap();
        if outcomes.is_empty() {
            // Return an empty response if no more pre-configured outcomes
            Ok(MockProvider::text_response(""))
        } else {
            outcomes.remove(0)
        }
    }
}
