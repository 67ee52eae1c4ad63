//! Answers `sampling/createMessage` requests from tool servers.
//!
//! This closes the recursive loop in the system: a server that is busy
//! handling one of our tool calls can ask the model a question of its own
//! through the very orchestrator driving it, without holding credentials.

use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::content::Content;
use crate::providers::base::Provider;
use crate::transport::{CreateMessageParams, CreateMessageResult, SamplingHandler};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: i32 = 1000;

pub struct SamplingBridge {
    provider: Arc<dyn Provider>,
    model: String,
    /// One sampling call in flight per bridge: each request is fully
    /// synchronous from the server's point of view, so overlapping requests
    /// queue here instead of racing.
    gate: Mutex<()>,
}

impl SamplingBridge {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            gate: Mutex::new(()),
        }
    }

    fn convert_messages(params: &CreateMessageParams) -> Vec<Message> {
        params
            .messages
            .iter()
            .map(|message| {
                let base = match message.role {
                    Role::Assistant => Message::assistant(),
                    _ => Message::user(),
                };
                base.with_text(message.text())
            })
            .collect()
    }
}

#[async_trait]
impl SamplingHandler for SamplingBridge {
    async fn create_message(&self, params: CreateMessageParams) -> CreateMessageResult {
        let _in_flight = self.gate.lock().await;
        info!(messages = params.messages.len(), "sampling request received");

        let messages = Self::convert_messages(&params);
        let temperature = params.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let max_tokens = params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        // No retry layer here: the server is waiting synchronously and a
        // failure must come back as an answer, not as silence.
        let text = match self
            .provider
            .complete(
                params.system_prompt.as_deref(),
                &messages,
                &[],
                Some(temperature),
                Some(max_tokens),
                None,
            )
            .await
        {
            Ok(response) => response
                .message
                .content
                .iter()
                .find_map(|content| content.as_text())
                .unwrap_or_default()
                .to_string(),
            Err(err) => {
                warn!(%err, "sampling completion failed");
                format!("Error during generation: {err}")
            }
        };

        info!("sampling completed");
        CreateMessageResult {
            role: Role::Assistant,
            model: self.model.clone(),
            content: Content::text(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tool::Tool;
    use crate::providers::base::{ProviderError, ProviderResponse};
    use crate::providers::mock::MockProvider;
    use crate::transport::SamplingMessage;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn params(text: &str) -> CreateMessageParams {
        CreateMessageParams {
            messages: vec![SamplingMessage {
                role: Role::User,
                content: json!({"type": "text", "text": text}),
            }],
            system_prompt: Some("be brief".to_string()),
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn test_bridge_answers_with_first_text_block() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text_response(
            "a short summary",
        )]));
        let bridge = SamplingBridge::new(provider, "test-model");

        let result = bridge.create_message(params("summarize this")).await;
        assert_eq!(result.role, Role::Assistant);
        assert_eq!(result.model, "test-model");
        assert_eq!(result.content.as_text(), Some("a short summary"));
    }

    #[tokio::test]
    async fn test_bridge_failure_still_answers() {
        let provider = Arc::new(MockProvider::with_outcomes(vec![Err(
            ProviderError::Status {
                status: 500,
                body: "upstream down".to_string(),
            },
        )]));
        let bridge = SamplingBridge::new(provider, "test-model");

        let result = bridge.create_message(params("summarize this")).await;
        let text = result.content.as_text().unwrap();
        assert!(text.starts_with("Error during generation:"));
        assert!(text.contains("upstream down"));
    }

    #[tokio::test]
    async fn test_result_wire_shape() {
        let provider = Arc::new(MockProvider::new(vec![MockProvider::text_response("ok")]));
        let bridge = SamplingBridge::new(provider, "m");

        let result = bridge.create_message(params("q")).await;
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["model"], "m");
        assert_eq!(value["content"]["type"], "text");
        assert_eq!(value["content"]["text"], "ok");
    }

    struct CapturingProvider {
        seen: StdMutex<Vec<(Option<f32>, Option<i32>)>>,
    }

    #[async_trait]
    impl Provider for CapturingProvider {
        async fn complete(
            &self,
            _system: Option<&str>,
            _messages: &[Message],
            _tools: &[Tool],
            temperature: Option<f32>,
            max_tokens: Option<i32>,
            _timeout: Option<Duration>,
        ) -> Result<ProviderResponse, ProviderError> {
            self.seen.lock().unwrap().push((temperature, max_tokens));
            Ok(MockProvider::text_response("ok"))
        }
    }

    #[tokio::test]
    async fn test_bridge_defaults_temperature_and_budget() {
        let provider = Arc::new(CapturingProvider {
            seen: StdMutex::new(Vec::new()),
        });
        let bridge = SamplingBridge::new(provider.clone(), "m");

        bridge.create_message(params("q")).await;

        let mut explicit = params("q");
        explicit.temperature = Some(0.2);
        explicit.max_tokens = Some(64);
        bridge.create_message(explicit).await;

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0], (Some(0.7), Some(1000)));
        assert_eq!(seen[1], (Some(0.2), Some(64)));
    }
}
