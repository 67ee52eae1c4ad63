use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::base::{
    Provider, ProviderError, ProviderResponse, DEFAULT_COMPLETION_TIMEOUT,
};
use super::configs::OpenRouterProviderConfig;
use super::utils::{get_usage, messages_to_wire, response_to_message, tools_to_wire};
use crate::models::message::Message;
use crate::models::tool::Tool;

/// Client for any OpenAI-compatible chat-completions endpoint; defaults to
/// OpenRouter's.
pub struct OpenRouterProvider {
    client: Client,
    config: OpenRouterProviderConfig,
}

impl OpenRouterProvider {
    pub fn new(config: OpenRouterProviderConfig) -> Result<Self, ProviderError> {
        // Deadlines are supplied per request; the client itself carries none.
        let client = Client::builder()
            .build()
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn post(&self, payload: Value, timeout: Duration) -> Result<Value, ProviderError> {
        let url = format!("{}/chat/completions", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        match response.status() {
            StatusCode::OK => response
                .json()
                .await
                .map_err(|err| ProviderError::Malformed(err.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}

/// Keep the wording the retry classifier matches on: reqwest does not expose
/// a uniform typed taxonomy for these.
fn classify_request_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Request(format!("request timed out: {err}"))
    } else if err.is_connect() {
        ProviderError::Request(format!("connection error: {err}"))
    } else {
        ProviderError::Request(err.to_string())
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    async fn complete(
        &self,
        system: Option<&str>,
        messages: &[Message],
        tools: &[Tool],
        temperature: Option<f32>,
        max_tokens: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut messages_array = Vec::new();
        if let Some(system) = system {
            messages_array.push(json!({"role": "system", "content": system}));
        }
        messages_array.extend(messages_to_wire(messages));

        let message_count = messages_array.len();
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_array,
        });
        let body = payload
            .as_object_mut()
            .ok_or_else(|| ProviderError::Malformed("payload is not an object".to_string()))?;
        if let Some(temperature) = temperature.or(self.config.temperature) {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = max_tokens.or(self.config.max_tokens) {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if !tools.is_empty() {
            body.insert("tools".to_string(), json!(tools_to_wire(tools)));
        }

        debug!(
            model = self.config.model.as_str(),
            messages = message_count,
            tools = tools.len(),
            "requesting completion"
        );

        let timeout = timeout.unwrap_or(DEFAULT_COMPLETION_TIMEOUT);
        let response = self.post(payload, timeout).await?;

        if let Some(error) = response.get("error") {
            return Err(ProviderError::Api(error.to_string()));
        }

        let (message, finish_reason) = response_to_message(&response)?;
        let usage = get_usage(&response);

        Ok(ProviderResponse {
            message,
            finish_reason,
            usage,
        })
    }
}
