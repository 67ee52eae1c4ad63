use crate::models::message::Message;
use crate::models::tool::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Baseline per-request deadline for a completion call when the caller does
/// not supply one.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);
/// How much the deadline grows per retry attempt, so a slow-but-alive
/// endpoint eventually gets enough room to answer.
const TIMEOUT_ESCALATION: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The request never produced an HTTP response. The message keeps the
    /// transport library's wording ("timed out", "connection", ...) because
    /// retry classification matches on it.
    #[error("request to completion endpoint failed: {0}")]
    Request(String),

    #[error("completion endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("completion endpoint returned a malformed body: {0}")]
    Malformed(String),

    #[error("completion endpoint reported an error: {0}")]
    Api(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }
}

/// Why the completion ended, mapped onto an internal vocabulary. Unknown
/// provider values pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    Other(String),
}

impl FinishReason {
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolUse,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, FinishReason::ToolUse)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub message: Message,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Base trait for completion providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate the next message for the given transcript and tool catalog.
    async fn complete(
        &self,
        system: Option<&str>,
        messages: &[Message],
        tools: &[Tool],
        temperature: Option<f32>,
        max_tokens: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Whether a failure is worth another attempt.
///
/// The transport library does not expose a uniform typed taxonomy for
/// network faults, so classification is by error description. Deliberately
/// conservative: anything that is not clearly a network-level failure
/// propagates immediately.
pub fn is_transient(error: &ProviderError) -> bool {
    let description = error.to_string().to_lowercase();
    description.contains("timed out")
        || description.contains("timeout")
        || description.contains("connection")
        || description.contains("network")
}

/// Retry wrapper around [`Provider::complete`].
///
/// Only transient failures are retried; backoff doubles per attempt and each
/// attempt gets a larger deadline than the last, so a slow endpoint is not
/// retried against an identical deadline it already missed. After
/// `max_retries` attempts the last error propagates unchanged.
#[allow(clippy::too_many_arguments)]
pub async fn complete_with_retry(
    provider: &dyn Provider,
    system: Option<&str>,
    messages: &[Message],
    tools: &[Tool],
    temperature: Option<f32>,
    max_tokens: Option<i32>,
    base_timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
) -> Result<ProviderResponse, ProviderError> {
    let attempts = max_retries.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        let timeout = base_timeout + TIMEOUT_ESCALATION * attempt;
        match provider
            .complete(system, messages, tools, temperature, max_tokens, Some(timeout))
            .await
        {
            Ok(response) => return Ok(response),
            Err(err) if is_transient(&err) && attempt + 1 < attempts => {
                let delay = base_delay * 2u32.pow(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "transient completion failure, backing off"
                );
                tokio::time::sleep(delay).await;
                last_error = Some(err);
            }
            Err(err) => {
                debug!(attempt, %err, "completion failed without retry");
                return Err(err);
            }
        }
    }

    // Unreachable unless attempts == 0 was clamped; keep the last error.
    Err(last_error.unwrap_or_else(|| ProviderError::Request("no attempts made".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlakyProvider {
        outcomes: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
        attempts: AtomicUsize,
        timeouts_seen: Mutex<Vec<Duration>>,
    }

    impl FlakyProvider {
        fn new(outcomes: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                attempts: AtomicUsize::new(0),
                timeouts_seen: Mutex::new(Vec::new()),
            }
        }

        fn ok_response() -> ProviderResponse {
            ProviderResponse {
                message: Message::assistant().with_text("done"),
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
            }
        }
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        async fn complete(
            &self,
            _system: Option<&str>,
            _messages: &[Message],
            _tools: &[Tool],
            _temperature: Option<f32>,
            _max_tokens: Option<i32>,
            timeout: Option<Duration>,
        ) -> Result<ProviderResponse, ProviderError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(timeout) = timeout {
                self.timeouts_seen.lock().unwrap().push(timeout);
            }
            self.outcomes.lock().unwrap().remove(0)
        }
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_provider("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider("length"), FinishReason::Length);
        assert_eq!(
            FinishReason::from_provider("tool_calls"),
            FinishReason::ToolUse
        );
        assert_eq!(
            FinishReason::from_provider("function_call"),
            FinishReason::ToolUse
        );
        assert_eq!(
            FinishReason::from_provider("content_filter"),
            FinishReason::Other("content_filter".to_string())
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&ProviderError::Request(
            "operation timed out".to_string()
        )));
        assert!(is_transient(&ProviderError::Request(
            "connection refused".to_string()
        )));
        assert!(!is_transient(&ProviderError::Status {
            status: 500,
            body: "server error".to_string()
        }));
        assert!(!is_transient(&ProviderError::Malformed(
            "no choices".to_string()
        )));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let provider = FlakyProvider::new(vec![
            Err(ProviderError::Request("connection reset".to_string())),
            Ok(FlakyProvider::ok_response()),
        ]);

        let result = complete_with_retry(
            &provider,
            None,
            &[],
            &[],
            None,
            None,
            Duration::from_secs(10),
            3,
            Duration::from_millis(1),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_http_status_is_not_retried() {
        let provider = FlakyProvider::new(vec![Err(ProviderError::Status {
            status: 500,
            body: "oops".to_string(),
        })]);

        let result = complete_with_retry(
            &provider,
            None,
            &[],
            &[],
            None,
            None,
            Duration::from_secs(10),
            3,
            Duration::from_millis(1),
        )
        .await;

        assert!(matches!(result, Err(ProviderError::Status { status: 500, .. })));
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_propagate_last_error() {
        let provider = FlakyProvider::new(vec![
            Err(ProviderError::Request("timeout a".to_string())),
            Err(ProviderError::Request("timeout b".to_string())),
            Err(ProviderError::Request("timeout c".to_string())),
        ]);

        let result = complete_with_retry(
            &provider,
            None,
            &[],
            &[],
            None,
            None,
            Duration::from_secs(10),
            3,
            Duration::from_millis(1),
        )
        .await;

        match result {
            Err(err) => assert!(err.to_string().contains("timeout c")),
            Ok(_) => panic!("expected failure"),
        }
        assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_deadline_escalates_per_attempt() {
        let provider = FlakyProvider::new(vec![
            Err(ProviderError::Request("timed out".to_string())),
            Err(ProviderError::Request("timed out".to_string())),
            Ok(FlakyProvider::ok_response()),
        ]);

        complete_with_retry(
            &provider,
            None,
            &[],
            &[],
            None,
            None,
            Duration::from_secs(60),
            3,
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        let timeouts = provider.timeouts_seen.lock().unwrap().clone();
        assert_eq!(
            timeouts,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(90),
                Duration::from_secs(120),
            ]
        );
    }
}
