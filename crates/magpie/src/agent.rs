//! The conversation loop.
//!
//! One [`Agent`] drives one conversation: it appends the (possibly
//! preprocessed) user input, asks the provider for a turn with the full tool
//! catalog, executes any requested tools through the router, feeds the
//! results back, and stops on a natural answer or the iteration ceiling.
//! `run` never fails: every internal fault degrades to a user-visible string
//! while the cause is preserved in the logs.

use crate::models::message::Message;
use crate::preprocess::{PreparedInput, QueryPreprocessor};
use crate::providers::base::{
    complete_with_retry, Provider, ProviderError, DEFAULT_COMPLETION_TIMEOUT,
};
use crate::router::ToolRouter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Hard ceiling on Thinking entries per user turn.
pub const DEFAULT_MAX_ITERATIONS: usize = 5;
/// Pause before retrying a failed Thinking step.
const STEP_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Attempts the completion retry layer makes per Thinking step.
const COMPLETION_ATTEMPTS: u32 = 3;
const COMPLETION_BASE_DELAY: Duration = Duration::from_secs(1);

pub const MAX_ITERATIONS_MESSAGE: &str =
    "I reached the maximum number of iterations without arriving at a final answer.";
pub const APOLOGY_MESSAGE: &str =
    "I'm sorry - something went wrong while generating a response. Please try again.";
pub const EMPTY_RESPONSE_MESSAGE: &str = "I couldn't generate a response.";

enum StepOutcome {
    /// The model produced a final (or degraded-final) answer.
    Answer(String),
    /// Tools were executed and their results appended; think again.
    Continue,
}

pub struct Agent {
    provider: Arc<dyn Provider>,
    router: ToolRouter,
    preprocessor: Option<Box<dyn QueryPreprocessor>>,
    system_prompt: Option<String>,
    transcript: Vec<Message>,
    max_iterations: usize,
    step_retry_delay: Duration,
    conversation_id: String,
}

impl Agent {
    pub fn new(provider: Arc<dyn Provider>, router: ToolRouter) -> Self {
        Self {
            provider,
            router,
            preprocessor: None,
            system_prompt: None,
            transcript: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            step_retry_delay: STEP_RETRY_DELAY,
            conversation_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Box<dyn QueryPreprocessor>) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    #[cfg(test)]
    fn with_step_retry_delay(mut self, delay: Duration) -> Self {
        self.step_retry_delay = delay;
        self
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    /// The append-only conversation history. Messages are never rewritten or
    /// truncated here; windowing is a caller concern.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Run one user turn to completion. Infallible by design: the worst
    /// outcomes are fixed fallback strings, never a propagated fault.
    pub async fn run(&mut self, query: &str) -> String {
        info!(
            conversation = self.conversation_id.as_str(),
            query_len = query.len(),
            "processing user query"
        );

        let prepared = match &self.preprocessor {
            Some(preprocessor) => preprocessor.prepare(query).await,
            None => PreparedInput::Prompt(query.to_string()),
        };
        match prepared {
            PreparedInput::Messages(messages) => self.transcript.extend(messages),
            PreparedInput::Prompt(prompt) => {
                self.transcript.push(Message::user().with_text(prompt));
            }
        }

        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            match self.step().await {
                Ok(StepOutcome::Answer(text)) => {
                    info!(
                        conversation = self.conversation_id.as_str(),
                        iterations, "conversation turn complete"
                    );
                    return text;
                }
                Ok(StepOutcome::Continue) => {}
                Err(err) => {
                    error!(
                        conversation = self.conversation_id.as_str(),
                        iteration = iterations,
                        %err,
                        "thinking step failed"
                    );
                    if iterations < self.max_iterations {
                        tokio::time::sleep(self.step_retry_delay).await;
                    } else {
                        return APOLOGY_MESSAGE.to_string();
                    }
                }
            }
        }

        warn!(
            conversation = self.conversation_id.as_str(),
            "iteration ceiling reached without an answer"
        );
        MAX_ITERATIONS_MESSAGE.to_string()
    }

    async fn step(&mut self) -> Result<StepOutcome, ProviderError> {
        // Rebuilt every step: server tool sets may change between turns.
        let tools = self.router.catalog().await;

        let response = complete_with_retry(
            self.provider.as_ref(),
            self.system_prompt.as_deref(),
            &self.transcript,
            &tools,
            None,
            None,
            DEFAULT_COMPLETION_TIMEOUT,
            COMPLETION_ATTEMPTS,
            COMPLETION_BASE_DELAY,
        )
        .await?;

        let finish_reason = response.finish_reason.clone();
        self.transcript.push(response.message);

        if finish_reason.is_tool_use() {
            let results = {
                let message = self
                    .transcript
                    .last()
                    .filter(|message| !message.tool_requests().is_empty());
                let message = match message {
                    Some(message) => message,
                    None => {
                        // Tool use was signalled but nothing parseable came
                        // with it; end the turn with whatever text we got
                        // instead of looping on a malformed response.
                        warn!(
                            conversation = self.conversation_id.as_str(),
                            "tool use indicated but no tool requests present"
                        );
                        let text = self
                            .transcript
                            .last()
                            .map(Message::text)
                            .unwrap_or_default();
                        return Ok(StepOutcome::Answer(non_empty_or_fallback(text)));
                    }
                };
                let requests = message.tool_requests();
                self.router.execute_batch(&requests).await
            };

            let mut tool_message = Message::user();
            for entry in results {
                tool_message = tool_message.with_content(entry);
            }
            self.transcript.push(tool_message);
            return Ok(StepOutcome::Continue);
        }

        let text = self
            .transcript
            .last()
            .map(Message::text)
            .unwrap_or_default();
        Ok(StepOutcome::Answer(non_empty_or_fallback(text)))
    }
}

fn non_empty_or_fallback(text: String) -> String {
    if text.trim().is_empty() {
        EMPTY_RESPONSE_MESSAGE.to_string()
    } else {
        text
    }
}
