//! Query preprocessing for the agent loop.
//!
//! The loop itself stays ignorant of documents and prompt templates; it holds
//! a [`QueryPreprocessor`] and feeds whatever comes back into the transcript.

use crate::models::message::Message;
use crate::router::ToolServer;
use crate::transport::ResourceContent;
use async_trait::async_trait;
use indoc::formatdoc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RESOURCE_TIMEOUT: Duration = Duration::from_secs(10);
const PROMPT_TIMEOUT: Duration = Duration::from_secs(10);
const DOC_INDEX_URI: &str = "docs://documents";

/// What a query turned into after preprocessing.
#[derive(Debug, Clone, PartialEq)]
pub enum PreparedInput {
    /// Template messages to append verbatim instead of the raw query.
    Messages(Vec<Message>),
    /// A prompt to append as the user message; possibly the literal query.
    Prompt(String),
}

#[async_trait]
pub trait QueryPreprocessor: Send + Sync {
    async fn prepare(&self, query: &str) -> PreparedInput;
}

/// Resolves `/command arg` against the designated doc server's prompt
/// templates and `@name` mentions against its resource catalog.
pub struct DocQueryPreprocessor {
    doc_server: Arc<dyn ToolServer>,
}

impl DocQueryPreprocessor {
    pub fn new(doc_server: Arc<dyn ToolServer>) -> Self {
        Self { doc_server }
    }

    async fn process_command(&self, query: &str) -> PreparedInput {
        let mut words = query.split_whitespace();
        let command = words
            .next()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();
        let doc_id = match words.next() {
            Some(doc_id) => doc_id.to_string(),
            None => {
                warn!(command = command.as_str(), "command requires a document id; sending literally");
                return PreparedInput::Prompt(query.to_string());
            }
        };

        info!(command = command.as_str(), doc_id = doc_id.as_str(), "resolving prompt template");
        match self
            .doc_server
            .get_prompt(&command, json!({ "doc_id": doc_id }), PROMPT_TIMEOUT)
            .await
        {
            Ok(messages) if !messages.is_empty() => PreparedInput::Messages(messages),
            Ok(_) => {
                warn!(command = command.as_str(), "prompt template returned no messages");
                PreparedInput::Prompt(query.to_string())
            }
            Err(err) => {
                warn!(command = command.as_str(), %err, "prompt template lookup failed");
                PreparedInput::Prompt(query.to_string())
            }
        }
    }

    async fn doc_ids(&self) -> Option<Vec<String>> {
        let content = match self
            .doc_server
            .read_resource(DOC_INDEX_URI, RESOURCE_TIMEOUT)
            .await
        {
            Ok(content) => content,
            Err(err) => {
                warn!(%err, "could not list document ids");
                return None;
            }
        };
        match content {
            ResourceContent::Json(Value::Array(entries)) => Some(
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|id| id.to_string())
                    .collect(),
            ),
            other => {
                warn!(?other, "document index is not a JSON array");
                None
            }
        }
    }

    async fn interpolate_resources(&self, query: &str) -> PreparedInput {
        let mentions: Vec<&str> = query
            .split_whitespace()
            .filter_map(|word| word.strip_prefix('@'))
            .filter(|name| !name.is_empty())
            .collect();
        if mentions.is_empty() {
            return PreparedInput::Prompt(query.to_string());
        }
        debug!(?mentions, "resolving resource mentions");

        let doc_ids = match self.doc_ids().await {
            Some(ids) => ids,
            None => return PreparedInput::Prompt(query.to_string()),
        };

        // All-or-nothing: a single unresolved mention aborts interpolation so
        // the model never sees partial context presented as complete.
        let missing: Vec<&&str> = mentions
            .iter()
            .filter(|name| !doc_ids.iter().any(|id| id == **name))
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "mentioned documents not found; sending literally");
            return PreparedInput::Prompt(query.to_string());
        }

        let mut resources = String::new();
        for name in &mentions {
            let uri = format!("{DOC_INDEX_URI}/{name}");
            match self.doc_server.read_resource(&uri, RESOURCE_TIMEOUT).await {
                Ok(content) => {
                    resources.push_str(&format!(
                        "\n<resource id=\"{name}\">\n{}\n</resource>\n",
                        content.as_text()
                    ));
                }
                Err(err) => {
                    warn!(name = *name, %err, "failed to load document; sending literally");
                    return PreparedInput::Prompt(query.to_string());
                }
            }
        }
        info!(count = mentions.len(), "loaded mentioned documents");

        let prompt = formatdoc! {r#"
            The user has a question:
            <query>
            {query}
            </query>

            The following document context is available to help answer it:
            <context>
            {resources}
            </context>

            Instructions:
            - Answer the user's question directly and concisely using the provided document context
            - Start with the exact information they need
            - If the user references documents with @ (like @report.pdf), use the content provided in the context
            - Do not mention the provided context itself - just use the information naturally
            - If you need to act on documents (like editing), use the appropriate tools
        "#};
        PreparedInput::Prompt(prompt)
    }
}

#[async_trait]
impl QueryPreprocessor for DocQueryPreprocessor {
    async fn prepare(&self, query: &str) -> PreparedInput {
        if query.trim_start().starts_with('/') {
            self.process_command(query.trim()).await
        } else {
            self.interpolate_resources(query).await
        }
    }
}
