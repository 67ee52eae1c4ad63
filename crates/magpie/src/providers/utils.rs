use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};

use super::base::{FinishReason, ProviderError, Usage};
use crate::errors::ToolError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};
use tracing::debug;

lazy_static! {
    static ref SANITIZE_RE: Regex = Regex::new(r"[^a-zA-Z0-9_-]").expect("static regex");
    static ref VALID_NAME_RE: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").expect("static regex");
}

/// Convert the internal transcript to the provider's message specification.
///
/// Every message becomes `{role, content}` with the content flattened to
/// text: tool requests and results are rendered inline rather than using the
/// provider's dedicated tool-role messages.
pub fn messages_to_wire(messages: &[Message]) -> Vec<Value> {
    let mut wire = Vec::with_capacity(messages.len());

    for message in messages {
        let mut parts = Vec::new();
        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        parts.push(text.text.clone());
                    }
                }
                MessageContent::ToolRequest(request) => match &request.tool_call {
                    Ok(call) => parts.push(format!(
                        "Requested tool '{}' with input {}",
                        call.name, call.arguments
                    )),
                    Err(err) => parts.push(format!("Invalid tool request: {err}")),
                },
                MessageContent::ToolResponse(response) => match &response.tool_result {
                    Ok(contents) => {
                        let texts: Vec<&str> = contents
                            .iter()
                            .filter_map(|content| content.as_text())
                            .collect();
                        parts.push(format!(
                            "Tool result ({}):\n{}",
                            response.id,
                            texts.join("\n")
                        ));
                    }
                    Err(err) => parts.push(format!(
                        "The tool call ({}) returned the following error:\n{}",
                        response.id, err
                    )),
                },
            }
        }

        if parts.is_empty() {
            continue;
        }
        wire.push(json!({
            "role": message.role,
            "content": parts.join("\n"),
        }));
    }

    wire
}

/// Convert internal tools to the provider's `function` descriptors.
///
/// The aggregated catalog may carry the same name from two servers; the
/// provider requires unique function names, so later duplicates are dropped —
/// mirroring the dispatcher's first-registration-wins resolution.
pub fn tools_to_wire(tools: &[Tool]) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut wire = Vec::new();

    for tool in tools {
        if !seen.insert(tool.name.as_str()) {
            debug!(tool = tool.name.as_str(), "shadowed duplicate tool in catalog");
            continue;
        }
        wire.push(json!({
            "type": "function",
            "function": {
                "name": sanitize_function_name(&tool.name),
                "description": tool.description,
                "parameters": tool.input_schema,
            }
        }));
    }

    wire
}

/// Convert the provider's response body into a message plus finish reason.
pub fn response_to_message(response: &Value) -> Result<(Message, FinishReason), ProviderError> {
    let choice = response
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .ok_or_else(|| ProviderError::Malformed("no choices in response".to_string()))?;

    let original = choice
        .get("message")
        .ok_or_else(|| ProviderError::Malformed("choice has no message".to_string()))?;

    let mut content = Vec::new();
    if let Some(text) = original.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(MessageContent::text(text));
        }
    }

    if let Some(tool_calls) = original.get("tool_calls").and_then(Value::as_array) {
        for (index, tool_call) in tool_calls.iter().enumerate() {
            let id = tool_call
                .get("id")
                .and_then(Value::as_str)
                .map(|id| id.to_string())
                .unwrap_or_else(|| format!("tool_{index}"));
            let function_name = tool_call["function"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let arguments = tool_call["function"]["arguments"]
                .as_str()
                .unwrap_or_default()
                .to_string();

            if !is_valid_function_name(&function_name) {
                let error = ToolError::NotFound(format!(
                    "The provided function name '{function_name}' had invalid characters, it must match [a-zA-Z0-9_-]+"
                ));
                content.push(MessageContent::tool_request(id, Err(error)));
            } else {
                match serde_json::from_str::<Value>(&arguments) {
                    Ok(params) => {
                        content.push(MessageContent::tool_request(
                            id,
                            Ok(ToolCall::new(&function_name, params)),
                        ));
                    }
                    Err(err) => {
                        let error = ToolError::InvalidParameters(format!(
                            "Could not interpret tool call arguments for id {id}: {err}"
                        ));
                        content.push(MessageContent::tool_request(id, Err(error)));
                    }
                }
            }
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(FinishReason::from_provider)
        .unwrap_or(FinishReason::Stop);

    let message = Message {
        role: Role::Assistant,
        created: chrono::Utc::now().timestamp(),
        content,
    };
    Ok((message, finish_reason))
}

/// Pull usage counters out of the response; missing counters stay `None`.
pub fn get_usage(response: &Value) -> Usage {
    let usage = match response.get("usage") {
        Some(usage) => usage,
        None => return Usage::default(),
    };

    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(Value::as_i64)
        .map(|v| v as i32);
    let output_tokens = usage
        .get("completion_tokens")
        .and_then(Value::as_i64)
        .map(|v| v as i32);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_i64)
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Usage::new(input_tokens, output_tokens, total_tokens)
}

pub fn sanitize_function_name(name: &str) -> String {
    SANITIZE_RE.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_NAME_RE.is_match(name)
}
