use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by tool lookup and execution.
///
/// This is serializable because tool errors are carried inside transcript
/// messages: a failed call stays part of the conversation so the model can
/// react to it on the next turn.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ToolResult<T> = Result<T, ToolError>;
