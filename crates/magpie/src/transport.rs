//! Client side of the stdio tool server protocol.
//!
//! Each [`TransportClient`] owns exactly one subprocess and the pipes to it.
//! Frames are line-delimited JSON-RPC 2.0: requests we issue are matched to
//! responses through a pending map, and requests the *server* issues (ping,
//! sampling) are answered by a background task so the read loop is never
//! blocked on a handler.

use crate::models::content::Content;
use crate::models::message::Message;
use crate::models::role::Role;
use crate::models::tool::Tool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Subprocess teardown is asynchronous on some platforms; wait this long
/// after the kill before declaring the client gone.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn server '{server}': {source}")]
    Spawn {
        server: String,
        source: std::io::Error,
    },

    #[error("connection to server '{server}' failed: {message}")]
    Connection { server: String, message: String },

    #[error("server '{server}' returned an invalid payload: {message}")]
    Protocol { server: String, message: String },

    #[error("request '{method}' to server '{server}' timed out after {seconds}s")]
    Timeout {
        server: String,
        method: String,
        seconds: u64,
    },

    #[error("server '{server}' closed the connection")]
    Closed { server: String },

    #[error("server '{server}' replied with error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
}

/// How to launch one tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerConfig {
    pub fn new<N: Into<String>, C: Into<String>>(name: N, command: C, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }
}

/// A prompt template advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// A resource advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceInfo {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
}

/// A resource body, decoded as JSON when the media type says so (or when the
/// text happens to parse), raw text otherwise. Best-effort by design.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceContent {
    Json(Value),
    Text(String),
}

impl ResourceContent {
    /// Render the content as plain text for interpolation into a prompt.
    pub fn as_text(&self) -> String {
        match self {
            ResourceContent::Json(value) => value.to_string(),
            ResourceContent::Text(text) => text.clone(),
        }
    }
}

/// An inbound `sampling/createMessage` request from a server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageParams {
    #[serde(default)]
    pub messages: Vec<SamplingMessage>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplingMessage {
    pub role: Role,
    pub content: Value,
}

impl SamplingMessage {
    /// Pull the text out of the content, falling back to a raw rendering of
    /// whatever the server sent.
    pub fn text(&self) -> String {
        match self.content.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => match &self.content {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// The answer to a sampling request, always well-formed.
#[derive(Debug, Clone, Serialize)]
pub struct CreateMessageResult {
    pub role: Role,
    pub model: String,
    pub content: Content,
}

/// Installed on a client to satisfy inbound sampling requests.
///
/// Implementations must always produce a result; surfacing failures as
/// error-shaped text keeps the server's request/response cycle alive.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(&self, params: CreateMessageParams) -> CreateMessageResult;
}

#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("server", &self.inner.config.name)
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    config: ServerConfig,
    child: std::sync::Mutex<Option<Child>>,
    writer: Mutex<Option<BufWriter<ChildStdin>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>,
    id_counter: AtomicU64,
    handler: Option<Arc<dyn SamplingHandler>>,
}

impl TransportClient {
    /// Spawn the server process and perform the protocol handshake.
    ///
    /// The optional handler answers `sampling/createMessage` requests the
    /// server may issue at any point while the connection is open.
    pub async fn connect(
        config: ServerConfig,
        handler: Option<Arc<dyn SamplingHandler>>,
    ) -> Result<Self, TransportError> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Connection {
            server: config.name.clone(),
            message: "failed to capture server stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Connection {
            server: config.name.clone(),
            message: "failed to capture server stdout".to_string(),
        })?;

        let client = TransportClient {
            inner: Arc::new(ClientInner {
                config,
                child: std::sync::Mutex::new(Some(child)),
                writer: Mutex::new(Some(BufWriter::new(stdin))),
                pending: Mutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
                handler,
            }),
        };

        let reader = Arc::clone(&client.inner);
        tokio::spawn(async move {
            reader.read_loop(stdout).await;
        });

        match client.handshake().await {
            Ok(()) => Ok(client),
            Err(err) => {
                client.shutdown().await;
                Err(TransportError::Connection {
                    server: client.name().to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "sampling": {} },
        });
        self.inner
            .send_request("initialize", params, HANDSHAKE_TIMEOUT)
            .await?;
        self.inner
            .send_notification("notifications/initialized", json!({}))
            .await?;
        Ok(())
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<Tool>, TransportError> {
        let result = self.inner.send_request("tools/list", json!({}), timeout).await?;
        Ok(decode_tools(&result))
    }

    /// Invoke a tool and return the raw result object, or `None` when the
    /// server answered with an explicit null. Classification of the outcome
    /// belongs to the dispatcher.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        let params = json!({
            "name": name,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            },
        });
        let result = self.inner.send_request("tools/call", params, timeout).await?;
        match result {
            Value::Null => Ok(None),
            other => Ok(Some(other)),
        }
    }

    pub async fn list_prompts(&self, timeout: Duration) -> Result<Vec<PromptInfo>, TransportError> {
        let result = self
            .inner
            .send_request("prompts/list", json!({}), timeout)
            .await?;
        let prompts = result.get("prompts").cloned().unwrap_or(json!([]));
        serde_json::from_value(prompts).map_err(|err| self.inner.protocol_error(err.to_string()))
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Vec<Message>, TransportError> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.inner.send_request("prompts/get", params, timeout).await?;
        decode_prompt_messages(&result)
            .map_err(|message| self.inner.protocol_error(message))
    }

    pub async fn list_resources(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ResourceInfo>, TransportError> {
        let result = self
            .inner
            .send_request("resources/list", json!({}), timeout)
            .await?;
        let resources = result.get("resources").cloned().unwrap_or(json!([]));
        serde_json::from_value(resources).map_err(|err| self.inner.protocol_error(err.to_string()))
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        timeout: Duration,
    ) -> Result<ResourceContent, TransportError> {
        let result = self
            .inner
            .send_request("resources/read", json!({ "uri": uri }), timeout)
            .await?;
        decode_resource(&result).map_err(|message| self.inner.protocol_error(message))
    }

    /// Close the channel and terminate the subprocess.
    ///
    /// Safe to call on every exit path; pending requests are failed rather
    /// than left hanging, and a short grace period covers platforms where
    /// process teardown is asynchronous.
    pub async fn shutdown(&self) {
        {
            let mut writer = self.inner.writer.lock().await;
            *writer = None;
        }

        let child = {
            let mut guard = self
                .inner
                .child
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.take()
        };
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                debug!(server = self.name(), %err, "kill failed (server may have exited)");
            }
            let _ = child.wait().await;
        }

        self.inner.fail_all_pending().await;
        tokio::time::sleep(SHUTDOWN_GRACE).await;
    }
}

impl ClientInner {
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(id, tx);
        }

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed {
                server: self.config.name.clone(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout {
                    server: self.config.name.clone(),
                    method: method.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_message(&payload).await
    }

    async fn send_response(&self, id: Value, result: Value) -> Result<(), TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        self.write_message(&payload).await
    }

    async fn send_error(&self, id: Value, code: i64, message: String) -> Result<(), TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), TransportError> {
        let encoded = message.to_string();
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or_else(|| TransportError::Closed {
            server: self.config.name.clone(),
        })?;

        let write = async {
            stream.write_all(encoded.as_bytes()).await?;
            stream.write_all(b"\n").await?;
            stream.flush().await
        };
        write.await.map_err(|err| TransportError::Connection {
            server: self.config.name.clone(),
            message: err.to_string(),
        })
    }

    async fn read_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(raw)) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(frame) => self.route_frame(frame).await,
                        Err(err) => {
                            warn!(
                                server = %self.config.name,
                                line = trimmed,
                                %err,
                                "server wrote a non-JSON line; ignoring"
                            );
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(server = %self.config.name, %err, "read loop error");
                    break;
                }
            }
        }

        debug!(server = %self.config.name, "server channel closed");
        self.fail_all_pending().await;
    }

    async fn route_frame(self: &Arc<Self>, frame: Value) {
        match (frame.get("id").cloned(), frame.get("method").is_some()) {
            (Some(id), true) => self.handle_server_request(id, frame).await,
            (Some(id), false) => self.handle_response(id, frame).await,
            (None, true) => {
                let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
                debug!(server = %self.config.name, method, "notification from server");
            }
            (None, false) => {}
        }
    }

    async fn handle_response(&self, id: Value, frame: Value) {
        let key = match id.as_u64() {
            Some(key) => key,
            None => return,
        };
        let responder = {
            let mut pending = self.pending.lock().await;
            pending.remove(&key)
        };
        let responder = match responder {
            Some(responder) => responder,
            None => {
                debug!(server = %self.config.name, key, "response for unknown request");
                return;
            }
        };

        let outcome = if let Some(error) = frame.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(TransportError::Rpc {
                server: self.config.name.clone(),
                code,
                message,
            })
        } else {
            Ok(frame.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = responder.send(outcome);
    }

    async fn handle_server_request(self: &Arc<Self>, id: Value, frame: Value) {
        let method = frame
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match method.as_str() {
            "ping" => {
                let _ = self.send_response(id, json!({})).await;
            }
            "sampling/createMessage" => {
                let handler = match &self.handler {
                    Some(handler) => Arc::clone(handler),
                    None => {
                        let _ = self
                            .send_error(id, -32601, "sampling is not supported".to_string())
                            .await;
                        return;
                    }
                };
                let params = frame.get("params").cloned().unwrap_or(json!({}));
                let params: CreateMessageParams = match serde_json::from_value(params) {
                    Ok(params) => params,
                    Err(err) => {
                        let _ = self
                            .send_error(id, -32602, format!("invalid sampling params: {err}"))
                            .await;
                        return;
                    }
                };

                // Answer from a separate task: the handler performs its own
                // network round trip and the read loop must stay free to
                // deliver responses for our outstanding requests.
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    let result = handler.create_message(params).await;
                    match serde_json::to_value(&result) {
                        Ok(value) => {
                            if let Err(err) = inner.send_response(id, value).await {
                                error!(server = %inner.config.name, %err, "failed to answer sampling request");
                            }
                        }
                        Err(err) => {
                            let _ = inner
                                .send_error(id, -32603, format!("failed to encode result: {err}"))
                                .await;
                        }
                    }
                });
            }
            other => {
                warn!(server = %self.config.name, method = other, "unsupported server request");
                let _ = self
                    .send_error(id, -32601, format!("client does not implement '{other}'"))
                    .await;
            }
        }
    }

    async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(TransportError::Closed {
                server: self.config.name.clone(),
            }));
        }
    }

    fn protocol_error(&self, message: impl Into<String>) -> TransportError {
        TransportError::Protocol {
            server: self.config.name.clone(),
            message: message.into(),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

fn decode_tools(result: &Value) -> Vec<Tool> {
    let mut tools = Vec::new();
    if let Some(array) = result.get("tools").and_then(Value::as_array) {
        for entry in array {
            let name = match entry.get("name").and_then(Value::as_str) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let description = entry
                .get("description")
                .and_then(Value::as_str)
                .map(|text| text.to_string())
                .unwrap_or_else(|| format!("Tool {name}"));
            let input_schema = entry
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
            tools.push(Tool::new(name, description, input_schema));
        }
    }
    tools
}

fn decode_prompt_messages(result: &Value) -> Result<Vec<Message>, String> {
    let entries = result
        .get("messages")
        .and_then(Value::as_array)
        .ok_or("prompt result has no messages array")?;

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
        let base = if role == "assistant" {
            Message::assistant()
        } else {
            Message::user()
        };
        let text = match entry.get("content") {
            Some(Value::String(text)) => text.clone(),
            Some(content) => match content.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => return Err(format!("prompt content has no text: {content}")),
            },
            None => return Err("prompt message has no content".to_string()),
        };
        messages.push(base.with_text(text));
    }
    Ok(messages)
}

fn decode_resource(result: &Value) -> Result<ResourceContent, String> {
    let first = result
        .get("contents")
        .and_then(Value::as_array)
        .and_then(|contents| contents.first())
        .ok_or("resource result has no contents")?;

    let text = first
        .get("text")
        .and_then(Value::as_str)
        .ok_or("resource content has no text body")?;

    let mime_type = first.get("mimeType").and_then(Value::as_str);
    if mime_type == Some("application/json") {
        return serde_json::from_str(text)
            .map(ResourceContent::Json)
            .map_err(|err| format!("resource declared as JSON failed to parse: {err}"));
    }

    // Not declared as JSON but may still be JSON; fall back to raw text.
    match serde_json::from_str(text) {
        Ok(value) => Ok(ResourceContent::Json(value)),
        Err(_) => Ok(ResourceContent::Text(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_tools_applies_defaults() {
        let result = json!({
            "tools": [
                {"name": "read_doc", "description": "Read a doc", "inputSchema": {"type": "object"}},
                {"name": "bare"},
                {"description": "nameless entries are skipped"},
            ]
        });
        let tools = decode_tools(&result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "read_doc");
        assert_eq!(tools[1].description, "Tool bare");
        assert_eq!(tools[1].input_schema["type"], "object");
    }

    #[test]
    fn test_decode_prompt_messages() {
        let result = json!({
            "messages": [
                {"role": "user", "content": {"type": "text", "text": "summarize plan.md"}},
                {"role": "assistant", "content": "on it"},
            ]
        });
        let messages = decode_prompt_messages(&result).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text(), "summarize plan.md");
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[test]
    fn test_decode_prompt_messages_rejects_missing_text() {
        let result = json!({"messages": [{"role": "user", "content": {"type": "image"}}]});
        assert!(decode_prompt_messages(&result).is_err());
    }

    #[test]
    fn test_decode_resource_declared_json() {
        let result = json!({
            "contents": [{"uri": "docs://documents", "mimeType": "application/json", "text": "[\"a.md\",\"b.md\"]"}]
        });
        match decode_resource(&result).unwrap() {
            ResourceContent::Json(value) => assert_eq!(value, json!(["a.md", "b.md"])),
            other => panic!("expected JSON content, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_resource_declared_json_but_invalid() {
        let result = json!({
            "contents": [{"uri": "docs://x", "mimeType": "application/json", "text": "not json"}]
        });
        assert!(decode_resource(&result).is_err());
    }

    #[test]
    fn test_decode_resource_best_effort_fallback() {
        let parses = json!({"contents": [{"uri": "docs://x", "text": "{\"k\": 1}"}]});
        match decode_resource(&parses).unwrap() {
            ResourceContent::Json(value) => assert_eq!(value["k"], 1),
            other => panic!("expected JSON content, got {other:?}"),
        }

        let plain = json!({"contents": [{"uri": "docs://x", "text": "just words"}]});
        match decode_resource(&plain).unwrap() {
            ResourceContent::Text(text) => assert_eq!(text, "just words"),
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[test]
    fn test_sampling_message_text_extraction() {
        let typed = SamplingMessage {
            role: Role::User,
            content: json!({"type": "text", "text": "hello"}),
        };
        assert_eq!(typed.text(), "hello");

        let bare = SamplingMessage {
            role: Role::User,
            content: json!("plain"),
        };
        assert_eq!(bare.text(), "plain");

        let odd = SamplingMessage {
            role: Role::User,
            content: json!({"data": 3}),
        };
        assert_eq!(odd.text(), "{\"data\":3}");
    }
}
