//! Aggregates tools across every registered server and dispatches calls.
//!
//! Servers are kept in registration order, which is load-bearing: the
//! aggregated catalog lists tools in that order, and when two servers expose
//! a tool with the same name the earlier registration wins silently.

use crate::models::content::Content;
use crate::models::message::{MessageContent, ToolRequest};
use crate::models::tool::Tool;
use crate::transport::{
    PromptInfo, ResourceContent, ResourceInfo, TransportClient, TransportError,
};
use crate::errors::ToolError;
use async_trait::async_trait;
use lazy_static::lazy_static;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-server deadline when building the aggregated catalog.
pub const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-server deadline when resolving a tool name to its owner.
pub const LOCATE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between calls in a batch so a server is never hammered
/// back-to-back.
const BATCH_PAUSE: Duration = Duration::from_millis(100);

lazy_static! {
    /// Deadlines by tool name. This is a heuristic keyed on the name alone,
    /// not the declared schema; tools absent from the table get the default.
    static ref TOOL_TIMEOUTS: HashMap<&'static str, u64> = {
        let mut map = HashMap::new();
        // Read tools - fast
        map.insert("read_doc", 10);
        map.insert("get_doc_content", 10);
        map.insert("list_docs", 10);
        map.insert("server_status", 10);
        // Edit tools - medium
        map.insert("edit_doc", 20);
        // Compound tools - long
        map.insert("duplicate_doc", 30);
        // Search/analysis tools - very long
        map.insert("search", 45);
        map.insert("analyze", 60);
        map.insert("generate_interview_questions", 60);
        map
    };
}

const DEFAULT_TOOL_TIMEOUT: u64 = 25;

/// Deadline for one invocation of the named tool.
pub fn timeout_for_tool(name: &str) -> Duration {
    Duration::from_secs(
        TOOL_TIMEOUTS
            .get(name)
            .copied()
            .unwrap_or(DEFAULT_TOOL_TIMEOUT),
    )
}

/// The surface a tool server offers to the router and the query
/// preprocessor. [`TransportClient`] is the production implementation; tests
/// substitute in-process fakes.
#[async_trait]
pub trait ToolServer: Send + Sync {
    fn name(&self) -> &str;

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<Tool>, TransportError>;

    /// Raw tool invocation; `None` means the server answered with null.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError>;

    async fn list_prompts(&self, timeout: Duration) -> Result<Vec<PromptInfo>, TransportError>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Vec<crate::models::message::Message>, TransportError>;

    async fn list_resources(&self, timeout: Duration)
        -> Result<Vec<ResourceInfo>, TransportError>;

    async fn read_resource(
        &self,
        uri: &str,
        timeout: Duration,
    ) -> Result<ResourceContent, TransportError>;
}

#[async_trait]
impl ToolServer for TransportClient {
    fn name(&self) -> &str {
        TransportClient::name(self)
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<Tool>, TransportError> {
        TransportClient::list_tools(self, timeout).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        TransportClient::call_tool(self, name, arguments, timeout).await
    }

    async fn list_prompts(&self, timeout: Duration) -> Result<Vec<PromptInfo>, TransportError> {
        TransportClient::list_prompts(self, timeout).await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Vec<crate::models::message::Message>, TransportError> {
        TransportClient::get_prompt(self, name, arguments, timeout).await
    }

    async fn list_resources(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ResourceInfo>, TransportError> {
        TransportClient::list_resources(self, timeout).await
    }

    async fn read_resource(
        &self,
        uri: &str,
        timeout: Duration,
    ) -> Result<ResourceContent, TransportError> {
        TransportClient::read_resource(self, uri, timeout).await
    }
}

/// The dispatcher's normalized view of one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct ToolRouter {
    servers: Vec<Arc<dyn ToolServer>>,
}

impl ToolRouter {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
        }
    }

    pub fn register(&mut self, server: Arc<dyn ToolServer>) {
        self.servers.push(server);
    }

    pub fn servers(&self) -> &[Arc<dyn ToolServer>] {
        &self.servers
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(|server| server.name().to_string())
            .collect()
    }

    /// Build the tool catalog fresh from every registered server.
    ///
    /// Servers are queried concurrently, each with its own deadline; one that
    /// errors or times out contributes zero tools and the rest of the catalog
    /// is unaffected. The output keeps registration order regardless of which
    /// server answers first. Never cached: tool sets may change between
    /// turns.
    pub async fn catalog(&self) -> Vec<Tool> {
        let queries = self
            .servers
            .iter()
            .map(|server| server.list_tools(CATALOG_TIMEOUT));
        let outcomes = futures::future::join_all(queries).await;

        let mut tools = Vec::new();
        for (server, outcome) in self.servers.iter().zip(outcomes) {
            match outcome {
                Ok(batch) => {
                    debug!(server = server.name(), count = batch.len(), "collected tools");
                    tools.extend(batch);
                }
                Err(err) => {
                    warn!(server = server.name(), %err, "skipping server in catalog");
                }
            }
        }
        tools
    }

    /// Resolve a tool name to the first registered server exposing it.
    pub async fn locate(&self, tool_name: &str) -> Option<Arc<dyn ToolServer>> {
        for server in &self.servers {
            match server.list_tools(LOCATE_TIMEOUT).await {
                Ok(tools) if tools.iter().any(|tool| tool.name == tool_name) => {
                    return Some(Arc::clone(server));
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(server = server.name(), %err, "could not check server for tool");
                }
            }
        }
        None
    }

    /// Invoke one tool with a deadline and classify the outcome.
    pub async fn dispatch(
        &self,
        server: &dyn ToolServer,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> ToolExecutionResult {
        info!(
            server = server.name(),
            tool = name,
            timeout_secs = timeout.as_secs(),
            "executing tool"
        );

        let outcome = server.call_tool(name, arguments, timeout).await;
        match outcome {
            Ok(Some(result)) => normalize_result(name, &result),
            Ok(None) => ToolExecutionResult {
                success: false,
                content: format!("Tool '{name}' returned no result"),
                error: Some("No result returned".to_string()),
            },
            Err(err) => ToolExecutionResult {
                success: false,
                content: String::new(),
                error: Some(err.to_string()),
            },
        }
    }

    /// Execute a batch of tool requests strictly in order.
    ///
    /// The output always has one `ToolResponse` block per request, in request
    /// order; an entry that cannot be located or fails never aborts the rest
    /// of the batch.
    pub async fn execute_batch(&self, requests: &[&ToolRequest]) -> Vec<MessageContent> {
        info!(count = requests.len(), "executing tool batch");
        let mut results = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            let entry = match &request.tool_call {
                Err(err) => MessageContent::tool_response(request.id.clone(), Err(err.clone())),
                Ok(call) => {
                    let response = match self.locate(&call.name).await {
                        None => Err(ToolError::NotFound(
                            json!({
                                "error": format!("Tool '{}' not found", call.name),
                                "registered_servers": self.server_names(),
                            })
                            .to_string(),
                        )),
                        Some(server) => {
                            let timeout = timeout_for_tool(&call.name);
                            let result = self
                                .dispatch(server.as_ref(), &call.name, call.arguments.clone(), timeout)
                                .await;
                            if result.success {
                                Ok(vec![Content::text(result.content)])
                            } else {
                                Err(ToolError::ExecutionError(format!(
                                    "{} (tool '{}')",
                                    result
                                        .error
                                        .unwrap_or_else(|| "unknown failure".to_string()),
                                    call.name,
                                )))
                            }
                        }
                    };
                    MessageContent::tool_response(request.id.clone(), response)
                }
            };
            results.push(entry);

            if index + 1 < requests.len() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        results
    }
}

/// Extract the usable content from a raw tool result: the concatenated text
/// segments when any decode, otherwise a rendering of the whole result.
fn normalize_result(name: &str, result: &Value) -> ToolExecutionResult {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut parts = Vec::new();
    if let Some(segments) = result.get("content").and_then(Value::as_array) {
        for segment in segments {
            if let Ok(Content::Text(text)) = serde_json::from_value::<Content>(segment.clone()) {
                parts.push(text.text);
            }
        }
    }
    let content = if parts.is_empty() {
        result.to_string()
    } else {
        parts.join("\n")
    };

    if is_error {
        ToolExecutionResult {
            success: false,
            content,
            error: Some(format!("Tool '{name}' reported an error")),
        }
    } else {
        ToolExecutionResult {
            success: true,
            content,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Message;
    use crate::models::tool::ToolCall;
    use std::collections::HashMap as StdHashMap;

    struct StaticServer {
        name: String,
        tools: Vec<Tool>,
        responses: StdHashMap<String, Result<Option<Value>, String>>,
        broken: bool,
    }

    impl StaticServer {
        fn new(name: &str, tool_names: &[&str]) -> Self {
            let tools = tool_names
                .iter()
                .map(|name| Tool::new(*name, format!("Tool {name}"), json!({"type": "object"})))
                .collect();
            Self {
                name: name.to_string(),
                tools,
                responses: StdHashMap::new(),
                broken: false,
            }
        }

        fn broken(name: &str) -> Self {
            let mut server = Self::new(name, &[]);
            server.broken = true;
            server
        }

        fn respond(mut self, tool: &str, result: Value) -> Self {
            self.responses.insert(tool.to_string(), Ok(Some(result)));
            self
        }

        fn respond_null(mut self, tool: &str) -> Self {
            self.responses.insert(tool.to_string(), Ok(None));
            self
        }

        fn respond_timeout(mut self, tool: &str) -> Self {
            self.responses
                .insert(tool.to_string(), Err("timeout".to_string()));
            self
        }
    }

    #[async_trait]
    impl ToolServer for StaticServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self, _timeout: Duration) -> Result<Vec<Tool>, TransportError> {
            if self.broken {
                return Err(TransportError::Closed {
                    server: self.name.clone(),
                });
            }
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
            timeout: Duration,
        ) -> Result<Option<Value>, TransportError> {
            match self.responses.get(name) {
                Some(Ok(result)) => Ok(result.clone()),
                Some(Err(_)) => Err(TransportError::Timeout {
                    server: self.name.clone(),
                    method: "tools/call".to_string(),
                    seconds: timeout.as_secs(),
                }),
                None => Ok(Some(json!({"content": [{"type": "text", "text": "ok"}]}))),
            }
        }

        async fn list_prompts(
            &self,
            _timeout: Duration,
        ) -> Result<Vec<PromptInfo>, TransportError> {
            Ok(Vec::new())
        }

        async fn get_prompt(
            &self,
            _name: &str,
            _arguments: Value,
            _timeout: Duration,
        ) -> Result<Vec<Message>, TransportError> {
            Ok(Vec::new())
        }

        async fn list_resources(
            &self,
            _timeout: Duration,
        ) -> Result<Vec<ResourceInfo>, TransportError> {
            Ok(Vec::new())
        }

        async fn read_resource(
            &self,
            _uri: &str,
            _timeout: Duration,
        ) -> Result<ResourceContent, TransportError> {
            Err(TransportError::Protocol {
                server: self.name.clone(),
                message: "no resources".to_string(),
            })
        }
    }

    fn request(id: &str, tool: &str) -> ToolRequest {
        ToolRequest {
            id: id.to_string(),
            tool_call: Ok(ToolCall::new(tool, json!({}))),
        }
    }

    #[tokio::test]
    async fn test_catalog_preserves_registration_order() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(StaticServer::new("alpha", &["a1", "a2"])));
        router.register(Arc::new(StaticServer::new("beta", &["b1"])));

        let catalog = router.catalog().await;
        let names: Vec<&str> = catalog.iter().map(|tool| tool.name.as_str()).collect();
        assert_eq!(names, vec!["a1", "a2", "b1"]);
    }

    #[tokio::test]
    async fn test_catalog_is_stable_across_calls() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(StaticServer::new("alpha", &["a1"])));
        router.register(Arc::new(StaticServer::new("beta", &["b1"])));

        let first: Vec<String> = router.catalog().await.into_iter().map(|t| t.name).collect();
        let second: Vec<String> = router.catalog().await.into_iter().map(|t| t.name).collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_broken_server_contributes_zero_tools() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(StaticServer::broken("dead")));
        router.register(Arc::new(StaticServer::new("alive", &["tool"])));

        let catalog = router.catalog().await;
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].name, "tool");
    }

    #[tokio::test]
    async fn test_locate_first_registered_wins() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(StaticServer::new("first", &["ping"])));
        router.register(Arc::new(StaticServer::new("second", &["ping"])));

        for _ in 0..3 {
            let server = router.locate("ping").await.unwrap();
            assert_eq!(server.name(), "first");
        }
    }

    #[tokio::test]
    async fn test_locate_missing_tool() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(StaticServer::new("only", &["ping"])));
        assert!(router.locate("pong").await.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_concatenates_text_segments() {
        let server = StaticServer::new("s", &["multi"]).respond(
            "multi",
            json!({"content": [
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two"},
            ]}),
        );
        let router = ToolRouter::new();
        let result = router
            .dispatch(&server, "multi", json!({}), Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert_eq!(result.content, "one\ntwo");
    }

    #[tokio::test]
    async fn test_dispatch_falls_back_to_raw_rendering() {
        let server = StaticServer::new("s", &["odd"])
            .respond("odd", json!({"content": [{"type": "chart", "bars": [1]}]}));
        let router = ToolRouter::new();
        let result = router
            .dispatch(&server, "odd", json!({}), Duration::from_secs(5))
            .await;
        assert!(result.success);
        assert!(result.content.contains("chart"));
    }

    #[tokio::test]
    async fn test_dispatch_null_result_is_failure() {
        let server = StaticServer::new("s", &["nil"]).respond_null("nil");
        let router = ToolRouter::new();
        let result = router
            .dispatch(&server, "nil", json!({}), Duration::from_secs(5))
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No result returned"));
    }

    #[tokio::test]
    async fn test_dispatch_error_flag_is_failure() {
        let server = StaticServer::new("s", &["bad"]).respond(
            "bad",
            json!({"isError": true, "content": [{"type": "text", "text": "boom"}]}),
        );
        let router = ToolRouter::new();
        let result = router
            .dispatch(&server, "bad", json!({}), Duration::from_secs(5))
            .await;
        assert!(!result.success);
        assert_eq!(result.content, "boom");
        assert!(result.error.unwrap().contains("reported an error"));
    }

    #[tokio::test]
    async fn test_batch_preserves_count_and_order() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(
            StaticServer::new("s", &["a", "b"])
                .respond("a", json!({"content": [{"type": "text", "text": "ra"}]}))
                .respond("b", json!({"content": [{"type": "text", "text": "rb"}]})),
        ));

        let ra = request("1", "a");
        let rb = request("2", "b");
        let rc = request("3", "missing");
        let results = router.execute_batch(&[&ra, &rb, &rc]).await;

        assert_eq!(results.len(), 3);
        let ids: Vec<&str> = results
            .iter()
            .map(|entry| entry.as_tool_response().unwrap().id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(results[0].as_tool_response().unwrap().tool_result.is_ok());
        assert!(results[2].as_tool_response().unwrap().tool_result.is_err());
    }

    #[tokio::test]
    async fn test_batch_not_found_lists_registered_servers() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(StaticServer::new("docs", &["read_doc"])));
        router.register(Arc::new(StaticServer::new("search", &["search"])));

        let req = request("1", "no_such_tool");
        let results = router.execute_batch(&[&req]).await;
        let err = results[0]
            .as_tool_response()
            .unwrap()
            .tool_result
            .as_ref()
            .unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("no_such_tool"));
        assert!(rendered.contains("docs"));
        assert!(rendered.contains("search"));
    }

    #[tokio::test]
    async fn test_batch_timeout_entry_mentions_timed_out() {
        let mut router = ToolRouter::new();
        router.register(Arc::new(
            StaticServer::new("s", &["search"]).respond_timeout("search"),
        ));

        let req = request("1", "search");
        let results = router.execute_batch(&[&req]).await;
        let err = results[0]
            .as_tool_response()
            .unwrap()
            .tool_result
            .as_ref()
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_batch_preserves_malformed_request_error() {
        let router = ToolRouter::new();
        let req = ToolRequest {
            id: "1".to_string(),
            tool_call: Err(ToolError::InvalidParameters("bad json".to_string())),
        };
        let results = router.execute_batch(&[&req]).await;
        let err = results[0]
            .as_tool_response()
            .unwrap()
            .tool_result
            .as_ref()
            .unwrap_err();
        assert_eq!(err, &ToolError::InvalidParameters("bad json".to_string()));
    }

    #[test]
    fn test_timeout_table() {
        assert_eq!(timeout_for_tool("read_doc"), Duration::from_secs(10));
        assert_eq!(timeout_for_tool("edit_doc"), Duration::from_secs(20));
        assert_eq!(timeout_for_tool("duplicate_doc"), Duration::from_secs(30));
        assert_eq!(timeout_for_tool("search"), Duration::from_secs(45));
        assert_eq!(timeout_for_tool("analyze"), Duration::from_secs(60));
        assert_eq!(timeout_for_tool("brand_new_tool"), Duration::from_secs(25));
    }
}
