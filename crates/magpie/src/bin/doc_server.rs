//! A toy document server speaking the stdio tool server protocol.
//!
//! Serves a small in-memory document store over line-delimited JSON-RPC:
//! tools to read, edit and summarize documents, resources exposing the
//! document index and bodies, and prompt templates. `summarize_doc` issues a
//! `sampling/createMessage` request back to the connected client while the
//! client's `tools/call` is still outstanding, which makes this server the
//! test fixture for the recursive sampling path. Deliberately synchronous
//! and std-only: it is the far side of the pipe, not part of the library.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

struct DocServer {
    docs: BTreeMap<String, String>,
    stdout: io::Stdout,
}

fn seed_docs() -> BTreeMap<String, String> {
    let mut docs = BTreeMap::new();
    docs.insert(
        "deposition.md".to_string(),
        "This deposition covers the testimony of Angela Smith, P.E.".to_string(),
    );
    docs.insert(
        "report.pdf".to_string(),
        "The report details the state of a 20m condenser tower.".to_string(),
    );
    docs.insert(
        "financials.docx".to_string(),
        "These financials outline the project's budget and expenditures.".to_string(),
    );
    docs.insert(
        "outlook.pdf".to_string(),
        "This document presents the projected future performance of the system.".to_string(),
    );
    docs.insert(
        "plan.md".to_string(),
        "The plan outlines the steps for the project's implementation.".to_string(),
    );
    docs.insert(
        "spec.txt".to_string(),
        "These specifications define the technical requirements for the equipment.".to_string(),
    );
    docs
}

fn main() {
    let mut server = DocServer {
        docs: seed_docs(),
        stdout: io::stdout(),
    };

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    while let Some(Ok(line)) = lines.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let frame: Value = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(_) => continue,
        };
        server.handle_frame(&mut lines, frame);
    }
}

impl DocServer {
    fn handle_frame(
        &mut self,
        lines: &mut impl Iterator<Item = io::Result<String>>,
        frame: Value,
    ) {
        let method = frame.get("method").and_then(Value::as_str).unwrap_or("");
        let id = frame.get("id").cloned();
        let params = frame.get("params").cloned().unwrap_or(json!({}));

        let id = match id {
            Some(id) => id,
            // Notifications need no reply.
            None => return,
        };

        match method {
            "initialize" => self.reply(
                id,
                json!({
                    "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(json!("2025-06-18")),
                    "serverInfo": {"name": "doc-server", "version": env!("CARGO_PKG_VERSION")},
                    "capabilities": {"tools": {}, "resources": {}, "prompts": {}},
                }),
            ),
            "tools/list" => self.reply(id, self.tools_list()),
            "tools/call" => {
                let result = self.tools_call(lines, &params);
                self.reply(id, result);
            }
            "prompts/list" => self.reply(
                id,
                json!({"prompts": [
                    {"name": "summarize_doc", "description": "Summarize a document"},
                    {"name": "rewrite_markdown", "description": "Rewrite a document as markdown"},
                ]}),
            ),
            "prompts/get" => {
                let result = self.prompts_get(&params);
                self.reply_outcome(id, result);
            }
            "resources/list" => {
                let resources: Vec<Value> = self
                    .docs
                    .keys()
                    .map(|doc_id| {
                        json!({
                            "uri": format!("docs://documents/{doc_id}"),
                            "name": doc_id,
                            "mimeType": "text/plain",
                        })
                    })
                    .collect();
                self.reply(id, json!({ "resources": resources }));
            }
            "resources/read" => {
                let result = self.resources_read(&params);
                self.reply_outcome(id, result);
            }
            other => self.reply_error(id, -32601, &format!("method '{other}' not found")),
        }
    }

    fn tools_list(&self) -> Value {
        json!({"tools": [
            {
                "name": "read_doc",
                "description": "Read a document by its ID",
                "inputSchema": {
                    "type": "object",
                    "properties": {"doc_id": {"type": "string", "description": "The ID of the document to read"}},
                    "required": ["doc_id"],
                },
            },
            {
                "name": "edit_doc",
                "description": "Edit a document by its ID and content",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "doc_id": {"type": "string", "description": "The ID of the document to edit"},
                        "content": {"type": "string", "description": "The new content of the document"},
                    },
                    "required": ["doc_id", "content"],
                },
            },
            {
                "name": "summarize_doc",
                "description": "Summarize a document using the client's language model",
                "inputSchema": {
                    "type": "object",
                    "properties": {"doc_id": {"type": "string", "description": "The ID of the document to summarize"}},
                    "required": ["doc_id"],
                },
            },
            {
                "name": "stall",
                "description": "Sleep for the given number of seconds, then answer",
                "inputSchema": {
                    "type": "object",
                    "properties": {"seconds": {"type": "number", "description": "How long to sleep"}},
                    "required": ["seconds"],
                },
            },
        ]})
    }

    fn tools_call(
        &mut self,
        lines: &mut impl Iterator<Item = io::Result<String>>,
        params: &Value,
    ) -> Value {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        match name {
            "read_doc" => {
                let doc_id = arguments.get("doc_id").and_then(Value::as_str).unwrap_or("");
                let body = self.docs.get(doc_id).cloned().unwrap_or_default();
                text_result(&body, false)
            }
            "edit_doc" => {
                let doc_id = arguments
                    .get("doc_id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let content = arguments
                    .get("content")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if self.docs.contains_key(&doc_id) {
                    self.docs.insert(doc_id, content);
                    text_result("true", false)
                } else {
                    text_result("false", false)
                }
            }
            "summarize_doc" => {
                let doc_id = arguments.get("doc_id").and_then(Value::as_str).unwrap_or("");
                match self.docs.get(doc_id).cloned() {
                    Some(body) => self.summarize_via_sampling(lines, doc_id, &body),
                    None => text_result(&format!("No document with id '{doc_id}'"), true),
                }
            }
            "stall" => {
                let seconds = arguments
                    .get("seconds")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0);
                std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
                text_result("finally awake", false)
            }
            other => text_result(&format!("unknown tool '{other}'"), true),
        }
    }

    /// Ask the connected client for a completion while its `tools/call` to us
    /// is still outstanding, then fold the answer into our tool result.
    fn summarize_via_sampling(
        &mut self,
        lines: &mut impl Iterator<Item = io::Result<String>>,
        doc_id: &str,
        body: &str,
    ) -> Value {
        let request_id = 9001u64;
        let request = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "sampling/createMessage",
            "params": {
                "messages": [{
                    "role": "user",
                    "content": {"type": "text", "text": format!("Summarize this document in one sentence:\n{body}")},
                }],
                "systemPrompt": "You summarize documents precisely.",
                "maxTokens": 200,
            },
        });
        self.write_frame(&request);

        // Wait for our response, answering nothing else in the meantime.
        for line in lines.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let frame: Value = match serde_json::from_str(line.trim()) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            if frame.get("id").and_then(Value::as_u64) != Some(request_id) {
                continue;
            }
            if frame.get("error").is_some() {
                return text_result(
                    &format!("sampling failed for '{doc_id}': {}", frame["error"]),
                    true,
                );
            }
            let text = frame["result"]["content"]["text"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            return text_result(&text, false);
        }

        text_result("client went away during sampling", true)
    }

    fn prompts_get(&self, params: &Value) -> Result<Value, String> {
        let name = params.get("name").and_then(Value::as_str).unwrap_or("");
        let doc_id = params
            .get("arguments")
            .and_then(|arguments| arguments.get("doc_id"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let body = self
            .docs
            .get(doc_id)
            .ok_or_else(|| format!("unknown document '{doc_id}'"))?;

        let text = match name {
            "summarize_doc" => format!(
                "Summarize the following document in a few sentences:\n\n{body}"
            ),
            "rewrite_markdown" => format!("# {doc_id}\n\n{body}"),
            other => return Err(format!("unknown prompt '{other}'")),
        };

        Ok(json!({"messages": [{
            "role": "user",
            "content": {"type": "text", "text": text},
        }]}))
    }

    fn resources_read(&self, params: &Value) -> Result<Value, String> {
        let uri = params.get("uri").and_then(Value::as_str).unwrap_or("");

        if uri == "docs://documents" {
            let ids: Vec<&String> = self.docs.keys().collect();
            return Ok(json!({"contents": [{
                "uri": uri,
                "mimeType": "application/json",
                "text": serde_json::to_string(&ids).unwrap_or_default(),
            }]}));
        }

        match uri.strip_prefix("docs://documents/") {
            Some(doc_id) => {
                let body = self
                    .docs
                    .get(doc_id)
                    .ok_or_else(|| format!("unknown document '{doc_id}'"))?;
                Ok(json!({"contents": [{
                    "uri": uri,
                    "mimeType": "text/plain",
                    "text": body,
                }]}))
            }
            None => Err(format!("unknown resource uri '{uri}'")),
        }
    }

    fn reply_outcome(&mut self, id: Value, outcome: Result<Value, String>) {
        match outcome {
            Ok(result) => self.reply(id, result),
            Err(message) => self.reply_error(id, -32602, &message),
        }
    }

    fn reply(&mut self, id: Value, result: Value) {
        self.write_frame(&json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }

    fn reply_error(&mut self, id: Value, code: i64, message: &str) {
        self.write_frame(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }));
    }

    fn write_frame(&mut self, frame: &Value) {
        let mut handle = self.stdout.lock();
        // A write failure means the client is gone; nothing useful remains.
        let _ = writeln!(handle, "{frame}");
        let _ = handle.flush();
    }
}

fn text_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error,
    })
}
