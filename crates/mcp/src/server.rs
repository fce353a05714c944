//! Stdio JSON-RPC server speaking the MCP tool protocol.
//!
//! One JSON message per stdin line, one per stdout line. Protocol
//! version `2025-03-26`. The server moves UNINITIALIZED → INITIALIZING
//! (on `initialize`) → INITIALIZED (on `notifications/initialized`);
//! only `ping` and `initialize` are accepted before that.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2025-03-26";

// JSON-RPC error codes.
const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const NOT_INITIALIZED: i64 = -32002;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Initializing,
    Initialized,
}

/// A tool handler: arguments in, text out (`Err` becomes an
/// `isError` text response).
pub type ToolHandler = Box<dyn Fn(&Value) -> Result<String, String> + Send + Sync>;

struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    handler: ToolHandler,
}

pub struct StdioServer {
    name: String,
    version: String,
    state: State,
    tools: Vec<Tool>,
}

impl StdioServer {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            state: State::Uninitialized,
            tools: Vec::new(),
        }
    }

    pub fn register_tool(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: ToolHandler,
    ) {
        self.tools.push(Tool {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        });
    }

    /// Serve until EOF on the reader.
    pub fn run(&mut self, reader: impl BufRead, mut writer: impl Write) -> std::io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.process_line(&line) {
                writeln!(writer, "{response}")?;
                writer.flush()?;
            }
        }
        tracing::info!("stdin closed, server loop exiting");
        Ok(())
    }

    /// Handle one raw input line; returns the serialized response, if
    /// the input warrants one.
    pub fn process_line(&mut self, line: &str) -> Option<String> {
        let message: Value = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(_) => {
                // Parse errors echo no id.
                return Some(error_response(None, PARSE_ERROR, "Parse error", None).to_string());
            }
        };

        if let Some(batch) = message.as_array() {
            let has_initialize = batch
                .iter()
                .any(|req| req.get("method").and_then(Value::as_str) == Some("initialize"));
            if has_initialize {
                return Some(
                    error_response(
                        None,
                        INVALID_REQUEST,
                        "Invalid Request: initialize cannot be part of a batch",
                        None,
                    )
                    .to_string(),
                );
            }
            let responses: Vec<Value> = batch
                .iter()
                .filter_map(|req| self.process_message(req))
                .collect();
            if responses.is_empty() {
                return None;
            }
            return Some(Value::Array(responses).to_string());
        }

        self.process_message(&message).map(|r| r.to_string())
    }

    fn process_message(&mut self, message: &Value) -> Option<Value> {
        let id = message.get("id").cloned();
        let is_notification = id.is_none();

        if message.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Some(error_response(
                id,
                INVALID_REQUEST,
                "Invalid Request: missing or invalid jsonrpc field",
                None,
            ));
        }
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return Some(error_response(
                id,
                INVALID_REQUEST,
                "Invalid Request: missing method field",
                None,
            ));
        };
        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

        // Ping is allowed at any state.
        if method == "ping" {
            return id.map(|id| success_response(id, json!({})));
        }

        if method == "initialize" {
            // Initialize must be a request, not a notification.
            let Some(id) = id else { return None };
            if self.state != State::Uninitialized {
                return Some(error_response(
                    Some(id),
                    INVALID_REQUEST,
                    "Invalid Request: already initialized",
                    None,
                ));
            }
            self.state = State::Initializing;
            return Some(success_response(id, self.initialize_result()));
        }

        if method == "notifications/initialized" {
            if self.state == State::Initializing {
                self.state = State::Initialized;
                tracing::info!("server initialized, tools available");
            }
            return None;
        }

        if self.state != State::Initialized {
            if is_notification {
                return None;
            }
            return Some(error_response(
                id,
                NOT_INITIALIZED,
                "Server not initialized",
                Some(json!({ "note": "Expected notifications/initialized" })),
            ));
        }

        match method {
            "tools/list" => id.map(|id| success_response(id, self.tools_list())),
            "tools/call" => id.map(|id| success_response(id, self.tools_call(&params))),
            other => id.map(|id| {
                error_response(
                    Some(id),
                    METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                    None,
                )
            }),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": { "name": self.name, "version": self.version },
            "capabilities": { "tools": {} },
            "instructions":
                "Use the available tools to drive swarm analysis sessions over binaries",
        })
    }

    fn tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    fn tools_call(&self, params: &Value) -> Value {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return tool_error("Missing 'name' parameter");
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let Some(tool) = self.tools.iter().find(|t| t.name == name) else {
            return tool_error(format!("Tool not found: {name}"));
        };

        tracing::info!(tool = name, "tool call");
        match (tool.handler)(&arguments) {
            Ok(text) => json!({ "content": [{ "type": "text", "text": text }] }),
            Err(error) => tool_error(error),
        }
    }
}

fn tool_error(text: impl Into<String>) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": true,
    })
}

fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(
    id: Option<Value>,
    code: i64,
    message: impl Into<String>,
    data: Option<Value>,
) -> Value {
    let mut error = json!({ "code": code, "message": message.into() });
    if let Some(data) = data {
        error["data"] = data;
    }
    let mut response = json!({ "jsonrpc": "2.0", "error": error });
    if let Some(id) = id {
        response["id"] = id;
    }
    response
}
