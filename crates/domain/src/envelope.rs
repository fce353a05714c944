//! Request/response envelope carried over the session pipes.
//!
//! The supervisor writes `OrchestratorRequest` frames onto the request
//! pipe; the orchestrator answers every request with exactly one
//! `OrchestratorResponse` frame on the response pipe.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A supervisor→orchestrator request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl OrchestratorRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            kind: "request".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// The initial request carrying the task for a fresh session.
    pub fn start_task(session_id: &str, task: &str) -> Self {
        Self::new(
            format!("init_{session_id}"),
            "start_task",
            serde_json::json!({ "task": task }),
        )
    }

    /// A follow-up user message for a running session.
    pub fn process_input(id: impl Into<String>, input: &str) -> Self {
        Self::new(id, "process_input", serde_json::json!({ "input": input }))
    }

    /// A graceful shutdown request.
    pub fn shutdown(session_id: &str) -> Self {
        Self::new(format!("shutdown_{session_id}"), "shutdown", Value::Null)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An orchestrator→supervisor response: either a `result` payload or an
/// `error` string, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestratorResponse {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// A successful response whose payload is a single `content` string.
    pub fn content(text: impl Into<String>) -> Self {
        Self::ok(serde_json::json!({ "content": text.into() }))
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The `content` string of a successful response, if present.
    pub fn content_text(&self) -> Option<&str> {
        self.result.as_ref()?.get("content")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let req = OrchestratorRequest::start_task("session_ab", "map the exports");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"request\""));
        assert!(json.contains("\"id\":\"init_session_ab\""));
        assert!(json.contains("\"method\":\"start_task\""));
        assert!(json.contains("map the exports"));
    }

    #[test]
    fn roundtrip_request() {
        let req = OrchestratorRequest::process_input("msg_42", "status");
        let parsed: OrchestratorRequest =
            serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(req, parsed);
    }

    #[test]
    fn response_ok_omits_error() {
        let resp = OrchestratorResponse::content("done");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("error"));
        assert_eq!(resp.content_text(), Some("done"));
        assert!(!resp.is_error());
    }

    #[test]
    fn response_err_omits_result() {
        let resp = OrchestratorResponse::err("orchestrator process terminated (PID 123)");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("result"));
        assert!(resp.is_error());
        assert!(resp.error.as_deref().unwrap().contains("PID 123"));
    }

    #[test]
    fn deserialize_error_response() {
        let resp: OrchestratorResponse =
            serde_json::from_str(r#"{"error":"Timeout waiting for response"}"#).unwrap();
        assert!(resp.is_error());
        assert!(resp.content_text().is_none());
    }

    #[test]
    fn shutdown_request_has_null_params() {
        let req = OrchestratorRequest::shutdown("session_ff");
        assert_eq!(req.params, Value::Null);
        assert_eq!(req.method, "shutdown");
    }
}
