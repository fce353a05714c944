//! Tool-call vocabulary shared by the ledger, the merge engine and the
//! orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of tools that mutate the canonical database. Everything
/// else is a read and can never conflict.
pub const WRITE_TOOLS: &[&str] = &[
    "set_name",
    "set_comment",
    "set_function_prototype",
    "set_variable",
    "set_local_type",
    "patch_bytes",
    "patch_assembly",
];

/// Whether a tool mutates the canonical database.
pub fn is_write_tool(tool_name: &str) -> bool {
    WRITE_TOOLS.contains(&tool_name)
}

/// A single tool invocation, as dispatched through a [`ToolRegistry`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The JSON payload every tool returns in its result content.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }

    /// Parse a tool-result content string.
    pub fn from_content(content: &str) -> Option<Self> {
        serde_json::from_str(content).ok()
    }

    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"success":false}"#.into())
    }
}

/// Dispatch surface for tool execution.
///
/// Agents and the merge engine share one registry shape; they differ only
/// in which database context the registry is bound to. The production
/// implementation lives in the disassembly host; tests use in-memory
/// registries.
pub trait ToolRegistry: Send + Sync {
    /// Execute a tool call and return its result content (a JSON-encoded
    /// [`ToolOutcome`]).
    fn execute(&self, call: &ToolInvocation) -> crate::error::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_set_is_closed() {
        assert!(is_write_tool("set_name"));
        assert!(is_write_tool("patch_assembly"));
        assert!(!is_write_tool("get_function"));
        assert!(!is_write_tool("list_strings"));
        assert_eq!(WRITE_TOOLS.len(), 7);
    }

    #[test]
    fn outcome_content_roundtrip() {
        let outcome = ToolOutcome::ok("renamed sub_401000 to parse_header");
        let parsed = ToolOutcome::from_content(&outcome.to_content()).unwrap();
        assert!(parsed.success);
        assert_eq!(
            parsed.message.as_deref(),
            Some("renamed sub_401000 to parse_header")
        );
    }

    #[test]
    fn outcome_failure_carries_error() {
        let outcome = ToolOutcome::failed("address not mapped");
        let parsed = ToolOutcome::from_content(&outcome.to_content()).unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.error.as_deref(), Some("address not mapped"));
    }

    #[test]
    fn garbage_content_is_none() {
        assert!(ToolOutcome::from_content("not json").is_none());
    }
}
