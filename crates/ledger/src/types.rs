//! Ledger row and query result types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recorded tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRow {
    /// Autoincrement row id; 0 for a hypothetical (not yet recorded) call.
    pub id: i64,
    pub agent_id: String,
    pub tool_name: String,
    pub address: u64,
    pub parameters: Value,
    /// Unix seconds.
    pub timestamp: i64,
    pub is_write: bool,
}

/// A detected write/write collision at one address.
///
/// `first_call` is the recorded row; `second_call` is the call being
/// checked (hypothetical, id 0, not yet in the ledger).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConflict {
    pub first_call: ToolCallRow,
    pub second_call: ToolCallRow,
    /// The colliding tool name.
    pub conflict_type: String,
}

/// Per-agent call statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentToolStats {
    pub total_calls: u64,
    pub read_calls: u64,
    pub write_calls: u64,
    /// Sum over this agent's written addresses of the number of other
    /// agents that also wrote each address.
    pub conflicts: u64,
}
