//! The shared tool-call ledger.
//!
//! Every tool call an agent makes, read or write, is appended to a
//! per-binary SQLite database. The ledger is the ground truth for conflict
//! detection and the input to merge replay: rows are totally ordered by
//! their autoincrement id, which defines the merge order across all agents
//! of a binary.

pub mod monitor;
pub mod tracker;
pub mod types;

pub use monitor::{LedgerMonitor, ToolCallEvent};
pub use tracker::ToolCallTracker;
pub use types::{AgentToolStats, ToolCallRow, ToolConflict};
