//! Merge engine: deterministic replay of agent writes.
//!
//! Reads one agent's ledger rows in insertion order, skips reads, and
//! re-executes every write through the tool registry bound to the
//! canonical database. Later rows overwrite earlier ones at the same
//! address; a failed write is reported, never fatal.

use std::sync::Arc;

use swarm_domain::tool::{is_write_tool, ToolInvocation, ToolOutcome, ToolRegistry};
use swarm_ledger::ToolCallTracker;

/// Per-change summaries are truncated to keep merge reports readable.
const SUMMARY_MAX_CHARS: usize = 100;

/// Outcome of one agent merge.
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// True when nothing failed (including the no-op merge).
    pub success: bool,
    pub changes_applied: u32,
    pub changes_failed: u32,
    pub applied_changes: Vec<String>,
    pub failed_changes: Vec<String>,
    pub note: Option<String>,
}

impl MergeReport {
    /// Human-readable summary for tool responses.
    pub fn summary(&self, agent_id: &str) -> String {
        let mut out = format!(
            "Merge of {agent_id}: {} applied, {} failed",
            self.changes_applied, self.changes_failed
        );
        if let Some(note) = &self.note {
            out.push_str(&format!(" ({note})"));
        }
        for change in &self.applied_changes {
            out.push_str(&format!("\n  + {change}"));
        }
        for failure in &self.failed_changes {
            out.push_str(&format!("\n  - {failure}"));
        }
        out
    }
}

pub struct MergeEngine {
    tracker: Arc<ToolCallTracker>,
    registry: Arc<dyn ToolRegistry>,
}

impl MergeEngine {
    pub fn new(tracker: Arc<ToolCallTracker>, registry: Arc<dyn ToolRegistry>) -> Self {
        Self { tracker, registry }
    }

    /// Replay one agent's write operations against the canonical
    /// database.
    pub fn merge_agent_changes(&self, agent_id: &str) -> MergeReport {
        let mut report = MergeReport::default();

        let calls = match self.tracker.get_agent_tool_calls(agent_id) {
            Ok(calls) => calls,
            Err(e) => {
                report.note = Some(format!("ledger read failed: {e}"));
                return report;
            }
        };

        if calls.is_empty() {
            report.success = true;
            report.note = Some("No tool calls to merge".into());
            tracing::info!(agent_id, "no tool calls to merge");
            return report;
        }

        tracing::info!(agent_id, calls = calls.len(), "starting merge");

        for call in &calls {
            if !is_write_tool(&call.tool_name) {
                continue;
            }
            tracing::debug!(tool = %call.tool_name, id = call.id, "replaying write");

            let invocation = ToolInvocation::new(
                format!("merge_{}", call.id),
                call.tool_name.clone(),
                call.parameters.clone(),
            );

            match self.registry.execute(&invocation) {
                Ok(content) => match ToolOutcome::from_content(&content) {
                    Some(outcome) if outcome.success => {
                        report.changes_applied += 1;
                        let message = outcome
                            .message
                            .unwrap_or_else(|| "Applied successfully".into());
                        report.applied_changes.push(format!(
                            "{}: {}",
                            call.tool_name,
                            truncate_chars(&message, SUMMARY_MAX_CHARS)
                        ));
                    }
                    Some(outcome) => {
                        report.changes_failed += 1;
                        let error = outcome.error.unwrap_or_else(|| "Unknown error".into());
                        report.failed_changes.push(format!(
                            "{}: {}",
                            call.tool_name,
                            truncate_chars(&error, SUMMARY_MAX_CHARS)
                        ));
                    }
                    None => {
                        report.changes_failed += 1;
                        report
                            .failed_changes
                            .push(format!("{}: Failed to parse result", call.tool_name));
                    }
                },
                Err(e) => {
                    report.changes_failed += 1;
                    report
                        .failed_changes
                        .push(format!("{}: {e}", call.tool_name));
                }
            }
        }

        report.success = report.changes_failed == 0;
        self.log_report(agent_id, &report);
        report
    }

    fn log_report(&self, agent_id: &str, report: &MergeReport) {
        tracing::info!(
            agent_id,
            applied = report.changes_applied,
            failed = report.changes_failed,
            status = if report.success { "SUCCESS" } else { "PARTIAL" },
            "merge complete"
        );
        for change in &report.applied_changes {
            tracing::debug!(change = %change, "applied");
        }
        for failure in &report.failed_changes {
            tracing::warn!(failure = %failure, "not applied");
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        text.chars().take(max).collect()
    }
}
