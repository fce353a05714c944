//! SQLite-backed tool-call tracker.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde_json::Value;

use swarm_domain::error::{Error, Result};
use swarm_domain::tool::is_write_tool;

use crate::types::{AgentToolStats, ToolCallRow, ToolConflict};

const DB_FILE: &str = "tool_calls.db";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tool_calls (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        address INTEGER NOT NULL,
        parameters TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        is_write INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_agent ON tool_calls(agent_id);
    CREATE INDEX IF NOT EXISTS idx_address ON tool_calls(address);
    CREATE INDEX IF NOT EXISTS idx_tool ON tool_calls(tool_name);
    CREATE INDEX IF NOT EXISTS idx_agent_tool ON tool_calls(agent_id, tool_name);
    CREATE INDEX IF NOT EXISTS idx_address_write ON tool_calls(address, is_write);
";

/// Append-only record of every tool call across all agents of a binary.
///
/// One connection per process; the mutex serializes statements. Cross-
/// process readers rely on SQLite's own locking.
pub struct ToolCallTracker {
    conn: Mutex<Connection>,
}

impl ToolCallTracker {
    /// Open (creating if needed) the ledger inside `workspace_dir`.
    pub fn open(workspace_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(workspace_dir)?;
        let db_path = workspace_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Database(format!("opening {}: {e}", db_path.display())))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Database(format!("creating ledger schema: {e}")))?;
        tracing::info!(path = %db_path.display(), "tool-call ledger ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append one call. The write classification comes from the closed
    /// write-tool set. Returns the new row id.
    pub fn record(
        &self,
        agent_id: &str,
        tool_name: &str,
        address: u64,
        parameters: &Value,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO tool_calls (agent_id, tool_name, address, parameters, timestamp, is_write) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .map_err(db_err)?;
        stmt.execute(params![
            agent_id,
            tool_name,
            address as i64,
            parameters.to_string(),
            chrono::Utc::now().timestamp(),
            is_write_tool(tool_name) as i64,
        ])
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        tracing::debug!(agent_id, tool_name, address, id, "recorded tool call");
        Ok(id)
    }

    /// Write/write collisions a hypothetical call would have with other
    /// agents. Defined only for write tools; reads never conflict.
    pub fn check_for_conflicts(
        &self,
        agent_id: &str,
        tool_name: &str,
        address: u64,
    ) -> Result<Vec<ToolConflict>> {
        if !is_write_tool(tool_name) {
            return Ok(Vec::new());
        }

        let second_call = ToolCallRow {
            id: 0,
            agent_id: agent_id.to_owned(),
            tool_name: tool_name.to_owned(),
            address,
            parameters: Value::Null,
            timestamp: chrono::Utc::now().timestamp(),
            is_write: true,
        };

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, agent_id, tool_name, address, parameters, timestamp, is_write \
                 FROM tool_calls \
                 WHERE address = ?1 AND is_write = 1 AND agent_id != ?2 AND tool_name = ?3 \
                 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![address as i64, agent_id, tool_name], row_to_call)
            .map_err(db_err)?;

        let mut conflicts = Vec::new();
        for row in rows {
            conflicts.push(ToolConflict {
                first_call: row.map_err(db_err)?,
                second_call: second_call.clone(),
                conflict_type: tool_name.to_owned(),
            });
        }
        Ok(conflicts)
    }

    /// All calls by one agent, in insertion order.
    pub fn get_agent_tool_calls(&self, agent_id: &str) -> Result<Vec<ToolCallRow>> {
        self.query_calls(
            "SELECT id, agent_id, tool_name, address, parameters, timestamp, is_write \
             FROM tool_calls WHERE agent_id = ?1 ORDER BY id",
            params![agent_id],
        )
    }

    /// All calls touching one address, in insertion order.
    pub fn get_address_tool_calls(&self, address: u64) -> Result<Vec<ToolCallRow>> {
        self.query_calls(
            "SELECT id, agent_id, tool_name, address, parameters, timestamp, is_write \
             FROM tool_calls WHERE address = ?1 ORDER BY id",
            params![address as i64],
        )
    }

    /// One agent's write operations, in insertion order.
    pub fn get_agent_write_operations(&self, agent_id: &str) -> Result<Vec<ToolCallRow>> {
        self.query_calls(
            "SELECT id, agent_id, tool_name, address, parameters, timestamp, is_write \
             FROM tool_calls WHERE agent_id = ?1 AND is_write = 1 ORDER BY id",
            params![agent_id],
        )
    }

    /// Rows with id greater than `last_seen`, for the change feed.
    pub fn rows_after(&self, last_seen: i64) -> Result<Vec<ToolCallRow>> {
        self.query_calls(
            "SELECT id, agent_id, tool_name, address, parameters, timestamp, is_write \
             FROM tool_calls WHERE id > ?1 ORDER BY id",
            params![last_seen],
        )
    }

    /// Per-agent totals plus the cross-agent conflict count.
    pub fn get_agent_stats(&self, agent_id: &str) -> Result<AgentToolStats> {
        let calls = self.get_agent_tool_calls(agent_id)?;
        let mut stats = AgentToolStats {
            total_calls: calls.len() as u64,
            ..Default::default()
        };

        let mut written: Vec<u64> = Vec::new();
        for call in &calls {
            if call.is_write {
                stats.write_calls += 1;
                if !written.contains(&call.address) {
                    written.push(call.address);
                }
            } else {
                stats.read_calls += 1;
            }
        }

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT COUNT(DISTINCT agent_id) FROM tool_calls \
                 WHERE address = ?1 AND is_write = 1 AND agent_id != ?2",
            )
            .map_err(db_err)?;
        for address in written {
            let others: u64 = stmt
                .query_row(params![address as i64, agent_id], |r| r.get(0))
                .map_err(db_err)?;
            stats.conflicts += others;
        }
        Ok(stats)
    }

    /// Remove every row belonging to one agent. The only operation that
    /// deletes from the ledger.
    pub fn clear_agent_data(&self, agent_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("DELETE FROM tool_calls WHERE agent_id = ?1")
            .map_err(db_err)?;
        let removed = stmt.execute(params![agent_id]).map_err(db_err)?;
        tracing::info!(agent_id, removed, "cleared agent ledger rows");
        Ok(removed)
    }

    fn query_calls(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<ToolCallRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql).map_err(db_err)?;
        let rows = stmt.query_map(params, row_to_call).map_err(db_err)?;
        rows.map(|r| r.map_err(db_err)).collect()
    }
}

fn row_to_call(row: &Row<'_>) -> rusqlite::Result<ToolCallRow> {
    let params_text: String = row.get(4)?;
    Ok(ToolCallRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        tool_name: row.get(2)?,
        address: row.get::<_, i64>(3)? as u64,
        parameters: serde_json::from_str(&params_text).unwrap_or(Value::Null),
        timestamp: row.get(5)?,
        is_write: row.get::<_, i64>(6)? != 0,
    })
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracker() -> (tempfile::TempDir, ToolCallTracker) {
        let tmp = tempfile::tempdir().unwrap();
        let tracker = ToolCallTracker::open(tmp.path()).unwrap();
        (tmp, tracker)
    }

    #[test]
    fn recorded_call_is_returned_for_its_agent() {
        let (_tmp, tracker) = tracker();
        let id = tracker
            .record("agent_1", "get_function", 0x401000, &json!({"ea": "0x401000"}))
            .unwrap();
        assert!(id > 0);

        let calls = tracker.get_agent_tool_calls("agent_1").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, id);
        assert_eq!(calls[0].tool_name, "get_function");
        assert!(!calls[0].is_write);
        assert!(tracker.get_agent_tool_calls("agent_2").unwrap().is_empty());
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let (_tmp, tracker) = tracker();
        let a = tracker.record("agent_1", "set_name", 1, &json!({})).unwrap();
        let b = tracker.record("agent_2", "set_name", 2, &json!({})).unwrap();
        let c = tracker.record("agent_1", "get_xrefs", 3, &json!({})).unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn conflict_requires_same_tool_other_agent_same_address() {
        let (_tmp, tracker) = tracker();
        tracker
            .record("agent_1", "set_name", 0x401000, &json!({"name": "foo"}))
            .unwrap();

        // Same agent: no conflict.
        assert!(tracker
            .check_for_conflicts("agent_1", "set_name", 0x401000)
            .unwrap()
            .is_empty());

        // Other agent, same tool and address: one conflict pair.
        let conflicts = tracker
            .check_for_conflicts("agent_2", "set_name", 0x401000)
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].first_call.agent_id, "agent_1");
        assert_eq!(conflicts[0].second_call.agent_id, "agent_2");
        assert_eq!(conflicts[0].second_call.id, 0);
        assert_eq!(conflicts[0].conflict_type, "set_name");

        // Different tool at the same address: no conflict.
        assert!(tracker
            .check_for_conflicts("agent_2", "set_comment", 0x401000)
            .unwrap()
            .is_empty());

        // Different address: no conflict.
        assert!(tracker
            .check_for_conflicts("agent_2", "set_name", 0x401004)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn reads_never_conflict() {
        let (_tmp, tracker) = tracker();
        tracker
            .record("agent_1", "get_function", 0x401000, &json!({}))
            .unwrap();
        assert!(tracker
            .check_for_conflicts("agent_2", "get_function", 0x401000)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn high_addresses_roundtrip() {
        let (_tmp, tracker) = tracker();
        let address = 0xffff_ffff_ffff_f000u64;
        tracker
            .record("agent_1", "set_comment", address, &json!({"comment": "top"}))
            .unwrap();
        let calls = tracker.get_address_tool_calls(address).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].address, address);
    }

    #[test]
    fn stats_count_reads_writes_and_conflicts() {
        let (_tmp, tracker) = tracker();
        tracker.record("agent_1", "get_function", 0x10, &json!({})).unwrap();
        tracker.record("agent_1", "set_name", 0x20, &json!({})).unwrap();
        tracker.record("agent_1", "set_name", 0x30, &json!({})).unwrap();
        // Two other agents write 0x20; one other agent writes 0x30.
        tracker.record("agent_2", "set_name", 0x20, &json!({})).unwrap();
        tracker.record("agent_3", "patch_bytes", 0x20, &json!({})).unwrap();
        tracker.record("agent_2", "set_comment", 0x30, &json!({})).unwrap();

        let stats = tracker.get_agent_stats("agent_1").unwrap();
        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.read_calls, 1);
        assert_eq!(stats.write_calls, 2);
        assert_eq!(stats.conflicts, 3);
    }

    #[test]
    fn no_writes_means_no_conflicts() {
        let (_tmp, tracker) = tracker();
        tracker.record("agent_1", "get_function", 0x10, &json!({})).unwrap();
        tracker.record("agent_2", "set_name", 0x10, &json!({})).unwrap();
        let stats = tracker.get_agent_stats("agent_1").unwrap();
        assert_eq!(stats.conflicts, 0);
    }

    #[test]
    fn clear_agent_data_removes_only_that_agent() {
        let (_tmp, tracker) = tracker();
        tracker.record("agent_1", "set_name", 0x10, &json!({})).unwrap();
        tracker.record("agent_2", "set_name", 0x20, &json!({})).unwrap();

        assert_eq!(tracker.clear_agent_data("agent_1").unwrap(), 1);
        assert!(tracker.get_agent_tool_calls("agent_1").unwrap().is_empty());
        assert_eq!(tracker.get_agent_tool_calls("agent_2").unwrap().len(), 1);
    }

    #[test]
    fn rows_after_advances_with_the_feed() {
        let (_tmp, tracker) = tracker();
        let a = tracker.record("agent_1", "set_name", 0x10, &json!({})).unwrap();
        let b = tracker.record("agent_1", "set_name", 0x20, &json!({})).unwrap();

        let fresh = tracker.rows_after(0).unwrap();
        assert_eq!(fresh.len(), 2);

        let after_a = tracker.rows_after(a).unwrap();
        assert_eq!(after_a.len(), 1);
        assert_eq!(after_a[0].id, b);

        assert!(tracker.rows_after(b).unwrap().is_empty());
    }

    #[test]
    fn write_operations_filter() {
        let (_tmp, tracker) = tracker();
        tracker.record("agent_1", "get_function", 0x10, &json!({})).unwrap();
        tracker.record("agent_1", "patch_bytes", 0x20, &json!({})).unwrap();
        let writes = tracker.get_agent_write_operations("agent_1").unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].tool_name, "patch_bytes");
    }
}
