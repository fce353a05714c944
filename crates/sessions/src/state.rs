//! The per-session `state.json` file.
//!
//! This is how the supervisor recognizes its own sessions across restarts
//! and how hash collisions are detected: the file records which binary
//! owns the directory and which orchestrator PID owns the session.

use std::path::Path;

use serde::{Deserialize, Serialize};

use swarm_domain::config::STATE_FILE;
use swarm_domain::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    pub binary_path: String,
    pub orchestrator_pid: i32,
    /// Unix seconds.
    #[serde(default)]
    pub created_at: i64,
}

impl SessionState {
    /// Load from a session directory's `state.json`.
    pub fn load_dir(session_dir: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(session_dir.join(STATE_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write into a session directory as `state.json`.
    pub fn store_dir(&self, session_dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(session_dir.join(STATE_FILE), json)?;
        Ok(())
    }
}
