//! Agent process spawning.
//!
//! Each agent is a disassembly-host process attached to the session's
//! binary. The spawner writes the agent's config file into the shared
//! workspace, launches the host, and tracks the child for termination.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command};

use parking_lot::Mutex;
use serde_json::Value;

use swarm_domain::config::HostConfig;
use swarm_domain::error::{Error, Result};

/// Marker file telling a starting agent it is being resurrected.
const RESURRECTION_MARKER: &str = ".resurrecting";
const RESURRECTION_CONFIG: &str = "resurrection_config.json";

pub struct AgentSpawner {
    host: HostConfig,
    workspace_dir: PathBuf,
    active: Mutex<HashMap<i32, (String, Child)>>,
}

impl AgentSpawner {
    pub fn new(host: HostConfig, workspace_dir: PathBuf) -> Self {
        Self {
            host,
            workspace_dir,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Launch one agent against `database_path`. Returns its PID.
    pub fn spawn_agent(
        &self,
        agent_id: &str,
        database_path: &str,
        agent_config: &Value,
    ) -> Result<i32> {
        self.write_agent_config(agent_id, agent_config)?;
        let child = self.launch(database_path)?;
        let pid = child.id() as i32;
        self.active.lock().insert(pid, (agent_id.to_owned(), child));
        tracing::info!(agent_id, pid, "agent launched");
        Ok(pid)
    }

    /// Re-launch a dead agent. The marker and saved config let the new
    /// process pick up where the old one stopped.
    pub fn resurrect_agent(
        &self,
        agent_id: &str,
        database_path: &str,
        resurrection_config: &Value,
    ) -> Result<i32> {
        tracing::info!(agent_id, "resurrecting agent");

        let agent_workspace = PathBuf::from(database_path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.workspace_dir.clone());
        std::fs::write(
            agent_workspace.join(RESURRECTION_MARKER),
            chrono::Utc::now().timestamp().to_string(),
        )?;
        std::fs::write(
            agent_workspace.join(RESURRECTION_CONFIG),
            serde_json::to_string_pretty(resurrection_config)?,
        )?;

        let child = self.launch(database_path)?;
        let pid = child.id() as i32;
        self.active.lock().insert(pid, (agent_id.to_owned(), child));
        Ok(pid)
    }

    /// Whether a spawned agent is still running (reaps it if not).
    pub fn is_agent_alive(&self, pid: i32) -> bool {
        let mut active = self.active.lock();
        match active.get_mut(&pid) {
            Some((_, child)) => !matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }

    /// Agent ids of all tracked processes, reaping exited ones.
    pub fn running_agents(&self) -> Vec<String> {
        let mut active = self.active.lock();
        active.retain(|_, (_, child)| !matches!(child.try_wait(), Ok(Some(_))));
        active.values().map(|(id, _)| id.clone()).collect()
    }

    pub fn terminate_agent(&self, pid: i32) {
        if let Some((agent_id, mut child)) = self.active.lock().remove(&pid) {
            tracing::info!(agent_id, pid, "terminating agent");
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    pub fn terminate_all_agents(&self) {
        let mut active = self.active.lock();
        for (pid, (agent_id, child)) in active.iter_mut() {
            tracing::info!(agent_id, pid, "terminating agent");
            let _ = child.kill();
            let _ = child.wait();
        }
        active.clear();
    }

    /// Write `configs/<agent_id>_config.json` and return its path.
    fn write_agent_config(&self, agent_id: &str, agent_config: &Value) -> Result<PathBuf> {
        let configs_dir = self.workspace_dir.join("configs");
        std::fs::create_dir_all(&configs_dir)?;
        let path = configs_dir.join(format!("{agent_id}_config.json"));
        std::fs::write(&path, serde_json::to_string_pretty(agent_config)?)?;
        Ok(path)
    }

    fn launch(&self, database_path: &str) -> Result<Child> {
        let mut cmd = Command::new(&self.host.command);
        cmd.args(&self.host.args).arg(database_path);
        cmd.spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {e}", self.host.command.display())))
    }
}

impl Drop for AgentSpawner {
    fn drop(&mut self) {
        self.terminate_all_agents();
    }
}
