//! Configuration for the swarm processes.
//!
//! Contract values shared between processes (pipe names, environment
//! variables, the workspace root) are fixed constants: they are how an
//! orchestrator spawned by one build finds the session created by another.
//! Everything tunable is a serde field with a default.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cross-process contract constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Environment variable carrying the session id to a spawned orchestrator.
pub const ENV_SESSION_ID: &str = "IDA_SWARM_MCP_SESSION_ID";
/// Environment variable carrying the session directory to a spawned orchestrator.
pub const ENV_SESSION_DIR: &str = "IDA_SWARM_MCP_SESSION_DIR";

/// Name of the supervisor→orchestrator pipe inside a session directory.
pub const REQUEST_PIPE: &str = "request.pipe";
/// Name of the orchestrator→supervisor pipe inside a session directory.
pub const RESPONSE_PIPE: &str = "response.pipe";
/// Name of the session state file inside a session directory.
pub const STATE_FILE: &str = "state.json";

/// Shared per-binary workspace root (ledger, transcript, logs, agent configs).
pub const WORKSPACE_ROOT: &str = "/tmp/ida_swarm_workspace";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Top-level configuration, loaded from an optional JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the shared per-binary workspaces.
    #[serde(default = "d_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn d_workspace_root() -> PathBuf {
    PathBuf::from(WORKSPACE_ROOT)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: d_workspace_root(),
            sessions: SessionsConfig::default(),
            host: HostConfig::default(),
            agents: AgentsConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Config {
    /// Load from a JSON file, or fall back to defaults if the path is `None`.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("reading {}: {e}", p.display())))?;
                serde_json::from_str(&raw)
                    .map_err(|e| Error::Config(format!("parsing {}: {e}", p.display())))
            }
            None => Ok(Self::default()),
        }
    }

    /// Per-binary workspace directory (ledger, transcript, logs).
    pub fn workspace_dir(&self, binary_name: &str) -> PathBuf {
        self.workspace_root.join(binary_name)
    }
}

/// Session supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Root directory for per-session state (pipes, state.json).
    #[serde(default = "d_sessions_root")]
    pub root: PathBuf,

    /// Maximum number of concurrently supervised sessions.
    #[serde(default = "d_max_sessions")]
    pub max_sessions: usize,

    /// Seconds to wait for a graceful orchestrator exit before force-kill.
    #[serde(default = "d_graceful_exit_secs")]
    pub graceful_exit_secs: u64,
}

fn d_sessions_root() -> PathBuf {
    std::env::temp_dir().join("ida_swarm_sessions")
}
fn d_max_sessions() -> usize {
    8
}
fn d_graceful_exit_secs() -> u64 {
    60
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            root: d_sessions_root(),
            max_sessions: d_max_sessions(),
            graceful_exit_secs: d_graceful_exit_secs(),
        }
    }
}

/// Disassembly host settings (the external process that runs orchestrators
/// and agents against a database).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Path to the host executable.
    #[serde(default = "d_host_command")]
    pub command: PathBuf,

    /// Arguments placed before the binary path (e.g. automatic mode).
    #[serde(default = "d_host_args")]
    pub args: Vec<String>,
}

fn d_host_command() -> PathBuf {
    PathBuf::from("/Applications/IDA Professional 9.0.app/Contents/MacOS/ida64")
}
fn d_host_args() -> Vec<String> {
    vec!["-A".into()]
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command: d_host_command(),
            args: d_host_args(),
        }
    }
}

/// Agent fleet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Number of agents spawned for a fresh task.
    #[serde(default = "d_agent_count")]
    pub count: usize,

    /// Upstream model identifier handed to agents.
    #[serde(default = "d_model")]
    pub model: String,
}

fn d_agent_count() -> usize {
    3
}
fn d_model() -> String {
    "claude-sonnet-4-20250514".into()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            count: d_agent_count(),
            model: d_model(),
        }
    }
}

/// IRC broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base TCP port; each binary gets `base + hash(binary) % spread`.
    #[serde(default = "d_port_base")]
    pub port_base: u16,

    /// Port range width for per-binary port derivation.
    #[serde(default = "d_port_spread")]
    pub port_spread: u16,
}

fn d_port_base() -> u16 {
    6667
}
fn d_port_spread() -> u16 {
    1000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port_base: d_port_base(),
            port_spread: d_port_spread(),
        }
    }
}

impl BrokerConfig {
    /// Deterministic per-binary broker port.
    pub fn port_for(&self, binary_name: &str) -> u16 {
        let mut h: u32 = 2166136261;
        for b in binary_name.bytes() {
            h ^= u32::from(b);
            h = h.wrapping_mul(16777619);
        }
        self.port_base + (h % u32::from(self.port_spread)) as u16
    }
}
