//! The orchestrator runtime.
//!
//! One orchestrator per binary: it hosts the deliberation broker, owns
//! the tool-call ledger and merge engine, manages the agent fleet, and
//! answers every supervisor request with exactly one response.

use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use swarm_broker::Broker;
use swarm_client::AnthropicClient;
use swarm_domain::config::{Config, REQUEST_PIPE, RESPONSE_PIPE};
use swarm_domain::envelope::{OrchestratorRequest, OrchestratorResponse};
use swarm_domain::error::{Error, Result};
use swarm_domain::framing;
use swarm_domain::tool::{ToolInvocation, ToolOutcome, ToolRegistry};
use swarm_ledger::{LedgerMonitor, ToolCallTracker};
use swarm_pool::AccountPool;

use crate::merge::MergeEngine;
use crate::spawner::AgentSpawner;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Canonical-database binding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry binding used when the orchestrator runs outside the
/// disassembly host: replayed writes are appended to a journal the host
/// applies against the canonical database when it next opens it. Inside
/// the host, the embedding provides its own [`ToolRegistry`] instead.
pub struct JournalRegistry {
    file: Mutex<File>,
}

impl JournalRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl ToolRegistry for JournalRegistry {
    fn execute(&self, call: &ToolInvocation) -> Result<String> {
        use std::io::Write;
        let record = serde_json::json!({
            "id": call.id,
            "name": call.name,
            "input": call.input,
            "timestamp": chrono::Utc::now().timestamp(),
        });
        let mut file = self.file.lock();
        writeln!(file, "{record}")?;
        Ok(ToolOutcome::ok(format!("{} journaled for canonical apply", call.name)).to_content())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Orchestrator {
    config: Config,
    binary_path: String,
    binary_name: String,
    broker: Broker,
    tracker: Arc<ToolCallTracker>,
    monitor: Mutex<Option<LedgerMonitor>>,
    spawner: AgentSpawner,
    merge: MergeEngine,
    next_agent: AtomicUsize,
    llm: Option<AnthropicClient>,
}

impl Orchestrator {
    pub async fn new(config: Config, binary_path: &str) -> Result<Self> {
        let binary_name = Path::new(binary_path)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("invalid binary path: {binary_path}")))?
            .to_owned();
        let workspace_dir = config.workspace_dir(&binary_name);
        std::fs::create_dir_all(&workspace_dir)?;

        let tracker = Arc::new(ToolCallTracker::open(&workspace_dir)?);
        let monitor = LedgerMonitor::start(tracker.clone(), 0);

        let broker_port = config.broker.port_for(&binary_name);
        let broker = Broker::start(broker_port, &workspace_dir).await?;

        let spawner = AgentSpawner::new(config.host.clone(), workspace_dir.clone());
        let registry: Arc<dyn ToolRegistry> =
            Arc::new(JournalRegistry::open(&workspace_dir.join("merge_journal.jsonl"))?);
        let merge = MergeEngine::new(tracker.clone(), registry);

        // The upstream client is optional: without pool credentials the
        // orchestrator still routes directives, it just cannot deliberate.
        let llm = match AccountPool::new(None) {
            Ok(pool) if pool.credentials_exist() => {
                let client = AnthropicClient::new(Arc::new(pool))?
                    .with_requests_log(workspace_dir.join("requests.log"));
                Some(client)
            }
            _ => {
                tracing::warn!("no credential pool found, LLM deliberation disabled");
                None
            }
        };

        tracing::info!(
            binary_name,
            broker_port = broker.port(),
            workspace = %workspace_dir.display(),
            "orchestrator ready"
        );

        Ok(Self {
            config,
            binary_path: binary_path.to_owned(),
            binary_name,
            broker,
            tracker,
            monitor: Mutex::new(Some(monitor)),
            spawner,
            merge,
            next_agent: AtomicUsize::new(1),
            llm,
        })
    }

    /// Handle one supervisor request, producing exactly one response.
    pub async fn handle_request(&self, request: OrchestratorRequest) -> OrchestratorResponse {
        tracing::info!(id = %request.id, method = %request.method, "request received");
        match request.method.as_str() {
            "start_task" => {
                let task = request
                    .params
                    .get("task")
                    .and_then(|v| v.as_str())
                    .unwrap_or("analyze the binary");
                self.start_task(task)
            }
            "process_input" => {
                let input = request
                    .params
                    .get("input")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                self.process_input(input).await
            }
            "shutdown" => self.shutdown(),
            other => OrchestratorResponse::err(format!("unknown method: {other}")),
        }
    }

    fn start_task(&self, task: &str) -> OrchestratorResponse {
        let mut spawned = 0;
        for _ in 0..self.config.agents.count {
            if self.spawn_one(task).is_some() {
                spawned += 1;
            }
        }
        if spawned == 0 {
            return OrchestratorResponse::err(format!(
                "failed to spawn any agents for task: {task}"
            ));
        }
        OrchestratorResponse::ok(serde_json::json!({
            "content": format!(
                "Swarm started: {spawned} agent(s) analyzing {}, task: {task}",
                self.binary_name
            ),
            "agents_spawned": spawned,
        }))
    }

    async fn process_input(&self, input: &str) -> OrchestratorResponse {
        let input = input.trim();

        if input == "status" {
            return OrchestratorResponse::content(self.status_report());
        }
        if let Some(agent_id) = input.strip_prefix("merge ") {
            let report = self.merge.merge_agent_changes(agent_id.trim());
            return OrchestratorResponse::content(report.summary(agent_id.trim()));
        }
        if let Some(task) = input.strip_prefix("spawn ") {
            return match self.spawn_one(task.trim()) {
                Some(agent_id) => {
                    OrchestratorResponse::content(format!("Spawned {agent_id} on: {task}"))
                }
                None => OrchestratorResponse::err("failed to spawn agent"),
            };
        }
        if let Some(agent_id) = input.strip_prefix("resurrect ") {
            return self.resurrect(agent_id.trim());
        }

        // Free-form input goes to the model when credentials exist.
        if let Some(client) = &self.llm {
            return self.deliberate(client, input).await;
        }
        OrchestratorResponse::content(format!(
            "Acknowledged: \"{input}\". {} agent(s) active. \
             Directives: status, spawn <task>, merge <agent_id>.",
            self.spawner.running_agents().len()
        ))
    }

    fn shutdown(&self) -> OrchestratorResponse {
        tracing::info!("shutdown requested");
        self.spawner.terminate_all_agents();
        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        self.broker.shutdown();
        OrchestratorResponse::content("Shutting down")
    }

    fn spawn_one(&self, task: &str) -> Option<String> {
        let n = self.next_agent.fetch_add(1, Ordering::Relaxed);
        let agent_id = format!("agent_{n}");
        let agent_config = serde_json::json!({
            "agent_id": agent_id,
            "task": task,
            "binary_name": self.binary_name,
            "broker_port": self.broker.port(),
            "db_path": self.binary_path,
            "model": self.config.agents.model,
        });
        match self
            .spawner
            .spawn_agent(&agent_id, &self.binary_path, &agent_config)
        {
            Ok(_) => Some(agent_id),
            Err(e) => {
                tracing::error!(agent_id, error = %e, "agent spawn failed");
                None
            }
        }
    }

    /// Relaunch a dead agent with its recorded task and ledger position,
    /// so it can pick up where the previous incarnation stopped.
    fn resurrect(&self, agent_id: &str) -> OrchestratorResponse {
        let config_path = self
            .config
            .workspace_dir(&self.binary_name)
            .join("configs")
            .join(format!("{agent_id}_config.json"));
        let agent_config: serde_json::Value = match std::fs::read_to_string(&config_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            Some(config) => config,
            None => {
                return OrchestratorResponse::err(format!(
                    "no recorded config for {agent_id}, cannot resurrect"
                ))
            }
        };

        let last_call_id = self
            .tracker
            .get_agent_tool_calls(agent_id)
            .ok()
            .and_then(|calls| calls.last().map(|c| c.id))
            .unwrap_or(0);
        let resurrection_config = serde_json::json!({
            "agent_id": agent_id,
            "original_config": agent_config,
            "resume_after_call_id": last_call_id,
        });

        match self
            .spawner
            .resurrect_agent(agent_id, &self.binary_path, &resurrection_config)
        {
            Ok(pid) => OrchestratorResponse::content(format!(
                "Resurrected {agent_id} (PID {pid}), resuming after call {last_call_id}"
            )),
            Err(e) => OrchestratorResponse::err(format!("resurrection failed: {e}")),
        }
    }

    fn status_report(&self) -> String {
        let running = self.spawner.running_agents();
        let mut lines = vec![
            format!("Binary: {}", self.binary_name),
            format!("Agents running: {}", running.len()),
        ];
        for presence in self.broker.active_agents() {
            lines.push(format!("  {}: {}", presence.agent_id, presence.task));
        }
        for agent_id in &running {
            if let Ok(stats) = self.tracker.get_agent_stats(agent_id) {
                lines.push(format!(
                    "  {agent_id}: {} calls ({} reads, {} writes, {} conflicts)",
                    stats.total_calls, stats.read_calls, stats.write_calls, stats.conflicts
                ));
            }
        }
        lines.join("\n")
    }

    async fn deliberate(&self, client: &AnthropicClient, input: &str) -> OrchestratorResponse {
        let body = serde_json::json!({
            "model": self.config.agents.model,
            "max_tokens": 1024,
            "system": format!(
                "You orchestrate a swarm of reverse-engineering agents analyzing {}.",
                self.binary_name
            ),
            "messages": [{ "role": "user", "content": input }],
        });
        match client.send(&body).await {
            Ok(response) => {
                let text = response
                    .pointer("/content/0/text")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(empty response)");
                OrchestratorResponse::content(text.to_owned())
            }
            Err(e) => OrchestratorResponse::err(format!("deliberation failed: {e}")),
        }
    }

    /// Serve the session pipes until shutdown (or supervisor EOF).
    ///
    /// Pipe I/O runs on OS threads; requests are handled here one at a
    /// time, preserving the one-response-per-request contract.
    pub async fn serve(self: Arc<Self>, session_dir: PathBuf) -> Result<()> {
        let (req_tx, mut req_rx) =
            tokio::sync::mpsc::unbounded_channel::<OrchestratorRequest>();
        let (resp_tx, resp_rx) = std::sync::mpsc::channel::<OrchestratorResponse>();

        // Open the request pipe first: the supervisor's writer open is
        // blocked on it, and its response reader is already waiting.
        let request_path = session_dir.join(REQUEST_PIPE);
        let reader = std::thread::spawn(move || {
            let file = match File::open(&request_path) {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(error = %e, "failed to open request pipe");
                    return;
                }
            };
            let mut reader = BufReader::new(file);
            loop {
                match framing::read_message::<OrchestratorRequest>(&mut reader) {
                    Ok(Some(request)) => {
                        if req_tx.send(request).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::info!("supervisor closed the request pipe");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "request pipe protocol error");
                        break;
                    }
                }
            }
        });

        let response_path = session_dir.join(RESPONSE_PIPE);
        let writer = std::thread::spawn(move || {
            let mut file = match OpenOptions::new().write(true).open(&response_path) {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(error = %e, "failed to open response pipe");
                    return;
                }
            };
            for response in resp_rx {
                if let Err(e) = framing::write_message(&mut file, &response) {
                    tracing::error!(error = %e, "response write failed");
                    break;
                }
            }
        });

        while let Some(request) = req_rx.recv().await {
            let is_shutdown = request.method == "shutdown";
            let response = self.handle_request(request).await;
            if resp_tx.send(response).is_err() {
                break;
            }
            if is_shutdown {
                break;
            }
        }

        // Flush the last response; the request reader is detached; it
        // unblocks when the supervisor closes its end or we exit.
        drop(resp_tx);
        let _ = writer.join();
        drop(reader);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use swarm_domain::config::{AgentsConfig, BrokerConfig, HostConfig, SessionsConfig};

    /// Config pointing every external surface at test-safe stand-ins:
    /// `sleep` as the host, an ephemeral broker port, a temp workspace.
    fn test_config(root: &Path) -> Config {
        Config {
            workspace_root: root.to_path_buf(),
            sessions: SessionsConfig::default(),
            host: HostConfig {
                command: PathBuf::from("/bin/sleep"),
                args: vec!["30".into()],
            },
            agents: AgentsConfig {
                count: 2,
                model: "claude-sonnet-4-20250514".into(),
            },
            broker: BrokerConfig {
                port_base: 0,
                port_spread: 1,
            },
        }
    }

    #[tokio::test]
    async fn start_task_spawns_the_configured_fleet() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(tmp.path()), "/b/a.out")
            .await
            .unwrap();

        let resp = orch
            .handle_request(OrchestratorRequest::start_task("session_x", "map exports"))
            .await;
        assert!(!resp.is_error());
        assert_eq!(resp.result.as_ref().unwrap()["agents_spawned"], 2);
        assert!(resp.content_text().unwrap().contains("map exports"));

        // Config files landed in the workspace.
        let configs = tmp.path().join("a.out/configs");
        assert!(configs.join("agent_1_config.json").exists());
        assert!(configs.join("agent_2_config.json").exists());

        let resp = orch.handle_request(OrchestratorRequest::shutdown("session_x")).await;
        assert_eq!(resp.content_text(), Some("Shutting down"));
    }

    #[tokio::test]
    async fn status_and_merge_directives() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(tmp.path()), "/b/a.out")
            .await
            .unwrap();
        orch.handle_request(OrchestratorRequest::start_task("session_x", "t"))
            .await;

        // A recorded write shows up in status stats.
        orch.tracker
            .record("agent_1", "set_name", 0x401000, &json!({"name": "foo"}))
            .unwrap();

        let resp = orch
            .handle_request(OrchestratorRequest::process_input("msg_1", "status"))
            .await;
        let text = resp.content_text().unwrap();
        assert!(text.contains("Binary: a.out"));
        assert!(text.contains("Agents running: 2"));
        assert!(text.contains("agent_1: 1 calls"));

        let resp = orch
            .handle_request(OrchestratorRequest::process_input("msg_2", "merge agent_1"))
            .await;
        let text = resp.content_text().unwrap();
        assert!(text.contains("Merge of agent_1: 1 applied, 0 failed"));

        // The journaled write is on disk for the host to apply.
        let journal =
            std::fs::read_to_string(tmp.path().join("a.out/merge_journal.jsonl")).unwrap();
        assert_eq!(journal.lines().count(), 1);
        assert!(journal.contains("set_name"));

        orch.handle_request(OrchestratorRequest::shutdown("session_x")).await;
    }

    #[tokio::test]
    async fn spawn_directive_and_freeform_acknowledgement() {
        let tmp = tempfile::tempdir().unwrap();
        let orch = Orchestrator::new(test_config(tmp.path()), "/b/a.out")
            .await
            .unwrap();

        let resp = orch
            .handle_request(OrchestratorRequest::process_input(
                "msg_1",
                "spawn look at the crypto",
            ))
            .await;
        assert!(resp.content_text().unwrap().contains("agent_1"));

        // Without pool credentials, free-form input is acknowledged.
        if orch.llm.is_none() {
            let resp = orch
                .handle_request(OrchestratorRequest::process_input("msg_2", "how is it going"))
                .await;
            let text = resp.content_text().unwrap();
            assert!(text.contains("how is it going"));
            assert!(text.contains("status"));
        }

        let resp = orch
            .handle_request(OrchestratorRequest::new("msg_3", "bogus_method", json!({})))
            .await;
        assert!(resp.is_error());

        orch.handle_request(OrchestratorRequest::shutdown("s")).await;
    }

    #[tokio::test]
    async fn resurrect_directive_relaunches_with_saved_config() {
        let tmp = tempfile::tempdir().unwrap();
        let bin_dir = tmp.path().join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let bin_path = bin_dir.join("a.out");
        std::fs::write(&bin_path, b"").unwrap();

        let orch = Orchestrator::new(test_config(tmp.path()), bin_path.to_str().unwrap())
            .await
            .unwrap();
        orch.handle_request(OrchestratorRequest::start_task("s", "map exports"))
            .await;

        let resp = orch
            .handle_request(OrchestratorRequest::process_input("m1", "resurrect agent_1"))
            .await;
        assert!(resp.content_text().unwrap().contains("Resurrected agent_1"));
        // The marker and saved config land next to the database.
        assert!(bin_dir.join(".resurrecting").exists());
        assert!(bin_dir.join("resurrection_config.json").exists());

        // An agent that never ran has no recorded config.
        let resp = orch
            .handle_request(OrchestratorRequest::process_input("m2", "resurrect agent_9"))
            .await;
        assert!(resp.is_error());

        orch.handle_request(OrchestratorRequest::shutdown("s")).await;
    }

    #[tokio::test]
    async fn serve_answers_over_the_session_pipes() {
        use nix::sys::stat::Mode;

        let tmp = tempfile::tempdir().unwrap();
        let session_dir = tmp.path().join("session_test");
        std::fs::create_dir_all(&session_dir).unwrap();
        for pipe in [REQUEST_PIPE, RESPONSE_PIPE] {
            nix::unistd::mkfifo(&session_dir.join(pipe), Mode::from_bits_truncate(0o666))
                .unwrap();
        }

        let orch = Arc::new(
            Orchestrator::new(test_config(tmp.path()), "/b/a.out")
                .await
                .unwrap(),
        );
        let server = tokio::spawn(orch.clone().serve(session_dir.clone()));

        // Supervisor side, on a blocking thread.
        let supervisor = tokio::task::spawn_blocking(move || {
            let mut writer = OpenOptions::new()
                .write(true)
                .open(session_dir.join(REQUEST_PIPE))
                .unwrap();
            let mut reader = BufReader::new(File::open(session_dir.join(RESPONSE_PIPE)).unwrap());

            framing::write_message(&mut writer, &OrchestratorRequest::process_input("m1", "status"))
                .unwrap();
            let resp: OrchestratorResponse =
                framing::read_message(&mut reader).unwrap().unwrap();
            assert!(resp.content_text().unwrap().contains("Binary: a.out"));

            framing::write_message(&mut writer, &OrchestratorRequest::shutdown("s")).unwrap();
            let resp: OrchestratorResponse =
                framing::read_message(&mut reader).unwrap().unwrap();
            assert_eq!(resp.content_text(), Some("Shutting down"));
        });

        supervisor.await.unwrap();
        server.await.unwrap().unwrap();
    }
}
