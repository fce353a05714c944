//! The broker server: localhost TCP accept loop and command handling.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;

use swarm_domain::error::{Error, Result};

use crate::channel::Channel;
use crate::message::{unescape_text, Message};
use crate::transcript::Transcript;

/// The channel where agents register and announce presence.
const AGENTS_CHANNEL: &str = "#agents";
/// Nick prefix identifying an agent connection.
const AGENT_NICK_PREFIX: &str = "agent_";
/// PRIVMSG prefix announcing an agent's task.
const TASK_PREFIX: &str = "MY_TASK: ";

/// Presence record for one registered agent.
#[derive(Debug, Clone)]
pub struct AgentPresence {
    pub agent_id: String,
    pub task: String,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    client_id: u64,
}

struct Client {
    nick: Option<String>,
    tx: UnboundedSender<String>,
}

#[derive(Default)]
struct BrokerState {
    next_client_id: u64,
    clients: HashMap<u64, Client>,
    channels: HashMap<String, Channel>,
    agents: HashMap<String, AgentPresence>,
}

struct Inner {
    state: Mutex<BrokerState>,
    transcript: Transcript,
}

/// The deliberation broker for one binary.
pub struct Broker {
    inner: Arc<Inner>,
    port: u16,
    accept_task: JoinHandle<()>,
}

impl Broker {
    /// Bind `127.0.0.1:port` (0 for an ephemeral port) and start serving.
    /// The transcript database lives in `workspace_dir`.
    pub async fn start(port: u16, workspace_dir: &std::path::Path) -> Result<Self> {
        let transcript = Transcript::open(workspace_dir)?;
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| Error::Broker(format!("binding port {port}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Broker(e.to_string()))?
            .port();

        let inner = Arc::new(Inner {
            state: Mutex::new(BrokerState::default()),
            transcript,
        });

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "broker connection accepted");
                        let inner = accept_inner.clone();
                        tokio::spawn(handle_client(inner, stream));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "broker accept failed");
                    }
                }
            }
        });

        tracing::info!(port, "deliberation broker listening");
        Ok(Self {
            inner,
            port,
            accept_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Names of channels with in-memory state.
    pub fn list_channels(&self) -> Vec<String> {
        self.inner.state.lock().channels.keys().cloned().collect()
    }

    /// Currently registered agents.
    pub fn active_agents(&self) -> Vec<AgentPresence> {
        self.inner.state.lock().agents.values().cloned().collect()
    }

    /// Channel history: in-memory if the channel is live, otherwise
    /// synthesized from the transcript.
    pub fn channel_history(&self, channel: &str) -> Result<Vec<Message>> {
        {
            let state = self.inner.state.lock();
            if let Some(ch) = state.channels.get(channel) {
                return Ok(ch.history().to_vec());
            }
        }
        self.inner.transcript.load_channel(channel)
    }

    /// Stop accepting connections. Existing connections drain on close.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-connection handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_client(inner: Arc<Inner>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = unbounded_channel::<String>();

    let client_id = {
        let mut state = inner.state.lock();
        let id = state.next_client_id;
        state.next_client_id += 1;
        state.clients.insert(id, Client { nick: None, tx });
        id
    };

    // Writer task: drains the outbound queue onto the socket so command
    // processing never blocks on a slow peer.
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }
        let msg = Message::parse(trimmed);
        let deliveries = process_message(&inner, client_id, msg);
        deliver(&inner, deliveries);
    }

    let deliveries = handle_disconnect(&inner, client_id);
    deliver(&inner, deliveries);
    writer.abort();
    tracing::debug!(client_id, "broker connection closed");
}

fn deliver(inner: &Inner, deliveries: Vec<(u64, String)>) {
    let state = inner.state.lock();
    for (target, line) in deliveries {
        if let Some(client) = state.clients.get(&target) {
            let _ = client.tx.send(line);
        }
    }
}

/// Handle one parsed command. Returns the lines to deliver, computed under
/// the state lock and sent after it is released.
fn process_message(inner: &Inner, client_id: u64, msg: Message) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    let mut state = inner.state.lock();

    match msg.command.as_str() {
        "NICK" if !msg.params.is_empty() => {
            let nick = msg.params[0].clone();
            if let Some(client) = state.clients.get_mut(&client_id) {
                client.nick = Some(nick.clone());
            }
            let welcome = Message::new(
                Some("server"),
                "001",
                [nick.as_str(), "Welcome to the deliberation server"],
            );
            out.push((client_id, welcome.serialize()));
        }

        "JOIN" if !msg.params.is_empty() => {
            let channel_name = msg.params[0].clone();
            let nick = nick_of(&state, client_id);

            state
                .channels
                .entry(channel_name.clone())
                .or_insert_with(|| Channel::new(&channel_name))
                .add_member(client_id);

            let join_msg = Message::new(Some(&nick), "JOIN", [channel_name.as_str()]);
            out.extend(broadcast(&mut state, &channel_name, join_msg, None));

            // Provisionally register agents joining #agents; the JOIN is
            // announced once the task arrives.
            if channel_name == AGENTS_CHANNEL && nick.starts_with(AGENT_NICK_PREFIX) {
                state.agents.insert(
                    nick.clone(),
                    AgentPresence {
                        agent_id: nick.clone(),
                        task: String::new(),
                        last_seen: chrono::Utc::now(),
                        client_id,
                    },
                );
            }

            // New joiner receives the full history, in broadcast order.
            if let Some(ch) = state.channels.get(&channel_name) {
                for hist in ch.history() {
                    out.push((client_id, hist.serialize()));
                }
            }
        }

        "PRIVMSG" if msg.params.len() >= 2 => {
            let channel_name = msg.params[0].clone();
            let text = msg.params[1].clone();
            let nick = nick_of(&state, client_id);

            if let Some(agent) = state.agents.get_mut(&nick) {
                agent.last_seen = chrono::Utc::now();
            }

            // Task announcement: consumed, never broadcast itself.
            if let Some(task) = text.strip_prefix(TASK_PREFIX) {
                let mut announce = None;
                if let Some(agent) = state.agents.get_mut(&nick) {
                    if agent.task.is_empty() {
                        announce = Some(format!("AGENT_JOIN: {nick}|{task}"));
                    }
                    agent.task = task.to_owned();
                }
                if let Some(text) = announce {
                    out.extend(system_broadcast(&mut state, &text));
                }
                return out;
            }

            if state.channels.contains_key(&channel_name) {
                // Wire form keeps any escapes; the transcript stores the
                // unescaped text.
                let privmsg = Message::privmsg(&nick, &channel_name, &text);
                out.extend(broadcast(&mut state, &channel_name, privmsg, Some(client_id)));
                if let Err(e) = inner
                    .transcript
                    .log(&channel_name, &nick, &unescape_text(&text))
                {
                    tracing::warn!(error = %e, "transcript write failed");
                }
            }
        }

        "PART" if !msg.params.is_empty() => {
            let channel_name = msg.params[0].clone();
            let nick = nick_of(&state, client_id);
            if let Some(ch) = state.channels.get_mut(&channel_name) {
                ch.remove_member(client_id);
                let part_msg = Message::new(Some(&nick), "PART", [channel_name.as_str()]);
                out.extend(broadcast(&mut state, &channel_name, part_msg, None));
            }
        }

        other => {
            tracing::debug!(command = other, "ignoring unsupported broker command");
        }
    }

    out
}

fn handle_disconnect(inner: &Inner, client_id: u64) -> Vec<(u64, String)> {
    let mut out = Vec::new();
    let mut state = inner.state.lock();

    // Departing agents are announced to the rest of the swarm.
    let departed: Option<String> = state
        .agents
        .iter()
        .find(|(_, info)| info.client_id == client_id)
        .map(|(id, _)| id.clone());
    if let Some(agent_id) = departed {
        state.agents.remove(&agent_id);
        out.extend(system_broadcast(&mut state, &format!("AGENT_LEAVE: {agent_id}")));
        tracing::info!(agent_id, "agent left the broker");
    }

    for ch in state.channels.values_mut() {
        ch.remove_member(client_id);
    }
    state.clients.remove(&client_id);
    out
}

fn nick_of(state: &BrokerState, client_id: u64) -> String {
    state
        .clients
        .get(&client_id)
        .and_then(|c| c.nick.clone())
        .unwrap_or_else(|| format!("client_{client_id}"))
}

fn broadcast(
    state: &mut BrokerState,
    channel_name: &str,
    msg: Message,
    sender: Option<u64>,
) -> Vec<(u64, String)> {
    match state.channels.get_mut(channel_name) {
        Some(ch) => {
            let line = msg.serialize();
            ch.record_broadcast(msg, sender)
                .into_iter()
                .map(|id| (id, line.clone()))
                .collect()
        }
        None => Vec::new(),
    }
}

fn system_broadcast(state: &mut BrokerState, text: &str) -> Vec<(u64, String)> {
    let msg = Message::new(Some("SYSTEM"), "PRIVMSG", [AGENTS_CHANNEL, text]);
    broadcast(state, AGENTS_CHANNEL, msg, None)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(port: u16) -> Self {
            let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let (r, w) = stream.into_split();
            Self {
                reader: BufReader::new(r),
                writer: w,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Message {
            let mut line = String::new();
            tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for broker line")
                .unwrap();
            Message::parse(line.trim_end_matches(['\r', '\n']))
        }

        /// Register with a nick and consume the 001 welcome.
        async fn login(&mut self, nick: &str) {
            self.send(&format!("NICK {nick}")).await;
            let welcome = self.recv().await;
            assert_eq!(welcome.command, "001");
            assert_eq!(welcome.params[0], nick);
        }
    }

    async fn broker() -> (tempfile::TempDir, Broker) {
        let tmp = tempfile::tempdir().unwrap();
        let broker = Broker::start(0, tmp.path()).await.unwrap();
        (tmp, broker)
    }

    #[tokio::test]
    async fn privmsg_reaches_other_members_not_sender() {
        let (_tmp, broker) = broker().await;
        let mut a = TestClient::connect(broker.port()).await;
        let mut b = TestClient::connect(broker.port()).await;
        a.login("agent_1").await;
        b.login("agent_2").await;

        a.send("JOIN #findings").await;
        let join = a.recv().await; // own JOIN broadcast
        assert_eq!(join.command, "JOIN");
        let _history_join = a.recv().await; // history replay of the same JOIN

        b.send("JOIN #findings").await;
        let _b_join = b.recv().await;

        // A sees B's join too.
        let seen = a.recv().await;
        assert_eq!(seen.command, "JOIN");
        assert_eq!(seen.prefix.as_deref(), Some("agent_2"));

        // Drain B's history replay (JOIN agent_1, JOIN agent_2).
        let _ = b.recv().await;
        let _ = b.recv().await;

        a.send("PRIVMSG #findings :renamed the dispatcher").await;
        let msg = b.recv().await;
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.prefix.as_deref(), Some("agent_1"));
        assert_eq!(msg.params[1], "renamed the dispatcher");

        assert!(broker.list_channels().contains(&"#findings".to_owned()));
    }

    #[tokio::test]
    async fn late_joiner_receives_history_in_order() {
        let (_tmp, broker) = broker().await;
        let mut a = TestClient::connect(broker.port()).await;
        a.login("agent_1").await;
        a.send("JOIN #notes").await;
        let _ = a.recv().await; // JOIN broadcast
        let _ = a.recv().await; // history replay

        a.send("PRIVMSG #notes :first").await;
        a.send("PRIVMSG #notes :second").await;

        // Wait for the server to process before the late join.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut b = TestClient::connect(broker.port()).await;
        b.login("observer").await;
        b.send("JOIN #notes").await;
        let own_join = b.recv().await;
        assert_eq!(own_join.command, "JOIN");

        // History: agent_1 JOIN, first, second, observer JOIN.
        let h1 = b.recv().await;
        assert_eq!(h1.command, "JOIN");
        assert_eq!(h1.prefix.as_deref(), Some("agent_1"));
        let h2 = b.recv().await;
        assert_eq!(h2.params[1], "first");
        let h3 = b.recv().await;
        assert_eq!(h3.params[1], "second");
        let h4 = b.recv().await;
        assert_eq!(h4.command, "JOIN");
        assert_eq!(h4.prefix.as_deref(), Some("observer"));
    }

    #[tokio::test]
    async fn my_task_registers_agent_and_is_consumed() {
        let (_tmp, broker) = broker().await;
        let mut a = TestClient::connect(broker.port()).await;
        let mut b = TestClient::connect(broker.port()).await;
        a.login("agent_1").await;
        b.login("agent_2").await;

        a.send("JOIN #agents").await;
        let _ = a.recv().await;
        let _ = a.recv().await;
        b.send("JOIN #agents").await;
        let _ = b.recv().await; // own join
        let _seen_by_a = a.recv().await;
        let _ = b.recv().await; // history: agent_1 join
        let _ = b.recv().await; // history: agent_2 join

        a.send("PRIVMSG #agents :MY_TASK: map the import table").await;

        // B receives the system AGENT_JOIN, not the MY_TASK itself.
        let announce = b.recv().await;
        assert_eq!(announce.prefix.as_deref(), Some("SYSTEM"));
        assert_eq!(announce.params[1], "AGENT_JOIN: agent_1|map the import table");

        let agents = broker.active_agents();
        assert_eq!(agents.len(), 2);
        let registered = agents.iter().find(|p| p.agent_id == "agent_1").unwrap();
        assert_eq!(registered.task, "map the import table");

        // A second MY_TASK updates the task without re-announcing.
        a.send("PRIVMSG #agents :MY_TASK: now patching").await;
        a.send("PRIVMSG #agents :done with imports").await;
        let next = b.recv().await;
        assert_eq!(next.params[1], "done with imports");
    }

    #[tokio::test]
    async fn disconnect_broadcasts_agent_leave() {
        let (_tmp, broker) = broker().await;
        let mut a = TestClient::connect(broker.port()).await;
        let mut b = TestClient::connect(broker.port()).await;
        a.login("agent_1").await;
        b.login("agent_2").await;
        a.send("JOIN #agents").await;
        let _ = a.recv().await;
        let _ = a.recv().await;
        b.send("JOIN #agents").await;
        let _ = b.recv().await;
        let _ = a.recv().await;
        let _ = b.recv().await;
        let _ = b.recv().await;

        a.send("PRIVMSG #agents :MY_TASK: exports").await;
        let _join = b.recv().await;

        drop(a);

        let leave = b.recv().await;
        assert_eq!(leave.prefix.as_deref(), Some("SYSTEM"));
        assert_eq!(leave.params[1], "AGENT_LEAVE: agent_1");
        assert!(broker.active_agents().iter().all(|p| p.agent_id != "agent_1"));
    }

    #[tokio::test]
    async fn transcript_stores_unescaped_text() {
        let (tmp, broker) = broker().await;
        let mut a = TestClient::connect(broker.port()).await;
        a.login("agent_1").await;
        a.send("JOIN #scratch").await;
        let _ = a.recv().await;
        let _ = a.recv().await;

        a.send("PRIVMSG #scratch :one\\ntwo").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let transcript = Transcript::open(tmp.path()).unwrap();
        let history = transcript.load_channel("#scratch").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].params[1], "one\ntwo");

        // The broker's cold lookup goes through the same path once the
        // in-memory channel is gone; the live one keeps the wire form.
        let live = broker.channel_history("#scratch").unwrap();
        let privmsgs: Vec<_> = live.iter().filter(|m| m.command == "PRIVMSG").collect();
        assert_eq!(privmsgs[0].params[1], "one\\ntwo");
    }

    #[tokio::test]
    async fn cold_history_is_synthesized_from_transcript() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let transcript = Transcript::open(tmp.path()).unwrap();
            transcript.log("#old", "agent_9", "from a past run").unwrap();
        }
        let broker = Broker::start(0, tmp.path()).await.unwrap();
        let history = broker.channel_history("#old").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].command, "PRIVMSG");
        assert_eq!(history[0].prefix.as_deref(), Some("agent_9"));
        assert_eq!(history[0].params[1], "from a past run");
    }

    #[tokio::test]
    async fn part_is_announced_to_remaining_members() {
        let (_tmp, broker) = broker().await;
        let mut a = TestClient::connect(broker.port()).await;
        let mut b = TestClient::connect(broker.port()).await;
        a.login("agent_1").await;
        b.login("agent_2").await;
        a.send("JOIN #room").await;
        let _ = a.recv().await;
        let _ = a.recv().await;
        b.send("JOIN #room").await;
        let _ = b.recv().await;
        let _ = a.recv().await;
        let _ = b.recv().await;
        let _ = b.recv().await;

        a.send("PART #room").await;
        let part = b.recv().await;
        assert_eq!(part.command, "PART");
        assert_eq!(part.prefix.as_deref(), Some("agent_1"));
    }
}
