//! The session supervisor.
//!
//! Owns every session: spawning, the framed-pipe request/response cycle,
//! the single-flight invariant, graceful-then-forceful shutdown, and
//! crash detection. Sessions expose no callbacks into the supervisor;
//! all routing happens here.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use swarm_domain::config::{
    HostConfig, SessionsConfig, ENV_SESSION_DIR, ENV_SESSION_ID, REQUEST_PIPE, RESPONSE_PIPE,
};
use swarm_domain::envelope::{OrchestratorRequest, OrchestratorResponse};
use swarm_domain::error::{Error, Result};
use swarm_domain::framing;

use crate::identity;
use crate::probe;
use crate::process;
use crate::state::SessionState;

/// How often liveness is polled during graceful shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(1000);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct SessionInner {
    active: bool,
    response_buffer: Vec<OrchestratorResponse>,
    has_pending_request: bool,
    pending_request_text: String,
    last_activity: Option<Instant>,
}

struct Session {
    session_id: String,
    binary_path: String,
    session_dir: PathBuf,
    pid: i32,
    created_at: Instant,

    inner: Mutex<SessionInner>,
    response_cv: Condvar,
    /// In-flight operation count; close waits for it to drain.
    usage: Mutex<usize>,
    usage_cv: Condvar,
    reader_stop: AtomicBool,
    writer: Mutex<Option<File>>,
    child: Mutex<Option<Child>>,
    reader_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Session {
    fn new(
        session_id: String,
        binary_path: String,
        session_dir: PathBuf,
        child: Option<Child>,
        pid: i32,
    ) -> Self {
        Self {
            session_id,
            binary_path,
            session_dir,
            pid,
            created_at: Instant::now(),
            inner: Mutex::new(SessionInner {
                active: true,
                ..Default::default()
            }),
            response_cv: Condvar::new(),
            usage: Mutex::new(0),
            usage_cv: Condvar::new(),
            reader_stop: AtomicBool::new(false),
            writer: Mutex::new(None),
            child: Mutex::new(child),
            reader_thread: Mutex::new(None),
        }
    }

    fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    fn process_has_exited(&self) -> bool {
        let mut child = self.child.lock();
        match child.as_mut() {
            Some(c) => match c.try_wait() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                // Reaped elsewhere or not traceable: the probe decides.
                Err(_) => !process::is_alive(self.pid),
            },
            None => process::child_exited(self.pid),
        }
    }

    fn kill_process(&self) {
        let mut child = self.child.lock();
        if let Some(c) = child.as_mut() {
            let _ = c.kill();
            let _ = c.wait();
        } else {
            process::kill_now(self.pid);
        }
    }

    fn usage_inc(&self) {
        *self.usage.lock() += 1;
    }

    fn usage_dec(&self) {
        let mut usage = self.usage.lock();
        *usage -= 1;
        if *usage == 0 {
            self.usage_cv.notify_all();
        }
    }

    /// Block until no operation is in flight.
    fn wait_idle(&self) {
        let mut usage = self.usage.lock();
        while *usage != 0 {
            self.usage_cv.wait(&mut usage);
        }
    }

    fn push_response(&self, response: OrchestratorResponse) {
        let mut inner = self.inner.lock();
        inner.response_buffer.push(response);
        self.response_cv.notify_all();
    }

    /// Consume the single buffered response, blocking until it arrives.
    ///
    /// On success the pending flag clears. A timeout returns an error
    /// response but leaves the pending flag set: the real response may
    /// still arrive and be consumed by a later wait.
    fn consume_response(&self, timeout: Option<Duration>) -> OrchestratorResponse {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();

        while inner.response_buffer.is_empty() {
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return OrchestratorResponse::err(
                            "Timeout waiting for response from orchestrator",
                        );
                    }
                    self.response_cv.wait_until(&mut inner, deadline);
                }
                None => self.response_cv.wait(&mut inner),
            }
        }

        let response = inner.response_buffer.remove(0);
        inner.response_buffer.clear();
        inner.has_pending_request = false;
        inner.pending_request_text.clear();
        response
    }

    fn send_request(&self, request: &OrchestratorRequest) -> Result<()> {
        let mut writer = self.writer.lock();
        match writer.as_mut() {
            Some(w) => framing::write_message(w, request),
            None => Err(Error::Pipe("request pipe not open".into())),
        }
    }
}

/// Reader thread: opens the response pipe (blocking until the
/// orchestrator opens its end) and pushes every framed response into the
/// session buffer. EOF with a dead process synthesizes a crash response.
fn reader_loop(session: Arc<Session>) {
    let path = session.session_dir.join(RESPONSE_PIPE);
    tracing::debug!(session_id = %session.session_id, "reader opening response pipe");

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            session.push_response(OrchestratorResponse::err(format!(
                "Failed to open response pipe: {e}"
            )));
            return;
        }
    };
    let mut reader = BufReader::new(file);

    while !session.reader_stop.load(Ordering::Relaxed) {
        match framing::read_message::<OrchestratorResponse>(&mut reader) {
            Ok(Some(response)) => {
                tracing::debug!(session_id = %session.session_id, "response received");
                session.push_response(response);
            }
            Ok(None) => {
                // EOF: clean shutdown or crash. Give the PID a moment to
                // actually exit before deciding which.
                let mut exited = false;
                for _ in 0..5 {
                    if session.process_has_exited() {
                        exited = true;
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                if exited {
                    tracing::warn!(
                        session_id = %session.session_id,
                        pid = session.pid,
                        "orchestrator process terminated"
                    );
                    session.inner.lock().active = false;
                    session.push_response(OrchestratorResponse::err(format!(
                        "Orchestrator process terminated (PID {})",
                        session.pid
                    )));
                }
                break;
            }
            Err(e) => {
                tracing::warn!(session_id = %session.session_id, error = %e, "pipe protocol error");
                session.inner.lock().active = false;
                session.push_response(OrchestratorResponse::err(format!("Pipe read error: {e}")));
                break;
            }
        }
    }
    tracing::debug!(session_id = %session.session_id, "reader thread exiting");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, Arc<Session>>,
    binary_to_session: HashMap<String, String>,
}

/// Owner of all supervised sessions.
pub struct SessionSupervisor {
    config: SessionsConfig,
    host: HostConfig,
    registry: Mutex<Registry>,
}

impl SessionSupervisor {
    pub fn new(config: SessionsConfig, host: HostConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)?;
        Ok(Self {
            config,
            host,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// The active session for a binary, if any.
    pub fn active_session_for_binary(&self, binary_path: &str) -> Option<String> {
        let registry = self.registry.lock();
        let session_id = registry.binary_to_session.get(binary_path)?;
        let session = registry.sessions.get(session_id)?;
        session.is_active().then(|| session_id.clone())
    }

    /// Create a session for a binary: derive its id, reap any stale
    /// predecessor, create the directory and pipes, spawn the
    /// orchestrator and send the initial task.
    pub fn create_session(&self, binary_path: &str, initial_task: &str) -> Result<String> {
        let mut registry = self.registry.lock();

        let session_id = identity::generate_session_id(&self.config.root, binary_path);
        let session_dir = self.config.root.join(&session_id);

        // Crash-recovery: a directory left by a previous run.
        if let Ok(state) = SessionState::load_dir(&session_dir) {
            if state.binary_path == binary_path {
                if process::is_alive(state.orchestrator_pid) {
                    if registry.sessions.contains_key(&session_id) {
                        return Err(Error::AlreadyActive(session_id));
                    }
                    return Err(Error::Session {
                        session_id: session_id.clone(),
                        message: format!(
                            "existing session found for this binary (PID {}), close it first",
                            state.orchestrator_pid
                        ),
                    });
                }
                tracing::warn!(
                    session_id,
                    pid = state.orchestrator_pid,
                    "reaping stale session directory"
                );
                let _ = std::fs::remove_dir_all(&session_dir);
            }
        }

        // In-memory duplicate for the same binary.
        if let Some(existing) = registry.binary_to_session.get(binary_path).cloned() {
            match registry.sessions.get(&existing) {
                Some(s) if s.is_active() => return Err(Error::AlreadyActive(existing)),
                _ => {
                    registry.binary_to_session.remove(binary_path);
                }
            }
        }

        if registry.sessions.len() >= self.config.max_sessions {
            return Err(Error::MaxSessions(self.config.max_sessions));
        }

        create_session_pipes(&session_dir)?;

        let child = match self.spawn_orchestrator(binary_path, &session_id, &session_dir) {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&session_dir);
                return Err(e);
            }
        };
        let pid = child.id() as i32;

        let state = SessionState {
            session_id: session_id.clone(),
            binary_path: binary_path.to_owned(),
            orchestrator_pid: pid,
            created_at: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = state.store_dir(&session_dir) {
            process::terminate(pid);
            let _ = std::fs::remove_dir_all(&session_dir);
            return Err(e);
        }

        let session = match self.attach_session(
            session_id.clone(),
            binary_path.to_owned(),
            session_dir.clone(),
            Some(child),
            pid,
        ) {
            Ok(session) => session,
            Err(e) => {
                process::terminate(pid);
                let _ = std::fs::remove_dir_all(&session_dir);
                return Err(e);
            }
        };

        // First request: the initial task. One pending slot is taken.
        let request = OrchestratorRequest::start_task(&session_id, initial_task);
        if let Err(e) = session.send_request(&request) {
            self.teardown_failed_session(&session);
            return Err(Error::Session {
                session_id,
                message: format!("failed to send initial task: {e}"),
            });
        }
        {
            let mut inner = session.inner.lock();
            inner.has_pending_request = true;
            inner.pending_request_text = initial_task.to_owned();
        }

        registry
            .binary_to_session
            .insert(binary_path.to_owned(), session_id.clone());
        registry.sessions.insert(session_id.clone(), session);

        tracing::info!(session_id, binary_path, pid, "session created");
        Ok(session_id)
    }

    /// Wire a spawned (or externally managed) orchestrator process into a
    /// session: start the response reader and open the request pipe. The
    /// request-pipe open blocks until the orchestrator opens its end.
    fn attach_session(
        &self,
        session_id: String,
        binary_path: String,
        session_dir: PathBuf,
        child: Option<Child>,
        pid: i32,
    ) -> Result<Arc<Session>> {
        let session = Arc::new(Session::new(
            session_id,
            binary_path,
            session_dir.clone(),
            child,
            pid,
        ));

        let reader_session = session.clone();
        let handle = std::thread::spawn(move || reader_loop(reader_session));
        *session.reader_thread.lock() = Some(handle);

        let writer = OpenOptions::new()
            .write(true)
            .open(session_dir.join(REQUEST_PIPE))
            .map_err(|e| {
                self.unblock_reader(&session);
                Error::Pipe(format!("opening request pipe: {e}"))
            })?;
        *session.writer.lock() = Some(writer);

        Ok(session)
    }

    /// Wake a reader stuck opening the response pipe by briefly opening
    /// the write end ourselves, then join it.
    fn unblock_reader(&self, session: &Arc<Session>) {
        session.reader_stop.store(true, Ordering::Relaxed);
        let _ = OpenOptions::new()
            .write(true)
            .open(session.session_dir.join(RESPONSE_PIPE));
        if let Some(handle) = session.reader_thread.lock().take() {
            let _ = handle.join();
        }
    }

    fn teardown_failed_session(&self, session: &Arc<Session>) {
        session.reader_stop.store(true, Ordering::Relaxed);
        *session.writer.lock() = None;
        session.kill_process();
        if let Some(handle) = session.reader_thread.lock().take() {
            let _ = handle.join();
        }
        let _ = std::fs::remove_dir_all(&session.session_dir);
    }

    fn spawn_orchestrator(
        &self,
        binary_path: &str,
        session_id: &str,
        session_dir: &std::path::Path,
    ) -> Result<Child> {
        let mut cmd = Command::new(&self.host.command);
        cmd.args(&self.host.args);
        if let Some(flag) = probe::detect_type_flag(binary_path) {
            tracing::debug!(flag, "adding binary type flag");
            cmd.arg(flag);
        }
        cmd.arg(binary_path)
            .env(ENV_SESSION_ID, session_id)
            .env(ENV_SESSION_DIR, session_dir);

        tracing::info!(
            host = %self.host.command.display(),
            binary_path,
            session_id,
            "spawning orchestrator"
        );
        cmd.spawn()
            .map_err(|e| Error::SpawnFailed(format!("{}: {e}", self.host.command.display())))
    }

    /// Send a message to a session's orchestrator.
    ///
    /// Single-flight: rejected while a previous request's response is
    /// unconsumed, naming that request. With `wait_for_response` the call
    /// blocks for the response; otherwise it returns immediately and the
    /// response stays buffered for [`wait_for_response`](Self::wait_for_response).
    pub fn send_message(
        &self,
        session_id: &str,
        message: &str,
        wait_for_response: bool,
    ) -> Result<OrchestratorResponse> {
        let session = self.checkout_active(session_id)?;

        {
            let mut inner = session.inner.lock();
            inner.last_activity = Some(Instant::now());

            if inner.has_pending_request {
                let pending = inner.pending_request_text.clone();
                drop(inner);
                session.usage_dec();
                return Err(Error::Session {
                    session_id: session_id.to_owned(),
                    message: format!(
                        "cannot send message: session has unconsumed response from previous \
                         request: \"{pending}\". Call wait_for_response first."
                    ),
                });
            }

            inner.response_buffer.clear();
            inner.has_pending_request = true;
            inner.pending_request_text = message.to_owned();
        }

        let request = OrchestratorRequest::process_input(
            format!("msg_{}", chrono::Utc::now().timestamp_micros()),
            message,
        );
        if let Err(e) = session.send_request(&request) {
            let mut inner = session.inner.lock();
            inner.has_pending_request = false;
            inner.pending_request_text.clear();
            drop(inner);
            session.usage_dec();
            return Err(Error::Session {
                session_id: session_id.to_owned(),
                message: format!("failed to send message to orchestrator: {e}"),
            });
        }

        if !wait_for_response {
            session.usage_dec();
            return Ok(OrchestratorResponse::ok(serde_json::json!({
                "success": true,
                "message": "Message sent, response pending"
            })));
        }

        let response = session.consume_response(None);
        session.usage_dec();
        Ok(response)
    }

    /// Consume the buffered response of an earlier non-waiting send.
    pub fn wait_for_response(
        &self,
        session_id: &str,
        timeout: Option<Duration>,
    ) -> Result<OrchestratorResponse> {
        let session = self.checkout_active(session_id)?;
        let response = session.consume_response(timeout);
        session.usage_dec();
        Ok(response)
    }

    /// Close a session: reject new work, drain in-flight operations,
    /// request a graceful shutdown, and force-kill on timeout.
    /// Returns `false` if the session does not exist.
    pub fn close_session(&self, session_id: &str) -> Result<bool> {
        let session = {
            let registry = self.registry.lock();
            match registry.sessions.get(session_id) {
                Some(s) => {
                    s.inner.lock().active = false;
                    s.clone()
                }
                None => return Ok(false),
            }
        };

        session.wait_idle();
        tracing::info!(session_id, "all in-flight operations drained, shutting down");

        let _ = session.send_request(&OrchestratorRequest::shutdown(session_id));

        let deadline = Instant::now() + Duration::from_secs(self.config.graceful_exit_secs);
        while Instant::now() < deadline && !session.process_has_exited() {
            std::thread::sleep(SHUTDOWN_POLL);
        }

        session.reader_stop.store(true, Ordering::Relaxed);
        if !session.process_has_exited() {
            tracing::warn!(session_id, pid = session.pid, "graceful exit timeout, force-killing");
            session.kill_process();
        } else {
            tracing::info!(session_id, "orchestrator exited gracefully");
        }

        // Closing our write end unblocks an orchestrator stuck reading.
        *session.writer.lock() = None;
        if let Some(handle) = session.reader_thread.lock().take() {
            let _ = handle.join();
        }

        let _ = std::fs::remove_dir_all(&session.session_dir);

        let mut registry = self.registry.lock();
        registry.sessions.remove(session_id);
        if registry.binary_to_session.get(&session.binary_path) == Some(&session.session_id) {
            registry.binary_to_session.remove(&session.binary_path);
        }
        Ok(true)
    }

    /// Close every session: shut all down in parallel, with one shared
    /// graceful window, then force-kill survivors.
    pub fn close_all_sessions(&self) {
        // Deactivation happens under the registry lock so no checkout can
        // slip between the active check and its usage increment.
        let sessions: Vec<Arc<Session>> = {
            let registry = self.registry.lock();
            for session in registry.sessions.values() {
                session.inner.lock().active = false;
            }
            registry.sessions.values().cloned().collect()
        };
        if sessions.is_empty() {
            return;
        }

        for session in &sessions {
            session.wait_idle();
        }

        tracing::info!(count = sessions.len(), "shutting down all sessions");
        for session in &sessions {
            let _ = session.send_request(&OrchestratorRequest::shutdown(&session.session_id));
            session.reader_stop.store(true, Ordering::Relaxed);
        }

        let deadline = Instant::now() + Duration::from_secs(self.config.graceful_exit_secs);
        loop {
            let all_exited = sessions.iter().all(|s| s.process_has_exited());
            if all_exited || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }

        for session in &sessions {
            if !session.process_has_exited() {
                tracing::warn!(
                    session_id = %session.session_id,
                    pid = session.pid,
                    "force-killing surviving orchestrator"
                );
                session.kill_process();
            }
            *session.writer.lock() = None;
            if let Some(handle) = session.reader_thread.lock().take() {
                let _ = handle.join();
            }
            let _ = std::fs::remove_dir_all(&session.session_dir);
        }

        let mut registry = self.registry.lock();
        registry.sessions.clear();
        registry.binary_to_session.clear();
        tracing::info!("all sessions closed");
    }

    /// Immediate SIGKILL for every session; reader threads are detached
    /// rather than joined.
    pub fn force_kill_all_sessions(&self) {
        let mut registry = self.registry.lock();
        for (session_id, session) in registry.sessions.drain() {
            tracing::warn!(session_id, pid = session.pid, "force-killing session");
            session.inner.lock().active = false;
            session.reader_stop.store(true, Ordering::Relaxed);
            *session.writer.lock() = None;
            session.kill_process();
            drop(session.reader_thread.lock().take());
            let _ = std::fs::remove_dir_all(&session.session_dir);
        }
        registry.binary_to_session.clear();
    }

    /// Diagnostic snapshot of one session.
    pub fn get_session_status(&self, session_id: &str) -> serde_json::Value {
        let registry = self.registry.lock();
        match registry.sessions.get(session_id) {
            None => serde_json::json!({ "exists": false }),
            Some(session) => {
                let inner = session.inner.lock();
                serde_json::json!({
                    "exists": true,
                    "session_id": session.session_id,
                    "binary_path": session.binary_path,
                    "active": inner.active,
                    "pid": session.pid,
                    "process_alive": !session.process_has_exited(),
                    "created_seconds_ago": session.created_at.elapsed().as_secs(),
                    "last_activity_seconds_ago": inner
                        .last_activity
                        .map(|t| t.elapsed().as_secs())
                        .unwrap_or_else(|| session.created_at.elapsed().as_secs()),
                })
            }
        }
    }

    /// Validate a session is active and take a usage reference, in one
    /// step under the registry lock. Close marks sessions inactive under
    /// the same lock, so it can never drain the usage count between our
    /// check and the increment; the caller must balance with
    /// `usage_dec`.
    fn checkout_active(&self, session_id: &str) -> Result<Arc<Session>> {
        let registry = self.registry.lock();
        let session = registry
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::Session {
                session_id: session_id.to_owned(),
                message: "session not found or inactive".into(),
            })?;
        if !session.is_active() {
            return Err(Error::Session {
                session_id: session_id.to_owned(),
                message: "session not found or inactive".into(),
            });
        }
        session.usage_inc();
        Ok(session)
    }
}

impl Drop for SessionSupervisor {
    fn drop(&mut self) {
        self.close_all_sessions();
    }
}

fn create_session_pipes(session_dir: &std::path::Path) -> Result<()> {
    use nix::sys::stat::Mode;

    std::fs::create_dir_all(session_dir)?;
    let mode = Mode::from_bits_truncate(0o666);
    for pipe in [REQUEST_PIPE, RESPONSE_PIPE] {
        let path = session_dir.join(pipe);
        nix::unistd::mkfifo(&path, mode)
            .map_err(|e| Error::Pipe(format!("mkfifo {}: {e}", path.display())))?;
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
