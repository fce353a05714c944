//! The three session tools exposed over MCP.

use std::sync::Arc;

use serde_json::{json, Value};

use swarm_sessions::SessionSupervisor;

use crate::server::StdioServer;

/// Register `start_analysis_session`, `send_message` and
/// `close_session` against a supervisor.
pub fn register_session_tools(server: &mut StdioServer, supervisor: Arc<SessionSupervisor>) {
    let start_supervisor = supervisor.clone();
    server.register_tool(
        "start_analysis_session",
        "Start an AI swarm analysis session on a binary. Spawns an orchestrator that \
         manages a fleet of reverse-engineering agents over the same database. The task \
         should carry real context about what you need and why; the orchestrator plans \
         the swarm around it.",
        json!({
            "type": "object",
            "properties": {
                "binary_path": {
                    "type": "string",
                    "description": "Absolute path to the binary or database to analyze."
                },
                "task": {
                    "type": "string",
                    "description": "The initial task or question for the orchestrator."
                }
            },
            "required": ["binary_path", "task"]
        }),
        Box::new(move |args| start_analysis_session(&start_supervisor, args)),
    );

    let send_supervisor = supervisor.clone();
    server.register_tool(
        "send_message",
        "Send a follow-up message to a running analysis session. The orchestrator keeps \
         full context from previous interactions and can direct agents, spawn new ones, \
         or merge results.",
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Session id returned by start_analysis_session."
                },
                "message": {
                    "type": "string",
                    "description": "Message for the orchestrator managing the swarm."
                }
            },
            "required": ["session_id", "message"]
        }),
        Box::new(move |args| send_message(&send_supervisor, args)),
    );

    server.register_tool(
        "close_session",
        "Close an active analysis session, shutting down its orchestrator and agents.",
        json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Session id of the session to terminate."
                }
            },
            "required": ["session_id"]
        }),
        Box::new(move |args| close_session(&supervisor, args)),
    );
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

fn start_analysis_session(
    supervisor: &SessionSupervisor,
    args: &Value,
) -> Result<String, String> {
    let binary_path = required_str(args, "binary_path")?;
    let task = required_str(args, "task")?;

    let session_id = supervisor
        .create_session(binary_path, task)
        .map_err(|e| e.to_string())?;

    // The orchestrator answers the initial task with its startup report.
    let response = supervisor
        .wait_for_response(&session_id, None)
        .map_err(|e| e.to_string())?;

    if let Some(error) = &response.error {
        let error = format!("Session failed to start: {error}");
        let _ = supervisor.close_session(&session_id);
        return Err(error);
    }

    let content = response.content_text().unwrap_or("Session started");
    Ok(format!("Session ID: {session_id}\n\n{content}"))
}

fn send_message(supervisor: &SessionSupervisor, args: &Value) -> Result<String, String> {
    let session_id = required_str(args, "session_id")?;
    let message = required_str(args, "message")?;

    let response = supervisor
        .send_message(session_id, message, true)
        .map_err(|e| e.to_string())?;

    if let Some(error) = &response.error {
        return Err(error.clone());
    }
    Ok(response
        .content_text()
        .unwrap_or("Message sent to orchestrator")
        .to_owned())
}

fn close_session(supervisor: &SessionSupervisor, args: &Value) -> Result<String, String> {
    let session_id = required_str(args, "session_id")?;
    match supervisor.close_session(session_id) {
        Ok(true) => Ok("Session closed successfully".into()),
        Ok(false) => Err(format!("Session not found: {session_id}")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_domain::config::{HostConfig, SessionsConfig};

    fn supervisor(max_sessions: usize) -> (tempfile::TempDir, Arc<SessionSupervisor>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = SessionsConfig {
            root: tmp.path().to_path_buf(),
            max_sessions,
            graceful_exit_secs: 1,
        };
        let supervisor =
            Arc::new(SessionSupervisor::new(config, HostConfig::default()).unwrap());
        (tmp, supervisor)
    }

    #[test]
    fn tools_are_listed_with_schemas() {
        let (_tmp, supervisor) = supervisor(1);
        let mut server = StdioServer::new("swarm-mcp", "0.1.0");
        register_session_tools(&mut server, supervisor);

        let init = server
            .process_line(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#)
            .unwrap();
        assert!(init.contains("swarm-mcp"));
        server.process_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#);

        let listing = server
            .process_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .unwrap();
        let listing: Value = serde_json::from_str(&listing).unwrap();
        let names: Vec<&str> = listing["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            ["start_analysis_session", "send_message", "close_session"]
        );
    }

    #[test]
    fn missing_parameters_are_rejected() {
        let (_tmp, supervisor) = supervisor(1);
        let err = start_analysis_session(&supervisor, &json!({ "task": "t" })).unwrap_err();
        assert!(err.contains("binary_path"));
        let err = send_message(&supervisor, &json!({ "session_id": "s" })).unwrap_err();
        assert!(err.contains("message"));
        let err = close_session(&supervisor, &json!({})).unwrap_err();
        assert!(err.contains("session_id"));
    }

    #[test]
    fn capacity_error_surfaces_as_tool_error() {
        let (_tmp, supervisor) = supervisor(0);
        let err = start_analysis_session(
            &supervisor,
            &json!({ "binary_path": "/b/a.out", "task": "t" }),
        )
        .unwrap_err();
        assert!(err.contains("maximum number of sessions"), "{err}");
    }

    #[test]
    fn close_unknown_session_reports_not_found() {
        let (_tmp, supervisor) = supervisor(1);
        let err = close_session(
            &supervisor,
            &json!({ "session_id": "session_0000000000000000" }),
        )
        .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn send_to_unknown_session_is_an_error() {
        let (_tmp, supervisor) = supervisor(1);
        let err = send_message(
            &supervisor,
            &json!({ "session_id": "session_ffff", "message": "hello" }),
        )
        .unwrap_err();
        assert!(err.contains("not found or inactive"), "{err}");
    }
}
