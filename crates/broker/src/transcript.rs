//! SQLite transcript of broker deliberation.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use swarm_domain::error::{Error, Result};

use crate::message::Message;

const DB_FILE: &str = "irc_deliberation.db";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
        channel TEXT NOT NULL,
        nick TEXT NOT NULL,
        message TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_channel ON messages(channel);
";

/// Durable mirror of every persisted channel message.
pub struct Transcript {
    conn: Mutex<Connection>,
}

impl Transcript {
    /// Open (creating if needed) the transcript inside `workspace_dir`.
    pub fn open(workspace_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(workspace_dir)?;
        let db_path = workspace_dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Database(format!("opening {}: {e}", db_path.display())))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Database(format!("creating transcript schema: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record one message (already unescaped).
    pub fn log(&self, channel: &str, nick: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("INSERT INTO messages (channel, nick, message) VALUES (?1, ?2, ?3)")
            .map_err(|e| Error::Database(e.to_string()))?;
        stmt.execute(params![channel, nick, message])
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    /// Synthesize PRIVMSG history for a channel with no in-memory state.
    pub fn load_channel(&self, channel: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT nick, message FROM messages WHERE channel = ?1 ORDER BY id")
            .map_err(|e| Error::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![channel], |row| {
                let nick: String = row.get(0)?;
                let message: String = row.get(1)?;
                Ok((nick, message))
            })
            .map_err(|e| Error::Database(e.to_string()))?;

        let mut history = Vec::new();
        for row in rows {
            let (nick, message) = row.map_err(|e| Error::Database(e.to_string()))?;
            history.push(Message::privmsg(&nick, channel, &message));
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_and_reload_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = Transcript::open(tmp.path()).unwrap();
        transcript.log("#agents", "agent_1", "first").unwrap();
        transcript.log("#agents", "agent_2", "second").unwrap();
        transcript.log("#other", "agent_1", "elsewhere").unwrap();

        let history = transcript.load_channel("#agents").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].prefix.as_deref(), Some("agent_1"));
        assert_eq!(history[0].params, vec!["#agents", "first"]);
        assert_eq!(history[1].params[1], "second");
    }

    #[test]
    fn unknown_channel_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = Transcript::open(tmp.path()).unwrap();
        assert!(transcript.load_channel("#nothing").unwrap().is_empty());
    }

    #[test]
    fn stores_multiline_text_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let transcript = Transcript::open(tmp.path()).unwrap();
        transcript.log("#agents", "agent_1", "line one\nline two").unwrap();
        let history = transcript.load_channel("#agents").unwrap();
        assert_eq!(history[0].params[1], "line one\nline two");
    }
}
