/// Shared error type used across all swarm crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database: {0}")]
    Database(String),

    #[error("session {session_id}: {message}")]
    Session { session_id: String, message: String },

    #[error("binary already being analyzed in session {0}")]
    AlreadyActive(String),

    #[error("maximum number of sessions reached ({0})")]
    MaxSessions(usize),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("pipe: {0}")]
    Pipe(String),

    #[error("broker: {0}")]
    Broker(String),

    #[error("crypto: {0}")]
    Crypto(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("credentials file not found at {0}")]
    CredentialsMissing(String),

    #[error("credentials file unreadable: {0}")]
    CredentialsUnreadable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
