//! IRC-lite deliberation broker.
//!
//! Agents of one binary coordinate through a minimal IRC dialect on a
//! localhost TCP port: NICK, JOIN, PART and PRIVMSG, with per-channel
//! in-memory history and a SQLite transcript. Joining `#agents` with an
//! `agent_*` nick registers presence; the first `MY_TASK:` message
//! completes registration and is announced as a system `AGENT_JOIN`.

pub mod channel;
pub mod message;
pub mod server;
pub mod transcript;

pub use message::Message;
pub use server::{AgentPresence, Broker};
pub use transcript::Transcript;
