//! Session supervision.
//!
//! One session = one supervised orchestrator process tied to one binary.
//! The supervisor derives deterministic session identities, creates the
//! session directory with its two named pipes, spawns the orchestrator,
//! and enforces the single-flight invariant: at most one outstanding
//! request per session, with exactly one response consumed per request.

pub mod identity;
pub mod probe;
pub mod process;
pub mod state;
pub mod supervisor;

pub use identity::{generate_session_id, hash_binary_path};
pub use state::SessionState;
pub use supervisor::SessionSupervisor;
