//! Shared types for the swarm orchestrator.
//!
//! Everything the processes agree on lives here: the common error type,
//! configuration, the framed-pipe codec, the orchestrator request/response
//! envelope, and the tool-call vocabulary (including the closed set of
//! write tools that drives conflict detection and merge replay).

pub mod config;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod tool;

pub use config::Config;
pub use envelope::{OrchestratorRequest, OrchestratorResponse};
pub use error::{Error, Result};
pub use tool::{ToolInvocation, ToolOutcome, ToolRegistry, WRITE_TOOLS};
