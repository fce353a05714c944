//! Upstream LLM HTTP client.
//!
//! Thin on the wire format (the Messages API payload passes through as
//! JSON) and thick on the parts the swarm depends on: pool-backed OAuth
//! with per-request disk reload, retry with exponential backoff,
//! rate-limit classification and failover, and a requests log for
//! post-mortem inspection of auth failures.

pub mod anthropic;
pub mod error;

pub use anthropic::AnthropicClient;
pub use error::{ApiError, ApiErrorKind};
