//! Encrypted multi-account credential pool.
//!
//! Accounts for the upstream LLM live in a single Fernet-encrypted JSON
//! file shared by every swarm process. Each read-modify-write is bracketed
//! by an advisory file lock and each external read reloads from disk, so a
//! token refresh or rate-limit mark in one process is visible to all
//! others on their next call.

pub mod fernet;
pub mod pool;
pub mod refresh;
pub mod store;

pub use pool::AccountPool;
pub use store::{AccountInfo, OAuthAccount, OAuthCredentials, RateLimitEntry};
