//! On-disk pool format (version 2) and account records.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use swarm_domain::error::{Error, Result};

/// Current pool file version. Loaders refuse anything else.
pub const POOL_VERSION: u32 = 2;

/// Refresh margin: an account counts as expired this many seconds early.
pub const EXPIRY_MARGIN_SECS: i64 = 300;

/// Stored OAuth credentials for one upstream account.
///
/// `Debug` is manually implemented to redact secrets.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp (seconds) when the access token expires.
    pub expires_at: f64,
    pub account_uuid: String,
}

impl OAuthCredentials {
    /// Expired, or expiring within `margin_secs`.
    pub fn is_expired(&self, margin_secs: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        (now + margin_secs) as f64 >= self.expires_at
    }
}

impl std::fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("account_uuid", &self.account_uuid)
            .finish()
    }
}

/// An account with its selection priority (0 = primary).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthAccount {
    pub credentials: OAuthCredentials,
    pub priority: i32,
}

/// Rate-limit state for one account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateLimitEntry {
    /// Unix timestamp (seconds) when the limit lifts.
    pub until_epoch: i64,
    /// The server-declared retry-after that produced this entry.
    pub retry_after_s: i64,
}

impl RateLimitEntry {
    pub fn is_rate_limited(&self) -> bool {
        chrono::Utc::now().timestamp() < self.until_epoch
    }

    /// Seconds until the limit lifts (0 if already lifted).
    pub fn seconds_until_available(&self) -> i64 {
        (self.until_epoch - chrono::Utc::now().timestamp()).max(0)
    }
}

/// The decrypted pool file contents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolState {
    #[serde(default)]
    pub accounts: Vec<OAuthAccount>,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitEntry>,
}

impl PoolState {
    /// Serialize to the versioned on-disk JSON.
    pub fn to_json(&self) -> Result<String> {
        let doc = serde_json::json!({
            "version": POOL_VERSION,
            "accounts": self.accounts,
            "rate_limits": self.rate_limits,
        });
        Ok(serde_json::to_string(&doc)?)
    }

    /// Parse the versioned on-disk JSON, refusing unknown versions.
    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: serde_json::Value = serde_json::from_str(raw)?;
        let version = doc.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        if version != u64::from(POOL_VERSION) {
            return Err(Error::Auth(format!(
                "unsupported credential pool version {version} (expected {POOL_VERSION})"
            )));
        }
        Ok(serde_json::from_value(doc)?)
    }

    pub fn find_account(&self, account_uuid: &str) -> Option<&OAuthAccount> {
        self.accounts
            .iter()
            .find(|a| a.credentials.account_uuid == account_uuid)
    }

    pub fn find_account_mut(&mut self, account_uuid: &str) -> Option<&mut OAuthAccount> {
        self.accounts
            .iter_mut()
            .find(|a| a.credentials.account_uuid == account_uuid)
    }

    /// Accounts in ascending priority order.
    pub fn sorted_accounts(&self) -> Vec<&OAuthAccount> {
        let mut accounts: Vec<&OAuthAccount> = self.accounts.iter().collect();
        accounts.sort_by_key(|a| a.priority);
        accounts
    }

    /// Not expired (with margin) and not currently rate-limited.
    pub fn is_available(&self, account: &OAuthAccount) -> bool {
        if account.credentials.is_expired(EXPIRY_MARGIN_SECS) {
            return false;
        }
        !self
            .rate_limits
            .get(&account.credentials.account_uuid)
            .map(RateLimitEntry::is_rate_limited)
            .unwrap_or(false)
    }
}

/// Inspection record for display and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AccountInfo {
    pub priority: i32,
    pub account_uuid: String,
    pub is_rate_limited: bool,
    pub seconds_until_available: i64,
    pub expires_at: f64,
    pub expires_soon: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(uuid: &str, expires_in: i64) -> OAuthCredentials {
        OAuthCredentials {
            access_token: format!("at-{uuid}"),
            refresh_token: format!("rt-{uuid}"),
            expires_at: (chrono::Utc::now().timestamp() + expires_in) as f64,
            account_uuid: uuid.into(),
        }
    }

    #[test]
    fn debug_redacts_secrets() {
        let c = creds("acc-1", 3600);
        let dbg = format!("{c:?}");
        assert!(dbg.contains("[REDACTED]"));
        assert!(!dbg.contains("at-acc-1"));
        assert!(dbg.contains("acc-1"));
    }

    #[test]
    fn versioned_roundtrip() {
        let mut state = PoolState::default();
        state.accounts.push(OAuthAccount {
            credentials: creds("acc-1", 3600),
            priority: 0,
        });
        state.rate_limits.insert(
            "acc-1".into(),
            RateLimitEntry {
                until_epoch: 0,
                retry_after_s: 60,
            },
        );
        let json = state.to_json().unwrap();
        assert!(json.contains("\"version\":2"));
        let parsed = PoolState::from_json(&json).unwrap();
        assert_eq!(parsed.accounts.len(), 1);
        assert!(parsed.rate_limits.contains_key("acc-1"));
    }

    #[test]
    fn unknown_version_is_refused() {
        let err = PoolState::from_json(r#"{"version":3,"accounts":[]}"#).unwrap_err();
        assert!(err.to_string().contains("version 3"));
        assert!(PoolState::from_json(r#"{"accounts":[]}"#).is_err());
    }

    #[test]
    fn expiry_margin() {
        assert!(creds("a", 100).is_expired(EXPIRY_MARGIN_SECS));
        assert!(!creds("a", 3600).is_expired(EXPIRY_MARGIN_SECS));
        assert!(creds("a", -10).is_expired(0));
    }

    #[test]
    fn availability_honours_rate_limits() {
        let mut state = PoolState::default();
        state.accounts.push(OAuthAccount {
            credentials: creds("a", 3600),
            priority: 0,
        });
        let account = state.accounts[0].clone();
        assert!(state.is_available(&account));

        state.rate_limits.insert(
            "a".into(),
            RateLimitEntry {
                until_epoch: chrono::Utc::now().timestamp() + 120,
                retry_after_s: 120,
            },
        );
        assert!(!state.is_available(&account));

        // An already-lifted limit does not block.
        state.rate_limits.insert(
            "a".into(),
            RateLimitEntry {
                until_epoch: chrono::Utc::now().timestamp() - 1,
                retry_after_s: 120,
            },
        );
        assert!(state.is_available(&account));
    }

    #[test]
    fn sorted_accounts_by_priority() {
        let mut state = PoolState::default();
        for (uuid, prio) in [("b", 5), ("a", 0), ("c", 2)] {
            state.accounts.push(OAuthAccount {
                credentials: creds(uuid, 3600),
                priority: prio,
            });
        }
        let order: Vec<&str> = state
            .sorted_accounts()
            .iter()
            .map(|a| a.credentials.account_uuid.as_str())
            .collect();
        assert_eq!(order, ["a", "c", "b"]);
    }
}
