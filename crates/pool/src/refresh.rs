//! Token refresh against the upstream OAuth endpoint.
//!
//! Refresh is triggered when an account's access token is within the
//! expiry margin. The refreshed credentials are persisted through
//! [`AccountPool::update_on_disk`] so every process sees them.

use serde::Deserialize;

use swarm_domain::error::{Error, Result};

use crate::pool::AccountPool;
use crate::store::{OAuthCredentials, EXPIRY_MARGIN_SECS};

const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Default lifetime when the token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Response from the token endpoint.
///
/// `Debug` is manually implemented to redact secrets.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Whether the credentials need a refresh before use.
pub fn needs_refresh(credentials: &OAuthCredentials) -> bool {
    credentials.is_expired(EXPIRY_MARGIN_SECS)
}

/// Refresh `credentials` and persist the result into `pool`.
///
/// Returns the refreshed credentials on success.
pub async fn refresh_account(
    client: &reqwest::Client,
    pool: &AccountPool,
    credentials: &OAuthCredentials,
) -> Result<OAuthCredentials> {
    if credentials.refresh_token.is_empty() {
        return Err(Error::Auth(format!(
            "account {} has no refresh token",
            credentials.account_uuid
        )));
    }

    tracing::info!(
        account_uuid = %credentials.account_uuid,
        "refreshing OAuth access token"
    );

    let resp = client
        .post(TOKEN_URL)
        .json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": credentials.refresh_token,
            "client_id": CLIENT_ID,
        }))
        .send()
        .await
        .map_err(|e| Error::Auth(format!("token refresh request failed: {e}")))?;

    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| Error::Auth(format!("reading refresh response: {e}")))?;

    if !status.is_success() {
        return Err(Error::Auth(format!(
            "token refresh returned HTTP {}: {body}",
            status.as_u16()
        )));
    }

    let token: TokenResponse = serde_json::from_str(&body)
        .map_err(|e| Error::Auth(format!("parsing refresh response: {e}")))?;

    let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
    let refreshed = OAuthCredentials {
        access_token: token.access_token,
        refresh_token: token
            .refresh_token
            .unwrap_or_else(|| credentials.refresh_token.clone()),
        expires_at: (chrono::Utc::now().timestamp() + expires_in) as f64,
        account_uuid: credentials.account_uuid.clone(),
    };

    if !pool.update_account_credentials(&credentials.account_uuid, refreshed.clone())? {
        tracing::warn!(
            account_uuid = %credentials.account_uuid,
            "refreshed an account no longer present in the pool"
        );
    }

    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_window_detection() {
        let now = chrono::Utc::now().timestamp();
        let near = OAuthCredentials {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: (now + 120) as f64,
            account_uuid: "u".into(),
        };
        assert!(needs_refresh(&near));

        let far = OAuthCredentials {
            expires_at: (now + 7200) as f64,
            ..near.clone()
        };
        assert!(!needs_refresh(&far));
    }

    #[test]
    fn token_response_parses_minimal_body() {
        let resp: TokenResponse =
            serde_json::from_str(r#"{"access_token":"eyJ-new"}"#).unwrap();
        assert_eq!(resp.access_token, "eyJ-new");
        assert!(resp.refresh_token.is_none());
        assert!(resp.expires_in.is_none());
    }

    #[test]
    fn token_response_debug_is_redacted() {
        let resp: TokenResponse = serde_json::from_str(
            r#"{"access_token":"secret","refresh_token":"also-secret","expires_in":3600}"#,
        )
        .unwrap();
        let dbg = format!("{resp:?}");
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("[REDACTED]"));
    }
}
